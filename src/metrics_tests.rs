// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for metrics collection

#[cfg(test)]
mod tests {
    use crate::metrics::{
        gather_metrics, record_change_requests, record_zone_reconciliation,
    };
    use std::time::Duration;

    #[test]
    fn test_record_and_gather() {
        record_zone_reconciliation("inmemory/z1", "success", Duration::from_millis(12));
        record_change_requests("create", 3);
        record_change_requests("delete", 0); // no-op

        let text = gather_metrics().unwrap();
        assert!(text.contains("rezone_firestoned_io_zone_reconciliations_total"));
        assert!(text.contains("rezone_firestoned_io_change_requests_total"));
        assert!(text.contains("action=\"create\""));
        assert!(!text.contains("action=\"delete\""));
    }
}
