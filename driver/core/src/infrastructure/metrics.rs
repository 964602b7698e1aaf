// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Driver metrics definitions.
//!
//! Names follow Prometheus conventions (`_total` counters, `_seconds`
//! histograms). Recording is a no-op until the binary installs an exporter.

use metrics::{counter, describe_counter, describe_histogram, histogram};

pub const REMOTE_COMMANDS_TOTAL: &str = "hyperv_csi_remote_commands_total";
pub const REMOTE_COMMAND_DURATION: &str = "hyperv_csi_remote_command_duration_seconds";
pub const NODE_OPERATIONS_TOTAL: &str = "hyperv_csi_node_operations_total";

/// Register metric descriptions so they show up with help text on `/metrics`.
pub fn register_metrics() {
    describe_counter!(
        REMOTE_COMMANDS_TOTAL,
        "Remote PowerShell commands executed (by outcome: success, failure, timeout, transport_error)"
    );
    describe_histogram!(
        REMOTE_COMMAND_DURATION,
        "Wall-clock time of remote PowerShell commands, including queueing"
    );
    describe_counter!(
        NODE_OPERATIONS_TOTAL,
        "Node publish/unpublish operations (by operation, outcome)"
    );
}

pub fn record_remote_command(outcome: &'static str, duration_secs: f64) {
    counter!(REMOTE_COMMANDS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(REMOTE_COMMAND_DURATION).record(duration_secs);
}

pub fn record_node_operation(operation: &'static str, outcome: &'static str) {
    counter!(NODE_OPERATIONS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
}
