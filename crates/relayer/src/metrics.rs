use metrics::{describe_counter, describe_gauge};

// control sessions from agents
pub const METRICS_SESSION_LIVE: &str = "burrow_session_live";
pub const METRICS_SESSION_COUNT: &str = "burrow_session_count";
pub const METRICS_SESSION_ERROR_COUNT: &str = "burrow_session_error_count";

// logical tunnel connections multiplexed over the channel
pub const METRICS_TUNNEL_COUNT: &str = "burrow_tunnel_count";
pub const METRICS_TUNNEL_ERROR_COUNT: &str = "burrow_tunnel_error_count";

// edge connections through the forward server
pub const METRICS_FORWARD_LIVE: &str = "burrow_forward_live";
pub const METRICS_FORWARD_COUNT: &str = "burrow_forward_count";
pub const METRICS_FORWARD_REJECT_COUNT: &str = "burrow_forward_reject_count";

pub fn describe_metrics() {
    describe_gauge!(METRICS_SESSION_LIVE, "Live control sessions");
    describe_counter!(METRICS_SESSION_COUNT, "Number of accepted control sessions");
    describe_counter!(METRICS_SESSION_ERROR_COUNT, "Number of refused or failed control sessions");

    describe_counter!(METRICS_TUNNEL_COUNT, "Number of logical tunnel connections");
    describe_counter!(METRICS_TUNNEL_ERROR_COUNT, "Number of logical tunnel connection errors");

    describe_gauge!(METRICS_FORWARD_LIVE, "Live edge connections through the forward server");
    describe_counter!(METRICS_FORWARD_COUNT, "Number of edge connections through the forward server");
    describe_counter!(METRICS_FORWARD_REJECT_COUNT, "Number of edge connections with no matching hostname");
}
