use metrics::{describe_counter, describe_gauge, describe_histogram};

// registered services over control connections
pub const METRICS_SERVICE_LIVE: &str = "oneway_service_live";
pub const METRICS_SERVICE_COUNT: &str = "oneway_service_count";

// connection requests issued on behalf of downstream clients
pub const METRICS_CONN_REQUEST_COUNT: &str = "oneway_conn_request_count";
pub const METRICS_CONN_REQUEST_ERROR_COUNT: &str = "oneway_conn_request_error_count";
pub const METRICS_CONN_REQUEST_TIMEOUT_COUNT: &str = "oneway_conn_request_timeout_count";
pub const METRICS_CONN_REQUEST_HISTOGRAM: &str = "oneway_conn_request_histogram";

// dial-back connections from services
pub const METRICS_DIAL_BACK_COUNT: &str = "oneway_dial_back_count";
pub const METRICS_DIAL_BACK_ORPHAN_COUNT: &str = "oneway_dial_back_orphan_count";
pub const METRICS_DIAL_BACK_ERROR_COUNT: &str = "oneway_dial_back_error_count";

// downstream proxy connections
pub const METRICS_PROXY_LIVE: &str = "oneway_proxy_live";
pub const METRICS_PROXY_COUNT: &str = "oneway_proxy_count";
pub const METRICS_PROXY_ERROR_COUNT: &str = "oneway_proxy_error_count";

pub fn describe_metrics() {
    describe_gauge!(METRICS_SERVICE_LIVE, "Live registered services");
    describe_counter!(METRICS_SERVICE_COUNT, "Number of service registrations");

    describe_counter!(METRICS_CONN_REQUEST_COUNT, "Number of connection requests to services");
    describe_counter!(METRICS_CONN_REQUEST_ERROR_COUNT, "Number of failed connection requests to services");
    describe_counter!(METRICS_CONN_REQUEST_TIMEOUT_COUNT, "Number of connection requests which got no dial-back in time");
    describe_histogram!(METRICS_CONN_REQUEST_HISTOGRAM, "Time from connection request to dial-back, in seconds");

    describe_counter!(METRICS_DIAL_BACK_COUNT, "Number of accepted dial-back connections");
    describe_counter!(METRICS_DIAL_BACK_ORPHAN_COUNT, "Number of dial-back connections without a waiting request");
    describe_counter!(METRICS_DIAL_BACK_ERROR_COUNT, "Number of dial-back accept or handshake errors");

    describe_gauge!(METRICS_PROXY_LIVE, "Live bridged proxy connections");
    describe_counter!(METRICS_PROXY_COUNT, "Number of incoming proxy connections");
    describe_counter!(METRICS_PROXY_ERROR_COUNT, "Number of failed proxy connections");
}
