//! Metric name and label definitions.

/// HTTP control API
pub mod http {
    pub const REQUESTS_TOTAL: &str = "switchboard_http_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "switchboard_http_request_duration_seconds";
}

/// Device sessions
pub mod session {
    /// Session starts, labelled by login mode
    pub const STARTS_TOTAL: &str = "switchboard_session_starts_total";
    /// Sessions currently connected
    pub const CONNECTED: &str = "switchboard_sessions_connected";
    /// Closes, labelled by reason
    pub const CLOSES_TOTAL: &str = "switchboard_session_closes_total";
    pub const RECONNECTS_TOTAL: &str = "switchboard_session_reconnects_total";
    pub const HEARTBEATS_TOTAL: &str = "switchboard_session_heartbeats_total";
}

/// Inbound pipeline
pub mod inbound {
    /// Messages received from transports, before filtering
    pub const EVENTS_TOTAL: &str = "switchboard_inbound_events_total";
    /// Messages dropped by the filter or the dedup window, labelled by reason
    pub const DROPPED_TOTAL: &str = "switchboard_inbound_dropped_total";
    pub const PROCESSED_TOTAL: &str = "switchboard_inbound_processed_total";
    pub const PROCESSING_DURATION_SECONDS: &str =
        "switchboard_inbound_processing_duration_seconds";
}

/// Auto-reply decisions
pub mod reply {
    /// Labelled by outcome (`answer` or the no-answer reason)
    pub const DECISIONS_TOTAL: &str = "switchboard_reply_decisions_total";
    pub const HANDOVERS_TOTAL: &str = "switchboard_handovers_total";
}

/// Outbound dispatcher
pub mod outbound {
    /// Labelled by final status
    pub const MESSAGES_TOTAL: &str = "switchboard_outbound_messages_total";
    pub const SEND_DURATION_SECONDS: &str = "switchboard_outbound_send_duration_seconds";
    pub const ACTIVE_LANES: &str = "switchboard_outbound_active_lanes";
}

/// Embedding and generation calls
pub mod ai {
    pub const REQUESTS_TOTAL: &str = "switchboard_ai_requests_total";
    pub const ERRORS_TOTAL: &str = "switchboard_ai_errors_total";
    pub const REQUEST_DURATION_SECONDS: &str = "switchboard_ai_request_duration_seconds";
}

/// Common label keys
pub mod labels {
    pub const ENDPOINT: &str = "endpoint";
    pub const METHOD: &str = "method";
    pub const STATUS: &str = "status";
    pub const PROVIDER: &str = "provider";
    pub const OPERATION: &str = "operation";
    pub const REASON: &str = "reason";
    pub const MODE: &str = "mode";
    pub const OUTCOME: &str = "outcome";
}

/// Histogram buckets
pub mod buckets {
    /// 1ms to 60s
    pub const HTTP_DURATION: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    /// Model calls have a longer tail
    pub const AI_DURATION: &[f64] = &[
        0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0, 60.0,
    ];
}
