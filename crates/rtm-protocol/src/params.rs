//! Protocol parameters -- the timing and sizing constants both ends agree on.
//!
//! The gateway enforces the command size ceiling and expects a ping at least
//! once per interval. Everything that is a node-local tuning knob (command
//! timeout, open timeout) lives in client configuration instead.

/// A named parameter set for the push gateway protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Parameter set identifier.
    pub id: u16,

    // -- Timer --
    /// Connection housekeeping tick in seconds (timeout scan, keepalive).
    pub tick_interval_secs: u64,

    // -- Keepalive --
    /// Seconds after the last pong before a new ping is sent.
    pub ping_interval_secs: u64,
    /// Seconds an outstanding ping may wait before the link is declared dead.
    pub ping_timeout_secs: u64,

    // -- Reconnect backoff --
    /// Base backoff in seconds: min(2^(failures-1) * base, max).
    pub reconnect_backoff_base_secs: u64,
    /// Maximum backoff in seconds.
    pub reconnect_backoff_max_secs: u64,
    /// Exponent saturation so the shift never overflows.
    pub backoff_saturation_count: u32,

    // -- Commands --
    /// Maximum serialized command size in bytes.
    pub max_command_bytes: usize,
    /// Highest correlation index before wrapping back to 1.
    pub max_correlation_index: u16,

    // -- Router --
    /// Consecutive connect failures before the cached route is discarded.
    pub router_max_failures: u32,

    // -- Session --
    /// Conversation ids per backend query when resolving unknown conversations.
    pub conversation_query_batch: usize,
    /// Maximum ids per online-status query.
    pub max_online_query_ids: usize,
    /// Inclusive bounds on a message history page.
    pub message_page_min: usize,
    pub message_page_max: usize,
}

/// Parameter set 0.
pub const DEFAULT_PARAMS: ProtocolParams = ProtocolParams {
    id: 0,

    tick_interval_secs: 1,

    ping_interval_secs: 180,
    ping_timeout_secs: 20,

    // 1, 2, 4, 8, 16, 30, 30, ...
    reconnect_backoff_base_secs: 1,
    reconnect_backoff_max_secs: 30,
    backoff_saturation_count: 5,

    max_command_bytes: 5000,
    max_correlation_index: u16::MAX,

    router_max_failures: 10,

    conversation_query_batch: 20,
    max_online_query_ids: 20,
    message_page_min: 1,
    message_page_max: 100,
};
