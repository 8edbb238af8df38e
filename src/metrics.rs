//! Metrics for NAT-PMP port mapping.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked for NAT-PMP port mapping.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "natpmp")]
pub struct Metrics {
    /*
     * Transport
     */
    /// Number of requests sent to a gateway, retransmissions included.
    pub requests_sent: Counter,
    /// Number of requests sent again after an attempt timed out.
    pub retransmissions: Counter,
    /// Number of received datagrams discarded as malformed or unrelated.
    pub stray_datagrams: Counter,
    /// Number of exchanges that ran out of attempts.
    pub timeouts: Counter,
    /// Number of exchanges refused by the gateway with a result code.
    pub refusals: Counter,

    /*
     * Gateway discovery
     */
    /// Number of gateways that answered the public address probe.
    pub discovery_success: Counter,
    /// Number of failed gateway discoveries.
    pub discovery_failure: Counter,

    /*
     * Mappings
     */
    /// Number of mapping requests made by callers.
    pub mapping_requests: Counter,
    /// Number of mappings created.
    pub mappings_created: Counter,
    /// Number of mapping requests that did not produce a mapping.
    pub mappings_failed: Counter,
    /// Number of mappings released.
    pub mappings_released: Counter,
}
