//! Protocol configuration.

use std::time::Duration;

/// APKES timing and capacity parameters.
///
/// Defaults match the reference deployment; every value can be overridden
/// before the subsystem is constructed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Smallest Trickle interval (`I_MIN`)
    pub trickle_min_interval: Duration,
    /// Maximum number of Trickle interval doublings (`I_MAX_DOUBLINGS`)
    pub trickle_max_doublings: i8,
    /// New neighbors per interval that trigger a Trickle reset
    /// (`R_THRESH`); defaults to the tentative-neighbor pool size
    pub reset_threshold: u8,
    /// Neighbor pool size (`N_MAX`)
    pub max_neighbors: usize,
    /// Wait-timer pool size, bounding in-flight handshakes (`K_TENT`)
    pub max_tentative: usize,
    /// Longest random wait before answering a HELLO (`W_MAX`)
    pub max_waiting_period: Duration,
    /// Grace period for the initiator's ACK after a HELLOACK (`T_ACK`)
    pub ack_delay: Duration,
    /// Neighbor lifetime granted by each authentic exchange (`T_LIFE`)
    pub neighbor_lifetime: Duration,
    /// Keepalive pass period (`T_UP_CHECK`)
    pub update_check_interval: Duration,
    /// UPDATE retransmissions per neighbor per pass (`U_MAX`)
    pub max_updates: u8,
    /// Wait for an UPDATEACK between retransmissions (`T_UPACK`)
    pub updateack_wait: Duration,
    /// REFRESH broadcasts sent after a reboot (`M_REFRESH`)
    pub refresh_count: u8,
    /// Spacing between REFRESH broadcasts (`T_REFRESH`)
    pub refresh_spacing: Duration,
    /// Piggyback and encrypt broadcast keys in update-form frames
    pub with_broadcast_keys: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trickle_min_interval: Duration::from_secs(30),
            trickle_max_doublings: 8,
            reset_threshold: 5,
            max_neighbors: 16,
            max_tentative: 5,
            max_waiting_period: Duration::from_secs(5),
            ack_delay: Duration::from_secs(2),
            neighbor_lifetime: Duration::from_secs(3600),
            update_check_interval: Duration::from_secs(180),
            max_updates: 3,
            updateack_wait: Duration::from_secs(5),
            refresh_count: 3,
            refresh_spacing: Duration::from_secs(3),
            with_broadcast_keys: true,
        }
    }
}

impl Config {
    /// Window during which HELLOACKs and ACKs for one HELLO may arrive
    #[must_use]
    pub fn hello_duration(&self) -> Duration {
        self.max_waiting_period + self.ack_delay
    }

    /// Occupancy above which the keepalive loop probes with UPDATEs
    /// instead of silently prolonging entries
    #[must_use]
    pub fn lazy_threshold(&self) -> usize {
        self.max_neighbors.saturating_sub(self.max_tentative)
    }
}
