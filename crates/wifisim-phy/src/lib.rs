//! # wifisim-phy
//!
//! Wi-Fi PHY simulation for wifisim.
//!
//! This crate provides:
//! - Operating channel selection over the channel table ([`OperatingChannel`])
//! - Interference and SINR tracking ([`InterferenceTracker`])
//! - Preamble detection and frame capture models ([`detection`])
//! - The PHY entity and its reception state machine ([`WifiPhy`])
//! - The wireless medium routing PPDUs between PHYs ([`Medium`])
//! - The rate control interface consumed by traffic sources ([`RateControl`])

pub mod channel;
pub mod detection;
pub mod interference;
pub mod medium;
pub mod phy;
pub mod rate_control;
pub mod state;

pub use channel::{ChannelEntry, ChannelError, ChannelType, OperatingChannel};
pub use detection::{FrameCaptureConfig, PreambleDetectionConfig, PREAMBLE_DETECTION_WINDOW};
pub use interference::{InterferenceTracker, SignalId};
pub use medium::{LinkModel, LinkParams, Medium};
pub use phy::{PhyStats, WifiPhy, WifiPhyConfig};
pub use rate_control::{su_preamble, ConstantRate, ConstantRateConfig, RateControl};
pub use state::PhyStateHelper;

use thiserror::Error;

/// Errors raised while building or configuring a PHY.
#[derive(Debug, Error)]
pub enum PhyError {
    /// Operating channel could not be selected.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Invalid PHY configuration.
    #[error("Invalid PHY configuration: {0}")]
    InvalidConfig(String),
}

/// Converts a power in dBm to milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Converts a power in milliwatts to dBm, `-inf` for zero.
pub fn mw_to_dbm(mw: f64) -> f64 {
    if mw > 0.0 {
        10.0 * mw.log10()
    } else {
        f64::NEG_INFINITY
    }
}

/// Converts a linear ratio to dB.
pub fn ratio_to_db(ratio: f64) -> f64 {
    mw_to_dbm(ratio)
}
