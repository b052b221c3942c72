//! Rate control interface.
//!
//! Traffic sources ask a [`RateControl`] for the TXVECTOR of each frame and
//! report the outcome back. Only a constant policy is provided; adaptive
//! algorithms plug in through the same trait.

use serde::{Deserialize, Serialize};
use wifi_ppdu::{MacAddr, PreambleType, TxVector, WifiMode};

/// Chooses transmission parameters per destination.
pub trait RateControl: Send + std::fmt::Debug {
    /// TXVECTOR for a data frame of `size` bytes to `dest`.
    fn data_tx_vector(&mut self, dest: MacAddr, size: u32) -> TxVector;

    /// TXVECTOR for an RTS (and other control frames) to `dest`.
    fn rts_tx_vector(&mut self, dest: MacAddr) -> TxVector;

    fn report_data_ok(&mut self, _dest: MacAddr, _snr_db: f64) {}

    fn report_data_failed(&mut self, _dest: MacAddr) {}
}

/// Fixed data and control modes, as configured in a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantRateConfig {
    /// Data mode name, e.g. `HeMcs7`.
    pub data_mode: String,
    #[serde(default = "default_control_mode")]
    pub control_mode: String,
    #[serde(default = "default_width")]
    pub channel_width_mhz: u16,
    #[serde(default = "default_gi")]
    pub guard_interval_ns: u16,
    #[serde(default = "default_nss")]
    pub nss: u8,
}

fn default_control_mode() -> String {
    "OfdmRate6Mbps".to_string()
}

fn default_width() -> u16 {
    20
}

fn default_gi() -> u16 {
    800
}

fn default_nss() -> u8 {
    1
}

/// Always the same TXVECTOR, whatever happened before.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantRate {
    data: TxVector,
    control: TxVector,
    successes: u64,
    failures: u64,
}

/// SU preamble used to carry a mode.
pub fn su_preamble(mode: WifiMode) -> PreambleType {
    match mode.class() {
        wifi_ppdu::ModulationClass::Ofdm => PreambleType::NonHt,
        wifi_ppdu::ModulationClass::Ht => PreambleType::HtMf,
        wifi_ppdu::ModulationClass::Vht => PreambleType::VhtSu,
        wifi_ppdu::ModulationClass::He => PreambleType::HeSu,
    }
}

impl ConstantRate {
    pub fn new(data: TxVector, control: TxVector) -> Self {
        Self {
            data,
            control,
            successes: 0,
            failures: 0,
        }
    }

    /// Builds the policy from mode names. Returns `None` for unknown modes.
    pub fn from_config(config: &ConstantRateConfig) -> Option<Self> {
        let data_mode = WifiMode::from_name(&config.data_mode)?;
        let control_mode = WifiMode::from_name(&config.control_mode)?;
        let gi = if data_mode.class() == wifi_ppdu::ModulationClass::Ofdm {
            800
        } else {
            config.guard_interval_ns
        };
        let width = if data_mode.class() == wifi_ppdu::ModulationClass::Ofdm {
            20
        } else {
            config.channel_width_mhz
        };
        let data = TxVector::new(data_mode, su_preamble(data_mode), width)
            .with_guard_interval(gi)
            .with_nss(data_mode.ht_nss().unwrap_or(config.nss));
        let control = TxVector::new(control_mode, su_preamble(control_mode), 20);
        Some(Self::new(data, control))
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl RateControl for ConstantRate {
    fn data_tx_vector(&mut self, _dest: MacAddr, _size: u32) -> TxVector {
        self.data.clone()
    }

    fn rts_tx_vector(&mut self, _dest: MacAddr) -> TxVector {
        self.control.clone()
    }

    fn report_data_ok(&mut self, _dest: MacAddr, _snr_db: f64) {
        self.successes += 1;
    }

    fn report_data_failed(&mut self, _dest: MacAddr) {
        self.failures += 1;
    }
}
