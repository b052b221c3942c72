//! # wifi-ppdu
//!
//! IEEE 802.11 PHY protocol data units and the per-amendment field codecs
//! needed to transmit and receive them in a discrete-event simulation.
//!
//! This crate is pure: it owns no simulation state. It provides
//! - MCS/rate tables for Legacy OFDM, HT, VHT and HE ([`mode`]),
//! - HE resource unit arithmetic ([`ru`]),
//! - the TXVECTOR ([`tx_vector`]),
//! - PSDU/A-MPDU framing ([`psdu`]),
//! - logical header fields with L-SIG wire encoding ([`header`]),
//! - the PPDU value object ([`ppdu`]),
//! - error rate models ([`error_rate`]),
//! - one [`PhyEntity`] per amendment, describing field sequences,
//!   durations and per-field reception outcomes ([`entity`]).
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use wifi_ppdu::{Band, Ppdu, PreambleType, Psdu, Mpdu, MacAddr, TxVector, WifiMode, SU_STA_ID};
//!
//! let mode = WifiMode::from_name("VhtMcs7").unwrap();
//! let txv = TxVector::new(mode, PreambleType::VhtSu, 80);
//! let mpdu = Mpdu::new(MacAddr::BROADCAST, MacAddr::new([2, 0, 0, 0, 0, 1]), 0, vec![0u8; 1000]);
//! let mut psdus = BTreeMap::new();
//! psdus.insert(SU_STA_ID, Psdu::single(mpdu));
//! let ppdu = Ppdu::new(psdus, &txv, Band::Ghz5, 5210, 1).unwrap();
//! assert_eq!(ppdu.tx_vector().unwrap().mode(), mode);
//! ```

pub mod entity;
pub mod error;
pub mod error_rate;
pub mod header;
pub mod mode;
pub mod ppdu;
pub mod psdu;
pub mod ru;
pub mod tx_vector;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use entity::{phy_entity, FieldRxInput, FieldRxStatus, PhyEntity, RxCapabilities, RxFailureAction};
pub use error::{HeaderError, PpduError, TxVectorError};
pub use error_rate::{AwgnErrorRateModel, ErrorRateModel, ErrorRateModelKind, ThresholdErrorRateModel};
pub use header::{HeSigA, HeSigB, HtSig, LSig, PpduHeader, VhtSigA};
pub use mode::{CodeRate, Modulation, WifiMode};
pub use ppdu::Ppdu;
pub use psdu::{MacAddr, Mpdu, Psdu};
pub use ru::{ContentChannel, RuSpec, RuType};
pub use tx_vector::{HeMuUserInfo, TxVector};

// ============================================================================
// Constants
// ============================================================================

/// Station identifier used to key per-user PSDUs and MU allocations.
pub type StaId = u16;

/// STA-ID under which the single PSDU of an SU PPDU is stored.
pub const SU_STA_ID: StaId = 65535;

/// Maximum value of the 12-bit L-SIG length field.
pub const MAX_LSIG_LENGTH: u16 = 4095;

/// Signal extension appended to OFDM-based PPDUs in the 2.4 GHz band.
pub const SIGNAL_EXTENSION_2_4GHZ: Duration = Duration::from_micros(6);

// ============================================================================
// Standards and bands
// ============================================================================

/// PHY standard a device implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WifiStandard {
    #[serde(rename = "a")]
    Ieee80211a,
    #[serde(rename = "g")]
    Ieee80211g,
    #[serde(rename = "n")]
    Ieee80211n,
    #[serde(rename = "ac")]
    Ieee80211ac,
    #[serde(rename = "ax")]
    Ieee80211ax,
}

impl WifiStandard {
    /// Highest modulation class the standard can transmit and receive.
    pub fn max_modulation_class(self) -> ModulationClass {
        match self {
            WifiStandard::Ieee80211a | WifiStandard::Ieee80211g => ModulationClass::Ofdm,
            WifiStandard::Ieee80211n => ModulationClass::Ht,
            WifiStandard::Ieee80211ac => ModulationClass::Vht,
            WifiStandard::Ieee80211ax => ModulationClass::He,
        }
    }

    /// Returns true if a device of this standard can decode the given class.
    pub fn supports(self, class: ModulationClass) -> bool {
        class <= self.max_modulation_class()
    }

    /// Widest channel the standard defines, in MHz.
    pub fn max_channel_width(self) -> u16 {
        match self {
            WifiStandard::Ieee80211a | WifiStandard::Ieee80211g => 20,
            WifiStandard::Ieee80211n => 40,
            WifiStandard::Ieee80211ac | WifiStandard::Ieee80211ax => 160,
        }
    }

    /// Returns true if the standard operates in the given band.
    pub fn allows_band(self, band: Band) -> bool {
        match self {
            WifiStandard::Ieee80211a | WifiStandard::Ieee80211ac => band == Band::Ghz5,
            WifiStandard::Ieee80211g => band == Band::Ghz2_4,
            WifiStandard::Ieee80211n => band != Band::Ghz6,
            WifiStandard::Ieee80211ax => true,
        }
    }
}

impl fmt::Display for WifiStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WifiStandard::Ieee80211a => write!(f, "802.11a"),
            WifiStandard::Ieee80211g => write!(f, "802.11g"),
            WifiStandard::Ieee80211n => write!(f, "802.11n"),
            WifiStandard::Ieee80211ac => write!(f, "802.11ac"),
            WifiStandard::Ieee80211ax => write!(f, "802.11ax"),
        }
    }
}

/// Frequency band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    #[serde(rename = "2.4ghz")]
    Ghz2_4,
    #[serde(rename = "5ghz")]
    Ghz5,
    #[serde(rename = "6ghz")]
    Ghz6,
}

impl Band {
    /// Signal extension for OFDM-based PPDUs sent in this band.
    pub fn signal_extension(self) -> Duration {
        match self {
            Band::Ghz2_4 => SIGNAL_EXTENSION_2_4GHZ,
            Band::Ghz5 | Band::Ghz6 => Duration::ZERO,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            Band::Ghz2_4 => "2.4ghz",
            Band::Ghz5 => "5ghz",
            Band::Ghz6 => "6ghz",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Ghz2_4 => write!(f, "2.4 GHz"),
            Band::Ghz5 => write!(f, "5 GHz"),
            Band::Ghz6 => write!(f, "6 GHz"),
        }
    }
}

// ============================================================================
// Modulation class, preamble, fields
// ============================================================================

/// Amendment family a mode or PPDU belongs to. Ordered by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModulationClass {
    Ofdm,
    Ht,
    Vht,
    He,
}

impl ModulationClass {
    pub const ALL: [ModulationClass; 4] = [
        ModulationClass::Ofdm,
        ModulationClass::Ht,
        ModulationClass::Vht,
        ModulationClass::He,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            ModulationClass::Ofdm => "ofdm",
            ModulationClass::Ht => "ht",
            ModulationClass::Vht => "vht",
            ModulationClass::He => "he",
        }
    }
}

impl fmt::Display for ModulationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModulationClass::Ofdm => write!(f, "OFDM"),
            ModulationClass::Ht => write!(f, "HT"),
            ModulationClass::Vht => write!(f, "VHT"),
            ModulationClass::He => write!(f, "HE"),
        }
    }
}

/// PPDU format, as announced by the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreambleType {
    NonHt,
    HtMf,
    VhtSu,
    HeSu,
    HeErSu,
    HeMu,
    HeTb,
}

impl PreambleType {
    pub fn modulation_class(self) -> ModulationClass {
        match self {
            PreambleType::NonHt => ModulationClass::Ofdm,
            PreambleType::HtMf => ModulationClass::Ht,
            PreambleType::VhtSu => ModulationClass::Vht,
            PreambleType::HeSu | PreambleType::HeErSu | PreambleType::HeMu | PreambleType::HeTb => {
                ModulationClass::He
            }
        }
    }

    /// Downlink or uplink multi-user format.
    pub fn is_mu(self) -> bool {
        self.is_dl_mu() || self.is_ul_mu()
    }

    pub fn is_dl_mu(self) -> bool {
        self == PreambleType::HeMu
    }

    pub fn is_ul_mu(self) -> bool {
        self == PreambleType::HeTb
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            PreambleType::NonHt => "non_ht",
            PreambleType::HtMf => "ht_mf",
            PreambleType::VhtSu => "vht_su",
            PreambleType::HeSu => "he_su",
            PreambleType::HeErSu => "he_er_su",
            PreambleType::HeMu => "he_mu",
            PreambleType::HeTb => "he_tb",
        }
    }
}

impl fmt::Display for PreambleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PreambleType::NonHt => "NON_HT",
            PreambleType::HtMf => "HT_MF",
            PreambleType::VhtSu => "VHT_SU",
            PreambleType::HeSu => "HE_SU",
            PreambleType::HeErSu => "HE_ER_SU",
            PreambleType::HeMu => "HE_MU",
            PreambleType::HeTb => "HE_TB",
        })
    }
}

/// A field of a PPDU, received in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PpduField {
    /// Legacy STF + LTF.
    Preamble,
    /// L-SIG (and RL-SIG for HE).
    NonHtHeader,
    HtSig,
    /// STF + LTFs of the amendment.
    Training,
    SigA,
    SigB,
    Data,
}

impl fmt::Display for PpduField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PpduField::Preamble => "preamble",
            PpduField::NonHtHeader => "non-HT header",
            PpduField::HtSig => "HT-SIG",
            PpduField::Training => "training",
            PpduField::SigA => "SIG-A",
            PpduField::SigB => "SIG-B",
            PpduField::Data => "data",
        })
    }
}

// ============================================================================
// Drop reasons
// ============================================================================

/// Why a PPDU (or part of it) was not received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DropReason {
    UnsupportedSettings,
    ChannelSwitching,
    Rxing,
    Txing,
    Sleeping,
    PoweredOff,
    BusyDecodingPreamble,
    PreambleDetectFailure,
    ReceptionAbortedByTx,
    LSigFailure,
    HtSigFailure,
    SigAFailure,
    SigBFailure,
    PreambleDetectionPacketSwitch,
    FrameCapturePacketSwitch,
    ObssPdCcaReset,
    HeTbPpduTooLate,
    Filtered,
}

impl DropReason {
    /// Lowercase label for metric breakdowns.
    pub fn as_label(&self) -> &'static str {
        match self {
            DropReason::UnsupportedSettings => "unsupported_settings",
            DropReason::ChannelSwitching => "channel_switching",
            DropReason::Rxing => "rxing",
            DropReason::Txing => "txing",
            DropReason::Sleeping => "sleeping",
            DropReason::PoweredOff => "powered_off",
            DropReason::BusyDecodingPreamble => "busy_decoding_preamble",
            DropReason::PreambleDetectFailure => "preamble_detect_failure",
            DropReason::ReceptionAbortedByTx => "reception_aborted_by_tx",
            DropReason::LSigFailure => "l_sig_failure",
            DropReason::HtSigFailure => "ht_sig_failure",
            DropReason::SigAFailure => "sig_a_failure",
            DropReason::SigBFailure => "sig_b_failure",
            DropReason::PreambleDetectionPacketSwitch => "preamble_detection_packet_switch",
            DropReason::FrameCapturePacketSwitch => "frame_capture_packet_switch",
            DropReason::ObssPdCcaReset => "obss_pd_cca_reset",
            DropReason::HeTbPpduTooLate => "he_tb_ppdu_too_late",
            DropReason::Filtered => "filtered",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_label().to_ascii_uppercase())
    }
}

/// Integer ceiling division.
pub(crate) fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}
