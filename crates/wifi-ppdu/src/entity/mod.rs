//! Per-amendment PHY entities.
//!
//! A [`PhyEntity`] knows the field sequence of its PPDU formats, how long
//! each field lasts for a given TXVECTOR, how the L-SIG length maps to a PPDU
//! duration, and how to judge the reception of each field. One static
//! instance exists per modulation class; [`phy_entity`] selects it.

mod he;
mod ht;
mod ofdm;
mod vht;

pub use he::HePhy;
pub use ht::HtPhy;
pub use ofdm::OfdmPhy;
pub use vht::VhtPhy;

use crate::error::PpduError;
use crate::mode::WifiMode;
use crate::tx_vector::TxVector;
use crate::{
    ceil_div, Band, DropReason, ModulationClass, PpduField, PreambleType, StaId, WifiStandard,
    MAX_LSIG_LENGTH,
};
use rand::{Rng, RngCore};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

static OFDM_PHY: OfdmPhy = OfdmPhy;
static HT_PHY: HtPhy = HtPhy;
static VHT_PHY: VhtPhy = VhtPhy;
static HE_PHY: HePhy = HePhy;

/// Returns the PHY entity handling a modulation class.
pub fn phy_entity(class: ModulationClass) -> &'static dyn PhyEntity {
    match class {
        ModulationClass::Ofdm => &OFDM_PHY,
        ModulationClass::Ht => &HT_PHY,
        ModulationClass::Vht => &VHT_PHY,
        ModulationClass::He => &HE_PHY,
    }
}

// ============================================================================
// Reception inputs and outcomes
// ============================================================================

/// What the receiving PHY can decode and who it is.
#[derive(Debug, Clone, PartialEq)]
pub struct RxCapabilities {
    pub standard: WifiStandard,
    pub max_channel_width: u16,
    pub max_nss: u8,
    /// BSS color of the receiver, 0 if unknown.
    pub bss_color: u8,
    /// STA-ID the receiver was assigned by its AP.
    pub sta_id: StaId,
    pub is_ap: bool,
    /// OBSS PD level; foreign-colour PPDUs received below it are ignored.
    pub obss_pd_level_dbm: Option<f64>,
}

/// Inputs for judging the reception of one field.
#[derive(Debug, Clone, Copy)]
pub struct FieldRxInput<'a> {
    /// TXVECTOR as decoded from the header so far.
    pub tx_vector: &'a TxVector,
    /// Probability that the field's bits survived at the measured SINR.
    pub success_rate: f64,
    pub rx_power_dbm: f64,
    pub caps: &'a RxCapabilities,
}

/// What the PHY does after a failed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RxFailureAction {
    /// Stop decoding; the signal still counts for CCA until it ends.
    Drop,
    /// Stop decoding and forget the signal for CCA purposes.
    Abort,
    /// Keep going.
    Ignore,
}

/// Outcome of receiving one PPDU field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRxStatus {
    pub success: bool,
    pub reason: Option<DropReason>,
    pub action: RxFailureAction,
}

impl FieldRxStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
            action: RxFailureAction::Ignore,
        }
    }

    pub fn drop(reason: DropReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            action: RxFailureAction::Drop,
        }
    }

    pub fn abort(reason: DropReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            action: RxFailureAction::Abort,
        }
    }
}

// ============================================================================
// PhyEntity
// ============================================================================

/// Field codec and reception rules of one amendment.
pub trait PhyEntity: Send + Sync + fmt::Debug {
    fn modulation_class(&self) -> ModulationClass;

    /// Value advertised in the supported-rates element, if any.
    fn bss_membership_selector(&self) -> Option<u8> {
        None
    }

    fn mcs_range(&self) -> RangeInclusive<u8> {
        let n = WifiMode::all(self.modulation_class()).len() as u8;
        0..=n.saturating_sub(1)
    }

    fn modes(&self) -> &'static [WifiMode] {
        WifiMode::all(self.modulation_class())
    }

    /// Field sequence per PPDU format.
    fn ppdu_formats(&self) -> &'static [(PreambleType, &'static [PpduField])];

    fn ppdu_fields(&self, preamble: PreambleType) -> &'static [PpduField] {
        self.ppdu_formats()
            .iter()
            .find(|(p, _)| *p == preamble)
            .map(|(_, fields)| *fields)
            .unwrap_or(&[])
    }

    /// Returns true if `mode` may be used at this width and stream count.
    fn is_mode_allowed(&self, mode: WifiMode, channel_width: u16, nss: u8) -> bool;

    /// Duration of a non-data field. Data is sized by [`payload_duration`].
    ///
    /// [`payload_duration`]: PhyEntity::payload_duration
    fn field_duration(&self, field: PpduField, tx_vector: &TxVector) -> Duration;

    /// Everything before the data field.
    fn preamble_and_header_duration(&self, tx_vector: &TxVector) -> Duration {
        self.ppdu_fields(tx_vector.preamble())
            .iter()
            .filter(|f| **f != PpduField::Data)
            .map(|f| self.field_duration(*f, tx_vector))
            .sum()
    }

    /// Data OFDM symbol duration, including the guard interval.
    fn symbol_duration(&self, tx_vector: &TxVector) -> Duration {
        crate::mode::symbol_duration(self.modulation_class(), tx_vector.guard_interval_ns())
    }

    /// Data field duration for a PSDU of `size` bytes sent to `sta_id`,
    /// signal extension included.
    fn payload_duration(&self, size: u32, tx_vector: &TxVector, band: Band, sta_id: StaId) -> Duration;

    /// Offsets from the start of the data field at which each A-MPDU
    /// subframe has been fully received.
    fn mpdu_end_offsets(
        &self,
        subframe_sizes: &[u32],
        tx_vector: &TxVector,
        band: Band,
        sta_id: StaId,
    ) -> Vec<Duration> {
        let total: u32 = subframe_sizes.iter().sum();
        let end = self.payload_duration(total, tx_vector, band, sta_id);
        let mut acc = 0;
        subframe_sizes
            .iter()
            .map(|size| {
                acc += size;
                if acc == total {
                    end
                } else {
                    self.payload_duration(acc, tx_vector, Band::Ghz5, sta_id).min(end)
                }
            })
            .collect()
    }

    /// Total PPDU duration for per-station PSDU sizes.
    fn ppdu_duration(&self, psdu_sizes: &BTreeMap<StaId, u32>, tx_vector: &TxVector, band: Band) -> Duration {
        let payload = psdu_sizes
            .iter()
            .map(|(sta_id, size)| self.payload_duration(*size, tx_vector, band, *sta_id))
            .max()
            .unwrap_or(Duration::ZERO);
        self.preamble_and_header_duration(tx_vector) + payload
    }

    /// L-SIG length announcing a PPDU of `duration`.
    fn duration_to_lsig_length(&self, duration: Duration, tx_vector: &TxVector, band: Band) -> Result<u16, PpduError>;

    /// PPDU duration a receiver infers from the L-SIG length alone.
    fn lsig_length_to_duration(&self, length: u16, tx_vector: &TxVector, band: Band) -> Duration;

    /// Mode whose error rate governs the reception of `field`.
    fn sig_mode(&self, field: PpduField, tx_vector: &TxVector) -> Option<WifiMode>;

    fn field_failure_reason(&self, field: PpduField) -> DropReason {
        match field {
            PpduField::NonHtHeader => DropReason::LSigFailure,
            PpduField::HtSig => DropReason::HtSigFailure,
            PpduField::SigA => DropReason::SigAFailure,
            PpduField::SigB => DropReason::SigBFailure,
            _ => DropReason::PreambleDetectFailure,
        }
    }

    /// Judges the reception of a header field: a PER draw against the
    /// field's success rate, then the amendment's content checks.
    fn end_receive_field(&self, field: PpduField, input: &FieldRxInput<'_>, rng: &mut dyn RngCore) -> FieldRxStatus {
        let draw: f64 = rng.gen();
        if draw > input.success_rate {
            return FieldRxStatus::drop(self.field_failure_reason(field));
        }
        self.process_field(field, input)
    }

    /// Content checks on a correctly received field.
    fn process_field(&self, _field: PpduField, _input: &FieldRxInput<'_>) -> FieldRxStatus {
        FieldRxStatus::ok()
    }
}

// ============================================================================
// Shared arithmetic
// ============================================================================

/// Receiver must implement the PPDU's amendment to go past the L-SIG.
pub(crate) fn check_class_supported(input: &FieldRxInput<'_>) -> FieldRxStatus {
    if input.caps.standard.supports(input.tx_vector.modulation_class()) {
        FieldRxStatus::ok()
    } else {
        FieldRxStatus::drop(DropReason::UnsupportedSettings)
    }
}

/// Number of data symbols for `size` bytes (SERVICE + PSDU + tail bits).
pub(crate) fn data_symbols(size: u32, bits_per_symbol: (u64, u64), n_es: u64) -> u64 {
    let (num, den) = bits_per_symbol;
    let bits = 16 + 8 * size as u64 + 6 * n_es;
    ceil_div(bits * den, num.max(1))
}

/// Number of LTF symbols for HT/VHT/HE stream counts.
pub(crate) fn n_ltf(nss: u8) -> u64 {
    match nss {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        5 | 6 => 6,
        _ => 8,
    }
}

/// HT/VHT L-SIG length: `ceil((d - 20us - ext) / 4us) * 3 - 3`.
pub(crate) fn ht_lsig_length(duration: Duration, band: Band) -> Result<u16, PpduError> {
    let rest = duration
        .saturating_sub(Duration::from_micros(20))
        .saturating_sub(band.signal_extension())
        .as_nanos() as u64;
    let length = (ceil_div(rest, 4000) * 3).saturating_sub(3);
    if length > MAX_LSIG_LENGTH as u64 {
        return Err(PpduError::DurationTooLong(duration.as_nanos()));
    }
    Ok(length as u16)
}

/// Inverse of [`ht_lsig_length`], on the 4 us legacy grid.
pub(crate) fn ht_lsig_duration(length: u16, band: Band) -> Duration {
    let symbols = ceil_div(length as u64 + 3, 3);
    Duration::from_micros(symbols * 4 + 20) + band.signal_extension()
}

/// Snaps a 4 us-grid duration down to whole data symbols after the preamble.
pub(crate) fn floor_to_symbols(calculated: Duration, preamble: Duration, symbol: Duration, band: Band) -> (u64, Duration) {
    let ext = band.signal_extension();
    let data = calculated.saturating_sub(preamble).saturating_sub(ext).as_nanos() as u64;
    let n_sym = data / symbol.as_nanos().max(1) as u64;
    (n_sym, preamble + symbol * n_sym as u32 + ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn caps(standard: WifiStandard) -> RxCapabilities {
        RxCapabilities {
            standard,
            max_channel_width: 160,
            max_nss: 8,
            bss_color: 0,
            sta_id: 1,
            is_ap: false,
            obss_pd_level_dbm: None,
        }
    }

    #[test]
    fn test_registry_classes() {
        for class in ModulationClass::ALL {
            assert_eq!(phy_entity(class).modulation_class(), class);
        }
        assert_eq!(phy_entity(ModulationClass::Ht).bss_membership_selector(), Some(127));
        assert_eq!(phy_entity(ModulationClass::Vht).bss_membership_selector(), Some(126));
        assert_eq!(phy_entity(ModulationClass::He).bss_membership_selector(), Some(122));
        assert_eq!(phy_entity(ModulationClass::Ofdm).bss_membership_selector(), None);
        assert_eq!(phy_entity(ModulationClass::Ht).mcs_range(), 0..=31);
        assert_eq!(phy_entity(ModulationClass::He).mcs_range(), 0..=11);
    }

    #[test]
    fn test_per_draw() {
        let txv = TxVector::new(WifiMode::ofdm_rate(6).unwrap(), PreambleType::NonHt, 20);
        let caps = caps(WifiStandard::Ieee80211a);
        let entity = phy_entity(ModulationClass::Ofdm);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let sure = FieldRxInput {
            tx_vector: &txv,
            success_rate: 1.0,
            rx_power_dbm: -50.0,
            caps: &caps,
        };
        for _ in 0..100 {
            assert!(entity.end_receive_field(PpduField::NonHtHeader, &sure, &mut rng).success);
        }

        let hopeless = FieldRxInput {
            success_rate: 0.0,
            ..sure
        };
        let status = entity.end_receive_field(PpduField::NonHtHeader, &hopeless, &mut rng);
        assert_eq!(status, FieldRxStatus::drop(DropReason::LSigFailure));
    }

    #[test]
    fn test_unsupported_class() {
        let txv = TxVector::new(WifiMode::vht(0).unwrap(), PreambleType::VhtSu, 20);
        let caps = caps(WifiStandard::Ieee80211n);
        let input = FieldRxInput {
            tx_vector: &txv,
            success_rate: 1.0,
            rx_power_dbm: -50.0,
            caps: &caps,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let status = phy_entity(ModulationClass::Vht).end_receive_field(PpduField::NonHtHeader, &input, &mut rng);
        assert_eq!(status.reason, Some(DropReason::UnsupportedSettings));
        assert_eq!(status.action, RxFailureAction::Drop);
    }

    #[test]
    fn test_data_symbols() {
        // 6 Mbps, 100 bytes: (16 + 800 + 6) / 24 = 34.25 -> 35 symbols
        assert_eq!(data_symbols(100, (24, 1), 1), 35);
    }
}
