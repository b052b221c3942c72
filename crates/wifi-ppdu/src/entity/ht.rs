use super::{
    check_class_supported, data_symbols, floor_to_symbols, ht_lsig_duration, ht_lsig_length, n_ltf,
    FieldRxInput, FieldRxStatus, PhyEntity,
};
use crate::error::PpduError;
use crate::mode::{data_subcarriers, WifiMode};
use crate::tx_vector::TxVector;
use crate::{ceil_div, Band, DropReason, ModulationClass, PpduField, PreambleType, StaId};
use std::time::Duration;

const HT_MF_FIELDS: &[PpduField] = &[
    PpduField::Preamble,
    PpduField::NonHtHeader,
    PpduField::HtSig,
    PpduField::Training,
    PpduField::Data,
];

/// HT (802.11n), mixed format.
#[derive(Debug, Default)]
pub struct HtPhy;

impl HtPhy {
    /// BCC encoders needed for the data rate.
    fn n_es(tx_vector: &TxVector) -> u64 {
        let rate = tx_vector.mode().data_rate(
            tx_vector.channel_width(),
            tx_vector.guard_interval_ns(),
            tx_vector.nss(),
        );
        let per_encoder = if tx_vector.guard_interval_ns() == 800 {
            270_000_000
        } else {
            300_000_000
        };
        ceil_div(rate, per_encoder).max(1)
    }

    /// Duration carried by the HT-SIG length, which is exact.
    pub fn duration_from_ht_length(&self, ht_length: u16, tx_vector: &TxVector, band: Band) -> Duration {
        self.preamble_and_header_duration(tx_vector)
            + self.payload_duration(ht_length as u32, tx_vector, band, crate::SU_STA_ID)
    }
}

impl PhyEntity for HtPhy {
    fn modulation_class(&self) -> ModulationClass {
        ModulationClass::Ht
    }

    fn bss_membership_selector(&self) -> Option<u8> {
        Some(127)
    }

    fn ppdu_formats(&self) -> &'static [(PreambleType, &'static [PpduField])] {
        &[(PreambleType::HtMf, HT_MF_FIELDS)]
    }

    fn is_mode_allowed(&self, mode: WifiMode, channel_width: u16, nss: u8) -> bool {
        mode.class() == ModulationClass::Ht
            && matches!(channel_width, 20 | 40)
            && mode.ht_nss() == Some(nss)
    }

    fn field_duration(&self, field: PpduField, tx_vector: &TxVector) -> Duration {
        match field {
            PpduField::Preamble => Duration::from_micros(16),
            PpduField::NonHtHeader => Duration::from_micros(4),
            PpduField::HtSig => Duration::from_micros(8),
            PpduField::Training => Duration::from_micros(4 + 4 * n_ltf(tx_vector.nss())),
            _ => Duration::ZERO,
        }
    }

    fn payload_duration(&self, size: u32, tx_vector: &TxVector, band: Band, _sta_id: StaId) -> Duration {
        let n_sd = data_subcarriers(ModulationClass::Ht, tx_vector.channel_width()).unwrap_or(52);
        let bps = tx_vector.mode().data_bits_per_symbol(n_sd, tx_vector.nss());
        let n_sym = data_symbols(size, bps, Self::n_es(tx_vector));
        self.symbol_duration(tx_vector) * n_sym as u32 + band.signal_extension()
    }

    fn duration_to_lsig_length(&self, duration: Duration, _tx_vector: &TxVector, band: Band) -> Result<u16, PpduError> {
        ht_lsig_length(duration, band)
    }

    fn lsig_length_to_duration(&self, length: u16, tx_vector: &TxVector, band: Band) -> Duration {
        let calculated = ht_lsig_duration(length, band);
        floor_to_symbols(
            calculated,
            self.preamble_and_header_duration(tx_vector),
            self.symbol_duration(tx_vector),
            band,
        )
        .1
    }

    fn sig_mode(&self, field: PpduField, tx_vector: &TxVector) -> Option<WifiMode> {
        match field {
            PpduField::NonHtHeader => WifiMode::ofdm_rate(6),
            PpduField::HtSig => WifiMode::ht(0),
            PpduField::Data => Some(tx_vector.mode()),
            _ => None,
        }
    }

    fn process_field(&self, field: PpduField, input: &FieldRxInput<'_>) -> FieldRxStatus {
        match field {
            PpduField::NonHtHeader => check_class_supported(input),
            PpduField::HtSig => {
                let txv = input.tx_vector;
                if txv.channel_width() > input.caps.max_channel_width
                    || txv.nss() > input.caps.max_nss
                    || !self.is_mode_allowed(txv.mode(), txv.channel_width(), txv.nss())
                {
                    tracing::debug!(
                        mode = %txv.mode(),
                        width = txv.channel_width(),
                        nss = txv.nss(),
                        "HT-SIG announces unsupported settings"
                    );
                    FieldRxStatus::drop(DropReason::UnsupportedSettings)
                } else {
                    FieldRxStatus::ok()
                }
            }
            _ => FieldRxStatus::ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_ht_field_durations() {
        let txv = TxVector::new(WifiMode::ht(20).unwrap(), PreambleType::HtMf, 40);
        assert_eq!(txv.nss(), 3);
        // HT-STF + 4 HT-LTFs for 3 streams
        assert_eq!(HtPhy.field_duration(PpduField::Training, &txv), Duration::from_micros(20));
        assert_eq!(HtPhy.preamble_and_header_duration(&txv), Duration::from_micros(48));
    }

    #[test]
    fn test_ht_payload() {
        // MCS7 20 MHz: 260 bits/symbol, 1000 bytes -> ceil(8022 / 260) = 31
        let txv = TxVector::new(WifiMode::ht(7).unwrap(), PreambleType::HtMf, 20);
        let d = HtPhy.payload_duration(1000, &txv, Band::Ghz5, crate::SU_STA_ID);
        assert_eq!(d, Duration::from_micros(31 * 4));
        let sgi = txv.with_guard_interval(400);
        let d = HtPhy.payload_duration(1000, &sgi, Band::Ghz5, crate::SU_STA_ID);
        assert_eq!(d, Duration::from_nanos(31 * 3600));
    }

    #[test]
    fn test_ht_lsig_within_one_symbol() {
        for gi in [400u16, 800] {
            for size in (1..3000u32).step_by(97) {
                for band in [Band::Ghz2_4, Band::Ghz5] {
                    let txv = TxVector::new(WifiMode::ht(5).unwrap(), PreambleType::HtMf, 20)
                        .with_guard_interval(gi);
                    let sizes = BTreeMap::from([(crate::SU_STA_ID, size)]);
                    let d = HtPhy.ppdu_duration(&sizes, &txv, band);
                    let length = HtPhy.duration_to_lsig_length(d, &txv, band).unwrap();
                    let back = HtPhy.lsig_length_to_duration(length, &txv, band);
                    let symbol = HtPhy.symbol_duration(&txv);
                    assert!(back >= d && back - d <= symbol, "{:?} vs {:?}", back, d);
                    assert_eq!(HtPhy.duration_from_ht_length(size as u16, &txv, band), d);
                }
            }
        }
    }
}
