use super::{
    check_class_supported, data_symbols, floor_to_symbols, ht_lsig_duration, ht_lsig_length, n_ltf,
    FieldRxInput, FieldRxStatus, PhyEntity,
};
use crate::error::PpduError;
use crate::mode::{data_subcarriers, WifiMode};
use crate::tx_vector::TxVector;
use crate::{ceil_div, Band, DropReason, ModulationClass, PpduField, PreambleType, StaId};
use std::time::Duration;

const VHT_SU_FIELDS: &[PpduField] = &[
    PpduField::Preamble,
    PpduField::NonHtHeader,
    PpduField::SigA,
    PpduField::Training,
    PpduField::SigB,
    PpduField::Data,
];

/// VHT (802.11ac), single user.
#[derive(Debug, Default)]
pub struct VhtPhy;

impl VhtPhy {
    fn n_es(tx_vector: &TxVector) -> u64 {
        let rate = tx_vector.mode().data_rate(
            tx_vector.channel_width(),
            tx_vector.guard_interval_ns(),
            tx_vector.nss(),
        );
        let per_encoder = if tx_vector.guard_interval_ns() == 800 {
            540_000_000
        } else {
            600_000_000
        };
        ceil_div(rate, per_encoder).max(1)
    }

    /// SIG-A disambiguation bit: short GI with `N_SYM mod 10 == 9`.
    pub fn sgi_disambiguation(&self, duration: Duration, tx_vector: &TxVector, band: Band) -> bool {
        if tx_vector.guard_interval_ns() != 400 {
            return false;
        }
        let data = duration
            .saturating_sub(self.preamble_and_header_duration(tx_vector))
            .saturating_sub(band.signal_extension());
        let n_sym = data.as_nanos() / self.symbol_duration(tx_vector).as_nanos();
        n_sym % 10 == 9
    }

    /// Exact PPDU duration from the L-SIG length and the SIG-A
    /// disambiguation bit.
    pub fn duration_from_lsig(&self, length: u16, tx_vector: &TxVector, band: Band, sgi_disambiguation: bool) -> Duration {
        let preamble = self.preamble_and_header_duration(tx_vector);
        let symbol = self.symbol_duration(tx_vector);
        let (mut n_sym, _) = floor_to_symbols(ht_lsig_duration(length, band), preamble, symbol, band);
        if tx_vector.guard_interval_ns() == 400 && sgi_disambiguation {
            n_sym = n_sym.saturating_sub(1);
        }
        preamble + symbol * n_sym as u32 + band.signal_extension()
    }
}

impl PhyEntity for VhtPhy {
    fn modulation_class(&self) -> ModulationClass {
        ModulationClass::Vht
    }

    fn bss_membership_selector(&self) -> Option<u8> {
        Some(126)
    }

    fn ppdu_formats(&self) -> &'static [(PreambleType, &'static [PpduField])] {
        &[(PreambleType::VhtSu, VHT_SU_FIELDS)]
    }

    fn is_mode_allowed(&self, mode: WifiMode, channel_width: u16, nss: u8) -> bool {
        if mode.class() != ModulationClass::Vht
            || !matches!(channel_width, 20 | 40 | 80 | 160)
            || !(1..=8).contains(&nss)
        {
            return false;
        }
        !matches!(
            (mode.index(), channel_width, nss),
            (9, 20, n) if n != 3 && n != 6
        ) && !matches!(
            (mode.index(), channel_width, nss),
            (6, 80, 3) | (6, 80, 7) | (9, 80, 6) | (9, 160, 3)
        )
    }

    fn field_duration(&self, field: PpduField, tx_vector: &TxVector) -> Duration {
        match field {
            PpduField::Preamble => Duration::from_micros(16),
            PpduField::NonHtHeader => Duration::from_micros(4),
            PpduField::SigA => Duration::from_micros(8),
            PpduField::Training => Duration::from_micros(4 + 4 * n_ltf(tx_vector.nss())),
            PpduField::SigB => Duration::from_micros(4),
            _ => Duration::ZERO,
        }
    }

    fn payload_duration(&self, size: u32, tx_vector: &TxVector, band: Band, _sta_id: StaId) -> Duration {
        let n_sd = data_subcarriers(ModulationClass::Vht, tx_vector.channel_width()).unwrap_or(52);
        let bps = tx_vector.mode().data_bits_per_symbol(n_sd, tx_vector.nss());
        let n_sym = data_symbols(size, bps, Self::n_es(tx_vector));
        self.symbol_duration(tx_vector) * n_sym as u32 + band.signal_extension()
    }

    fn duration_to_lsig_length(&self, duration: Duration, _tx_vector: &TxVector, band: Band) -> Result<u16, PpduError> {
        ht_lsig_length(duration, band)
    }

    /// Without the SIG-A disambiguation bit the result can be one symbol long.
    fn lsig_length_to_duration(&self, length: u16, tx_vector: &TxVector, band: Band) -> Duration {
        self.duration_from_lsig(length, tx_vector, band, false)
    }

    fn sig_mode(&self, field: PpduField, tx_vector: &TxVector) -> Option<WifiMode> {
        match field {
            PpduField::NonHtHeader => WifiMode::ofdm_rate(6),
            PpduField::SigA | PpduField::SigB => WifiMode::vht(0),
            PpduField::Data => Some(tx_vector.mode()),
            _ => None,
        }
    }

    fn process_field(&self, field: PpduField, input: &FieldRxInput<'_>) -> FieldRxStatus {
        match field {
            PpduField::NonHtHeader => check_class_supported(input),
            PpduField::SigA => {
                let txv = input.tx_vector;
                if txv.channel_width() > input.caps.max_channel_width
                    || txv.nss() > input.caps.max_nss
                    || !self.is_mode_allowed(txv.mode(), txv.channel_width(), txv.nss())
                {
                    tracing::debug!(
                        mode = %txv.mode(),
                        width = txv.channel_width(),
                        nss = txv.nss(),
                        "VHT-SIG-A announces unsupported settings"
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

    fn txv(mcs: u8, width: u16, gi: u16, nss: u8) -> TxVector {
        TxVector::new(WifiMode::vht(mcs).unwrap(), PreambleType::VhtSu, width)
            .with_guard_interval(gi)
            .with_nss(nss)
    }

    #[test]
    fn test_mcs_exceptions() {
        let mcs9 = WifiMode::vht(9).unwrap();
        let mcs6 = WifiMode::vht(6).unwrap();
        assert!(!VhtPhy.is_mode_allowed(mcs9, 20, 1));
        assert!(VhtPhy.is_mode_allowed(mcs9, 20, 3));
        assert!(VhtPhy.is_mode_allowed(mcs9, 20, 6));
        assert!(!VhtPhy.is_mode_allowed(mcs6, 80, 3));
        assert!(!VhtPhy.is_mode_allowed(mcs6, 80, 7));
        assert!(VhtPhy.is_mode_allowed(mcs6, 80, 2));
        assert!(!VhtPhy.is_mode_allowed(mcs9, 80, 6));
        assert!(!VhtPhy.is_mode_allowed(mcs9, 160, 3));
        assert!(VhtPhy.is_mode_allowed(mcs9, 40, 1));
    }

    #[test]
    fn test_training_ltfs() {
        assert_eq!(VhtPhy.field_duration(PpduField::Training, &txv(0, 20, 800, 1)), Duration::from_micros(8));
        assert_eq!(VhtPhy.field_duration(PpduField::Training, &txv(0, 20, 800, 5)), Duration::from_micros(28));
        assert_eq!(VhtPhy.field_duration(PpduField::Training, &txv(0, 20, 800, 8)), Duration::from_micros(36));
    }

    #[test]
    fn test_lsig_exact_with_disambiguation() {
        for (mcs, width) in [(0u8, 20u16), (4, 40), (7, 80), (8, 160)] {
            for gi in [400u16, 800] {
                for size in (1..3000u32).step_by(37) {
                    let v = txv(mcs, width, gi, 1);
                    let sizes = BTreeMap::from([(crate::SU_STA_ID, size)]);
                    let d = VhtPhy.ppdu_duration(&sizes, &v, Band::Ghz5);
                    let length = VhtPhy.duration_to_lsig_length(d, &v, Band::Ghz5).unwrap();
                    let bit = VhtPhy.sgi_disambiguation(d, &v, Band::Ghz5);
                    assert_eq!(VhtPhy.duration_from_lsig(length, &v, Band::Ghz5, bit), d);

                    let coarse = VhtPhy.lsig_length_to_duration(length, &v, Band::Ghz5);
                    assert!(coarse >= d && coarse - d <= VhtPhy.symbol_duration(&v));
                }
            }
        }
    }
}
