use super::{data_symbols, PhyEntity};
use crate::error::PpduError;
use crate::mode::WifiMode;
use crate::tx_vector::TxVector;
use crate::{Band, ModulationClass, PpduField, PreambleType, StaId, MAX_LSIG_LENGTH};
use std::time::Duration;

const NON_HT_FIELDS: &[PpduField] = &[PpduField::Preamble, PpduField::NonHtHeader, PpduField::Data];

const DATA_SUBCARRIERS: u32 = 48;
const SYMBOL: Duration = Duration::from_micros(4);

/// Legacy OFDM (802.11a/g).
#[derive(Debug, Default)]
pub struct OfdmPhy;

impl OfdmPhy {
    fn bits_per_symbol(mode: WifiMode) -> (u64, u64) {
        mode.data_bits_per_symbol(DATA_SUBCARRIERS, 1)
    }

    fn header() -> Duration {
        Duration::from_micros(20)
    }
}

impl PhyEntity for OfdmPhy {
    fn modulation_class(&self) -> ModulationClass {
        ModulationClass::Ofdm
    }

    fn ppdu_formats(&self) -> &'static [(PreambleType, &'static [PpduField])] {
        &[(PreambleType::NonHt, NON_HT_FIELDS)]
    }

    fn is_mode_allowed(&self, mode: WifiMode, channel_width: u16, nss: u8) -> bool {
        mode.class() == ModulationClass::Ofdm && channel_width == 20 && nss == 1
    }

    fn field_duration(&self, field: PpduField, _tx_vector: &TxVector) -> Duration {
        match field {
            PpduField::Preamble => Duration::from_micros(16),
            PpduField::NonHtHeader => Duration::from_micros(4),
            _ => Duration::ZERO,
        }
    }

    fn payload_duration(&self, size: u32, tx_vector: &TxVector, band: Band, _sta_id: StaId) -> Duration {
        let n_sym = data_symbols(size, Self::bits_per_symbol(tx_vector.mode()), 1);
        SYMBOL * n_sym as u32 + band.signal_extension()
    }

    /// Largest PSDU that fits in `duration`. For a duration produced by
    /// [`PhyEntity::ppdu_duration`] this maps back to exactly that duration.
    fn duration_to_lsig_length(&self, duration: Duration, tx_vector: &TxVector, band: Band) -> Result<u16, PpduError> {
        let data = duration
            .saturating_sub(Self::header())
            .saturating_sub(band.signal_extension());
        let n_sym = (data.as_nanos() / SYMBOL.as_nanos()) as u64;
        let (num, den) = Self::bits_per_symbol(tx_vector.mode());
        let bits = n_sym * num / den;
        let bytes = bits.saturating_sub(22) / 8;
        if bytes > MAX_LSIG_LENGTH as u64 {
            return Err(PpduError::DurationTooLong(duration.as_nanos()));
        }
        Ok(bytes as u16)
    }

    fn lsig_length_to_duration(&self, length: u16, tx_vector: &TxVector, band: Band) -> Duration {
        Self::header() + self.payload_duration(length as u32, tx_vector, band, crate::SU_STA_ID)
    }

    fn sig_mode(&self, field: PpduField, tx_vector: &TxVector) -> Option<WifiMode> {
        match field {
            PpduField::NonHtHeader => WifiMode::ofdm_rate(6),
            PpduField::Data => Some(tx_vector.mode()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn txv(mbps: u8) -> TxVector {
        TxVector::new(WifiMode::ofdm_rate(mbps).unwrap(), PreambleType::NonHt, 20)
    }

    #[test]
    fn test_duration_1500_bytes_6mbps() {
        // ceil((16 + 12000 + 6) / 24) = 501 symbols
        let sizes = BTreeMap::from([(crate::SU_STA_ID, 1500u32)]);
        let d = OfdmPhy.ppdu_duration(&sizes, &txv(6), Band::Ghz5);
        assert_eq!(d, Duration::from_micros(20 + 501 * 4));
        let d24 = OfdmPhy.ppdu_duration(&sizes, &txv(6), Band::Ghz2_4);
        assert_eq!(d24, d + Duration::from_micros(6));
    }

    #[test]
    fn test_lsig_roundtrip_exact() {
        for mbps in [6u8, 9, 12, 18, 24, 36, 48, 54] {
            for size in [14u32, 100, 1500, 4000] {
                for band in [Band::Ghz5, Band::Ghz2_4] {
                    let v = txv(mbps);
                    let d = OfdmPhy.lsig_length_to_duration(size as u16, &v, band);
                    let length = OfdmPhy.duration_to_lsig_length(d, &v, band).unwrap();
                    assert!(length as u32 >= size);
                    assert_eq!(OfdmPhy.lsig_length_to_duration(length, &v, band), d);
                }
            }
        }
    }
}
