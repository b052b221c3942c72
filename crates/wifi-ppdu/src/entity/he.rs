use super::{check_class_supported, data_symbols, floor_to_symbols, n_ltf, FieldRxInput, FieldRxStatus, PhyEntity};
use crate::error::PpduError;
use crate::mode::WifiMode;
use crate::ru::RuType;
use crate::tx_vector::TxVector;
use crate::{ceil_div, Band, DropReason, ModulationClass, PpduField, PreambleType, StaId, MAX_LSIG_LENGTH};
use std::collections::BTreeMap;
use std::time::Duration;

const HE_SU_FIELDS: &[PpduField] = &[
    PpduField::Preamble,
    PpduField::NonHtHeader,
    PpduField::SigA,
    PpduField::Training,
    PpduField::Data,
];

const HE_MU_FIELDS: &[PpduField] = &[
    PpduField::Preamble,
    PpduField::NonHtHeader,
    PpduField::SigA,
    PpduField::SigB,
    PpduField::Training,
    PpduField::Data,
];

const HE_FORMATS: &[(PreambleType, &[PpduField])] = &[
    (PreambleType::HeSu, HE_SU_FIELDS),
    (PreambleType::HeErSu, HE_SU_FIELDS),
    (PreambleType::HeMu, HE_MU_FIELDS),
    (PreambleType::HeTb, HE_SU_FIELDS),
];

/// HE-SIG-B symbol duration.
const SIG_B_SYMBOL: Duration = Duration::from_micros(4);

/// HE (802.11ax): SU, ER SU, MU and TB formats.
#[derive(Debug, Default)]
pub struct HePhy;

impl HePhy {
    /// The `m` term of the L-SIG length formula.
    fn lsig_m(preamble: PreambleType) -> u64 {
        match preamble {
            PreambleType::HeMu | PreambleType::HeErSu => 1,
            _ => 2,
        }
    }

    /// HE-SIG-B size in bits for the given per-content-channel user counts.
    ///
    /// Common field: one 8-bit RU allocation subfield per 40 MHz (a single
    /// one up to 40 MHz), a centre-26 bit above 40 MHz, CRC and tail.
    /// User field: blocks of two 21-bit users with CRC and tail (52 bits),
    /// the last user alone in a 31-bit block.
    pub fn sigb_field_size(channel_width: u16, users_per_cc: (usize, usize)) -> u64 {
        let common: u64 = if channel_width <= 40 {
            8 + 4 + 6
        } else {
            8 * (channel_width as u64 / 40) + 1 + 4 + 6
        };
        let max_users = users_per_cc.0.max(users_per_cc.1) as u64;
        let user_specific = (max_users / 2) * (2 * 21 + 4 + 6) + (max_users % 2) * (21 + 4 + 6);
        common + user_specific
    }

    /// HE-SIG-B duration of an HE MU TXVECTOR.
    pub fn sigb_duration(&self, tx_vector: &TxVector) -> Duration {
        if !tx_vector.preamble().is_dl_mu() {
            return Duration::ZERO;
        }
        let size = Self::sigb_field_size(tx_vector.channel_width(), tx_vector.sigb_users_per_content_channel());
        let (num, den) = WifiMode::vht(tx_vector.sigb_mcs())
            .unwrap_or_else(|| WifiMode::all(ModulationClass::Vht)[0])
            .data_bits_per_symbol(52, 1);
        let n_sym = ceil_div(size * den, num);
        SIG_B_SYMBOL * n_sym as u32
    }

    fn user_params(tx_vector: &TxVector, sta_id: StaId) -> (WifiMode, u32, u8) {
        match tx_vector.users().get(&sta_id) {
            Some(user) if tx_vector.is_mu() => (
                tx_vector.mode_for(sta_id),
                user.ru.ru_type.data_subcarriers(),
                user.nss,
            ),
            _ => (
                tx_vector.mode(),
                RuType::full_band(tx_vector.channel_width())
                    .map_or(234, |ru| ru.data_subcarriers()),
                tx_vector.nss(),
            ),
        }
    }
}

impl PhyEntity for HePhy {
    fn modulation_class(&self) -> ModulationClass {
        ModulationClass::He
    }

    fn bss_membership_selector(&self) -> Option<u8> {
        Some(122)
    }

    fn ppdu_formats(&self) -> &'static [(PreambleType, &'static [PpduField])] {
        HE_FORMATS
    }

    fn is_mode_allowed(&self, mode: WifiMode, channel_width: u16, nss: u8) -> bool {
        mode.class() == ModulationClass::He
            && matches!(channel_width, 20 | 40 | 80 | 160)
            && (1..=8).contains(&nss)
    }

    fn field_duration(&self, field: PpduField, tx_vector: &TxVector) -> Duration {
        let preamble = tx_vector.preamble();
        match field {
            PpduField::Preamble => Duration::from_micros(16),
            PpduField::NonHtHeader => Duration::from_micros(8),
            PpduField::SigA if preamble == PreambleType::HeErSu => Duration::from_micros(16),
            PpduField::SigA => Duration::from_micros(8),
            PpduField::SigB => self.sigb_duration(tx_vector),
            PpduField::Training => {
                let stf = if preamble == PreambleType::HeTb { 8_000 } else { 4_000 };
                let ltf = tx_vector.he_ltf_type() as u64 * 3_200 + tx_vector.guard_interval_ns() as u64;
                Duration::from_nanos(stf + n_ltf(tx_vector.max_nss()) * ltf)
            }
            _ => Duration::ZERO,
        }
    }

    fn payload_duration(&self, size: u32, tx_vector: &TxVector, band: Band, sta_id: StaId) -> Duration {
        let (mode, n_sd, nss) = Self::user_params(tx_vector, sta_id);
        let n_sym = data_symbols(size, mode.data_bits_per_symbol(n_sd, nss), 1);
        self.symbol_duration(tx_vector) * n_sym as u32 + band.signal_extension()
    }

    /// HE TB PPDUs take the duration imposed by the trigger when known, and
    /// are otherwise quantized through the L-SIG length like the receiver
    /// will see them.
    fn ppdu_duration(&self, psdu_sizes: &BTreeMap<StaId, u32>, tx_vector: &TxVector, band: Band) -> Duration {
        if tx_vector.preamble() == PreambleType::HeTb {
            if let Some(length) = tx_vector.length() {
                return self.lsig_length_to_duration(length, tx_vector, band);
            }
        }
        let payload = psdu_sizes
            .iter()
            .map(|(sta_id, size)| self.payload_duration(*size, tx_vector, band, *sta_id))
            .max()
            .unwrap_or(Duration::ZERO);
        let duration = self.preamble_and_header_duration(tx_vector) + payload;
        if tx_vector.preamble() == PreambleType::HeTb {
            match self.duration_to_lsig_length(duration, tx_vector, band) {
                Ok(length) => self.lsig_length_to_duration(length, tx_vector, band),
                Err(_) => duration,
            }
        } else {
            duration
        }
    }

    fn duration_to_lsig_length(&self, duration: Duration, tx_vector: &TxVector, band: Band) -> Result<u16, PpduError> {
        let rest = duration
            .saturating_sub(Duration::from_micros(20))
            .saturating_sub(band.signal_extension())
            .as_nanos() as u64;
        let length = (ceil_div(rest, 4000) * 3)
            .saturating_sub(3)
            .saturating_sub(Self::lsig_m(tx_vector.preamble()));
        if length > MAX_LSIG_LENGTH as u64 {
            return Err(PpduError::DurationTooLong(duration.as_nanos()));
        }
        Ok(length as u16)
    }

    fn lsig_length_to_duration(&self, length: u16, tx_vector: &TxVector, band: Band) -> Duration {
        let m = Self::lsig_m(tx_vector.preamble());
        let calculated =
            Duration::from_micros(ceil_div(length as u64 + 3 + m, 3) * 4 + 20) + band.signal_extension();
        if tx_vector.preamble() == PreambleType::HeTb {
            return calculated;
        }
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
            PpduField::SigA => WifiMode::vht(0),
            PpduField::SigB => WifiMode::vht(tx_vector.sigb_mcs()),
            PpduField::Data => Some(tx_vector.mode()),
            _ => None,
        }
    }

    fn process_field(&self, field: PpduField, input: &FieldRxInput<'_>) -> FieldRxStatus {
        let txv = input.tx_vector;
        let caps = input.caps;
        match field {
            PpduField::NonHtHeader => check_class_supported(input),
            PpduField::SigA => {
                if txv.preamble() == PreambleType::HeTb && !caps.is_ap {
                    tracing::debug!("HE TB PPDU received by a non-AP station");
                    return FieldRxStatus::drop(DropReason::Filtered);
                }
                if txv.channel_width() > caps.max_channel_width {
                    return FieldRxStatus::drop(DropReason::UnsupportedSettings);
                }
                let foreign = caps.bss_color != 0 && txv.bss_color() != 0 && txv.bss_color() != caps.bss_color;
                if foreign {
                    if let Some(level) = caps.obss_pd_level_dbm {
                        if input.rx_power_dbm < level {
                            tracing::debug!(
                                color = txv.bss_color(),
                                rx_power_dbm = input.rx_power_dbm,
                                level,
                                "OBSS PPDU below OBSS-PD level, resetting CCA"
                            );
                            return FieldRxStatus::abort(DropReason::ObssPdCcaReset);
                        }
                    }
                    return FieldRxStatus::drop(DropReason::Filtered);
                }
                let nss = if txv.preamble() == PreambleType::HeMu {
                    1
                } else {
                    txv.max_nss()
                };
                if nss > caps.max_nss {
                    return FieldRxStatus::drop(DropReason::UnsupportedSettings);
                }
                FieldRxStatus::ok()
            }
            PpduField::SigB => match txv.users().get(&caps.sta_id) {
                None => FieldRxStatus::drop(DropReason::Filtered),
                Some(user) if user.nss > caps.max_nss => FieldRxStatus::drop(DropReason::UnsupportedSettings),
                Some(_) => FieldRxStatus::ok(),
            },
            _ => FieldRxStatus::ok(),
        }
    }
}
