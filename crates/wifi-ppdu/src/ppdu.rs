//! The PPDU value object.
//!
//! A [`Ppdu`] is immutable once built. It keeps the header fields, not the
//! sender's TXVECTOR: [`Ppdu::tx_vector`] decodes them again, exactly as a
//! receiver would, and the duration is derived from the L-SIG (HT-SIG for HT).

use crate::entity::{phy_entity, HePhy, HtPhy, OfdmPhy, PhyEntity, VhtPhy};
use crate::error::{HeaderError, PpduError};
use crate::header::PpduHeader;
use crate::psdu::Psdu;
use crate::ru::RuSpec;
use crate::tx_vector::TxVector;
use crate::{Band, ModulationClass, PreambleType, StaId, MAX_LSIG_LENGTH, SU_STA_ID};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Ppdu {
    uid: u64,
    preamble: PreambleType,
    band: Band,
    channel_center_mhz: u16,
    header: PpduHeader,
    psdus: BTreeMap<StaId, Psdu>,
    tx_duration: Duration,
}

impl Ppdu {
    /// Builds a PPDU: validates the TXVECTOR, encodes the header fields and
    /// derives the duration from them.
    ///
    /// SU PPDUs carry one PSDU under [`SU_STA_ID`]; MU PPDUs carry one PSDU
    /// per allocated station.
    pub fn new(
        psdus: BTreeMap<StaId, Psdu>,
        tx_vector: &TxVector,
        band: Band,
        channel_center_mhz: u16,
        uid: u64,
    ) -> Result<Self, PpduError> {
        tx_vector.validate()?;
        if psdus.is_empty() {
            return Err(PpduError::NoPsdu);
        }
        if tx_vector.is_mu() {
            if let Some(sta_id) = psdus.keys().find(|s| !tx_vector.users().contains_key(s)) {
                return Err(PpduError::UnallocatedStation(*sta_id));
            }
        } else if psdus.len() != 1 || !psdus.contains_key(&SU_STA_ID) {
            return Err(PpduError::InvalidSuPsdu);
        }

        let sizes: BTreeMap<StaId, u32> = psdus.iter().map(|(s, p)| (*s, p.size())).collect();
        let su_size = sizes.values().copied().max().unwrap_or(0);
        let class = tx_vector.modulation_class();
        let entity = phy_entity(class);
        let duration = entity.ppdu_duration(&sizes, tx_vector, band);

        // Only HT-SIG carries the PSDU length; VHT and HE are bounded by the
        // L-SIG duration alone.
        let (lsig_length, psdu_length, sgi_disambiguation) = match class {
            ModulationClass::Ofdm => {
                if su_size > MAX_LSIG_LENGTH as u32 {
                    return Err(PpduError::PsduTooLarge(su_size));
                }
                (su_size as u16, 0, false)
            }
            ModulationClass::Ht => {
                let ht_length = u16::try_from(su_size).map_err(|_| PpduError::PsduTooLarge(su_size))?;
                (entity.duration_to_lsig_length(duration, tx_vector, band)?, ht_length, false)
            }
            ModulationClass::Vht => (
                entity.duration_to_lsig_length(duration, tx_vector, band)?,
                0,
                VhtPhy.sgi_disambiguation(duration, tx_vector, band),
            ),
            ModulationClass::He => (entity.duration_to_lsig_length(duration, tx_vector, band)?, 0, false),
        };
        let header = PpduHeader::encode(tx_vector, lsig_length, psdu_length, sgi_disambiguation)?;

        let mut ppdu = Self {
            uid,
            preamble: tx_vector.preamble(),
            band,
            channel_center_mhz,
            header,
            psdus,
            tx_duration: Duration::ZERO,
        };
        ppdu.tx_duration = ppdu.duration_from_header()?;
        Ok(ppdu)
    }

    fn duration_from_header(&self) -> Result<Duration, HeaderError> {
        let txv = self.tx_vector()?;
        let band = self.band;
        Ok(match &self.header {
            PpduHeader::NonHt { l_sig } => OfdmPhy.lsig_length_to_duration(l_sig.length(), &txv, band),
            PpduHeader::Ht { ht_sig, .. } => HtPhy.duration_from_ht_length(ht_sig.ht_length, &txv, band),
            PpduHeader::Vht { l_sig, sig_a } => {
                VhtPhy.duration_from_lsig(l_sig.length(), &txv, band, sig_a.sgi_disambiguation)
            }
            PpduHeader::He { l_sig, .. } => HePhy.lsig_length_to_duration(l_sig.length(), &txv, band),
        })
    }

    /// TXVECTOR decoded from the header fields.
    pub fn tx_vector(&self) -> Result<TxVector, HeaderError> {
        let aggregation = self.psdus.values().any(Psdu::is_aggregate);
        self.header.decode(self.preamble, aggregation)
    }

    /// Same header and payload, same uid, duration recomputed from the
    /// decoded TXVECTOR. Used for retransmissions.
    pub fn copy(&self) -> Result<Ppdu, PpduError> {
        let txv = self.tx_vector()?;
        Ppdu::new(self.psdus.clone(), &txv, self.band, self.channel_center_mhz, self.uid)
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn preamble(&self) -> PreambleType {
        self.preamble
    }

    pub fn modulation_class(&self) -> ModulationClass {
        self.preamble.modulation_class()
    }

    pub fn band(&self) -> Band {
        self.band
    }

    pub fn channel_center_mhz(&self) -> u16 {
        self.channel_center_mhz
    }

    pub fn channel_width(&self) -> u16 {
        self.header.channel_width()
    }

    pub fn header(&self) -> &PpduHeader {
        &self.header
    }

    pub fn tx_duration(&self) -> Duration {
        self.tx_duration
    }

    pub fn is_mu(&self) -> bool {
        self.preamble.is_mu()
    }

    pub fn psdus(&self) -> &BTreeMap<StaId, Psdu> {
        &self.psdus
    }

    /// The PSDU of an SU PPDU (first PSDU otherwise).
    pub fn psdu(&self) -> Option<&Psdu> {
        self.psdus.get(&SU_STA_ID).or_else(|| self.psdus.values().next())
    }

    /// BSS color announced in HE-SIG-A, 0 for other formats.
    pub fn bss_color(&self) -> u8 {
        match &self.header {
            PpduHeader::He { sig_a, .. } => sig_a.bss_color,
            _ => 0,
        }
    }

    /// Station that sent an HE TB PPDU.
    pub fn tb_sta_id(&self) -> Option<StaId> {
        match &self.header {
            PpduHeader::He { tb_user, .. } => tb_user.map(|(sta_id, _)| sta_id),
            _ => None,
        }
    }

    /// PSDU a station should receive.
    ///
    /// SU PPDUs return their only PSDU. MU PPDUs check the BSS color first
    /// (0 on either side matches any color): DL MU returns the station's own
    /// PSDU, UL MU the single PSDU its sender contributed.
    pub fn psdu_for(&self, bss_color: u8, sta_id: StaId) -> Option<&Psdu> {
        if !self.is_mu() {
            return self.psdus.get(&SU_STA_ID);
        }
        let ppdu_color = self.bss_color();
        if bss_color != 0 && ppdu_color != 0 && bss_color != ppdu_color {
            return None;
        }
        if self.preamble.is_dl_mu() {
            self.psdus.get(&sta_id)
        } else {
            self.psdus.values().next()
        }
    }

    /// Centre frequencies of the 20 MHz subchannels the PPDU occupies.
    pub fn band_centers_mhz(&self) -> Vec<u16> {
        let width = self.channel_width();
        let first = self.channel_center_mhz - width / 2 + 10;
        (0..width / 20).map(|k| first + 20 * k).collect()
    }

    /// RU a station's payload is carried on, for HE MU and HE TB PPDUs.
    pub fn ru_for(&self, sta_id: StaId) -> Option<RuSpec> {
        match &self.header {
            PpduHeader::He { sig_b: Some(sig_b), .. } => sig_b.users.get(&sta_id).map(|u| u.ru),
            PpduHeader::He {
                tb_user: Some((tb_sta, user)),
                ..
            } if *tb_sta == sta_id => Some(user.ru),
            _ => None,
        }
    }

    /// Total PSDU bytes.
    pub fn size(&self) -> u32 {
        self.psdus.values().map(Psdu::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::WifiMode;
    use crate::psdu::{MacAddr, Mpdu};
    use crate::ru::RuType;
    use crate::tx_vector::HeMuUserInfo;

    fn psdu(len: usize) -> Psdu {
        Psdu::single(Mpdu::new(MacAddr::BROADCAST, MacAddr::new([2, 0, 0, 0, 0, 1]), 1, vec![0; len]))
    }

    fn su_map(len: usize) -> BTreeMap<StaId, Psdu> {
        BTreeMap::from([(SU_STA_ID, psdu(len))])
    }

    #[test]
    fn test_vht_su_roundtrip() {
        for gi in [400u16, 800] {
            for len in [10usize, 500, 1499, 2500] {
                let txv = TxVector::new(WifiMode::vht(8).unwrap(), PreambleType::VhtSu, 80)
                    .with_guard_interval(gi)
                    .with_nss(2);
                let ppdu = Ppdu::new(su_map(len), &txv, Band::Ghz5, 5210, 7).unwrap();
                assert_eq!(ppdu.tx_vector().unwrap(), txv);
                let sizes = BTreeMap::from([(SU_STA_ID, ppdu.size())]);
                assert_eq!(ppdu.tx_duration(), VhtPhy.ppdu_duration(&sizes, &txv, Band::Ghz5));
            }
        }
    }

    fn large_ampdu() -> BTreeMap<StaId, Psdu> {
        let mpdus = (0..24)
            .map(|seq| Mpdu::new(MacAddr::new([2, 0, 0, 0, 0, 2]), MacAddr::new([2, 0, 0, 0, 0, 1]), seq, vec![0; 3000]))
            .collect();
        BTreeMap::from([(SU_STA_ID, Psdu::ampdu(mpdus))])
    }

    #[test]
    fn test_vht_ampdu_over_64k() {
        let txv = TxVector::new(WifiMode::vht(9).unwrap(), PreambleType::VhtSu, 80)
            .with_nss(2)
            .with_aggregation(true);
        let psdus = large_ampdu();
        assert!(psdus[&SU_STA_ID].size() > u16::MAX as u32);

        let ppdu = Ppdu::new(psdus, &txv, Band::Ghz5, 5210, 3).unwrap();
        assert_eq!(ppdu.tx_vector().unwrap(), txv);
        let sizes = BTreeMap::from([(SU_STA_ID, ppdu.size())]);
        assert_eq!(ppdu.tx_duration(), VhtPhy.ppdu_duration(&sizes, &txv, Band::Ghz5));
    }

    #[test]
    fn test_he_ampdu_over_64k() {
        let txv = TxVector::new(WifiMode::he(11).unwrap(), PreambleType::HeSu, 80)
            .with_nss(2)
            .with_aggregation(true);
        let ppdu = Ppdu::new(large_ampdu(), &txv, Band::Ghz5, 5210, 4).unwrap();
        assert!(ppdu.size() > u16::MAX as u32);
        assert_eq!(ppdu.tx_vector().unwrap(), txv);
        assert!(ppdu.tx_duration() > Duration::ZERO);
    }

    #[test]
    fn test_ht_psdu_over_64k_rejected() {
        let txv = TxVector::new(WifiMode::ht(15).unwrap(), PreambleType::HtMf, 40).with_aggregation(true);
        assert!(matches!(
            Ppdu::new(large_ampdu(), &txv, Band::Ghz5, 5190, 5),
            Err(PpduError::PsduTooLarge(_))
        ));
    }

    #[test]
    fn test_ht_duration_from_ht_sig() {
        let txv = TxVector::new(WifiMode::ht(9).unwrap(), PreambleType::HtMf, 40).with_guard_interval(400);
        let ppdu = Ppdu::new(su_map(1200), &txv, Band::Ghz2_4, 2422, 1).unwrap();
        let sizes = BTreeMap::from([(SU_STA_ID, ppdu.size())]);
        assert_eq!(ppdu.tx_duration(), HtPhy.ppdu_duration(&sizes, &txv, Band::Ghz2_4));
        assert_eq!(ppdu.tx_vector().unwrap(), txv);
    }

    #[test]
    fn test_non_ht_length_is_psdu_size() {
        let txv = TxVector::new(WifiMode::ofdm_rate(24).unwrap(), PreambleType::NonHt, 20);
        let ppdu = Ppdu::new(su_map(100), &txv, Band::Ghz5, 5180, 1).unwrap();
        assert_eq!(ppdu.header().l_sig().length(), 130);
        assert!(matches!(
            Ppdu::new(su_map(5000), &txv, Band::Ghz5, 5180, 1),
            Err(PpduError::PsduTooLarge(_))
        ));
    }

    #[test]
    fn test_su_requires_su_sta_id() {
        let txv = TxVector::new(WifiMode::he(3).unwrap(), PreambleType::HeSu, 20);
        let psdus = BTreeMap::from([(5, psdu(100))]);
        assert_eq!(Ppdu::new(psdus, &txv, Band::Ghz5, 5180, 1), Err(PpduError::InvalidSuPsdu));
        assert_eq!(Ppdu::new(BTreeMap::new(), &txv, Band::Ghz5, 5180, 1), Err(PpduError::NoPsdu));
    }

    #[test]
    fn test_copy_keeps_uid_and_duration() {
        let txv = TxVector::new(WifiMode::he(5).unwrap(), PreambleType::HeSu, 40)
            .with_guard_interval(1600)
            .with_bss_color(3);
        let ppdu = Ppdu::new(su_map(800), &txv, Band::Ghz6, 5975, 42).unwrap();
        let copy = ppdu.copy().unwrap();
        assert_eq!(copy.uid(), 42);
        assert_eq!(copy.tx_duration(), ppdu.tx_duration());
        assert_eq!(copy, ppdu);
    }

    #[test]
    fn test_dl_mu_psdu_for() {
        let txv = TxVector::new(WifiMode::he(0).unwrap(), PreambleType::HeMu, 40)
            .with_bss_color(7)
            .with_user(1, HeMuUserInfo::new(RuSpec::new(RuType::Ru242, 1), 4, 1))
            .with_user(2, HeMuUserInfo::new(RuSpec::new(RuType::Ru242, 2), 7, 1));
        let psdus = BTreeMap::from([(1, psdu(300)), (2, psdu(600))]);
        let ppdu = Ppdu::new(psdus, &txv, Band::Ghz5, 5190, 9).unwrap();

        assert_eq!(ppdu.psdu_for(7, 2).map(Psdu::size), Some(630));
        assert_eq!(ppdu.psdu_for(0, 1).map(Psdu::size), Some(330));
        assert!(ppdu.psdu_for(4, 1).is_none());
        assert!(ppdu.psdu_for(7, 3).is_none());
        assert_eq!(ppdu.ru_for(2), Some(RuSpec::new(RuType::Ru242, 2)));
        assert_eq!(ppdu.tx_vector().unwrap(), txv);
    }

    #[test]
    fn test_unallocated_mu_station() {
        let txv = TxVector::new(WifiMode::he(0).unwrap(), PreambleType::HeMu, 20)
            .with_user(1, HeMuUserInfo::new(RuSpec::new(RuType::Ru106, 1), 4, 1));
        let psdus = BTreeMap::from([(2, psdu(300))]);
        assert_eq!(
            Ppdu::new(psdus, &txv, Band::Ghz5, 5180, 1),
            Err(PpduError::UnallocatedStation(2))
        );
    }

    #[test]
    fn test_tb_psdu_for_and_sender() {
        let txv = TxVector::new(WifiMode::he(0).unwrap(), PreambleType::HeTb, 20)
            .with_bss_color(1)
            .with_user(4, HeMuUserInfo::new(RuSpec::new(RuType::Ru106, 2), 3, 1));
        let psdus = BTreeMap::from([(4, psdu(200))]);
        let ppdu = Ppdu::new(psdus, &txv, Band::Ghz5, 5180, 77).unwrap();
        assert_eq!(ppdu.tb_sta_id(), Some(4));
        assert_eq!(ppdu.psdu_for(1, SU_STA_ID).map(Psdu::size), Some(230));
        assert!(ppdu.psdu_for(2, SU_STA_ID).is_none());
        assert_eq!(ppdu.tx_duration().as_nanos() % 4000, 0);
        let decoded = ppdu.tx_vector().unwrap();
        assert_eq!(decoded.length(), Some(ppdu.header().l_sig().length()));
    }

    #[test]
    fn test_band_centers() {
        let txv = TxVector::new(WifiMode::vht(0).unwrap(), PreambleType::VhtSu, 80);
        let ppdu = Ppdu::new(su_map(100), &txv, Band::Ghz5, 5210, 1).unwrap();
        assert_eq!(ppdu.band_centers_mhz(), vec![5180, 5200, 5220, 5240]);
    }
}
