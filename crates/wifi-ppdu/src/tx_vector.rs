//! TXVECTOR: the parameters a PPDU is transmitted with.

use crate::entity::phy_entity;
use crate::error::TxVectorError;
use crate::mode::WifiMode;
use crate::ru::{users_per_content_channel, RuSpec};
use crate::{ModulationClass, PreambleType, StaId, MAX_LSIG_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-station allocation inside an HE MU or HE TB PPDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeMuUserInfo {
    pub ru: RuSpec,
    /// HE MCS index.
    pub mcs: u8,
    pub nss: u8,
}

impl HeMuUserInfo {
    pub fn new(ru: RuSpec, mcs: u8, nss: u8) -> Self {
        Self { ru, mcs, nss }
    }

    pub fn mode(&self) -> Option<WifiMode> {
        WifiMode::he(self.mcs)
    }
}

/// Transmission parameters of one PPDU.
///
/// Built with [`TxVector::new`] and the `with_*` setters, then checked with
/// [`TxVector::validate`]. A PPDU only stores the header fields derived from
/// it; the receiver rebuilds an equal TXVECTOR from those fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxVector {
    mode: WifiMode,
    preamble: PreambleType,
    channel_width: u16,
    guard_interval_ns: u16,
    nss: u8,
    bss_color: u8,
    sigb_mcs: u8,
    he_ltf_type: u8,
    length: Option<u16>,
    aggregation: bool,
    users: BTreeMap<StaId, HeMuUserInfo>,
}

impl TxVector {
    /// Creates a TXVECTOR with an 800 ns guard interval, one spatial
    /// stream, no BSS color and a 2x HE-LTF.
    pub fn new(mode: WifiMode, preamble: PreambleType, channel_width: u16) -> Self {
        Self {
            mode,
            preamble,
            channel_width,
            guard_interval_ns: 800,
            nss: mode.ht_nss().unwrap_or(1),
            bss_color: 0,
            sigb_mcs: 0,
            he_ltf_type: 2,
            length: None,
            aggregation: false,
            users: BTreeMap::new(),
        }
    }

    pub fn with_guard_interval(mut self, ns: u16) -> Self {
        self.guard_interval_ns = ns;
        self
    }

    pub fn with_nss(mut self, nss: u8) -> Self {
        self.nss = nss;
        self
    }

    pub fn with_bss_color(mut self, color: u8) -> Self {
        self.bss_color = color;
        self
    }

    pub fn with_sigb_mcs(mut self, mcs: u8) -> Self {
        self.sigb_mcs = mcs;
        self
    }

    pub fn with_he_ltf_type(mut self, ltf_type: u8) -> Self {
        self.he_ltf_type = ltf_type;
        self
    }

    /// L-SIG length imposed by a trigger frame (HE TB only).
    pub fn with_length(mut self, length: u16) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_aggregation(mut self, aggregation: bool) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_user(mut self, sta_id: StaId, info: HeMuUserInfo) -> Self {
        self.users.insert(sta_id, info);
        self
    }

    /// Mode of an SU transmission.
    pub fn mode(&self) -> WifiMode {
        self.mode
    }

    /// Mode used for the payload addressed to `sta_id`.
    pub fn mode_for(&self, sta_id: StaId) -> WifiMode {
        self.users
            .get(&sta_id)
            .and_then(HeMuUserInfo::mode)
            .unwrap_or(self.mode)
    }

    pub fn preamble(&self) -> PreambleType {
        self.preamble
    }

    pub fn modulation_class(&self) -> ModulationClass {
        self.mode.class()
    }

    pub fn channel_width(&self) -> u16 {
        self.channel_width
    }

    pub fn guard_interval_ns(&self) -> u16 {
        self.guard_interval_ns
    }

    pub fn nss(&self) -> u8 {
        self.nss
    }

    pub fn nss_for(&self, sta_id: StaId) -> u8 {
        self.users.get(&sta_id).map_or(self.nss, |u| u.nss)
    }

    /// Largest stream count over all users, or the SU stream count.
    pub fn max_nss(&self) -> u8 {
        self.users.values().map(|u| u.nss).max().unwrap_or(self.nss)
    }

    pub fn bss_color(&self) -> u8 {
        self.bss_color
    }

    pub fn sigb_mcs(&self) -> u8 {
        self.sigb_mcs
    }

    pub fn he_ltf_type(&self) -> u8 {
        self.he_ltf_type
    }

    pub fn length(&self) -> Option<u16> {
        self.length
    }

    pub fn is_aggregation(&self) -> bool {
        self.aggregation
    }

    pub fn users(&self) -> &BTreeMap<StaId, HeMuUserInfo> {
        &self.users
    }

    pub fn ru_for(&self, sta_id: StaId) -> Option<RuSpec> {
        self.users.get(&sta_id).map(|u| u.ru)
    }

    pub fn is_mu(&self) -> bool {
        self.preamble.is_mu()
    }

    /// Users signalled on HE-SIG-B content channels 1 and 2.
    pub fn sigb_users_per_content_channel(&self) -> (usize, usize) {
        users_per_content_channel(self.users.values().map(|u| &u.ru), self.channel_width)
    }

    /// Checks that the combination of parameters describes a transmission
    /// the amendment defines.
    pub fn validate(&self) -> Result<(), TxVectorError> {
        let class = self.mode.class();
        if self.preamble.modulation_class() != class {
            return Err(TxVectorError::PreambleMismatch {
                preamble: self.preamble,
                class,
            });
        }

        let widths: &[u16] = match class {
            ModulationClass::Ofdm => &[20],
            ModulationClass::Ht => &[20, 40],
            ModulationClass::Vht | ModulationClass::He => &[20, 40, 80, 160],
        };
        let width_ok = widths.contains(&self.channel_width)
            && (self.preamble != PreambleType::HeErSu || self.channel_width == 20);
        if !width_ok {
            return Err(TxVectorError::UnsupportedWidth {
                class,
                width: self.channel_width,
            });
        }

        let gis: &[u16] = match class {
            ModulationClass::Ofdm => &[800],
            ModulationClass::Ht | ModulationClass::Vht => &[400, 800],
            ModulationClass::He => &[800, 1600, 3200],
        };
        if !gis.contains(&self.guard_interval_ns) {
            return Err(TxVectorError::InvalidGuardInterval {
                class,
                gi: self.guard_interval_ns,
            });
        }

        let nss_ok = match class {
            ModulationClass::Ofdm => self.nss == 1,
            ModulationClass::Ht => Some(self.nss) == self.mode.ht_nss(),
            ModulationClass::Vht | ModulationClass::He => (1..=8).contains(&self.nss),
        };
        if !nss_ok {
            return Err(TxVectorError::InvalidNss {
                class,
                nss: self.nss,
            });
        }

        if class == ModulationClass::He {
            if self.bss_color >= 64 {
                return Err(TxVectorError::InvalidBssColor(self.bss_color));
            }
            if self.sigb_mcs > 5 {
                return Err(TxVectorError::InvalidSigBMcs(self.sigb_mcs));
            }
            if ![1, 2, 4].contains(&self.he_ltf_type) {
                return Err(TxVectorError::InvalidLtfType(self.he_ltf_type));
            }
        }

        if let Some(length) = self.length {
            if length > MAX_LSIG_LENGTH {
                return Err(TxVectorError::LengthOverflow(length as u32));
            }
        }

        if self.preamble.is_mu() {
            self.validate_users()
        } else {
            if !self.users.is_empty() {
                return Err(TxVectorError::UnexpectedUsers(self.preamble));
            }
            let entity = phy_entity(class);
            if !entity.is_mode_allowed(self.mode, self.channel_width, self.nss) {
                return Err(TxVectorError::ModeNotAllowed {
                    mode: self.mode.name(),
                    width: self.channel_width,
                    nss: self.nss,
                });
            }
            Ok(())
        }
    }

    fn validate_users(&self) -> Result<(), TxVectorError> {
        if self.users.is_empty() {
            return Err(TxVectorError::MissingUsers(self.preamble));
        }
        if self.preamble == PreambleType::HeTb && self.users.len() != 1 {
            return Err(TxVectorError::TbUserCount(self.users.len()));
        }
        for (sta_id, user) in &self.users {
            if !user.ru.is_valid(self.channel_width) {
                return Err(TxVectorError::InvalidRu {
                    sta_id: *sta_id,
                    width: self.channel_width,
                });
            }
            if user.mode().is_none() {
                return Err(TxVectorError::InvalidUserMcs {
                    sta_id: *sta_id,
                    mcs: user.mcs,
                });
            }
            if !(1..=8).contains(&user.nss) {
                return Err(TxVectorError::InvalidNss {
                    class: ModulationClass::He,
                    nss: user.nss,
                });
            }
        }
        // Users may share an RU (MU-MIMO) but partially overlapping RUs are
        // never a valid allocation.
        let rus: Vec<&RuSpec> = self.users.values().map(|u| &u.ru).collect();
        for (i, a) in rus.iter().enumerate() {
            for b in &rus[i + 1..] {
                if a != b && a.overlaps(b, self.channel_width) {
                    return Err(TxVectorError::OverlappingRu);
                }
            }
        }
        Ok(())
    }
}
