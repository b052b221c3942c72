//! PHY header fields.
//!
//! A PPDU carries only these fields; the receiver rebuilds the TXVECTOR from
//! them. The L-SIG has a bit-exact 24-bit wire form, the other SIG fields
//! are kept as their logical subfields.

use crate::error::HeaderError;
use crate::mode::WifiMode;
use crate::tx_vector::{HeMuUserInfo, TxVector};
use crate::{ModulationClass, PreambleType, StaId, MAX_LSIG_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// L-SIG
// ============================================================================

/// RATE field (R1..R4, R1 first) for 6, 9, 12, 18, 24, 36, 48 and 54 Mbps.
const LSIG_RATE_CODES: [u8; 8] = [0b1101, 0b1111, 0b0101, 0b0111, 0b1001, 0b1011, 0b0001, 0b0011];

/// Legacy signal field: rate and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LSig {
    /// RATE subfield, R1 as the most significant of the four bits.
    rate: u8,
    length: u16,
}

impl LSig {
    /// L-SIG announcing `length` at a Legacy OFDM mode.
    pub fn new(mode: WifiMode, length: u16) -> Result<Self, HeaderError> {
        if mode.class() != ModulationClass::Ofdm {
            return Err(HeaderError::UnknownMode(mode.name()));
        }
        if length > MAX_LSIG_LENGTH {
            return Err(crate::error::TxVectorError::LengthOverflow(length as u32).into());
        }
        Ok(Self {
            rate: LSIG_RATE_CODES[mode.index() as usize],
            length,
        })
    }

    /// L-SIG of a non-legacy PPDU, which always signals 6 Mbps.
    pub fn legacy_6mbps(length: u16) -> Result<Self, HeaderError> {
        let mode = WifiMode::ofdm_rate(6).ok_or_else(|| HeaderError::UnknownMode("OfdmRate6Mbps".into()))?;
        Self::new(mode, length)
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn rate_code(&self) -> u8 {
        self.rate
    }

    /// Legacy mode the RATE subfield announces.
    pub fn mode(&self) -> Result<WifiMode, HeaderError> {
        LSIG_RATE_CODES
            .iter()
            .position(|c| *c == self.rate)
            .and_then(|i| WifiMode::mcs(ModulationClass::Ofdm, i as u8))
            .ok_or(HeaderError::InvalidRate(self.rate))
    }

    /// Encodes the 24 transmitted bits, first bit in the LSB of byte 0:
    /// RATE (4), reserved (1), LENGTH (12, LSB first), even parity (1),
    /// tail (6).
    pub fn encode(&self) -> [u8; 3] {
        let mut bits: u32 = 0;
        for i in 0..4 {
            bits |= (((self.rate >> (3 - i)) & 1) as u32) << i;
        }
        bits |= (self.length as u32 & 0x0fff) << 5;
        let parity = (bits & 0x1_ffff).count_ones() & 1;
        bits |= parity << 17;
        [bits as u8, (bits >> 8) as u8, (bits >> 16) as u8]
    }

    pub fn decode(bytes: [u8; 3]) -> Result<Self, HeaderError> {
        let bits = bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16;
        if (bits & 0x3_ffff).count_ones() & 1 != 0 {
            return Err(HeaderError::Parity);
        }
        if bits >> 18 != 0 {
            return Err(HeaderError::Tail);
        }
        if bits & (1 << 4) != 0 {
            return Err(HeaderError::ReservedBit);
        }
        let mut rate = 0u8;
        for i in 0..4 {
            rate |= (((bits >> i) & 1) as u8) << (3 - i);
        }
        let lsig = Self {
            rate,
            length: ((bits >> 5) & 0x0fff) as u16,
        };
        lsig.mode()?;
        Ok(lsig)
    }
}

// ============================================================================
// Bandwidth subfield
// ============================================================================

pub fn encode_bandwidth(channel_width: u16) -> Result<u8, HeaderError> {
    match channel_width {
        20 => Ok(0),
        40 => Ok(1),
        80 => Ok(2),
        160 => Ok(3),
        other => Err(HeaderError::InvalidBandwidth(other.min(255) as u8)),
    }
}

pub fn decode_bandwidth(code: u8) -> Result<u16, HeaderError> {
    match code {
        0 => Ok(20),
        1 => Ok(40),
        2 => Ok(80),
        3 => Ok(160),
        other => Err(HeaderError::InvalidBandwidth(other)),
    }
}

// ============================================================================
// HT-SIG, VHT-SIG-A, HE-SIG-A, HE-SIG-B
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtSig {
    pub mcs: u8,
    pub cbw40: bool,
    /// PSDU length in bytes.
    pub ht_length: u16,
    pub short_gi: bool,
    pub aggregation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhtSigA {
    pub bandwidth: u8,
    pub nsts: u8,
    pub short_gi: bool,
    /// Set when a short-GI payload has `N_SYM mod 10 == 9`.
    pub sgi_disambiguation: bool,
    pub mcs: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeSigA {
    pub bss_color: u8,
    pub bandwidth: u8,
    pub mcs: u8,
    pub nsts: u8,
    pub guard_interval_ns: u16,
    pub ltf_type: u8,
    /// HE-SIG-B MCS (HE MU only).
    pub sigb_mcs: u8,
}

/// HE-SIG-B: per-user allocations of an HE MU PPDU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeSigB {
    pub users: BTreeMap<StaId, HeMuUserInfo>,
}

/// Header fields of a PPDU, per format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PpduHeader {
    NonHt {
        l_sig: LSig,
    },
    Ht {
        l_sig: LSig,
        ht_sig: HtSig,
    },
    Vht {
        l_sig: LSig,
        sig_a: VhtSigA,
    },
    He {
        l_sig: LSig,
        sig_a: HeSigA,
        sig_b: Option<HeSigB>,
        /// Allocation of an HE TB PPDU, as solicited by the trigger.
        tb_user: Option<(StaId, HeMuUserInfo)>,
    },
}

impl PpduHeader {
    /// Builds the header fields for a TXVECTOR. `l_sig_length` is the value
    /// computed by the amendment's length encoding; `psdu_length` is only
    /// used by HT-SIG.
    pub fn encode(
        tx_vector: &TxVector,
        l_sig_length: u16,
        psdu_length: u16,
        sgi_disambiguation: bool,
    ) -> Result<Self, HeaderError> {
        let width = tx_vector.channel_width();
        let header = match tx_vector.modulation_class() {
            ModulationClass::Ofdm => PpduHeader::NonHt {
                l_sig: LSig::new(tx_vector.mode(), l_sig_length)?,
            },
            ModulationClass::Ht => PpduHeader::Ht {
                l_sig: LSig::legacy_6mbps(l_sig_length)?,
                ht_sig: HtSig {
                    mcs: tx_vector.mode().index(),
                    cbw40: width == 40,
                    ht_length: psdu_length,
                    short_gi: tx_vector.guard_interval_ns() == 400,
                    aggregation: tx_vector.is_aggregation(),
                },
            },
            ModulationClass::Vht => PpduHeader::Vht {
                l_sig: LSig::legacy_6mbps(l_sig_length)?,
                sig_a: VhtSigA {
                    bandwidth: encode_bandwidth(width)?,
                    nsts: tx_vector.nss(),
                    short_gi: tx_vector.guard_interval_ns() == 400,
                    sgi_disambiguation,
                    mcs: tx_vector.mode().index(),
                },
            },
            ModulationClass::He => {
                let preamble = tx_vector.preamble();
                PpduHeader::He {
                    l_sig: LSig::legacy_6mbps(l_sig_length)?,
                    sig_a: HeSigA {
                        bss_color: tx_vector.bss_color(),
                        bandwidth: encode_bandwidth(width)?,
                        mcs: tx_vector.mode().index(),
                        nsts: tx_vector.nss(),
                        guard_interval_ns: tx_vector.guard_interval_ns(),
                        ltf_type: tx_vector.he_ltf_type(),
                        sigb_mcs: tx_vector.sigb_mcs(),
                    },
                    sig_b: preamble.is_dl_mu().then(|| HeSigB {
                        users: tx_vector.users().clone(),
                    }),
                    tb_user: if preamble.is_ul_mu() {
                        tx_vector.users().iter().next().map(|(s, u)| (*s, *u))
                    } else {
                        None
                    },
                }
            }
        };
        Ok(header)
    }

    pub fn l_sig(&self) -> &LSig {
        match self {
            PpduHeader::NonHt { l_sig }
            | PpduHeader::Ht { l_sig, .. }
            | PpduHeader::Vht { l_sig, .. }
            | PpduHeader::He { l_sig, .. } => l_sig,
        }
    }

    pub fn channel_width(&self) -> u16 {
        match self {
            PpduHeader::NonHt { .. } => 20,
            PpduHeader::Ht { ht_sig, .. } => {
                if ht_sig.cbw40 {
                    40
                } else {
                    20
                }
            }
            PpduHeader::Vht { sig_a, .. } => decode_bandwidth(sig_a.bandwidth).unwrap_or(20),
            PpduHeader::He { sig_a, .. } => decode_bandwidth(sig_a.bandwidth).unwrap_or(20),
        }
    }

    /// Rebuilds the TXVECTOR from the header fields alone.
    pub fn decode(&self, preamble: PreambleType, aggregation: bool) -> Result<TxVector, HeaderError> {
        let txv = match self {
            PpduHeader::NonHt { l_sig } => TxVector::new(l_sig.mode()?, preamble, 20),
            PpduHeader::Ht { ht_sig, .. } => {
                let mode = WifiMode::ht(ht_sig.mcs)
                    .ok_or_else(|| HeaderError::UnknownMode(format!("HtMcs{}", ht_sig.mcs)))?;
                TxVector::new(mode, preamble, self.channel_width())
                    .with_guard_interval(if ht_sig.short_gi { 400 } else { 800 })
                    .with_aggregation(ht_sig.aggregation)
            }
            PpduHeader::Vht { sig_a, .. } => {
                let mode = WifiMode::vht(sig_a.mcs)
                    .ok_or_else(|| HeaderError::UnknownMode(format!("VhtMcs{}", sig_a.mcs)))?;
                TxVector::new(mode, preamble, decode_bandwidth(sig_a.bandwidth)?)
                    .with_guard_interval(if sig_a.short_gi { 400 } else { 800 })
                    .with_nss(sig_a.nsts)
                    .with_aggregation(aggregation)
            }
            PpduHeader::He {
                l_sig,
                sig_a,
                sig_b,
                tb_user,
            } => {
                let mode = WifiMode::he(sig_a.mcs)
                    .ok_or_else(|| HeaderError::UnknownMode(format!("HeMcs{}", sig_a.mcs)))?;
                let mut txv = TxVector::new(mode, preamble, decode_bandwidth(sig_a.bandwidth)?)
                    .with_guard_interval(sig_a.guard_interval_ns)
                    .with_nss(sig_a.nsts)
                    .with_bss_color(sig_a.bss_color)
                    .with_he_ltf_type(sig_a.ltf_type)
                    .with_sigb_mcs(sig_a.sigb_mcs)
                    .with_aggregation(aggregation);
                if let Some(sig_b) = sig_b {
                    for (sta_id, user) in &sig_b.users {
                        txv = txv.with_user(*sta_id, *user);
                    }
                }
                if let Some((sta_id, user)) = tb_user {
                    txv = txv.with_user(*sta_id, *user).with_length(l_sig.length());
                }
                txv
            }
        };
        txv.validate()?;
        Ok(txv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsig_roundtrip() {
        for mbps in [6u8, 9, 12, 18, 24, 36, 48, 54] {
            for length in [0u16, 1, 1500, 4095] {
                let lsig = LSig::new(WifiMode::ofdm_rate(mbps).unwrap(), length).unwrap();
                let decoded = LSig::decode(lsig.encode()).unwrap();
                assert_eq!(decoded, lsig);
                assert_eq!(decoded.mode().unwrap().ofdm_rate_mbps(), Some(mbps));
            }
        }
    }

    #[test]
    fn test_lsig_wire_layout() {
        // 6 Mbps = R1..R4 1101, transmitted LSB first; length 1 at bit 5.
        let bytes = LSig::legacy_6mbps(1).unwrap().encode();
        let bits = bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16;
        assert_eq!(bits & 0x0f, 0b1011);
        assert_eq!((bits >> 5) & 0x0fff, 1);
        // four ones in bits 0..16, so even parity bit is 0
        assert_eq!((bits >> 17) & 1, 0);
    }

    #[test]
    fn test_lsig_parity_error() {
        let mut bytes = LSig::legacy_6mbps(100).unwrap().encode();
        bytes[1] ^= 0x01;
        assert_eq!(LSig::decode(bytes), Err(HeaderError::Parity));
    }

    #[test]
    fn test_lsig_tail_and_reserved() {
        let mut bytes = LSig::legacy_6mbps(100).unwrap().encode();
        bytes[2] ^= 0x0c; // two tail bits keep parity even
        assert_eq!(LSig::decode(bytes), Err(HeaderError::Tail));

        let mut bytes = LSig::legacy_6mbps(100).unwrap().encode();
        bytes[0] ^= 0x30; // reserved bit + first length bit
        assert_eq!(LSig::decode(bytes), Err(HeaderError::ReservedBit));
    }

    #[test]
    fn test_length_overflow() {
        assert!(LSig::legacy_6mbps(4096).is_err());
    }

    #[test]
    fn test_bandwidth_codes() {
        for w in [20u16, 40, 80, 160] {
            assert_eq!(decode_bandwidth(encode_bandwidth(w).unwrap()).unwrap(), w);
        }
        assert!(encode_bandwidth(60).is_err());
    }
}
