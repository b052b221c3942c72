//! MPDUs and PSDUs (single MPDU or A-MPDU).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// MAC header of a QoS data frame, in bytes.
pub const MAC_HEADER_SIZE: u32 = 26;
/// Frame check sequence, in bytes.
pub const FCS_SIZE: u32 = 4;
/// A-MPDU subframe delimiter, in bytes.
pub const MPDU_DELIMITER_SIZE: u32 = 4;

/// 48-bit IEEE MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("MAC address '{}' has fewer than 6 octets", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| format!("invalid octet '{}' in MAC address '{}': {}", part, s, e))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address '{}' has more than 6 octets", s));
        }
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One MAC protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mpdu {
    /// Receiver address.
    pub addr1: MacAddr,
    /// Transmitter address.
    pub addr2: MacAddr,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Mpdu {
    pub fn new(addr1: MacAddr, addr2: MacAddr, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            addr1,
            addr2,
            sequence,
            payload,
        }
    }

    /// Size on air: header, body and FCS.
    pub fn size(&self) -> u32 {
        MAC_HEADER_SIZE + self.payload.len() as u32 + FCS_SIZE
    }
}

/// PHY service data unit: a single MPDU or an A-MPDU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Psdu {
    mpdus: Vec<Mpdu>,
    aggregated: bool,
}

impl Psdu {
    pub fn single(mpdu: Mpdu) -> Self {
        Self {
            mpdus: vec![mpdu],
            aggregated: false,
        }
    }

    /// A-MPDU of the given MPDUs, in order.
    pub fn ampdu(mpdus: Vec<Mpdu>) -> Self {
        Self {
            mpdus,
            aggregated: true,
        }
    }

    pub fn mpdus(&self) -> &[Mpdu] {
        &self.mpdus
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregated
    }

    pub fn len(&self) -> usize {
        self.mpdus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mpdus.is_empty()
    }

    /// Receiver address of the first MPDU.
    pub fn addr1(&self) -> Option<MacAddr> {
        self.mpdus.first().map(|m| m.addr1)
    }

    pub fn addr2(&self) -> Option<MacAddr> {
        self.mpdus.first().map(|m| m.addr2)
    }

    /// Bytes occupied by each MPDU on air. Every A-MPDU subframe carries a
    /// delimiter and all but the last are padded to a 4-byte boundary.
    pub fn subframe_sizes(&self) -> Vec<u32> {
        if !self.aggregated {
            return self.mpdus.iter().map(Mpdu::size).collect();
        }
        let last = self.mpdus.len().saturating_sub(1);
        self.mpdus
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let len = MPDU_DELIMITER_SIZE + m.size();
                if i == last {
                    len
                } else {
                    len.next_multiple_of(4)
                }
            })
            .collect()
    }

    /// PSDU length in bytes.
    pub fn size(&self) -> u32 {
        self.subframe_sizes().iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpdu(len: usize) -> Mpdu {
        Mpdu::new(MacAddr::BROADCAST, MacAddr::new([2, 0, 0, 0, 0, 1]), 0, vec![0; len])
    }

    #[test]
    fn test_mac_parse() {
        let addr: MacAddr = "02:00:00:00:00:0a".parse().unwrap();
        assert_eq!(addr, MacAddr::new([2, 0, 0, 0, 0, 10]));
        assert_eq!(addr.to_string(), "02:00:00:00:00:0a");
        assert!("02:00:00".parse::<MacAddr>().is_err());
        assert!("02:00:00:00:00:00:00".parse::<MacAddr>().is_err());
        assert!(MacAddr::BROADCAST.is_group());
    }

    #[test]
    fn test_single_size() {
        assert_eq!(Psdu::single(mpdu(100)).size(), 130);
    }

    #[test]
    fn test_ampdu_padding() {
        // 4 + 131 = 135, padded to 136; last subframe unpadded.
        let psdu = Psdu::ampdu(vec![mpdu(101), mpdu(101)]);
        assert_eq!(psdu.subframe_sizes(), vec![136, 135]);
        assert_eq!(psdu.size(), 271);
    }
}
