//! HE resource units.
//!
//! RU indices are 1-based and span the whole channel: in a 160 MHz channel,
//! 26-tone RUs 1-37 sit in the lower 80 MHz and 38-74 in the upper 80 MHz.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a resource unit, in tones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuType {
    #[serde(rename = "26")]
    Ru26,
    #[serde(rename = "52")]
    Ru52,
    #[serde(rename = "106")]
    Ru106,
    #[serde(rename = "242")]
    Ru242,
    #[serde(rename = "484")]
    Ru484,
    #[serde(rename = "996")]
    Ru996,
    #[serde(rename = "2x996")]
    Ru2x996,
}

impl RuType {
    pub const fn tones(self) -> u32 {
        match self {
            RuType::Ru26 => 26,
            RuType::Ru52 => 52,
            RuType::Ru106 => 106,
            RuType::Ru242 => 242,
            RuType::Ru484 => 484,
            RuType::Ru996 => 996,
            RuType::Ru2x996 => 1992,
        }
    }

    pub const fn data_subcarriers(self) -> u32 {
        match self {
            RuType::Ru26 => 24,
            RuType::Ru52 => 48,
            RuType::Ru106 => 102,
            RuType::Ru242 => 234,
            RuType::Ru484 => 468,
            RuType::Ru996 => 980,
            RuType::Ru2x996 => 1960,
        }
    }

    /// Number of RUs of this size in a channel, 0 if it does not fit.
    pub fn count(self, channel_width: u16) -> usize {
        let per_20 = match channel_width {
            20 => 0,
            40 => 1,
            80 => 2,
            160 => 3,
            _ => return 0,
        };
        const TABLE: [[usize; 4]; 7] = [
            [9, 18, 37, 74],
            [4, 8, 16, 32],
            [2, 4, 8, 16],
            [1, 2, 4, 8],
            [0, 1, 2, 4],
            [0, 0, 1, 2],
            [0, 0, 0, 1],
        ];
        TABLE[self as usize][per_20]
    }

    /// The RU covering a whole channel.
    pub fn full_band(channel_width: u16) -> Option<RuType> {
        match channel_width {
            20 => Some(RuType::Ru242),
            40 => Some(RuType::Ru484),
            80 => Some(RuType::Ru996),
            160 => Some(RuType::Ru2x996),
            _ => None,
        }
    }
}

impl fmt::Display for RuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuType::Ru2x996 => write!(f, "2x996-tone"),
            other => write!(f, "{}-tone", other.tones()),
        }
    }
}

/// HE-SIG-B content channel carrying a user's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentChannel {
    One,
    Two,
}

/// A resource unit within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuSpec {
    pub ru_type: RuType,
    /// 1-based index within the channel.
    pub index: usize,
}

impl RuSpec {
    pub fn new(ru_type: RuType, index: usize) -> Self {
        Self { ru_type, index }
    }

    pub fn full_band(channel_width: u16) -> Option<Self> {
        RuType::full_band(channel_width).map(|t| Self::new(t, 1))
    }

    pub fn is_valid(&self, channel_width: u16) -> bool {
        self.index >= 1 && self.index <= self.ru_type.count(channel_width)
    }

    /// True for the 26-tone RU straddling the centre of an 80 MHz segment.
    pub fn is_center_26(&self, channel_width: u16) -> bool {
        self.ru_type == RuType::Ru26 && channel_width >= 80 && self.index % 37 == 19
    }

    /// Zero-based 20 MHz subchannels this RU overlaps, lowest first.
    pub fn subchannels(&self, channel_width: u16) -> Vec<usize> {
        if !self.is_valid(channel_width) {
            return Vec::new();
        }
        let i = self.index - 1;
        match self.ru_type {
            RuType::Ru26 if channel_width >= 80 => {
                let segment = i / 37;
                let within = i % 37;
                let base = segment * 4;
                match within {
                    0..=17 => vec![base + within / 9],
                    18 => vec![base + 1, base + 2],
                    _ => vec![base + 2 + (within - 19) / 9],
                }
            }
            RuType::Ru26 => vec![i / 9],
            RuType::Ru52 => vec![i / 4],
            RuType::Ru106 => vec![i / 2],
            RuType::Ru242 => vec![i],
            RuType::Ru484 => vec![2 * i, 2 * i + 1],
            RuType::Ru996 => (4 * i..4 * i + 4).collect(),
            RuType::Ru2x996 => (0..8).collect(),
        }
    }

    /// Centre frequencies (MHz) of the 20 MHz subchannels this RU overlaps.
    pub fn band_centers_mhz(&self, channel_center_mhz: u16, channel_width: u16) -> Vec<u16> {
        let first = channel_center_mhz - channel_width / 2 + 10;
        self.subchannels(channel_width)
            .into_iter()
            .map(|k| first + 20 * k as u16)
            .collect()
    }

    /// HE-SIG-B content channel the allocation is signalled on.
    ///
    /// RUs of 484 tones and up alternate by index. Smaller RUs follow the
    /// parity of their 20 MHz subchannel; the centre 26-tone RU of an
    /// 80 MHz segment goes on content channel 1.
    pub fn content_channel(&self, channel_width: u16) -> ContentChannel {
        if channel_width <= 20 || self.is_center_26(channel_width) {
            return ContentChannel::One;
        }
        let even = match self.ru_type {
            RuType::Ru484 | RuType::Ru996 | RuType::Ru2x996 => self.index % 2 == 1,
            _ => self
                .subchannels(channel_width)
                .first()
                .map_or(true, |s| s % 2 == 0),
        };
        if even {
            ContentChannel::One
        } else {
            ContentChannel::Two
        }
    }

    /// Fraction of the channel's data subcarriers this RU uses.
    pub fn subcarrier_fraction(&self, channel_width: u16) -> f64 {
        match RuType::full_band(channel_width) {
            Some(full) => self.ru_type.data_subcarriers() as f64 / full.data_subcarriers() as f64,
            None => 0.0,
        }
    }

    /// Returns true if the two RUs share at least one tone.
    pub fn overlaps(&self, other: &RuSpec, channel_width: u16) -> bool {
        let (a0, a1) = self.slot_span(channel_width);
        let (b0, b1) = other.slot_span(channel_width);
        a0 < b1 && b0 < a1
    }

    // Half-open span in 26-tone slots. 80 MHz segments hold 37 slots with
    // the centre slot between the second and third 20 MHz subchannel.
    fn slot_span(&self, channel_width: u16) -> (usize, usize) {
        let slot = |subchannel: usize, offset: usize| -> usize {
            if channel_width >= 80 {
                let k = subchannel % 4;
                (subchannel / 4) * 37 + k * 9 + usize::from(k >= 2) + offset
            } else {
                subchannel * 9 + offset
            }
        };
        let i = self.index.saturating_sub(1);
        match self.ru_type {
            RuType::Ru26 => (i, i + 1),
            RuType::Ru52 => {
                let start = slot(i / 4, [0, 2, 5, 7][i % 4]);
                (start, start + 2)
            }
            RuType::Ru106 => {
                let start = slot(i / 2, [0, 5][i % 2]);
                (start, start + 4)
            }
            RuType::Ru242 => (slot(i, 0), slot(i, 0) + 9),
            RuType::Ru484 => (slot(2 * i, 0), slot(2 * i + 1, 0) + 9),
            RuType::Ru996 => (i * 37, i * 37 + 37),
            RuType::Ru2x996 => (0, 74),
        }
    }
}

impl fmt::Display for RuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} RU {}", self.ru_type, self.index)
    }
}

/// Counts the users signalled on each HE-SIG-B content channel.
pub fn users_per_content_channel<'a>(
    rus: impl IntoIterator<Item = &'a RuSpec>,
    channel_width: u16,
) -> (usize, usize) {
    rus.into_iter()
        .fold((0, 0), |(c1, c2), ru| match ru.content_channel(channel_width) {
            ContentChannel::One => (c1 + 1, c2),
            ContentChannel::Two => (c1, c2 + 1),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ru_counts() {
        assert_eq!(RuType::Ru26.count(20), 9);
        assert_eq!(RuType::Ru26.count(80), 37);
        assert_eq!(RuType::Ru26.count(160), 74);
        assert_eq!(RuType::Ru242.count(80), 4);
        assert_eq!(RuType::Ru996.count(40), 0);
        assert_eq!(RuType::Ru2x996.count(160), 1);
    }

    #[test]
    fn test_subchannels() {
        assert_eq!(RuSpec::new(RuType::Ru26, 19).subchannels(80), vec![1, 2]);
        assert_eq!(RuSpec::new(RuType::Ru26, 20).subchannels(80), vec![2]);
        assert_eq!(RuSpec::new(RuType::Ru26, 37).subchannels(80), vec![3]);
        assert_eq!(RuSpec::new(RuType::Ru26, 38).subchannels(160), vec![4]);
        assert_eq!(RuSpec::new(RuType::Ru106, 3).subchannels(40), vec![1]);
        assert_eq!(RuSpec::new(RuType::Ru484, 2).subchannels(80), vec![2, 3]);
        assert_eq!(RuSpec::new(RuType::Ru996, 1).subchannels(80), vec![0, 1, 2, 3]);
        assert!(RuSpec::new(RuType::Ru242, 5).subchannels(80).is_empty());
    }

    #[test]
    fn test_band_centers() {
        let ru = RuSpec::new(RuType::Ru242, 2);
        assert_eq!(ru.band_centers_mhz(5210, 80), vec![5190]);
    }

    #[test]
    fn test_content_channel() {
        assert_eq!(RuSpec::new(RuType::Ru242, 1).content_channel(40), ContentChannel::One);
        assert_eq!(RuSpec::new(RuType::Ru242, 2).content_channel(40), ContentChannel::Two);
        assert_eq!(RuSpec::new(RuType::Ru106, 4).content_channel(80), ContentChannel::Two);
        assert_eq!(RuSpec::new(RuType::Ru26, 19).content_channel(80), ContentChannel::One);
        assert_eq!(RuSpec::new(RuType::Ru52, 2).content_channel(20), ContentChannel::One);

        let rus = [
            RuSpec::new(RuType::Ru242, 1),
            RuSpec::new(RuType::Ru242, 2),
            RuSpec::new(RuType::Ru242, 3),
        ];
        assert_eq!(users_per_content_channel(&rus, 80), (2, 1));
    }

    #[test]
    fn test_overlap() {
        let a = RuSpec::new(RuType::Ru106, 1);
        let b = RuSpec::new(RuType::Ru26, 4);
        let c = RuSpec::new(RuType::Ru26, 6);
        assert!(a.overlaps(&b, 20));
        assert!(!a.overlaps(&c, 20));
        assert!(RuSpec::new(RuType::Ru242, 1).overlaps(&RuSpec::new(RuType::Ru52, 2), 40));
        assert!(!RuSpec::new(RuType::Ru242, 2).overlaps(&RuSpec::new(RuType::Ru52, 2), 40));
    }
}
