//! Operating channel selection.
//!
//! A channel is identified by (number, centre frequency, width, channel type,
//! band). The table below lists every channel a PHY may operate on;
//! [`OperatingChannel::set`] picks exactly one entry of the type the standard
//! uses, treating a zero number or frequency as a wildcard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use wifi_ppdu::{Band, WifiStandard};

/// Modulation family a channel row is defined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Dsss,
    Ofdm,
}

impl ChannelType {
    /// Rows a PHY of `standard` may select.
    pub fn for_standard(standard: WifiStandard) -> Self {
        match standard {
            WifiStandard::Ieee80211a
            | WifiStandard::Ieee80211g
            | WifiStandard::Ieee80211n
            | WifiStandard::Ieee80211ac
            | WifiStandard::Ieee80211ax => ChannelType::Ofdm,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            ChannelType::Dsss => "dsss",
            ChannelType::Ofdm => "ofdm",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One row of the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub number: u8,
    pub frequency_mhz: u16,
    pub width_mhz: u16,
    pub channel_type: ChannelType,
    pub band: Band,
}

/// Channel selection failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("no channel matches number {number}, frequency {frequency_mhz} MHz, width {width_mhz} MHz in {band}")]
    NotFound {
        number: u8,
        frequency_mhz: u16,
        width_mhz: u16,
        band: Band,
    },

    #[error("{count} channels match number {number}, frequency {frequency_mhz} MHz, width {width_mhz} MHz")]
    Ambiguous {
        count: usize,
        number: u8,
        frequency_mhz: u16,
        width_mhz: u16,
    },

    #[error("{standard} does not support {width_mhz} MHz channels in {band}")]
    UnsupportedWidth {
        standard: WifiStandard,
        width_mhz: u16,
        band: Band,
    },

    #[error("primary 20 MHz index {index} out of range for a {width_mhz} MHz channel")]
    InvalidPrimary { index: u8, width_mhz: u16 },
}

// ============================================================================
// Channel table
// ============================================================================

const CH_5GHZ_20: &[u8] = &[
    36, 40, 44, 48, 52, 56, 60, 64, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144, 149, 153, 157,
    161, 165,
];
const CH_5GHZ_40: &[u8] = &[38, 46, 54, 62, 102, 110, 118, 126, 134, 142, 151, 159];
const CH_5GHZ_80: &[u8] = &[42, 58, 106, 122, 138, 155];
const CH_5GHZ_160: &[u8] = &[50, 114];

fn push_all(
    table: &mut Vec<ChannelEntry>,
    band: Band,
    width_mhz: u16,
    channel_type: ChannelType,
    numbers: impl Iterator<Item = u8>,
) {
    let base = match band {
        Band::Ghz2_4 => 2407,
        Band::Ghz5 => 5000,
        Band::Ghz6 => 5950,
    };
    for number in numbers {
        table.push(ChannelEntry {
            number,
            frequency_mhz: base + 5 * number as u16,
            width_mhz,
            channel_type,
            band,
        });
    }
}

fn build_table() -> Vec<ChannelEntry> {
    let mut table = Vec::new();

    use ChannelType::{Dsss, Ofdm};

    push_all(&mut table, Band::Ghz2_4, 22, Dsss, 1..=13);
    // Channel 14 is DSSS only.
    table.push(ChannelEntry {
        number: 14,
        frequency_mhz: 2484,
        width_mhz: 22,
        channel_type: Dsss,
        band: Band::Ghz2_4,
    });
    push_all(&mut table, Band::Ghz2_4, 20, Ofdm, 1..=13);
    push_all(&mut table, Band::Ghz2_4, 40, Ofdm, 3..=11);

    push_all(&mut table, Band::Ghz5, 20, Ofdm, CH_5GHZ_20.iter().copied());
    push_all(&mut table, Band::Ghz5, 40, Ofdm, CH_5GHZ_40.iter().copied());
    push_all(&mut table, Band::Ghz5, 80, Ofdm, CH_5GHZ_80.iter().copied());
    push_all(&mut table, Band::Ghz5, 160, Ofdm, CH_5GHZ_160.iter().copied());

    push_all(&mut table, Band::Ghz6, 20, Ofdm, (1..=233).step_by(4));
    push_all(&mut table, Band::Ghz6, 40, Ofdm, (3..=227).step_by(8));
    push_all(&mut table, Band::Ghz6, 80, Ofdm, (7..=215).step_by(16));
    push_all(&mut table, Band::Ghz6, 160, Ofdm, (15..=207).step_by(32));

    table
}

/// The channel table every PHY selects from.
pub fn channel_table() -> &'static [ChannelEntry] {
    static TABLE: OnceLock<Vec<ChannelEntry>> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

// ============================================================================
// Operating channel
// ============================================================================

/// The channel a PHY operates on, plus the position of its primary 20 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingChannel {
    entry: ChannelEntry,
    primary20_index: u8,
}

impl OperatingChannel {
    /// Selects the unique table entry matching the arguments.
    ///
    /// `number` and `frequency_mhz` may be 0 to match any value; width and
    /// band must always match. The standard bounds the width and the band.
    pub fn set(
        number: u8,
        frequency_mhz: u16,
        width_mhz: u16,
        standard: WifiStandard,
        band: Band,
    ) -> Result<Self, ChannelError> {
        Self::set_from_table(channel_table(), number, frequency_mhz, width_mhz, standard, band)
    }

    /// Same as [`set`](Self::set) against an arbitrary table.
    pub fn set_from_table(
        table: &[ChannelEntry],
        number: u8,
        frequency_mhz: u16,
        width_mhz: u16,
        standard: WifiStandard,
        band: Band,
    ) -> Result<Self, ChannelError> {
        check_standard(standard, width_mhz, band)?;
        let channel_type = ChannelType::for_standard(standard);
        let mut matches = table.iter().filter(|e| {
            (number == 0 || e.number == number)
                && (frequency_mhz == 0 || e.frequency_mhz == frequency_mhz)
                && e.width_mhz == width_mhz
                && e.channel_type == channel_type
                && e.band == band
        });
        let first = matches.next().ok_or(ChannelError::NotFound {
            number,
            frequency_mhz,
            width_mhz,
            band,
        })?;
        let extra = matches.count();
        if extra > 0 {
            return Err(ChannelError::Ambiguous {
                count: extra + 1,
                number,
                frequency_mhz,
                width_mhz,
            });
        }
        Ok(Self {
            entry: *first,
            primary20_index: 0,
        })
    }

    /// First table entry of the given width in the band.
    pub fn set_default(width_mhz: u16, standard: WifiStandard, band: Band) -> Result<Self, ChannelError> {
        check_standard(standard, width_mhz, band)?;
        let channel_type = ChannelType::for_standard(standard);
        channel_table()
            .iter()
            .find(|e| e.width_mhz == width_mhz && e.channel_type == channel_type && e.band == band)
            .map(|entry| Self {
                entry: *entry,
                primary20_index: 0,
            })
            .ok_or(ChannelError::NotFound {
                number: 0,
                frequency_mhz: 0,
                width_mhz,
                band,
            })
    }

    /// Places the primary 20 MHz channel, counted from the lowest subchannel.
    pub fn with_primary20(mut self, index: u8) -> Result<Self, ChannelError> {
        if u16::from(index) >= self.entry.width_mhz / 20 {
            return Err(ChannelError::InvalidPrimary {
                index,
                width_mhz: self.entry.width_mhz,
            });
        }
        self.primary20_index = index;
        Ok(self)
    }

    pub fn number(&self) -> u8 {
        self.entry.number
    }

    pub fn frequency_mhz(&self) -> u16 {
        self.entry.frequency_mhz
    }

    pub fn width_mhz(&self) -> u16 {
        self.entry.width_mhz
    }

    pub fn band(&self) -> Band {
        self.entry.band
    }

    pub fn primary20_index(&self) -> u8 {
        self.primary20_index
    }

    fn low_edge_mhz(&self) -> u16 {
        self.entry.frequency_mhz - self.entry.width_mhz / 2
    }

    pub fn primary20_center_mhz(&self) -> u16 {
        self.low_edge_mhz() + 10 + 20 * u16::from(self.primary20_index)
    }

    /// Centre of the primary channel of `width_mhz` (20, 40, 80 or 160)
    /// containing the primary 20 MHz. Widths at or above the channel width
    /// give the channel centre.
    pub fn primary_center_mhz(&self, width_mhz: u16) -> u16 {
        if width_mhz >= self.entry.width_mhz || width_mhz < 20 {
            return self.entry.frequency_mhz;
        }
        let per_group = width_mhz / 20;
        let group = u16::from(self.primary20_index) / per_group;
        self.low_edge_mhz() + width_mhz * group + width_mhz / 2
    }

    /// Centres of all 20 MHz subchannels, lowest first.
    pub fn band_centers_mhz(&self) -> Vec<u16> {
        let first = self.low_edge_mhz() + 10;
        (0..self.entry.width_mhz / 20).map(|k| first + 20 * k).collect()
    }

    pub fn contains_band(&self, center_mhz: u16) -> bool {
        let low = self.low_edge_mhz();
        center_mhz > low && center_mhz < low + self.entry.width_mhz
    }
}

impl fmt::Display for OperatingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel {} ({} MHz, {} MHz wide, {}, primary20 #{})",
            self.entry.number, self.entry.frequency_mhz, self.entry.width_mhz, self.entry.band, self.primary20_index
        )
    }
}

fn check_standard(standard: WifiStandard, width_mhz: u16, band: Band) -> Result<(), ChannelError> {
    if width_mhz > standard.max_channel_width() || !standard.allows_band(band) {
        return Err(ChannelError::UnsupportedWidth {
            standard,
            width_mhz,
            band,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_match() {
        let ch = OperatingChannel::set(42, 5210, 80, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap();
        assert_eq!(ch.number(), 42);
        assert_eq!(ch.width_mhz(), 80);
        assert_eq!(ch.band_centers_mhz(), vec![5180, 5200, 5220, 5240]);
    }

    #[test]
    fn test_wildcards() {
        let ch = OperatingChannel::set(0, 5180, 20, WifiStandard::Ieee80211ac, Band::Ghz5).unwrap();
        assert_eq!(ch.number(), 36);

        let ch = OperatingChannel::set(6, 0, 20, WifiStandard::Ieee80211g, Band::Ghz2_4).unwrap();
        assert_eq!(ch.frequency_mhz(), 2437);
    }

    #[test]
    fn test_ambiguous_wildcard() {
        let err = OperatingChannel::set(0, 0, 80, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap_err();
        assert!(matches!(err, ChannelError::Ambiguous { count: 6, .. }));
    }

    #[test]
    fn test_custom_table_ambiguity() {
        let entry = ChannelEntry {
            number: 36,
            frequency_mhz: 5180,
            width_mhz: 80,
            channel_type: ChannelType::Ofdm,
            band: Band::Ghz5,
        };
        let single = [entry];
        let ch =
            OperatingChannel::set_from_table(&single, 36, 5180, 80, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap();
        assert_eq!(ch.frequency_mhz(), 5180);

        let twice = [entry, ChannelEntry { number: 37, ..entry }];
        let err =
            OperatingChannel::set_from_table(&twice, 0, 5180, 80, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap_err();
        assert!(matches!(err, ChannelError::Ambiguous { count: 2, .. }));
    }

    #[test]
    fn test_channel_type_separates_rows() {
        let ofdm = ChannelEntry {
            number: 6,
            frequency_mhz: 2437,
            width_mhz: 20,
            channel_type: ChannelType::Ofdm,
            band: Band::Ghz2_4,
        };
        let dsss = ChannelEntry {
            channel_type: ChannelType::Dsss,
            ..ofdm
        };
        let table = [dsss, ofdm];
        let ch = OperatingChannel::set_from_table(&table, 6, 2437, 20, WifiStandard::Ieee80211g, Band::Ghz2_4).unwrap();
        assert_eq!(ch.entry, ofdm);

        let err =
            OperatingChannel::set_from_table(&[dsss], 6, 0, 20, WifiStandard::Ieee80211n, Band::Ghz2_4).unwrap_err();
        assert!(matches!(err, ChannelError::NotFound { .. }));

        // The table keeps DSSS rows, but OFDM PHYs never select them.
        assert!(channel_table()
            .iter()
            .any(|e| e.number == 14 && e.channel_type == ChannelType::Dsss));
        let err = OperatingChannel::set(14, 0, 20, WifiStandard::Ieee80211g, Band::Ghz2_4).unwrap_err();
        assert!(matches!(err, ChannelError::NotFound { .. }));
        let ch = OperatingChannel::set(1, 0, 20, WifiStandard::Ieee80211g, Band::Ghz2_4).unwrap();
        assert_eq!(ch.entry.channel_type, ChannelType::Ofdm);
    }

    #[test]
    fn test_not_found_and_unsupported() {
        let err = OperatingChannel::set(37, 0, 20, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap_err();
        assert!(matches!(err, ChannelError::NotFound { .. }));

        let err = OperatingChannel::set(38, 0, 40, WifiStandard::Ieee80211a, Band::Ghz5).unwrap_err();
        assert!(matches!(err, ChannelError::UnsupportedWidth { .. }));

        let err = OperatingChannel::set(1, 0, 20, WifiStandard::Ieee80211ac, Band::Ghz2_4).unwrap_err();
        assert!(matches!(err, ChannelError::UnsupportedWidth { .. }));
    }

    #[test]
    fn test_defaults_per_band() {
        let ch = OperatingChannel::set_default(20, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap();
        assert_eq!(ch.number(), 36);
        let ch = OperatingChannel::set_default(160, WifiStandard::Ieee80211ax, Band::Ghz5).unwrap();
        assert_eq!(ch.number(), 50);
        let ch = OperatingChannel::set_default(80, WifiStandard::Ieee80211ax, Band::Ghz6).unwrap();
        assert_eq!((ch.number(), ch.frequency_mhz()), (7, 5985));
        let ch = OperatingChannel::set_default(20, WifiStandard::Ieee80211n, Band::Ghz2_4).unwrap();
        assert_eq!((ch.number(), ch.frequency_mhz()), (1, 2412));
    }

    #[test]
    fn test_primary_channels() {
        let ch = OperatingChannel::set(50, 0, 160, WifiStandard::Ieee80211ax, Band::Ghz5)
            .unwrap()
            .with_primary20(5)
            .unwrap();
        assert_eq!(ch.primary20_center_mhz(), 5280);
        assert_eq!(ch.primary_center_mhz(40), 5270);
        assert_eq!(ch.primary_center_mhz(80), 5290);
        assert_eq!(ch.primary_center_mhz(160), 5250);
        assert!(ch.contains_band(5320));
        assert!(!ch.contains_band(5340));
        assert!(ch.with_primary20(8).is_err());
    }
}
