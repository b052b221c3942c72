//! Modulation and coding schemes.
//!
//! Every mode of every amendment lives in a static table, built at compile
//! time. A name index (`"VhtMcs7"`, `"OfdmRate24Mbps"`, ...) is built once on
//! first lookup and is read-only afterwards.

use crate::ru::RuType;
use crate::ModulationClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Constellation used on each data subcarrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    Bpsk,
    Qpsk,
    Qam16,
    Qam64,
    Qam256,
    Qam1024,
}

impl Modulation {
    /// Coded bits carried per subcarrier per spatial stream.
    pub const fn bits_per_subcarrier(self) -> u32 {
        match self {
            Modulation::Bpsk => 1,
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
            Modulation::Qam256 => 8,
            Modulation::Qam1024 => 10,
        }
    }

    pub const fn constellation_size(self) -> u32 {
        1 << self.bits_per_subcarrier()
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Modulation::Bpsk => "BPSK",
            Modulation::Qpsk => "QPSK",
            Modulation::Qam16 => "16-QAM",
            Modulation::Qam64 => "64-QAM",
            Modulation::Qam256 => "256-QAM",
            Modulation::Qam1024 => "1024-QAM",
        })
    }
}

/// Convolutional/LDPC code rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeRate {
    Half,
    TwoThirds,
    ThreeQuarters,
    FiveSixths,
}

impl CodeRate {
    /// Rate as an exact `(numerator, denominator)` pair.
    pub const fn fraction(self) -> (u64, u64) {
        match self {
            CodeRate::Half => (1, 2),
            CodeRate::TwoThirds => (2, 3),
            CodeRate::ThreeQuarters => (3, 4),
            CodeRate::FiveSixths => (5, 6),
        }
    }

    pub fn as_f64(self) -> f64 {
        let (n, d) = self.fraction();
        n as f64 / d as f64
    }
}

impl fmt::Display for CodeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (n, d) = self.fraction();
        write!(f, "{}/{}", n, d)
    }
}

// ============================================================================
// Static tables
// ============================================================================

const OFDM_RATES_MBPS: [u8; 8] = [6, 9, 12, 18, 24, 36, 48, 54];

const OFDM_SCHEMES: [(Modulation, CodeRate); 8] = [
    (Modulation::Bpsk, CodeRate::Half),
    (Modulation::Bpsk, CodeRate::ThreeQuarters),
    (Modulation::Qpsk, CodeRate::Half),
    (Modulation::Qpsk, CodeRate::ThreeQuarters),
    (Modulation::Qam16, CodeRate::Half),
    (Modulation::Qam16, CodeRate::ThreeQuarters),
    (Modulation::Qam64, CodeRate::TwoThirds),
    (Modulation::Qam64, CodeRate::ThreeQuarters),
];

/// Per-stream schemes shared by HT (index mod 8), VHT (0-9) and HE (0-11).
const MCS_SCHEMES: [(Modulation, CodeRate); 12] = [
    (Modulation::Bpsk, CodeRate::Half),
    (Modulation::Qpsk, CodeRate::Half),
    (Modulation::Qpsk, CodeRate::ThreeQuarters),
    (Modulation::Qam16, CodeRate::Half),
    (Modulation::Qam16, CodeRate::ThreeQuarters),
    (Modulation::Qam64, CodeRate::TwoThirds),
    (Modulation::Qam64, CodeRate::ThreeQuarters),
    (Modulation::Qam64, CodeRate::FiveSixths),
    (Modulation::Qam256, CodeRate::ThreeQuarters),
    (Modulation::Qam256, CodeRate::FiveSixths),
    (Modulation::Qam1024, CodeRate::ThreeQuarters),
    (Modulation::Qam1024, CodeRate::FiveSixths),
];

const fn scheme(class: ModulationClass, index: u8) -> (Modulation, CodeRate) {
    match class {
        ModulationClass::Ofdm => OFDM_SCHEMES[index as usize],
        ModulationClass::Ht => MCS_SCHEMES[(index % 8) as usize],
        ModulationClass::Vht | ModulationClass::He => MCS_SCHEMES[index as usize],
    }
}

const fn build_table<const N: usize>(class: ModulationClass) -> [WifiMode; N] {
    let mut table = [WifiMode {
        class,
        index: 0,
        modulation: Modulation::Bpsk,
        code_rate: CodeRate::Half,
    }; N];
    let mut i = 0;
    while i < N {
        let (modulation, code_rate) = scheme(class, i as u8);
        table[i] = WifiMode {
            class,
            index: i as u8,
            modulation,
            code_rate,
        };
        i += 1;
    }
    table
}

static OFDM_MODES: [WifiMode; 8] = build_table(ModulationClass::Ofdm);
static HT_MODES: [WifiMode; 32] = build_table(ModulationClass::Ht);
static VHT_MODES: [WifiMode; 10] = build_table(ModulationClass::Vht);
static HE_MODES: [WifiMode; 12] = build_table(ModulationClass::He);

static MODE_NAMES: OnceLock<BTreeMap<String, WifiMode>> = OnceLock::new();

fn mode_names() -> &'static BTreeMap<String, WifiMode> {
    MODE_NAMES.get_or_init(|| {
        ModulationClass::ALL
            .iter()
            .flat_map(|class| WifiMode::all(*class))
            .map(|mode| (mode.name(), *mode))
            .collect()
    })
}

// ============================================================================
// WifiMode
// ============================================================================

/// One modulation and coding scheme of one amendment.
///
/// For Legacy OFDM the index is the rate index (0 = 6 Mbps ... 7 = 54 Mbps).
/// For HT it is the full MCS index 0-31, which also encodes the number of
/// spatial streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WifiMode {
    class: ModulationClass,
    index: u8,
    modulation: Modulation,
    code_rate: CodeRate,
}

impl WifiMode {
    /// All modes of a modulation class, ordered by index.
    pub fn all(class: ModulationClass) -> &'static [WifiMode] {
        match class {
            ModulationClass::Ofdm => &OFDM_MODES,
            ModulationClass::Ht => &HT_MODES,
            ModulationClass::Vht => &VHT_MODES,
            ModulationClass::He => &HE_MODES,
        }
    }

    /// Looks up a mode by class and index.
    pub fn mcs(class: ModulationClass, index: u8) -> Option<WifiMode> {
        Self::all(class).get(index as usize).copied()
    }

    /// Legacy OFDM mode for a rate in Mbps.
    pub fn ofdm_rate(mbps: u8) -> Option<WifiMode> {
        OFDM_RATES_MBPS
            .iter()
            .position(|r| *r == mbps)
            .and_then(|i| Self::mcs(ModulationClass::Ofdm, i as u8))
    }

    pub fn ht(index: u8) -> Option<WifiMode> {
        Self::mcs(ModulationClass::Ht, index)
    }

    pub fn vht(index: u8) -> Option<WifiMode> {
        Self::mcs(ModulationClass::Vht, index)
    }

    pub fn he(index: u8) -> Option<WifiMode> {
        Self::mcs(ModulationClass::He, index)
    }

    /// Looks up a mode by its unique name.
    pub fn from_name(name: &str) -> Option<WifiMode> {
        mode_names().get(name).copied()
    }

    /// Every registered mode name, sorted.
    pub fn names() -> impl Iterator<Item = &'static str> {
        mode_names().keys().map(String::as_str)
    }

    pub fn class(&self) -> ModulationClass {
        self.class
    }

    /// MCS index (rate index for Legacy OFDM).
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn modulation(&self) -> Modulation {
        self.modulation
    }

    pub fn code_rate(&self) -> CodeRate {
        self.code_rate
    }

    /// Spatial streams implied by an HT MCS index.
    pub fn ht_nss(&self) -> Option<u8> {
        (self.class == ModulationClass::Ht).then_some(self.index / 8 + 1)
    }

    /// Nominal rate of a Legacy OFDM mode, in Mbps.
    pub fn ofdm_rate_mbps(&self) -> Option<u8> {
        (self.class == ModulationClass::Ofdm).then(|| OFDM_RATES_MBPS[self.index as usize])
    }

    pub fn name(&self) -> String {
        match self.class {
            ModulationClass::Ofdm => {
                format!("OfdmRate{}Mbps", OFDM_RATES_MBPS[self.index as usize])
            }
            ModulationClass::Ht => format!("HtMcs{}", self.index),
            ModulationClass::Vht => format!("VhtMcs{}", self.index),
            ModulationClass::He => format!("HeMcs{}", self.index),
        }
    }

    /// Data bits per OFDM symbol as an exact fraction, for `n_sd` data
    /// subcarriers and `nss` spatial streams. HT modes use the stream count
    /// encoded in their index and ignore `nss`.
    pub fn data_bits_per_symbol(&self, n_sd: u32, nss: u8) -> (u64, u64) {
        let nss = self.ht_nss().unwrap_or(nss).max(1);
        let (num, den) = self.code_rate.fraction();
        (
            n_sd as u64 * self.modulation.bits_per_subcarrier() as u64 * num * nss as u64,
            den,
        )
    }

    /// Data rate in bit/s over a full channel.
    pub fn data_rate(&self, channel_width: u16, guard_interval_ns: u16, nss: u8) -> u64 {
        match data_subcarriers(self.class, channel_width) {
            Some(n_sd) => self.rate_for_subcarriers(n_sd, guard_interval_ns, nss),
            None => 0,
        }
    }

    /// Data rate in bit/s over one HE resource unit.
    pub fn ru_data_rate(&self, ru: RuType, guard_interval_ns: u16, nss: u8) -> u64 {
        self.rate_for_subcarriers(ru.data_subcarriers(), guard_interval_ns, nss)
    }

    fn rate_for_subcarriers(&self, n_sd: u32, guard_interval_ns: u16, nss: u8) -> u64 {
        let (num, den) = self.data_bits_per_symbol(n_sd, nss);
        let symbol_ns = symbol_duration(self.class, guard_interval_ns).as_nanos() as u64;
        num * 1_000_000_000 / (den * symbol_ns)
    }
}

impl fmt::Display for WifiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<WifiMode> for String {
    fn from(mode: WifiMode) -> Self {
        mode.name()
    }
}

impl TryFrom<String> for WifiMode {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        WifiMode::from_name(&name).ok_or_else(|| format!("unknown Wi-Fi mode '{}'", name))
    }
}

// ============================================================================
// Subcarriers and symbols
// ============================================================================

/// Data subcarriers of a full-band transmission.
pub fn data_subcarriers(class: ModulationClass, channel_width: u16) -> Option<u32> {
    match (class, channel_width) {
        (ModulationClass::Ofdm, 20) => Some(48),
        (ModulationClass::Ht | ModulationClass::Vht, 20) => Some(52),
        (ModulationClass::Ht | ModulationClass::Vht, 40) => Some(108),
        (ModulationClass::Vht, 80) => Some(234),
        (ModulationClass::Vht, 160) => Some(468),
        (ModulationClass::He, w) => RuType::full_band(w).map(|ru| ru.data_subcarriers()),
        _ => None,
    }
}

/// Duration of one data OFDM symbol including its guard interval.
pub fn symbol_duration(class: ModulationClass, guard_interval_ns: u16) -> Duration {
    match class {
        ModulationClass::Ofdm => Duration::from_nanos(4000),
        ModulationClass::Ht | ModulationClass::Vht => {
            Duration::from_nanos(3200 + guard_interval_ns as u64)
        }
        ModulationClass::He => Duration::from_nanos(12800 + guard_interval_ns as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ofdm_rates() {
        for (i, mbps) in OFDM_RATES_MBPS.iter().enumerate() {
            let mode = WifiMode::ofdm_rate(*mbps).unwrap();
            assert_eq!(mode.index() as usize, i);
            assert_eq!(mode.data_rate(20, 800, 1), *mbps as u64 * 1_000_000);
        }
    }

    #[test]
    fn test_known_rates() {
        // VHT MCS9, 80 MHz, 400 ns GI, 1 stream: 433.3 Mbit/s
        assert_eq!(WifiMode::vht(9).unwrap().data_rate(80, 400, 1), 433_333_333);
        // HT MCS7, 20 MHz, 800 ns: 65 Mbit/s
        assert_eq!(WifiMode::ht(7).unwrap().data_rate(20, 800, 1), 65_000_000);
        // HT MCS15 carries two streams regardless of the nss argument
        assert_eq!(WifiMode::ht(15).unwrap().data_rate(20, 800, 1), 130_000_000);
        // HE MCS11, 20 MHz, 800 ns: 143.4 Mbit/s
        assert_eq!(WifiMode::he(11).unwrap().data_rate(20, 800, 1), 143_382_352);
    }

    #[test]
    fn test_data_rate_monotonic_in_mcs() {
        for class in [ModulationClass::Vht, ModulationClass::He] {
            for width in [20u16, 40, 80, 160] {
                for gi in [400u16, 800, 1600, 3200] {
                    for nss in 1..=8u8 {
                        let rates: Vec<u64> = WifiMode::all(class)
                            .iter()
                            .map(|m| m.data_rate(width, gi, nss))
                            .collect();
                        assert!(rates.windows(2).all(|w| w[0] <= w[1]), "{:?}", rates);
                    }
                }
            }
        }
        for base in [0u8, 8, 16, 24] {
            for width in [20u16, 40] {
                let rates: Vec<u64> = (base..base + 8)
                    .map(|i| WifiMode::ht(i).unwrap().data_rate(width, 800, 1))
                    .collect();
                assert!(rates.windows(2).all(|w| w[0] <= w[1]));
            }
        }
        let legacy: Vec<u64> = WifiMode::all(ModulationClass::Ofdm)
            .iter()
            .map(|m| m.data_rate(20, 800, 1))
            .collect();
        assert!(legacy.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_name_registry() {
        assert_eq!(WifiMode::from_name("HeMcs11"), WifiMode::he(11));
        assert_eq!(WifiMode::from_name("OfdmRate24Mbps"), WifiMode::ofdm_rate(24));
        assert!(WifiMode::from_name("VhtMcs10").is_none());
        assert_eq!(WifiMode::names().count(), 8 + 32 + 10 + 12);
    }

    #[test]
    fn test_serde_by_name() {
        let mode = WifiMode::vht(5).unwrap();
        let json = serde_json::to_string(&mode).unwrap();
        assert_eq!(json, "\"VhtMcs5\"");
        let back: WifiMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mode);
        assert!(serde_json::from_str::<WifiMode>("\"Bogus\"").is_err());
    }
}
