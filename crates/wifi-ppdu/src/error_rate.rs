//! Error rate models: probability that a chunk of bits survives at a given SNR.

use crate::mode::{CodeRate, Modulation, WifiMode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maps (mode, SNR, number of bits) to a success probability.
pub trait ErrorRateModel: Send + Sync + fmt::Debug {
    /// Probability that `nbits` bits sent with `mode` at linear `snr` are
    /// all received correctly.
    fn chunk_success_rate(&self, mode: WifiMode, snr: f64, nbits: u64) -> f64;
}

/// Which error rate model a PHY uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRateModelKind {
    #[default]
    Awgn,
    Threshold,
}

impl ErrorRateModelKind {
    pub fn build(self) -> Box<dyn ErrorRateModel> {
        match self {
            ErrorRateModelKind::Awgn => Box::new(AwgnErrorRateModel),
            ErrorRateModelKind::Threshold => Box::new(ThresholdErrorRateModel::default()),
        }
    }
}

fn db_to_ratio(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Complementary error function (Abramowitz & Stegun 7.1.26).
fn erfc(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t
        * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let result = poly * (-x * x).exp();
    if x >= 0.0 {
        result
    } else {
        2.0 - result
    }
}

/// Uncoded BER of a Gray-coded constellation on an AWGN channel.
fn uncoded_ber(modulation: Modulation, snr: f64) -> f64 {
    match modulation {
        Modulation::Bpsk => 0.5 * erfc(snr.sqrt()),
        Modulation::Qpsk => 0.5 * erfc((snr / 2.0).sqrt()),
        other => {
            let m = other.constellation_size() as f64;
            let k = other.bits_per_subcarrier() as f64;
            (2.0 / k) * (1.0 - 1.0 / m.sqrt()) * erfc((3.0 * snr / (2.0 * (m - 1.0))).sqrt())
        }
    }
    .clamp(0.0, 0.5)
}

fn coding_gain_db(rate: CodeRate) -> f64 {
    match rate {
        CodeRate::Half => 5.0,
        CodeRate::TwoThirds => 4.0,
        CodeRate::ThreeQuarters => 3.5,
        CodeRate::FiveSixths => 3.0,
    }
}

/// Uncoded AWGN bit error rate shifted by a fixed coding gain per code rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwgnErrorRateModel;

impl ErrorRateModel for AwgnErrorRateModel {
    fn chunk_success_rate(&self, mode: WifiMode, snr: f64, nbits: u64) -> f64 {
        if nbits == 0 {
            return 1.0;
        }
        if snr <= 0.0 {
            return 0.0;
        }
        let effective = snr * db_to_ratio(coding_gain_db(mode.code_rate()));
        let ber = uncoded_ber(mode.modulation(), effective);
        (1.0 - ber).powf(nbits as f64)
    }
}

/// Deterministic model: success iff the SNR reaches the mode's threshold.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdErrorRateModel {
    /// Added to every threshold, in dB.
    pub margin_db: f64,
}

impl Default for ThresholdErrorRateModel {
    fn default() -> Self {
        Self { margin_db: 0.0 }
    }
}

impl ThresholdErrorRateModel {
    /// Minimum SNR in dB for the mode's modulation and code rate.
    pub fn threshold_db(&self, mode: WifiMode) -> f64 {
        let base = match (mode.modulation(), mode.code_rate()) {
            (Modulation::Bpsk, CodeRate::Half) => 2.0,
            (Modulation::Bpsk, _) => 5.0,
            (Modulation::Qpsk, CodeRate::Half) => 5.0,
            (Modulation::Qpsk, _) => 9.0,
            (Modulation::Qam16, CodeRate::Half) => 11.0,
            (Modulation::Qam16, _) => 15.0,
            (Modulation::Qam64, CodeRate::TwoThirds) => 18.0,
            (Modulation::Qam64, CodeRate::ThreeQuarters) => 20.0,
            (Modulation::Qam64, _) => 25.0,
            (Modulation::Qam256, CodeRate::ThreeQuarters) => 29.0,
            (Modulation::Qam256, _) => 31.0,
            (Modulation::Qam1024, CodeRate::ThreeQuarters) => 34.0,
            (Modulation::Qam1024, _) => 37.0,
        };
        base + self.margin_db
    }
}

impl ErrorRateModel for ThresholdErrorRateModel {
    fn chunk_success_rate(&self, mode: WifiMode, snr: f64, nbits: u64) -> f64 {
        if nbits == 0 {
            return 1.0;
        }
        if snr > 0.0 && 10.0 * snr.log10() >= self.threshold_db(mode) {
            1.0
        } else {
            0.0
        }
    }
}
