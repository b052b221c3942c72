//! Signal energy bookkeeping per 20 MHz subchannel.
//!
//! Every signal a PHY hears is recorded here, whether or not it is being
//! decoded. The tracker answers energy detection queries for CCA and splits
//! a reception interval into chunks of constant interference so the error
//! rate model can be applied chunk by chunk.

use crate::{dbm_to_mw, mw_to_dbm};
use std::collections::BTreeMap;
use wifi_ppdu::{ErrorRateModel, WifiMode};
use wifisim_common::SimTime;

/// Thermal noise density at 290 K.
const THERMAL_NOISE_DBM_PER_HZ: f64 = -174.0;

/// Handle to a tracked signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalId(pub u32);

#[derive(Debug, Clone)]
struct Signal {
    power_mw: BTreeMap<u16, f64>,
    start: SimTime,
    end: SimTime,
    ignored_for_cca: bool,
}

impl Signal {
    fn active_during(&self, from: SimTime, to: SimTime) -> bool {
        self.start < to && self.end > from
    }

    fn power_on(&self, bands: &[u16]) -> f64 {
        bands.iter().filter_map(|b| self.power_mw.get(b)).sum()
    }
}

/// Outcome of evaluating an interval against the error rate model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkEvaluation {
    pub success_rate: f64,
    /// Worst SINR seen over the interval, in dB.
    pub min_sinr_db: f64,
}

/// Tracks the signals overlapping a PHY's operating channel.
#[derive(Debug)]
pub struct InterferenceTracker {
    signals: BTreeMap<SignalId, Signal>,
    next_id: u32,
    noise_mw_per_band: f64,
}

impl InterferenceTracker {
    pub fn new(noise_figure_db: f64) -> Self {
        let noise_dbm = THERMAL_NOISE_DBM_PER_HZ + 10.0 * 20e6f64.log10() + noise_figure_db;
        Self {
            signals: BTreeMap::new(),
            next_id: 0,
            noise_mw_per_band: dbm_to_mw(noise_dbm),
        }
    }

    /// Records a signal with its received power per 20 MHz subchannel.
    pub fn add(&mut self, rx_power_dbm: &BTreeMap<u16, f64>, start: SimTime, end: SimTime) -> SignalId {
        let id = SignalId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let power_mw = rx_power_dbm.iter().map(|(band, dbm)| (*band, dbm_to_mw(*dbm))).collect();
        self.signals.insert(
            id,
            Signal {
                power_mw,
                start,
                end,
                ignored_for_cca: false,
            },
        );
        id
    }

    /// Stops a signal from holding the medium busy through preamble-based
    /// CCA. Its energy still counts for energy detection.
    pub fn set_ignored_for_cca(&mut self, id: SignalId) {
        if let Some(signal) = self.signals.get_mut(&id) {
            signal.ignored_for_cca = true;
        }
    }

    /// Noise power over `bands` subchannels.
    pub fn noise_mw(&self, bands: usize) -> f64 {
        self.noise_mw_per_band * bands.max(1) as f64
    }

    /// Received power of a set of signals over `bands`, in dBm.
    pub fn power_dbm(&self, ids: &[SignalId], bands: &[u16]) -> f64 {
        let mw: f64 = ids
            .iter()
            .filter_map(|id| self.signals.get(id))
            .map(|s| s.power_on(bands))
            .sum();
        mw_to_dbm(mw)
    }

    /// Total energy on a subchannel at `now`, noise excluded.
    pub fn energy_dbm(&self, band: u16, now: SimTime) -> f64 {
        let mw: f64 = self
            .signals
            .values()
            .filter(|s| s.start <= now && s.end > now)
            .filter_map(|s| s.power_mw.get(&band))
            .sum();
        mw_to_dbm(mw)
    }

    /// Returns true if a signal not ignored for CCA is on air at `now` with
    /// at least `threshold_dbm` on the subchannel.
    pub fn signal_above(&self, band: u16, now: SimTime, threshold_dbm: f64) -> bool {
        self.signals
            .values()
            .filter(|s| !s.ignored_for_cca && s.start <= now && s.end > now)
            .filter_map(|s| s.power_mw.get(&band))
            .any(|mw| mw_to_dbm(*mw) >= threshold_dbm)
    }

    /// Splits `[from, to)` at every start and end of interfering signals and
    /// returns each chunk's duration with its linear SINR over `bands`.
    ///
    /// `own` is the wanted signal set; `exclude` lists signals that are
    /// neither wanted nor interference.
    pub fn sinr_chunks(
        &self,
        own: &[SignalId],
        exclude: &[SignalId],
        bands: &[u16],
        from: SimTime,
        to: SimTime,
    ) -> Vec<(SimTime, f64)> {
        if to <= from {
            return Vec::new();
        }
        let signal_mw: f64 = own
            .iter()
            .filter_map(|id| self.signals.get(id))
            .map(|s| s.power_on(bands))
            .sum();
        let noise = self.noise_mw(bands.len());

        let interferers: Vec<&Signal> = self
            .signals
            .iter()
            .filter(|(id, s)| !own.contains(id) && !exclude.contains(id) && s.active_during(from, to))
            .map(|(_, s)| s)
            .collect();

        let mut cuts = vec![from, to];
        for s in &interferers {
            for t in [s.start, s.end] {
                if t > from && t < to {
                    cuts.push(t);
                }
            }
        }
        cuts.sort();
        cuts.dedup();

        cuts.windows(2)
            .map(|w| {
                let interference: f64 = interferers
                    .iter()
                    .filter(|s| s.active_during(w[0], w[1]))
                    .map(|s| s.power_on(bands))
                    .sum();
                (w[1] - w[0], signal_mw / (noise + interference))
            })
            .collect()
    }

    /// Applies the error rate model to every chunk of `[from, to)`, sending
    /// `rate_bps` worth of bits per unit time.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        model: &dyn ErrorRateModel,
        mode: WifiMode,
        rate_bps: u64,
        own: &[SignalId],
        exclude: &[SignalId],
        bands: &[u16],
        from: SimTime,
        to: SimTime,
    ) -> ChunkEvaluation {
        let chunks = self.sinr_chunks(own, exclude, bands, from, to);
        let mut success_rate = 1.0;
        let mut min_sinr = f64::INFINITY;
        for (duration, sinr) in chunks {
            let nbits = (rate_bps as f64 * duration.as_secs_f64()).round() as u64;
            success_rate *= model.chunk_success_rate(mode, sinr, nbits);
            min_sinr = min_sinr.min(sinr);
        }
        ChunkEvaluation {
            success_rate,
            min_sinr_db: if min_sinr.is_finite() {
                mw_to_dbm(min_sinr)
            } else {
                f64::INFINITY
            },
        }
    }

    /// Forgets signals that ended at or before `before`.
    pub fn purge(&mut self, before: SimTime) {
        self.signals.retain(|_, s| s.end > before);
    }

    pub fn clear(&mut self) {
        self.signals.clear();
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
