//! Preamble detection and frame capture models.

use serde::{Deserialize, Serialize};
use wifisim_common::SimTime;

/// How long after the start of a PPDU the detection verdict is taken.
pub const PREAMBLE_DETECTION_WINDOW: SimTime = SimTime::from_micros(4);

/// Threshold preamble detection: the legacy preamble is detected if both
/// the SNR and the RSSI on the primary 20 MHz clear their thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreambleDetectionConfig {
    pub snr_threshold_db: f64,
    pub min_rssi_dbm: f64,
}

impl Default for PreambleDetectionConfig {
    fn default() -> Self {
        Self {
            snr_threshold_db: 4.0,
            min_rssi_dbm: -82.0,
        }
    }
}

impl PreambleDetectionConfig {
    pub fn is_detected(&self, rssi_dbm: f64, snr_db: f64) -> bool {
        rssi_dbm >= self.min_rssi_dbm && snr_db >= self.snr_threshold_db
    }
}

/// Simple frame capture: a new PPDU that is `margin_db` stronger than the
/// one being received, and arrives within `window_us` of that PPDU's
/// preamble detection, takes over the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameCaptureConfig {
    pub margin_db: f64,
    pub window_us: u64,
}

impl Default for FrameCaptureConfig {
    fn default() -> Self {
        Self {
            margin_db: 5.0,
            window_us: 16,
        }
    }
}

impl FrameCaptureConfig {
    pub fn window(&self) -> SimTime {
        SimTime::from_micros(self.window_us)
    }

    pub fn is_in_capture_window(&self, detected_at: SimTime, now: SimTime) -> bool {
        now <= detected_at + self.window()
    }

    pub fn capture_new_frame(&self, current_dbm: f64, new_dbm: f64) -> bool {
        new_dbm - current_dbm >= self.margin_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_detection() {
        let model = PreambleDetectionConfig::default();
        assert!(model.is_detected(-80.0, 10.0));
        assert!(!model.is_detected(-85.0, 10.0));
        assert!(!model.is_detected(-60.0, 3.9));
    }

    #[test]
    fn test_frame_capture() {
        let fc = FrameCaptureConfig::default();
        let detected = SimTime::from_micros(104);
        assert!(fc.is_in_capture_window(detected, SimTime::from_micros(120)));
        assert!(!fc.is_in_capture_window(detected, SimTime::from_micros(121)));
        assert!(fc.capture_new_frame(-70.0, -65.0));
        assert!(!fc.capture_new_frame(-70.0, -66.0));
    }

    #[test]
    fn test_config_from_yaml() {
        let fc: FrameCaptureConfig = serde_yaml::from_str("margin_db: 8.0").unwrap();
        assert_eq!(fc.window_us, 16);
        assert!(serde_yaml::from_str::<PreambleDetectionConfig>("snr: 1").is_err());
    }
}
