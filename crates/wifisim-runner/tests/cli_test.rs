//! End-to-end tests of the `wifisim` binary.
//!
//! Each test writes a scenario into a temporary directory, runs the binary
//! on it and checks the statistics, trace and metrics it produces.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

use serde::Deserialize;

// ============================================================================
// JSON Deserialization Types for Trace Output
// ============================================================================

/// A trace entry from the output file. Fields present only for some entry
/// types are optional.
#[derive(Debug, Deserialize, Clone)]
struct TraceEntry {
    origin: String,
    origin_id: String,
    timestamp: String,
    time_us: u64,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    uid: Option<u64>,
    #[serde(default)]
    frame: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    transmitter: Option<String>,
    #[serde(rename = "SNR", default)]
    snr: Option<f64>,
    #[serde(default)]
    packet_hex: Option<String>,
    #[serde(default)]
    preamble: Option<String>,
    #[serde(default)]
    start_time_s: Option<f64>,
    #[serde(default)]
    end_time_s: Option<f64>,
    #[serde(default)]
    timer_id: Option<u64>,
}

const PING_SCENARIO: &str = r#"
simulation:
  duration_s: 1.0
  seed: 5
defaults:
  link:
    path_loss_db: 65.0
nodes:
  - name: ap
    phy: { is_ap: true }
    agents:
      - type: echo
  - name: sta
    agents:
      - { type: ping, target: "02:00:00:00:00:01", count: 3, interval_s: 0.05, start_s: 0.1 }
links:
  - { from: ap, to: sta }
"#;

const OFDMA_SCENARIO: &str = r#"
simulation:
  duration_s: 0.1
defaults:
  link:
    path_loss_db: 60.0
nodes:
  - name: ap
    phy: { is_ap: true }
    agents:
      - type: trigger
        start_s: 0.01
        interval_s: 0.01
        count: 2
        users:
          - { sta_id: 1, ru: "106", ru_index: 1, mcs: 0 }
          - { sta_id: 2, ru: "106", ru_index: 2, mcs: 3 }
  - name: sta1
    phy: { sta_id: 1 }
    agents:
      - type: tb_responder
  - name: sta2
    phy: { sta_id: 2 }
    agents:
      - type: tb_responder
links:
  - { from: ap, to: sta1 }
  - { from: ap, to: sta2 }
  - { from: sta1, to: sta2, path_loss_db: 90.0 }
"#;

// ============================================================================
// Test Helper Functions
// ============================================================================

fn wifisim(args: &[&str], dir: &Path) -> Output {
    // CARGO_BIN_EXE_wifisim is set by cargo when running tests for this crate
    let binary = env!("CARGO_BIN_EXE_wifisim");
    Command::new(binary)
        .current_dir(dir)
        .args(args)
        .output()
        .expect("Failed to execute wifisim")
}

fn assert_success(output: &Output) {
    if !output.status.success() {
        panic!(
            "wifisim failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

/// Run `scenario` and return the statistics printed on stdout and the trace.
fn run_and_collect_trace(scenario: &str, extra: &[&str]) -> (serde_json::Value, Vec<TraceEntry>) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(temp_dir.path().join("scenario.yaml"), scenario).unwrap();

    let mut args = vec!["run", "scenario.yaml", "--output", "trace.json"];
    args.extend_from_slice(extra);
    let output = wifisim(&args, temp_dir.path());
    assert_success(&output);

    let stats = serde_json::from_slice(&output.stdout).expect("Failed to parse stats JSON");
    let trace_json = fs::read_to_string(temp_dir.path().join("trace.json")).expect("Failed to read trace output file");
    let trace = serde_json::from_str(&trace_json).expect("Failed to parse trace JSON");
    (stats, trace)
}

fn agent_counter(stats: &serde_json::Value, node: &str, kind: &str, counter: &str) -> u64 {
    let node = stats["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["name"] == node)
        .unwrap_or_else(|| panic!("node {} missing", node));
    let agent = node["agents"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["kind"] == kind)
        .unwrap_or_else(|| panic!("agent {} missing", kind));
    agent["counters"][counter].as_u64().unwrap()
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_run_ping_scenario() {
    let (stats, trace) = run_and_collect_trace(PING_SCENARIO, &[]);

    assert_eq!(stats["seed"], 5);
    assert_eq!(stats["simulation_time_us"], 1_000_000);
    assert_eq!(agent_counter(&stats, "sta", "ping", "transmitted"), 3);
    assert_eq!(agent_counter(&stats, "sta", "ping", "received"), 3);
    assert_eq!(agent_counter(&stats, "ap", "echo", "replies"), 3);

    let requests: Vec<_> = trace
        .iter()
        .filter(|e| e.entry_type == "PHY_TX" && e.frame.as_deref() == Some("echo_request"))
        .collect();
    assert_eq!(requests.len(), 3);
    for tx in &requests {
        assert_eq!(tx.origin, "sta");
        assert!(tx.packet_hex.as_ref().is_some_and(|h| !h.is_empty()));
        assert!(tx.end_time_s.unwrap() > tx.start_time_s.unwrap());
        assert!(tx.timestamp.starts_with("2025-01-01T00:00:00."));
    }

    // Every request is received once by the AP, with the same PPDU uid.
    for tx in &requests {
        let rx: Vec<_> = trace
            .iter()
            .filter(|e| e.entry_type == "PHY_RX" && e.uid == tx.uid)
            .collect();
        assert_eq!(rx.len(), 1, "uid {:?}", tx.uid);
        assert_eq!(rx[0].origin, "ap");
        assert_eq!(rx[0].status.as_deref(), Some("ok"));
        assert_eq!(rx[0].transmitter.as_deref(), Some("sta"));
        assert!(rx[0].snr.unwrap() > 20.0);
        assert!(rx[0].time_us >= tx.time_us);
    }

    let ping_timers = trace
        .iter()
        .filter(|e| e.entry_type == "TIMER" && e.origin == "sta/ping")
        .count();
    assert!(ping_timers >= 3);
    assert!(trace.iter().all(|e| !e.origin_id.is_empty()));
}

#[test]
fn test_seed_override_is_deterministic() {
    let scenario = PING_SCENARIO.replace("start_s: 0.1 }", "start_s: 0.1, interval_jitter_s: 0.01 }");
    let (first_stats, first) = run_and_collect_trace(&scenario, &["--seed", "77"]);
    let (_, second) = run_and_collect_trace(&scenario, &["--seed", "77"]);

    assert_eq!(first_stats["seed"], 77);
    let times = |t: &[TraceEntry]| t.iter().map(|e| (e.time_us, e.entry_type.clone())).collect::<Vec<_>>();
    assert_eq!(times(&first), times(&second));
}

#[test]
fn test_duration_override() {
    let (stats, trace) = run_and_collect_trace(PING_SCENARIO, &["--duration", "120ms"]);
    assert_eq!(stats["simulation_time_us"], 120_000);
    assert_eq!(agent_counter(&stats, "sta", "ping", "transmitted"), 1);
    assert!(trace.iter().all(|e| e.time_us <= 120_000));
}

#[test]
fn test_ofdma_trigger_scenario() {
    let (stats, trace) = run_and_collect_trace(OFDMA_SCENARIO, &[]);

    assert_eq!(agent_counter(&stats, "ap", "trigger", "triggers_sent"), 2);
    assert_eq!(agent_counter(&stats, "ap", "trigger", "tb_received"), 4);
    assert_eq!(agent_counter(&stats, "sta1", "tb_responder", "responses"), 2);
    assert_eq!(agent_counter(&stats, "sta2", "tb_responder", "responses"), 2);

    // TB responses reuse the uid of the trigger that solicited them.
    let triggers: Vec<_> = trace
        .iter()
        .filter(|e| e.entry_type == "PHY_TX" && e.frame.as_deref() == Some("trigger"))
        .collect();
    assert_eq!(triggers.len(), 2);
    for trigger in triggers {
        let responders: Vec<_> = trace
            .iter()
            .filter(|e| e.entry_type == "PHY_TX" && e.frame.as_deref() == Some("tb_data") && e.uid == trigger.uid)
            .map(|e| e.origin.as_str())
            .collect();
        assert_eq!(responders.len(), 2);
        assert!(responders.contains(&"sta1") && responders.contains(&"sta2"));
    }
    assert!(trace
        .iter()
        .filter(|e| e.entry_type == "PHY_TX" && e.frame.as_deref() == Some("tb_data"))
        .all(|e| e.preamble.as_deref() == Some("HE_TB")));
}

#[test]
fn test_merged_models() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("base.yaml"), PING_SCENARIO).unwrap();
    fs::write(
        temp_dir.path().join("override.yaml"),
        "simulation:\n  duration_s: 0.2\nnodes:\n  - name: sta\n    agents:\n      - { type: ping, target: \"02:00:00:00:00:01\", count: 1, start_s: 0.1 }\n",
    )
    .unwrap();

    let output = wifisim(&["run", "base.yaml", "override.yaml"], temp_dir.path());
    assert_success(&output);
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["simulation_time_us"], 200_000);
    assert_eq!(agent_counter(&stats, "sta", "ping", "transmitted"), 1);
}

#[test]
fn test_metrics_export_prometheus() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("scenario.yaml"), PING_SCENARIO).unwrap();

    let output = wifisim(&["run", "scenario.yaml", "--metrics-output", "prometheus"], temp_dir.path());
    assert_success(&output);
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("# TYPE wifisim_phy_tx_ppdus counter"));
    assert!(text.contains("wifisim_phy_tx_ppdus{preamble=\"he_su\"} 6"));
    assert!(text.contains("wifisim_phy_tx_ppdus{node=\"sta\",preamble=\"he_su\"} 3"));
    assert!(text.contains("wifisim_ping_rtt_count 3"));
}

#[test]
fn test_metrics_export_json_to_file() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("scenario.yaml"), PING_SCENARIO).unwrap();

    let output = wifisim(
        &["run", "scenario.yaml", "--metrics-output", "json", "--metrics-file", "metrics.json"],
        temp_dir.path(),
    );
    assert_success(&output);
    // Statistics still go to stdout when metrics go to a file.
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(agent_counter(&stats, "sta", "ping", "received"), 3);

    let metrics: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp_dir.path().join("metrics.json")).unwrap()).unwrap();
    assert_eq!(metrics["counters"]["wifisim.ping.tx"], 3);
    assert_eq!(metrics["nodes"]["ap"]["counters"]["wifisim.echo.replies"], 3);
}

#[test]
fn test_invalid_model_fails() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("bad.yaml"), "nodes:\n  - name: a\n    colour: red\n").unwrap();
    let output = wifisim(&["run", "bad.yaml"], temp_dir.path());
    assert!(!output.status.success());

    let output = wifisim(&["run", "missing.yaml"], temp_dir.path());
    assert!(!output.status.success());
}

#[test]
fn test_channels_listing() {
    let temp_dir = TempDir::new().unwrap();
    let output = wifisim(&["channels", "--band", "2.4ghz", "--width", "20"], temp_dir.path());
    assert_success(&output);
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.lines().any(|l| l.split_whitespace().collect::<Vec<_>>() == ["1", "2412", "20", "2.4ghz", "ofdm"]));
    assert!(!text.contains("5ghz"));
}

#[test]
fn test_modes_listing() {
    let temp_dir = TempDir::new().unwrap();
    let output = wifisim(&["modes", "--class", "ofdm"], temp_dir.path());
    assert_success(&output);
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("OfdmRate6Mbps"));
    assert!(text.lines().any(|l| l.starts_with("OfdmRate54Mbps") && l.trim_end().ends_with("54.0")));
    assert!(!text.contains("HeMcs"));

    let output = wifisim(&["metrics"], temp_dir.path());
    assert_success(&output);
    assert!(String::from_utf8(output.stdout).unwrap().contains("wifisim.phy.rx_drop"));
}
