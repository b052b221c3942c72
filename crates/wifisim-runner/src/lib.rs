//! # wifisim-runner
//!
//! Runs a built wifisim simulation: the event loop, end-of-run statistics
//! and the JSON trace of PHY activity. The `wifisim` binary wraps this
//! library with a command line interface.

pub mod metrics_export;

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};
use wifi_ppdu::{Mpdu, StaId};
use wifisim_agents::{agent_report, AgentReport, AppFrame};
use wifisim_common::{
    metric_defs, EntityId, EntityRegistry, Event, EventId, EventPayload, EventQueue, PhyRxPsduEvent, PhyState, SimContext,
    SimError,
};
use wifisim_model::{build_simulation, BuiltSimulation, Model, ModelError, NodeInfo, MEDIUM_ENTITY};
use wifisim_phy::{PhyStats, WifiPhy};

pub use wifisim_common::SimTime;

// ============================================================================
// Error Types
// ============================================================================

/// Runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Statistics
// ============================================================================

/// End-of-run statistics of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub name: String,
    pub address: String,
    pub role: &'static str,
    pub channel: String,
    pub state: PhyState,
    pub phy: PhyStats,
    pub agents: Vec<AgentReport>,
}

/// Statistics of a completed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    pub seed: u64,
    /// Events dispatched, the end-of-simulation marker excluded.
    pub total_events: u64,
    pub simulation_time_us: u64,
    pub wall_time_ms: u64,
    pub events_by_kind: BTreeMap<&'static str, u64>,
    pub nodes: Vec<NodeStats>,
}

impl SimulationStats {
    /// Statistics of the node called `name`.
    pub fn node(&self, name: &str) -> Option<&NodeStats> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Counter `counter` of the first `kind` agent on node `name`.
    pub fn agent_counter(&self, name: &str, kind: &str, counter: &str) -> Option<u64> {
        self.node(name)?
            .agents
            .iter()
            .find(|a| a.kind == kind)?
            .counters
            .get(counter)
            .copied()
    }
}

// ============================================================================
// Trace Recording
// ============================================================================

/// A PPDU put on the air.
#[derive(Debug, Clone, Serialize)]
pub struct PhyTxPayload {
    pub uid: u64,
    pub preamble: String,
    pub mode: String,
    pub channel_width_mhz: u16,
    pub tx_power_dbm: f64,
    pub psdu_bytes: u32,
    /// Application frame carried by the first MPDU, when it decodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<&'static str>,
    /// First MPDU payload, hex-encoded.
    pub packet_hex: String,
    pub start_time_s: f64,
    pub end_time_s: f64,
}

/// A PSDU handed up by a PHY.
#[derive(Debug, Clone, Serialize)]
pub struct PhyRxPayload {
    /// "ok" when at least one MPDU was received, "error" otherwise.
    pub status: &'static str,
    pub uid: u64,
    pub sta_id: StaId,
    pub transmitter: String,
    #[serde(rename = "SNR")]
    pub snr_db: f64,
    #[serde(rename = "RSSI")]
    pub rssi_dbm: f64,
    pub mpdus_ok: usize,
    pub mpdus: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<&'static str>,
    pub start_time_s: f64,
    pub end_time_s: f64,
}

/// A PPDU the PHY gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct PhyDropPayload {
    pub uid: u64,
    pub preamble: String,
    pub reason: &'static str,
    #[serde(rename = "RSSI")]
    pub rssi_dbm: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhyStatePayload {
    pub previous: PhyState,
    pub state: PhyState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxRejectedPayload {
    pub state: PhyState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerPayload {
    pub timer_id: u64,
}

/// Payload types for different trace events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    #[serde(rename = "PHY_TX")]
    PhyTx(PhyTxPayload),
    #[serde(rename = "PHY_RX")]
    PhyRx(PhyRxPayload),
    #[serde(rename = "PHY_DROP")]
    PhyDrop(PhyDropPayload),
    #[serde(rename = "PHY_STATE")]
    PhyState(PhyStatePayload),
    #[serde(rename = "TX_REJECTED")]
    TxRejected(TxRejectedPayload),
    #[serde(rename = "TIMER")]
    Timer(TimerPayload),
}

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Node name of the entity the entry is about.
    pub origin: String,
    pub origin_id: String,
    /// Simulated time as ISO 8601, counted from 2025-01-01T00:00:00Z.
    pub timestamp: String,
    pub time_us: u64,
    #[serde(flatten)]
    pub payload: TracePayload,
}

/// Collects trace entries and writes them as one JSON array.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Write all entries to the output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

fn format_timestamp(time: SimTime) -> String {
    let us = time.as_micros();
    let secs = us / 1_000_000;
    format!(
        "2025-01-01T{:02}:{:02}:{:02}.{:06}Z",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        us % 1_000_000
    )
}

fn frame_name(mpdu: &Mpdu) -> Option<&'static str> {
    let name = match AppFrame::decode(&mpdu.payload).ok()? {
        AppFrame::EchoRequest { .. } => "echo_request",
        AppFrame::EchoReply { .. } => "echo_reply",
        AppFrame::Trigger { .. } => "trigger",
        AppFrame::TbData { .. } => "tb_data",
        AppFrame::DlData { .. } => "dl_data",
    };
    Some(name)
}

// ============================================================================
// Event Loop
// ============================================================================

/// Drives a built simulation to completion.
pub struct EventLoop {
    queue: EventQueue,
    registry: EntityRegistry,
    context: SimContext,
    node_infos: Vec<NodeInfo>,
    /// Trace origin names by entity id.
    origins: BTreeMap<EntityId, String>,
    trace: TraceRecorder,
    stats: SimulationStats,
}

impl EventLoop {
    /// Create an event loop for `simulation`, seeding the context RNG with
    /// `seed`. Trace entries are written to `trace_output` when given.
    pub fn new(simulation: BuiltSimulation, seed: u64, trace_output: Option<Box<dyn Write>>) -> Self {
        let mut context = SimContext::new(seed);
        let mut queue = EventQueue::new();
        // Initial events were numbered by the model; renumber them from the
        // context so later events cannot reuse their ids.
        for mut event in simulation.initial_events {
            event.id = EventId(context.next_event_id());
            queue.push(event);
        }

        let mut origins = BTreeMap::from([(MEDIUM_ENTITY, "medium".to_string())]);
        for node in &simulation.node_infos {
            origins.insert(node.phy_entity_id, node.name.clone());
            for (id, kind) in &node.agents {
                origins.insert(*id, format!("{}/{}", node.name, kind));
            }
        }

        EventLoop {
            queue,
            registry: simulation.entities,
            context,
            node_infos: simulation.node_infos,
            origins,
            trace: TraceRecorder::new(trace_output),
            stats: SimulationStats {
                seed,
                ..SimulationStats::default()
            },
        }
    }

    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn trace(&self) -> &TraceRecorder {
        &self.trace
    }

    /// Run until `duration` of simulated time has elapsed or no events are
    /// left, then flush the trace.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        let started = Instant::now();
        self.queue.push(Event {
            id: EventId(u64::MAX),
            time: duration,
            source: MEDIUM_ENTITY,
            targets: Vec::new(),
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.queue.step(&mut self.registry, &mut self.context)? {
            if matches!(event.payload, EventPayload::SimulationEnd) {
                debug!("Simulation end at {:?}", event.time);
                break;
            }
            self.stats.total_events += 1;
            let kind = event.payload.kind();
            *self.stats.events_by_kind.entry(kind).or_insert(0) += 1;
            metrics::counter!(metric_defs::SIMULATION_EVENTS.name, "kind" => kind).increment(1);
            if self.trace.is_enabled() {
                self.record_trace(&event);
            }
        }
        if self.context.time() < duration {
            self.context.set_time(duration);
        }

        self.stats.simulation_time_us = self.context.time().as_micros();
        self.stats.wall_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.stats.nodes = self.collect_node_stats();
        self.trace.flush()?;

        info!(
            "Simulation complete: {} events in {} ms",
            self.stats.total_events, self.stats.wall_time_ms
        );
        Ok(self.stats.clone())
    }

    fn collect_node_stats(&self) -> Vec<NodeStats> {
        self.node_infos
            .iter()
            .filter_map(|node| {
                let phy = self.registry.get_as::<WifiPhy>(node.phy_entity_id)?;
                let agents = node
                    .agents
                    .iter()
                    .filter_map(|(id, _)| self.registry.get(*id).and_then(agent_report))
                    .collect();
                Some(NodeStats {
                    name: node.name.clone(),
                    address: node.address.to_string(),
                    role: if node.is_ap { "ap" } else { "sta" },
                    channel: phy.channel().to_string(),
                    state: phy.state(),
                    phy: phy.stats().clone(),
                    agents,
                })
            })
            .collect()
    }

    fn origin(&self, id: EntityId) -> String {
        self.origins
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("entity_{}", id.0))
    }

    fn rx_payload(&self, status: &'static str, rx: &PhyRxPsduEvent) -> PhyRxPayload {
        PhyRxPayload {
            status,
            uid: rx.ppdu_uid,
            sta_id: rx.sta_id,
            transmitter: self.origin(rx.source_phy_id),
            snr_db: rx.snr_db,
            rssi_dbm: rx.rx_power_dbm,
            mpdus_ok: rx.mpdu_success.iter().filter(|ok| **ok).count(),
            mpdus: rx.mpdu_success.len(),
            frame: rx.psdu.mpdus().first().and_then(frame_name),
            start_time_s: rx.start_time.as_secs_f64(),
            end_time_s: rx.end_time.as_secs_f64(),
        }
    }

    fn record_trace(&mut self, event: &Event) {
        let (subject, payload) = match &event.payload {
            EventPayload::TransmitAir(tx) => {
                let first = tx.ppdu.psdus().values().next().and_then(|p| p.mpdus().first());
                let payload = PhyTxPayload {
                    uid: tx.ppdu.uid(),
                    preamble: tx.ppdu.preamble().to_string(),
                    mode: tx
                        .ppdu
                        .tx_vector()
                        .map(|txv| txv.mode().name())
                        .unwrap_or_default(),
                    channel_width_mhz: tx.ppdu.channel_width(),
                    tx_power_dbm: tx.tx_power_dbm,
                    psdu_bytes: tx.ppdu.size(),
                    frame: first.and_then(frame_name),
                    packet_hex: first.map(|m| hex::encode(&m.payload)).unwrap_or_default(),
                    start_time_s: event.time.as_secs_f64(),
                    end_time_s: tx.end_time.as_secs_f64(),
                };
                (tx.phy_id, TracePayload::PhyTx(payload))
            }
            EventPayload::PhyRxOk(rx) => (event.source, TracePayload::PhyRx(self.rx_payload("ok", rx))),
            EventPayload::PhyRxError(rx) => (event.source, TracePayload::PhyRx(self.rx_payload("error", rx))),
            EventPayload::PhyRxDrop(drop) => (
                event.source,
                TracePayload::PhyDrop(PhyDropPayload {
                    uid: drop.ppdu_uid,
                    preamble: drop.preamble.to_string(),
                    reason: drop.reason.as_label(),
                    rssi_dbm: drop.rx_power_dbm,
                }),
            ),
            EventPayload::PhyStateChanged(change) => (
                event.source,
                TracePayload::PhyState(PhyStatePayload {
                    previous: change.previous,
                    state: change.new_state,
                }),
            ),
            EventPayload::PhyTxRejected(rejected) => (
                event.source,
                TracePayload::TxRejected(TxRejectedPayload { state: rejected.state }),
            ),
            EventPayload::Timer { timer_id } => {
                let Some(target) = event.targets.first() else {
                    return;
                };
                // PHY-internal timers are not part of the trace.
                if !self.origins.get(target).is_some_and(|o| o.contains('/')) {
                    return;
                }
                (*target, TracePayload::Timer(TimerPayload { timer_id: *timer_id }))
            }
            _ => return,
        };

        let entry = TraceEntry {
            origin: self.origin(subject),
            origin_id: subject.0.to_string(),
            timestamp: format_timestamp(event.time),
            time_us: event.time.as_micros(),
            payload,
        };
        self.trace.record(entry);
    }
}

/// Build `model` and run it.
///
/// `seed` and `duration` override the model's `simulation` section.
pub fn run_model(
    model: &Model,
    seed: Option<u64>,
    duration: Option<SimTime>,
    trace_output: Option<Box<dyn Write>>,
) -> Result<SimulationStats, RunnerError> {
    let simulation = build_simulation(model)?;
    let seed = seed.unwrap_or(simulation.seed);
    let duration = duration.unwrap_or(simulation.duration);
    info!(
        "Running {} nodes for {:.6} s with seed {}",
        simulation.node_infos.len(),
        duration.as_secs_f64(),
        seed
    );
    let mut event_loop = EventLoop::new(simulation, seed, trace_output);
    event_loop.run(duration)
}
