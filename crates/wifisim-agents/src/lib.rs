//! # wifisim-agents
//!
//! Traffic agents for the wifisim simulator. Each agent is an entity
//! attached to one PHY: it hands PSDUs to the PHY with
//! [`EventPayload::PhyTxRequest`] and listens to the PHY's reception reports.
//!
//! - [`PingAgent`] / [`EchoAgent`] - echo request/reply traffic with
//!   transmitted/received accounting
//! - [`TriggerAgent`] / [`TbResponder`] - UL OFDMA: the AP solicits HE TB
//!   PPDUs and stations answer a SIFS after the trigger
//! - [`DlMuAgent`] / [`DlMuSink`] - periodic HE MU PPDUs and their receivers
//!
//! Agents are described in scenarios by [`AgentConfig`] and built with
//! [`create_agent`].

pub mod dl_mu;
pub mod echo;
pub mod frame;
pub mod ofdma;
pub mod ping;

pub use dl_mu::{DlMuAgent, DlMuConfig, DlMuSink, DlMuUserConfig};
pub use echo::{EchoAgent, EchoConfig};
pub use frame::{AppFrame, FrameError, TriggerUser};
pub use ofdma::{TbResponder, TriggerAgent, TriggerConfig, TriggerUserConfig};
pub use ping::{PingAgent, PingConfig};

use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use wifi_ppdu::{Band, MacAddr, StaId, TxVector};
use wifisim_common::{Entity, EntityId, EventPayload, MetricLabels, PhyRxPsduEvent, PhyTxRequestEvent, Psdu, SimContext, SimTime};
use wifisim_phy::RateControl;

/// Short interframe space.
pub const SIFS: SimTime = SimTime::from_micros(16);

// ============================================================================
// Configuration
// ============================================================================

/// Agent description as it appears in a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentConfig {
    Ping(PingConfig),
    Echo(EchoConfig),
    Trigger(TriggerConfig),
    TbResponder,
    DlMu(DlMuConfig),
    DlMuSink,
}

impl AgentConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentConfig::Ping(_) => "ping",
            AgentConfig::Echo(_) => "echo",
            AgentConfig::Trigger(_) => "trigger",
            AgentConfig::TbResponder => "tb_responder",
            AgentConfig::DlMu(_) => "dl_mu",
            AgentConfig::DlMuSink => "dl_mu_sink",
        }
    }
}

/// Agent construction failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{agent}' on node '{node}': {message}")]
    InvalidConfig {
        node: String,
        agent: &'static str,
        message: String,
    },
}

/// The PHY an agent drives, and what the agent needs to know about it.
#[derive(Debug, Clone)]
pub struct AttachedPhy {
    /// Node name, for logs and metric labels.
    pub node: String,
    pub phy: EntityId,
    pub address: MacAddr,
    pub sta_id: StaId,
    pub bss_color: u8,
    pub band: Band,
}

/// An agent entity plus the timers that start it.
pub struct BuiltAgent {
    pub entity: Box<dyn Entity>,
    /// `(time, timer_id)` pairs to schedule on the agent before the run.
    pub timers: Vec<(SimTime, u64)>,
}

/// Builds the agent described by `config`.
pub fn create_agent(
    id: EntityId,
    attached: AttachedPhy,
    config: &AgentConfig,
    rate: Box<dyn RateControl>,
) -> Result<BuiltAgent, AgentError> {
    let invalid = |message: String| AgentError::InvalidConfig {
        node: attached.node.clone(),
        agent: config.kind(),
        message,
    };
    let built = match config {
        AgentConfig::Ping(c) => {
            c.validate().map_err(invalid)?;
            let agent = PingAgent::new(id, attached, c.clone(), rate);
            BuiltAgent {
                timers: agent.initial_timers(),
                entity: Box::new(agent),
            }
        }
        AgentConfig::Echo(c) => BuiltAgent {
            entity: Box::new(EchoAgent::new(id, attached, c.clone(), rate)),
            timers: Vec::new(),
        },
        AgentConfig::Trigger(c) => {
            c.validate().map_err(invalid)?;
            let agent = TriggerAgent::new(id, attached, c.clone(), rate);
            BuiltAgent {
                timers: agent.initial_timers(),
                entity: Box::new(agent),
            }
        }
        AgentConfig::TbResponder => BuiltAgent {
            entity: Box::new(TbResponder::new(id, attached)),
            timers: Vec::new(),
        },
        AgentConfig::DlMu(c) => {
            c.validate().map_err(invalid)?;
            let agent = DlMuAgent::new(id, attached, c.clone());
            BuiltAgent {
                timers: agent.initial_timers(),
                entity: Box::new(agent),
            }
        }
        AgentConfig::DlMuSink => BuiltAgent {
            entity: Box::new(DlMuSink::new(id, attached)),
            timers: Vec::new(),
        },
    };
    Ok(built)
}

// ============================================================================
// Reporting
// ============================================================================

/// End-of-run counters of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentReport {
    pub node: String,
    pub kind: &'static str,
    pub counters: BTreeMap<&'static str, u64>,
}

/// Counters of `entity` if it is one of the agents of this crate.
pub fn agent_report(entity: &dyn Entity) -> Option<AgentReport> {
    let any = entity.as_any();
    if let Some(a) = any.downcast_ref::<PingAgent>() {
        return Some(a.report());
    }
    if let Some(a) = any.downcast_ref::<EchoAgent>() {
        return Some(a.report());
    }
    if let Some(a) = any.downcast_ref::<TriggerAgent>() {
        return Some(a.report());
    }
    if let Some(a) = any.downcast_ref::<TbResponder>() {
        return Some(a.report());
    }
    if let Some(a) = any.downcast_ref::<DlMuAgent>() {
        return Some(a.report());
    }
    any.downcast_ref::<DlMuSink>().map(DlMuSink::report)
}

// ============================================================================
// Shared helpers
// ============================================================================

fn agent_labels(attached: &AttachedPhy, kind: &str) -> MetricLabels {
    MetricLabels::new(attached.node.clone(), kind)
}

/// Hands PSDUs to the attached PHY.
fn request_tx(
    ctx: &mut SimContext,
    phy: EntityId,
    psdus: BTreeMap<StaId, Psdu>,
    tx_vector: TxVector,
    uid: Option<u64>,
    solicits_tb: bool,
) {
    ctx.post_immediate(
        vec![phy],
        EventPayload::PhyTxRequest(PhyTxRequestEvent {
            psdus,
            tx_vector,
            uid,
            solicits_tb,
        }),
    );
}

/// Successfully received MPDUs of a PSDU, decoded, with their transmitter.
fn received_frames(rx: &PhyRxPsduEvent, address: MacAddr) -> Vec<(MacAddr, AppFrame)> {
    rx.psdu
        .mpdus()
        .iter()
        .zip(&rx.mpdu_success)
        .filter(|(mpdu, ok)| **ok && (mpdu.addr1 == address || mpdu.addr1.is_group()))
        .filter_map(|(mpdu, _)| match AppFrame::decode(&mpdu.payload) {
            Ok(frame) => Some((mpdu.addr2, frame)),
            Err(e) => {
                tracing::trace!(from = %mpdu.addr2, error = %e, "ignoring foreign payload");
                None
            }
        })
        .collect()
}

/// `base_s` plus Gaussian jitter, never negative.
fn jittered_delay(rng: &mut ChaCha8Rng, base_s: f64, jitter_s: f64) -> SimTime {
    let delay_s = if jitter_s > 0.0 {
        match Normal::new(base_s, jitter_s) {
            Ok(normal) => normal.sample(rng).max(0.0),
            Err(_) => base_s,
        }
    } else {
        base_s
    };
    SimTime::from_secs(delay_s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_yaml() {
        let yaml = "- type: ping\n  target: \"02:00:00:00:00:02\"\n  count: 3\n- type: echo\n- type: tb_responder\n";
        let agents: Vec<AgentConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(agents.len(), 3);
        match &agents[0] {
            AgentConfig::Ping(p) => {
                assert_eq!(p.count, 3);
                assert_eq!(p.target, MacAddr::new([2, 0, 0, 0, 0, 2]));
            }
            other => panic!("unexpected agent {other:?}"),
        }
        assert_eq!(agents[1], AgentConfig::Echo(EchoConfig::default()));
        assert_eq!(agents[2].kind(), "tb_responder");

        assert!(serde_yaml::from_str::<Vec<AgentConfig>>("- type: ping\n  bogus: 1\n").is_err());
        assert!(serde_yaml::from_str::<Vec<AgentConfig>>("- type: flood\n").is_err());
    }

    #[test]
    fn test_jittered_delay() {
        use rand::SeedableRng;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(jittered_delay(&mut rng, 0.5, 0.0), SimTime::from_millis(500));
        for _ in 0..100 {
            assert!(jittered_delay(&mut rng, 0.0, 1.0) >= SimTime::ZERO);
        }
    }
}
