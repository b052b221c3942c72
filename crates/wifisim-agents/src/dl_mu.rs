//! Periodic DL MU traffic: one HE MU PPDU carrying a PSDU per configured
//! station, each on its own RU.

use crate::{agent_labels, received_frames, request_tx, AgentReport, AppFrame, AttachedPhy};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};
use wifi_ppdu::{HeMuUserInfo, MacAddr, Mpdu, PreambleType, Psdu, RuSpec, RuType, StaId, TxVector, WifiMode};
use wifisim_common::{
    metric_defs, Entity, EntityId, Event, EventPayload, MetricLabels, SimContext, SimError, SimTime,
};

const TIMER_DL_MU_SEND: u64 = 1;
const TIMER_DL_MU_STOP: u64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DlMuUserConfig {
    pub sta_id: StaId,
    /// Receiver address of the station's PSDU.
    pub address: MacAddr,
    pub ru: RuType,
    pub ru_index: u8,
    #[serde(default)]
    pub mcs: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DlMuConfig {
    pub start_s: f64,
    pub interval_s: f64,
    /// Number of PPDUs; 0 sends until stopped.
    pub count: u32,
    pub stop_s: Option<f64>,
    pub channel_width_mhz: u16,
    /// Payload bytes per station.
    pub size: u16,
    pub users: Vec<DlMuUserConfig>,
}

impl Default for DlMuConfig {
    fn default() -> Self {
        DlMuConfig {
            start_s: 0.1,
            interval_s: 0.01,
            count: 0,
            stop_s: None,
            channel_width_mhz: 20,
            size: 500,
            users: Vec::new(),
        }
    }
}

impl DlMuConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_s <= 0.0 {
            return Err(format!("interval_s must be positive, got {}", self.interval_s));
        }
        if self.users.is_empty() {
            return Err("no users to serve".to_string());
        }
        let width = self.channel_width_mhz;
        let mut sta_ids = BTreeSet::new();
        let mut rus: Vec<RuSpec> = Vec::new();
        for user in &self.users {
            if !sta_ids.insert(user.sta_id) {
                return Err(format!("station {} served twice", user.sta_id));
            }
            let ru = RuSpec::new(user.ru, usize::from(user.ru_index));
            if !ru.is_valid(width) {
                return Err(format!("{} does not fit a {} MHz channel", ru, width));
            }
            if rus.iter().any(|r| r.overlaps(&ru, width)) {
                return Err(format!("{} of station {} overlaps another user", ru, user.sta_id));
            }
            if WifiMode::he(user.mcs).is_none() {
                return Err(format!("invalid HE MCS {} for station {}", user.mcs, user.sta_id));
            }
            rus.push(ru);
        }
        Ok(())
    }
}

// ============================================================================
// Sender (AP)
// ============================================================================

pub struct DlMuAgent {
    id: EntityId,
    attached: AttachedPhy,
    config: DlMuConfig,
    seq: u16,
    stopped: bool,
    sent: u64,
    rejected: u64,
    metrics_labels: MetricLabels,
}

impl DlMuAgent {
    pub fn new(id: EntityId, attached: AttachedPhy, config: DlMuConfig) -> Self {
        let metrics_labels = agent_labels(&attached, "dl_mu");
        DlMuAgent {
            id,
            attached,
            config,
            seq: 0,
            stopped: false,
            sent: 0,
            rejected: 0,
            metrics_labels,
        }
    }

    pub fn initial_timers(&self) -> Vec<(SimTime, u64)> {
        let mut timers = vec![(SimTime::from_secs(self.config.start_s), TIMER_DL_MU_SEND)];
        if let Some(stop) = self.config.stop_s {
            timers.push((SimTime::from_secs(stop), TIMER_DL_MU_STOP));
        }
        timers
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            node: self.attached.node.clone(),
            kind: "dl_mu",
            counters: BTreeMap::from([("sent", self.sent), ("rejected", self.rejected)]),
        }
    }

    fn tx_vector(&self) -> Option<TxVector> {
        let first = self.config.users.first()?;
        let mut txv = TxVector::new(WifiMode::he(first.mcs)?, PreambleType::HeMu, self.config.channel_width_mhz)
            .with_bss_color(self.attached.bss_color);
        for user in &self.config.users {
            let ru = RuSpec::new(user.ru, usize::from(user.ru_index));
            txv = txv.with_user(user.sta_id, HeMuUserInfo::new(ru, user.mcs, 1));
        }
        Some(txv)
    }

    fn send(&mut self, ctx: &mut SimContext) {
        if self.stopped || (self.config.count > 0 && self.sent >= u64::from(self.config.count)) {
            return;
        }
        let Some(txv) = self.tx_vector() else {
            return;
        };
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let size = usize::from(self.config.size);
        let psdus: BTreeMap<StaId, Psdu> = self
            .config
            .users
            .iter()
            .map(|user| {
                let payload = AppFrame::DlData { seq }.encode(size);
                (user.sta_id, Psdu::single(Mpdu::new(user.address, self.attached.address, seq, payload)))
            })
            .collect();
        request_tx(ctx, self.attached.phy, psdus, txv, None, false);
        self.sent += 1;
        metrics::counter!(metric_defs::DL_MU_SENT.name, &self.metrics_labels.to_labels()).increment(1);
        debug!(
            "DlMu[{}]: HE MU PPDU seq={} to {} stations",
            self.attached.node,
            seq,
            self.config.users.len()
        );

        if self.config.count == 0 || self.sent < u64::from(self.config.count) {
            ctx.post_event(
                SimTime::from_secs(self.config.interval_s),
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_DL_MU_SEND,
                },
            );
        }
    }
}

impl Entity for DlMuAgent {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_DL_MU_SEND => self.send(ctx),
                TIMER_DL_MU_STOP => {
                    self.stopped = true;
                    info!("DlMu[{}]: stopped after {} PPDUs", self.attached.node, self.sent);
                }
                other => trace!("DlMu[{}]: unknown timer {}", self.attached.node, other),
            },
            EventPayload::PhyTxRejected(rejected) => {
                self.rejected += 1;
                debug!("DlMu[{}]: PHY refused PPDU while {}", self.attached.node, rejected.state);
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Sink (STA)
// ============================================================================

/// Counts DL MU payloads delivered to its station.
pub struct DlMuSink {
    id: EntityId,
    attached: AttachedPhy,
    received: u64,
    errors: u64,
    metrics_labels: MetricLabels,
}

impl DlMuSink {
    pub fn new(id: EntityId, attached: AttachedPhy) -> Self {
        let metrics_labels = agent_labels(&attached, "dl_mu_sink");
        DlMuSink {
            id,
            attached,
            received: 0,
            errors: 0,
            metrics_labels,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            node: self.attached.node.clone(),
            kind: "dl_mu_sink",
            counters: BTreeMap::from([("received", self.received), ("errors", self.errors)]),
        }
    }
}

impl Entity for DlMuSink {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::PhyRxOk(rx) if rx.tx_vector.preamble() == PreambleType::HeMu => {
                let delivered = received_frames(rx, self.attached.address)
                    .into_iter()
                    .filter(|(_, frame)| matches!(frame, AppFrame::DlData { .. }))
                    .count() as u64;
                self.received += delivered;
                metrics::counter!(metric_defs::DL_MU_RECEIVED.name, &self.metrics_labels.to_labels())
                    .increment(delivered);
            }
            EventPayload::PhyRxError(rx) if rx.tx_vector.preamble() == PreambleType::HeMu => {
                self.errors += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
