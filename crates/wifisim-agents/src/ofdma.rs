//! UL OFDMA: the AP solicits HE TB PPDUs with a trigger frame and the
//! allocated stations answer together a SIFS after it.
//!
//! The trigger announces the L-SIG length every responder must use, so all
//! HE TB PPDUs of one round end at the same instant and the AP PHY can merge
//! them into a single reception.

use crate::{agent_labels, received_frames, request_tx, AgentReport, AppFrame, AttachedPhy, TriggerUser, SIFS};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use wifi_ppdu::{
    phy_entity, HeMuUserInfo, MacAddr, ModulationClass, Mpdu, PreambleType, Psdu, RuSpec, RuType, StaId, TxVector,
    WifiMode, SU_STA_ID,
};
use wifisim_common::{
    metric_defs, Entity, EntityId, Event, EventPayload, MetricLabels, SimContext, SimError, SimTime,
};
use wifisim_phy::RateControl;

const TIMER_TRIGGER_SEND: u64 = 1;
const TIMER_TRIGGER_STOP: u64 = 2;
const TIMER_TB_RESPONSE: u64 = 1;

// ============================================================================
// Configuration
// ============================================================================

/// One station solicited by every trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerUserConfig {
    pub sta_id: StaId,
    pub ru: RuType,
    /// 1-based RU index within the channel.
    pub ru_index: u8,
    #[serde(default)]
    pub mcs: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerConfig {
    pub start_s: f64,
    pub interval_s: f64,
    /// Number of triggers; 0 sends until stopped.
    pub count: u32,
    pub stop_s: Option<f64>,
    pub channel_width_mhz: u16,
    /// Payload bytes each station sends in its HE TB PPDU.
    pub tb_size: u16,
    pub users: Vec<TriggerUserConfig>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            start_s: 0.1,
            interval_s: 0.01,
            count: 0,
            stop_s: None,
            channel_width_mhz: 20,
            tb_size: 200,
            users: Vec::new(),
        }
    }
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_s <= 0.0 {
            return Err(format!("interval_s must be positive, got {}", self.interval_s));
        }
        if self.users.is_empty() {
            return Err("no users to trigger".to_string());
        }
        let width = self.channel_width_mhz;
        let mut sta_ids = BTreeSet::new();
        let mut rus: Vec<RuSpec> = Vec::new();
        for user in &self.users {
            if !sta_ids.insert(user.sta_id) {
                return Err(format!("station {} triggered twice", user.sta_id));
            }
            let ru = RuSpec::new(user.ru, usize::from(user.ru_index));
            if !ru.is_valid(width) {
                return Err(format!("{} RU #{} does not fit a {} MHz channel", user.ru, user.ru_index, width));
            }
            if let Some(other) = rus.iter().find(|r| r.overlaps(&ru, width)) {
                return Err(format!("{} RU #{} overlaps {} RU #{}", user.ru, user.ru_index, other.ru_type, other.index));
            }
            if WifiMode::he(user.mcs).is_none() {
                return Err(format!("invalid HE MCS {} for station {}", user.mcs, user.sta_id));
            }
            rus.push(ru);
        }
        Ok(())
    }

    fn trigger_users(&self) -> Vec<TriggerUser> {
        self.users
            .iter()
            .map(|u| TriggerUser {
                sta_id: u.sta_id,
                ru_type: u.ru,
                ru_index: u.ru_index,
                mcs: u.mcs,
            })
            .collect()
    }
}

/// HE TB TXVECTOR of one solicited station.
fn tb_tx_vector(user: &TriggerUser, channel_width: u16, bss_color: u8) -> Option<TxVector> {
    let mode = WifiMode::he(user.mcs)?;
    let ru = RuSpec::new(user.ru_type, usize::from(user.ru_index));
    Some(
        TxVector::new(mode, PreambleType::HeTb, channel_width)
            .with_bss_color(bss_color)
            .with_user(user.sta_id, HeMuUserInfo::new(ru, user.mcs, 1)),
    )
}

fn tb_psdu(to: MacAddr, from: MacAddr, seq: u16, size: u16) -> Psdu {
    Psdu::single(Mpdu::new(to, from, seq, AppFrame::TbData { seq }.encode(usize::from(size))))
}

// ============================================================================
// Trigger agent (AP)
// ============================================================================

/// Periodically solicits HE TB PPDUs from a fixed set of stations.
pub struct TriggerAgent {
    id: EntityId,
    attached: AttachedPhy,
    config: TriggerConfig,
    rate: Box<dyn RateControl>,
    users: Vec<TriggerUser>,
    seq: u16,
    stopped: bool,
    triggers_sent: u64,
    tb_received: BTreeMap<StaId, u64>,
    tb_errors: u64,
    rejected: u64,
    metrics_labels: MetricLabels,
}

impl TriggerAgent {
    pub fn new(id: EntityId, attached: AttachedPhy, config: TriggerConfig, rate: Box<dyn RateControl>) -> Self {
        let metrics_labels = agent_labels(&attached, "trigger");
        let users = config.trigger_users();
        TriggerAgent {
            id,
            attached,
            config,
            rate,
            users,
            seq: 0,
            stopped: false,
            triggers_sent: 0,
            tb_received: BTreeMap::new(),
            tb_errors: 0,
            rejected: 0,
            metrics_labels,
        }
    }

    pub fn initial_timers(&self) -> Vec<(SimTime, u64)> {
        let mut timers = vec![(SimTime::from_secs(self.config.start_s), TIMER_TRIGGER_SEND)];
        if let Some(stop) = self.config.stop_s {
            timers.push((SimTime::from_secs(stop), TIMER_TRIGGER_STOP));
        }
        timers
    }

    pub fn triggers_sent(&self) -> u64 {
        self.triggers_sent
    }

    /// HE TB PSDUs received from `sta_id`.
    pub fn tb_received_from(&self, sta_id: StaId) -> u64 {
        self.tb_received.get(&sta_id).copied().unwrap_or(0)
    }

    pub fn tb_received(&self) -> u64 {
        self.tb_received.values().sum()
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            node: self.attached.node.clone(),
            kind: "trigger",
            counters: BTreeMap::from([
                ("triggers_sent", self.triggers_sent),
                ("tb_received", self.tb_received()),
                ("tb_errors", self.tb_errors),
                ("rejected", self.rejected),
            ]),
        }
    }

    /// L-SIG length fitting the longest HE TB PPDU among the users.
    fn ul_length(&self) -> Option<u16> {
        let he = phy_entity(ModulationClass::He);
        let width = self.config.channel_width_mhz;
        let size = tb_psdu(MacAddr::BROADCAST, MacAddr::BROADCAST, 0, self.config.tb_size).size();
        let mut longest: Option<(Duration, TxVector)> = None;
        for user in &self.users {
            let txv = tb_tx_vector(user, width, self.attached.bss_color)?;
            let sizes = BTreeMap::from([(user.sta_id, size)]);
            let duration = he.ppdu_duration(&sizes, &txv, self.attached.band);
            if longest.as_ref().map_or(true, |(d, _)| duration > *d) {
                longest = Some((duration, txv));
            }
        }
        let (duration, txv) = longest?;
        he.duration_to_lsig_length(duration, &txv, self.attached.band).ok()
    }

    fn send_trigger(&mut self, ctx: &mut SimContext) {
        if self.stopped || (self.config.count > 0 && self.triggers_sent >= u64::from(self.config.count)) {
            return;
        }
        let Some(ul_length) = self.ul_length() else {
            warn!("Trigger[{}]: cannot size the HE TB PPDUs, giving up", self.attached.node);
            self.stopped = true;
            return;
        };
        let frame = AppFrame::Trigger {
            ul_length,
            channel_width: self.config.channel_width_mhz,
            tb_size: self.config.tb_size,
            users: self.users.clone(),
        };
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let mpdu = Mpdu::new(MacAddr::BROADCAST, self.attached.address, seq, frame.encode(0));
        let txv = self.rate.rts_tx_vector(MacAddr::BROADCAST);
        request_tx(
            ctx,
            self.attached.phy,
            BTreeMap::from([(SU_STA_ID, Psdu::single(mpdu))]),
            txv,
            None,
            true,
        );
        self.triggers_sent += 1;
        metrics::counter!(metric_defs::TRIGGER_SENT.name, &self.metrics_labels.to_labels()).increment(1);
        debug!(
            "Trigger[{}]: trigger seq={} for {} stations, ul_length={}",
            self.attached.node,
            seq,
            self.users.len(),
            ul_length
        );

        if self.config.count == 0 || self.triggers_sent < u64::from(self.config.count) {
            ctx.post_event(
                SimTime::from_secs(self.config.interval_s),
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_TRIGGER_SEND,
                },
            );
        }
    }
}

impl Entity for TriggerAgent {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_TRIGGER_SEND => self.send_trigger(ctx),
                TIMER_TRIGGER_STOP => {
                    self.stopped = true;
                    info!(
                        "Trigger[{}]: stopped after {} triggers, {} HE TB PSDUs received",
                        self.attached.node,
                        self.triggers_sent,
                        self.tb_received()
                    );
                }
                other => trace!("Trigger[{}]: unknown timer {}", self.attached.node, other),
            },
            EventPayload::PhyRxOk(rx) if rx.tx_vector.preamble() == PreambleType::HeTb => {
                let data = received_frames(rx, self.attached.address)
                    .into_iter()
                    .filter(|(_, frame)| matches!(frame, AppFrame::TbData { .. }))
                    .count() as u64;
                if data > 0 {
                    *self.tb_received.entry(rx.sta_id).or_insert(0) += data;
                    metrics::counter!(metric_defs::TB_RECEIVED.name, &self.metrics_labels.to_labels())
                        .increment(data);
                    debug!("Trigger[{}]: HE TB PSDU from station {}", self.attached.node, rx.sta_id);
                }
            }
            EventPayload::PhyRxError(rx) if rx.tx_vector.preamble() == PreambleType::HeTb => {
                self.tb_errors += 1;
                debug!("Trigger[{}]: HE TB PSDU from station {} in error", self.attached.node, rx.sta_id);
            }
            EventPayload::PhyTxRejected(rejected) => {
                self.rejected += 1;
                debug!("Trigger[{}]: PHY refused trigger while {}", self.attached.node, rejected.state);
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
// TB responder (STA)
// ============================================================================

#[derive(Debug, Clone)]
struct PendingResponse {
    uid: u64,
    psdus: BTreeMap<StaId, Psdu>,
    tx_vector: TxVector,
}

/// Answers triggers that allocate an RU to its station.
pub struct TbResponder {
    id: EntityId,
    attached: AttachedPhy,
    pending: Option<PendingResponse>,
    seq: u16,
    triggers: u64,
    responses: u64,
    rejected: u64,
    metrics_labels: MetricLabels,
}

impl TbResponder {
    pub fn new(id: EntityId, attached: AttachedPhy) -> Self {
        let metrics_labels = agent_labels(&attached, "tb_responder");
        TbResponder {
            id,
            attached,
            pending: None,
            seq: 0,
            triggers: 0,
            responses: 0,
            rejected: 0,
            metrics_labels,
        }
    }

    pub fn responses(&self) -> u64 {
        self.responses
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            node: self.attached.node.clone(),
            kind: "tb_responder",
            counters: BTreeMap::from([
                ("triggers", self.triggers),
                ("responses", self.responses),
                ("rejected", self.rejected),
            ]),
        }
    }

    fn on_trigger(
        &mut self,
        ap: MacAddr,
        uid: u64,
        ul_length: u16,
        channel_width: u16,
        tb_size: u16,
        users: &[TriggerUser],
        ctx: &mut SimContext,
    ) {
        let Some(user) = users.iter().find(|u| u.sta_id == self.attached.sta_id) else {
            trace!("Trigger from {} does not allocate station {}", ap, self.attached.sta_id);
            return;
        };
        self.triggers += 1;
        let Some(tx_vector) = tb_tx_vector(user, channel_width, self.attached.bss_color) else {
            warn!("TbResponder[{}]: trigger with invalid HE MCS {}", self.attached.node, user.mcs);
            return;
        };
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let psdus = BTreeMap::from([(user.sta_id, tb_psdu(ap, self.attached.address, seq, tb_size))]);
        self.pending = Some(PendingResponse {
            uid,
            psdus,
            tx_vector: tx_vector.with_length(ul_length),
        });
        ctx.post_event(
            SIFS,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_TB_RESPONSE,
            },
        );
    }

    fn respond(&mut self, ctx: &mut SimContext) {
        let Some(response) = self.pending.take() else {
            return;
        };
        request_tx(
            ctx,
            self.attached.phy,
            response.psdus,
            response.tx_vector,
            Some(response.uid),
            false,
        );
        self.responses += 1;
        metrics::counter!(metric_defs::TB_RESPONSES.name, &self.metrics_labels.to_labels()).increment(1);
        debug!("TbResponder[{}]: HE TB response to trigger uid={}", self.attached.node, response.uid);
    }
}

impl Entity for TbResponder {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::PhyRxOk(rx) => {
                for (from, frame) in received_frames(rx, self.attached.address) {
                    if let AppFrame::Trigger {
                        ul_length,
                        channel_width,
                        tb_size,
                        users,
                    } = frame
                    {
                        self.on_trigger(from, rx.ppdu_uid, ul_length, channel_width, tb_size, &users, ctx);
                    }
                }
            }
            EventPayload::Timer {
                timer_id: TIMER_TB_RESPONSE,
            } => self.respond(ctx),
            EventPayload::PhyTxRejected(rejected) => {
                self.rejected += 1;
                debug!("TbResponder[{}]: PHY refused response while {}", self.attached.node, rejected.state);
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
