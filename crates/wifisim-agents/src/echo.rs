//! Echo responder.

use crate::{agent_labels, received_frames, request_tx, AgentReport, AppFrame, AttachedPhy, SIFS};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};
use wifi_ppdu::{MacAddr, Mpdu, Psdu, SU_STA_ID};
use wifisim_common::{
    metric_defs, Entity, EntityId, Event, EventPayload, MetricLabels, SimContext, SimError, SimTime,
};
use wifisim_phy::RateControl;

const TIMER_ECHO_REPLY: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EchoConfig {
    /// Delay between the end of a request and the reply.
    pub reply_delay_us: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        EchoConfig {
            reply_delay_us: SIFS.as_micros(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingReply {
    to: MacAddr,
    seq: u16,
    sent_at: SimTime,
    size: usize,
}

/// Answers every echo request addressed to its node.
pub struct EchoAgent {
    id: EntityId,
    attached: AttachedPhy,
    config: EchoConfig,
    rate: Box<dyn RateControl>,
    pending: VecDeque<PendingReply>,
    requests: u64,
    replies: u64,
    rejected: u64,
    metrics_labels: MetricLabels,
}

impl EchoAgent {
    pub fn new(id: EntityId, attached: AttachedPhy, config: EchoConfig, rate: Box<dyn RateControl>) -> Self {
        let metrics_labels = agent_labels(&attached, "echo");
        EchoAgent {
            id,
            attached,
            config,
            rate,
            pending: VecDeque::new(),
            requests: 0,
            replies: 0,
            rejected: 0,
            metrics_labels,
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            node: self.attached.node.clone(),
            kind: "echo",
            counters: BTreeMap::from([
                ("requests", self.requests),
                ("replies", self.replies),
                ("rejected", self.rejected),
            ]),
        }
    }

    fn send_reply(&mut self, ctx: &mut SimContext) {
        let Some(reply) = self.pending.pop_front() else {
            return;
        };
        let payload = AppFrame::EchoReply {
            seq: reply.seq,
            sent_at: reply.sent_at,
        }
        .encode(reply.size);
        let mpdu = Mpdu::new(reply.to, self.attached.address, reply.seq, payload);
        let txv = self.rate.data_tx_vector(reply.to, mpdu.size());
        request_tx(
            ctx,
            self.attached.phy,
            BTreeMap::from([(SU_STA_ID, Psdu::single(mpdu))]),
            txv,
            None,
            false,
        );
        self.replies += 1;
        metrics::counter!(metric_defs::ECHO_REPLIES.name, &self.metrics_labels.to_labels()).increment(1);
        debug!("Echo[{}]: reply seq={} to {}", self.attached.node, reply.seq, reply.to);
    }
}

impl Entity for EchoAgent {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::PhyRxOk(rx) => {
                for (from, frame) in received_frames(rx, self.attached.address) {
                    let AppFrame::EchoRequest { seq, sent_at } = frame else {
                        trace!("Echo[{}]: ignoring frame 0x{:02x} from {}", self.attached.node, frame.kind(), from);
                        continue;
                    };
                    let size = rx
                        .psdu
                        .mpdus()
                        .iter()
                        .find(|m| m.addr2 == from && m.sequence == seq)
                        .map_or(0, |m| m.payload.len());
                    self.requests += 1;
                    self.pending.push_back(PendingReply {
                        to: from,
                        seq,
                        sent_at,
                        size,
                    });
                    ctx.post_event(
                        SimTime::from_micros(self.config.reply_delay_us),
                        vec![self.id],
                        EventPayload::Timer {
                            timer_id: TIMER_ECHO_REPLY,
                        },
                    );
                }
            }
            EventPayload::Timer {
                timer_id: TIMER_ECHO_REPLY,
            } => self.send_reply(ctx),
            EventPayload::PhyTxRejected(rejected) => {
                self.rejected += 1;
                debug!("Echo[{}]: PHY refused reply while {}", self.attached.node, rejected.state);
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
