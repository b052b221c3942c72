//! Echo request client.

use crate::{agent_labels, jittered_delay, received_frames, request_tx, AgentReport, AppFrame, AttachedPhy};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};
use wifi_ppdu::{MacAddr, Mpdu, Psdu, SU_STA_ID};
use wifisim_common::{
    metric_defs, Entity, EntityId, Event, EventPayload, MetricLabels, SimContext, SimError, SimTime,
};
use wifisim_phy::RateControl;

const TIMER_PING_SEND: u64 = 1;
const TIMER_PING_STOP: u64 = 2;

/// Echo request header: type, sequence number, send timestamp.
const ECHO_HEADER_SIZE: usize = 11;

/// Ping client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PingConfig {
    /// Address the requests go to.
    pub target: MacAddr,
    /// Number of requests to send; 0 sends until stopped.
    pub count: u32,
    pub interval_s: f64,
    /// Standard deviation of the interval.
    pub interval_jitter_s: f64,
    /// Payload size of each request, in bytes.
    pub size: usize,
    pub start_s: f64,
    /// Replies arriving after this time are not counted.
    pub stop_s: Option<f64>,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            target: MacAddr::BROADCAST,
            count: 0,
            interval_s: 1.0,
            interval_jitter_s: 0.0,
            size: 100,
            start_s: 1.0,
            stop_s: None,
        }
    }
}

impl PingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_s <= 0.0 {
            return Err(format!("interval_s must be positive, got {}", self.interval_s));
        }
        if self.start_s < 0.0 {
            return Err(format!("start_s must not be negative, got {}", self.start_s));
        }
        if let Some(stop) = self.stop_s {
            if stop < self.start_s {
                return Err(format!("stop_s {} is before start_s {}", stop, self.start_s));
            }
        }
        if self.size < ECHO_HEADER_SIZE || self.size > 4000 {
            return Err(format!("size must be within {}..=4000 bytes, got {}", ECHO_HEADER_SIZE, self.size));
        }
        Ok(())
    }
}

/// Sends echo requests to one target and counts the replies.
///
/// A request counts as transmitted as soon as it is handed to the PHY.
/// Only replies that arrive before the stop time count as received.
pub struct PingAgent {
    id: EntityId,
    attached: AttachedPhy,
    config: PingConfig,
    rate: Box<dyn RateControl>,
    next_seq: u16,
    outstanding: BTreeMap<u16, SimTime>,
    stopped: bool,
    transmitted: u64,
    received: u64,
    rejected: u64,
    duplicates: u64,
    rtts: Vec<SimTime>,
    metrics_labels: MetricLabels,
}

impl PingAgent {
    pub fn new(id: EntityId, attached: AttachedPhy, config: PingConfig, rate: Box<dyn RateControl>) -> Self {
        let metrics_labels = agent_labels(&attached, "ping");
        PingAgent {
            id,
            attached,
            config,
            rate,
            next_seq: 0,
            outstanding: BTreeMap::new(),
            stopped: false,
            transmitted: 0,
            received: 0,
            rejected: 0,
            duplicates: 0,
            rtts: Vec::new(),
            metrics_labels,
        }
    }

    /// Start timer, plus the stop timer if one is configured.
    pub fn initial_timers(&self) -> Vec<(SimTime, u64)> {
        let mut timers = vec![(SimTime::from_secs(self.config.start_s), TIMER_PING_SEND)];
        if let Some(stop) = self.config.stop_s {
            timers.push((SimTime::from_secs(stop), TIMER_PING_STOP));
        }
        timers
    }

    pub fn config(&self) -> &PingConfig {
        &self.config
    }

    pub fn transmitted(&self) -> u64 {
        self.transmitted
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Requests the PHY refused to send.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Round-trip times of the counted replies, in arrival order.
    pub fn rtts(&self) -> &[SimTime] {
        &self.rtts
    }

    /// Fraction of transmitted requests that got no counted reply.
    pub fn loss(&self) -> f64 {
        if self.transmitted == 0 {
            return 0.0;
        }
        1.0 - self.received as f64 / self.transmitted as f64
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            node: self.attached.node.clone(),
            kind: "ping",
            counters: BTreeMap::from([
                ("transmitted", self.transmitted),
                ("received", self.received),
                ("rejected", self.rejected),
                ("duplicates", self.duplicates),
            ]),
        }
    }

    fn done_sending(&self) -> bool {
        self.stopped || (self.config.count > 0 && self.transmitted >= u64::from(self.config.count))
    }

    fn send_request(&mut self, ctx: &mut SimContext) {
        if self.done_sending() {
            return;
        }
        let now = ctx.time();
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let payload = AppFrame::EchoRequest { seq, sent_at: now }.encode(self.config.size);
        let mpdu = Mpdu::new(self.config.target, self.attached.address, seq, payload);
        let txv = self.rate.data_tx_vector(self.config.target, mpdu.size());
        let psdus = BTreeMap::from([(SU_STA_ID, Psdu::single(mpdu))]);
        request_tx(ctx, self.attached.phy, psdus, txv, None, false);

        self.outstanding.insert(seq, now);
        self.transmitted += 1;
        metrics::counter!(metric_defs::PING_TX.name, &self.metrics_labels.to_labels()).increment(1);
        debug!(
            "Ping[{}]: request seq={} to {} ({} bytes)",
            self.attached.node, seq, self.config.target, self.config.size
        );

        if !self.done_sending() {
            let delay = jittered_delay(ctx.rng(), self.config.interval_s, self.config.interval_jitter_s);
            ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_PING_SEND });
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!(
            "Ping[{}]: stopped, {} transmitted, {} received, {:.1}% loss",
            self.attached.node,
            self.transmitted,
            self.received,
            self.loss() * 100.0
        );
    }

    fn handle_reply(&mut self, from: MacAddr, seq: u16, sent_at: SimTime, snr_db: f64, ctx: &mut SimContext) {
        if self.stopped {
            trace!("Ping[{}]: late reply seq={} ignored", self.attached.node, seq);
            return;
        }
        if self.outstanding.remove(&seq).is_none() {
            self.duplicates += 1;
            debug!("Ping[{}]: unexpected reply seq={} from {}", self.attached.node, seq, from);
            return;
        }
        let rtt = ctx.time() - sent_at;
        self.received += 1;
        self.rtts.push(rtt);
        self.rate.report_data_ok(from, snr_db);
        let labels = self.metrics_labels.to_labels();
        metrics::counter!(metric_defs::PING_RX.name, &labels).increment(1);
        metrics::histogram!(metric_defs::PING_RTT.name, &labels).record(rtt.as_micros() as f64);
        debug!(
            "Ping[{}]: reply seq={} from {} rtt={}us",
            self.attached.node,
            seq,
            from,
            rtt.as_micros()
        );
    }
}

impl Entity for PingAgent {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_PING_SEND => self.send_request(ctx),
                TIMER_PING_STOP => self.stop(),
                other => trace!("Ping[{}]: unknown timer {}", self.attached.node, other),
            },
            EventPayload::PhyRxOk(rx) => {
                let replies: Vec<_> = received_frames(rx, self.attached.address)
                    .into_iter()
                    .filter_map(|(from, frame)| match frame {
                        AppFrame::EchoReply { seq, sent_at } => Some((from, seq, sent_at)),
                        _ => None,
                    })
                    .collect();
                for (from, seq, sent_at) in replies {
                    self.handle_reply(from, seq, sent_at, rx.snr_db, ctx);
                }
            }
            EventPayload::PhyTxRejected(rejected) => {
                self.rejected += 1;
                self.rate.report_data_failed(self.config.target);
                debug!("Ping[{}]: PHY refused request while {}", self.attached.node, rejected.state);
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
