//! Small simulation harness shared by the PHY scenario tests.

#![allow(dead_code)]

use std::any::Any;
use std::collections::BTreeMap;
use wifi_ppdu::{MacAddr, Mpdu, PreambleType, Psdu, StaId, TxVector, WifiMode, SU_STA_ID};
use wifisim_common::{
    DropReason, Entity, EntityId, EntityRegistry, Event, EventId, EventPayload, EventQueue, MetricLabels, PhyCommand,
    PhyRxPsduEvent, PhyStateChangedEvent, PhyTxRequestEvent, SimContext, SimError, SimTime,
};
use wifisim_phy::{LinkModel, LinkParams, Medium, WifiPhy, WifiPhyConfig};

pub const MEDIUM: EntityId = EntityId(0);

/// Records everything a PHY reports.
pub struct Listener {
    id: EntityId,
    pub events: Vec<(SimTime, EventPayload)>,
}

impl Listener {
    pub fn rx_ok(&self) -> Vec<&PhyRxPsduEvent> {
        self.events
            .iter()
            .filter_map(|(_, e)| match e {
                EventPayload::PhyRxOk(rx) => Some(rx),
                _ => None,
            })
            .collect()
    }

    pub fn rx_error(&self) -> Vec<&PhyRxPsduEvent> {
        self.events
            .iter()
            .filter_map(|(_, e)| match e {
                EventPayload::PhyRxError(rx) => Some(rx),
                _ => None,
            })
            .collect()
    }

    pub fn drops(&self) -> Vec<DropReason> {
        self.events
            .iter()
            .filter_map(|(_, e)| match e {
                EventPayload::PhyRxDrop(drop) => Some(drop.reason),
                _ => None,
            })
            .collect()
    }

    pub fn state_changes(&self) -> Vec<&PhyStateChangedEvent> {
        self.events
            .iter()
            .filter_map(|(_, e)| match e {
                EventPayload::PhyStateChanged(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    pub fn tx_rejections(&self) -> usize {
        self.events
            .iter()
            .filter(|(_, e)| matches!(e, EventPayload::PhyTxRejected(_)))
            .count()
    }
}

impl Entity for Listener {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
        self.events.push((event.time, event.payload.clone()));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Harness {
    registry: EntityRegistry,
    queue: EventQueue,
    pub ctx: SimContext,
}

impl Harness {
    pub fn new(seed: u64) -> Self {
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(Medium::new(MEDIUM, LinkModel::new())));
        Self {
            registry,
            queue: EventQueue::new(),
            ctx: SimContext::new(seed),
        }
    }

    /// Adds PHY `n` with its listener `100 + n`.
    pub fn add_phy(&mut self, n: u64, config: WifiPhyConfig) {
        let mut phy = WifiPhy::new(EntityId(n), config, MEDIUM, MetricLabels::new(format!("node{n}"), "test")).unwrap();
        phy.add_listener(EntityId(100 + n));
        self.registry.register(Box::new(phy));
        self.registry.register(Box::new(Listener {
            id: EntityId(100 + n),
            events: Vec::new(),
        }));
    }

    pub fn link(&mut self, from: u64, to: u64, path_loss_db: f64) {
        self.registry
            .get_as_mut::<Medium>(MEDIUM)
            .unwrap()
            .link_model_mut()
            .add_link(EntityId(from), EntityId(to), LinkParams::new(path_loss_db));
    }

    fn inject(&mut self, at_us: u64, source: EntityId, target: EntityId, payload: EventPayload) {
        let id = EventId(self.ctx.next_event_id());
        self.queue.push(Event {
            id,
            time: SimTime::from_micros(at_us),
            source,
            targets: vec![target],
            payload,
        });
    }

    pub fn send(&mut self, at_us: u64, from: u64, psdus: BTreeMap<StaId, Psdu>, tx_vector: TxVector) {
        self.send_with(at_us, from, psdus, tx_vector, None, false);
    }

    pub fn send_with(
        &mut self,
        at_us: u64,
        from: u64,
        psdus: BTreeMap<StaId, Psdu>,
        tx_vector: TxVector,
        uid: Option<u64>,
        solicits_tb: bool,
    ) {
        let payload = EventPayload::PhyTxRequest(PhyTxRequestEvent {
            psdus,
            tx_vector,
            uid,
            solicits_tb,
        });
        self.inject(at_us, EntityId(100 + from), EntityId(from), payload);
    }

    pub fn command(&mut self, at_us: u64, phy: u64, command: PhyCommand) {
        self.inject(at_us, EntityId(100 + phy), EntityId(phy), EventPayload::PhyControl(command));
    }

    pub fn run_until_us(&mut self, at_us: u64) -> Result<u64, SimError> {
        self.queue
            .run_until(&mut self.registry, &mut self.ctx, SimTime::from_micros(at_us))
    }

    pub fn phy(&self, n: u64) -> &WifiPhy {
        self.registry.get_as::<WifiPhy>(EntityId(n)).unwrap()
    }

    pub fn listener(&self, n: u64) -> &Listener {
        self.registry.get_as::<Listener>(EntityId(100 + n)).unwrap()
    }
}

pub fn su_psdu(size: usize) -> BTreeMap<StaId, Psdu> {
    BTreeMap::from([(SU_STA_ID, psdu(size))])
}

pub fn psdu(size: usize) -> Psdu {
    Psdu::single(Mpdu::new(
        MacAddr::new([2, 0, 0, 0, 0, 2]),
        MacAddr::new([2, 0, 0, 0, 0, 1]),
        0,
        vec![0xa5; size],
    ))
}

pub fn he_su(mcs: u8) -> TxVector {
    TxVector::new(WifiMode::he(mcs).unwrap(), PreambleType::HeSu, 20)
}

pub fn sta_config() -> WifiPhyConfig {
    WifiPhyConfig::default()
}

pub fn ap_config() -> WifiPhyConfig {
    WifiPhyConfig {
        is_ap: true,
        ..WifiPhyConfig::default()
    }
}
