//! Nodes made of a PHY and one agent, sharing a medium.

#![allow(dead_code)]

use wifi_ppdu::{Band, MacAddr, PreambleType, StaId, TxVector, WifiMode, SU_STA_ID};
use wifisim_agents::{create_agent, AgentConfig, AttachedPhy};
use wifisim_common::{
    Entity, EntityId, EntityRegistry, Event, EventId, EventPayload, EventQueue, MetricLabels, SimContext, SimError,
    SimTime,
};
use wifisim_phy::{ConstantRate, LinkModel, LinkParams, Medium, WifiPhy, WifiPhyConfig};

pub const MEDIUM: EntityId = EntityId(0);

pub fn address(n: u64) -> MacAddr {
    MacAddr::new([2, 0, 0, 0, 0, n as u8])
}

pub fn constant_rate(mcs: u8) -> ConstantRate {
    ConstantRate::new(
        TxVector::new(WifiMode::he(mcs).unwrap(), PreambleType::HeSu, 20),
        TxVector::new(WifiMode::ofdm_rate(6).unwrap(), PreambleType::NonHt, 20),
    )
}

pub struct Sim {
    registry: EntityRegistry,
    queue: EventQueue,
    ctx: SimContext,
}

impl Sim {
    pub fn new(seed: u64) -> Self {
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(Medium::new(MEDIUM, LinkModel::new())));
        Self {
            registry,
            queue: EventQueue::new(),
            ctx: SimContext::new(seed),
        }
    }

    /// Adds node `n`: PHY `n` driven by agent `100 + n`.
    pub fn add_node(&mut self, n: u64, sta_id: StaId, is_ap: bool, agent: AgentConfig) {
        let config = WifiPhyConfig {
            sta_id,
            is_ap,
            ..WifiPhyConfig::default()
        };
        let labels = MetricLabels::new(format!("node{n}"), "phy");
        let mut phy = WifiPhy::new(EntityId(n), config, MEDIUM, labels).unwrap();
        let agent_id = EntityId(100 + n);
        phy.add_listener(agent_id);
        self.registry.register(Box::new(phy));

        let attached = AttachedPhy {
            node: format!("node{n}"),
            phy: EntityId(n),
            address: address(n),
            sta_id,
            bss_color: 0,
            band: Band::Ghz5,
        };
        let built = create_agent(agent_id, attached, &agent, Box::new(constant_rate(0))).unwrap();
        for (time, timer_id) in built.timers {
            let id = EventId(self.ctx.next_event_id());
            self.queue.push(Event {
                id,
                time,
                source: agent_id,
                targets: vec![agent_id],
                payload: EventPayload::Timer { timer_id },
            });
        }
        self.registry.register(built.entity);
    }

    pub fn add_sta(&mut self, n: u64, agent: AgentConfig) {
        self.add_node(n, SU_STA_ID, false, agent);
    }

    /// Symmetric link between two nodes.
    pub fn link(&mut self, a: u64, b: u64, path_loss_db: f64) {
        let links = self.registry.get_as_mut::<Medium>(MEDIUM).unwrap().link_model_mut();
        links.add_link(EntityId(a), EntityId(b), LinkParams::new(path_loss_db));
        links.add_link(EntityId(b), EntityId(a), LinkParams::new(path_loss_db));
    }

    pub fn run_until(&mut self, end: SimTime) -> Result<u64, SimError> {
        self.queue.run_until(&mut self.registry, &mut self.ctx, end)
    }

    pub fn agent<T: Entity + 'static>(&self, n: u64) -> &T {
        self.registry.get_as::<T>(EntityId(100 + n)).unwrap()
    }

    pub fn phy(&self, n: u64) -> &WifiPhy {
        self.registry.get_as::<WifiPhy>(EntityId(n)).unwrap()
    }
}
