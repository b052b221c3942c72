//! Agents exchanging traffic over real PHYs.

mod common;

use common::{address, constant_rate, Sim};
use wifi_ppdu::{Band, RuType};
use wifisim_agents::{
    create_agent, AgentConfig, AgentError, AttachedPhy, DlMuAgent, DlMuConfig, DlMuSink, DlMuUserConfig, EchoAgent,
    EchoConfig, PingAgent, PingConfig, TbResponder, TriggerAgent, TriggerConfig, TriggerUserConfig,
};
use wifisim_common::{EntityId, SimTime};

fn ping(count: u32, start_s: f64, stop_s: Option<f64>) -> AgentConfig {
    AgentConfig::Ping(PingConfig {
        target: address(2),
        count,
        interval_s: 0.01,
        size: 200,
        start_s,
        stop_s,
        ..Default::default()
    })
}

fn ping_pair(config: AgentConfig) -> Sim {
    let mut sim = Sim::new(7);
    sim.add_sta(1, config);
    sim.add_sta(2, AgentConfig::Echo(EchoConfig::default()));
    sim.link(1, 2, 80.0);
    sim
}

#[test]
fn test_ping_echo_exchange() {
    let mut sim = ping_pair(ping(3, 0.001, None));
    sim.run_until(SimTime::from_millis(100)).unwrap();

    let pinger = sim.agent::<PingAgent>(1);
    assert_eq!(pinger.transmitted(), 3);
    assert_eq!(pinger.received(), 3);
    assert_eq!(pinger.loss(), 0.0);
    for rtt in pinger.rtts() {
        assert!(*rtt > SimTime::from_micros(16), "rtt {:?}", rtt);
        assert!(*rtt < SimTime::from_millis(1), "rtt {:?}", rtt);
    }

    let echo = sim.agent::<EchoAgent>(2);
    assert_eq!(echo.requests(), 3);
    assert_eq!(echo.replies(), 3);
    assert_eq!(sim.phy(1).stats().tx_ppdus, 3);
    assert_eq!(sim.phy(2).stats().tx_ppdus, 3);
}

#[test]
fn test_ping_count_limit() {
    let mut sim = ping_pair(ping(2, 0.001, None));
    sim.run_until(SimTime::from_millis(200)).unwrap();

    let pinger = sim.agent::<PingAgent>(1);
    assert_eq!(pinger.transmitted(), 2);
    assert_eq!(pinger.received(), 2);
    assert!(!pinger.is_stopped());
}

#[test]
fn test_ping_stop_with_request_in_flight() {
    // The request is still on air when the stop timer fires.
    let mut sim = ping_pair(ping(0, 1.0, Some(1.0001)));
    sim.run_until(SimTime::from_millis(1100)).unwrap();

    let pinger = sim.agent::<PingAgent>(1);
    assert!(pinger.is_stopped());
    assert_eq!(pinger.transmitted(), 1);
    assert_eq!(pinger.received(), 0);
    assert_eq!(pinger.loss(), 1.0);
    assert_eq!(sim.agent::<EchoAgent>(2).replies(), 1);
}

#[test]
fn test_ping_unreachable_target() {
    let mut sim = Sim::new(7);
    sim.add_sta(1, ping(2, 0.001, None));
    sim.add_sta(2, AgentConfig::Echo(EchoConfig::default()));
    sim.link(1, 2, 120.0);
    sim.run_until(SimTime::from_millis(100)).unwrap();

    let pinger = sim.agent::<PingAgent>(1);
    assert_eq!(pinger.transmitted(), 2);
    assert_eq!(pinger.received(), 0);
    assert_eq!(sim.agent::<EchoAgent>(2).requests(), 0);
}

fn trigger_user(sta_id: u16, ru_index: u8, mcs: u8) -> TriggerUserConfig {
    TriggerUserConfig {
        sta_id,
        ru: RuType::Ru106,
        ru_index,
        mcs,
    }
}

#[test]
fn test_trigger_round_trip() {
    let mut sim = Sim::new(3);
    sim.add_node(
        1,
        65535,
        true,
        AgentConfig::Trigger(TriggerConfig {
            start_s: 0.001,
            interval_s: 0.005,
            count: 3,
            tb_size: 300,
            users: vec![trigger_user(1, 1, 0), trigger_user(2, 2, 4)],
            ..Default::default()
        }),
    );
    sim.add_node(2, 1, false, AgentConfig::TbResponder);
    sim.add_node(3, 2, false, AgentConfig::TbResponder);
    sim.link(1, 2, 80.0);
    sim.link(1, 3, 80.0);
    sim.link(2, 3, 80.0);
    sim.run_until(SimTime::from_millis(50)).unwrap();

    let ap = sim.agent::<TriggerAgent>(1);
    assert_eq!(ap.triggers_sent(), 3);
    assert_eq!(ap.tb_received_from(1), 3);
    assert_eq!(ap.tb_received_from(2), 3);
    assert_eq!(ap.tb_received(), 6);
    assert_eq!(sim.agent::<TbResponder>(2).responses(), 3);
    assert_eq!(sim.agent::<TbResponder>(3).responses(), 3);
}

#[test]
fn test_trigger_for_other_station_ignored() {
    let mut sim = Sim::new(3);
    sim.add_node(
        1,
        65535,
        true,
        AgentConfig::Trigger(TriggerConfig {
            start_s: 0.001,
            count: 1,
            users: vec![trigger_user(1, 1, 0)],
            ..Default::default()
        }),
    );
    sim.add_node(2, 1, false, AgentConfig::TbResponder);
    sim.add_node(3, 9, false, AgentConfig::TbResponder);
    sim.link(1, 2, 80.0);
    sim.link(1, 3, 80.0);
    sim.run_until(SimTime::from_millis(20)).unwrap();

    assert_eq!(sim.agent::<TriggerAgent>(1).tb_received(), 1);
    assert_eq!(sim.agent::<TbResponder>(3).responses(), 0);
}

#[test]
fn test_dl_mu_delivery() {
    let mut sim = Sim::new(5);
    let user = |sta_id: u16, node: u64, ru_index: u8| DlMuUserConfig {
        sta_id,
        address: address(node),
        ru: RuType::Ru106,
        ru_index,
        mcs: 2,
    };
    sim.add_node(
        1,
        65535,
        true,
        AgentConfig::DlMu(DlMuConfig {
            start_s: 0.001,
            interval_s: 0.002,
            count: 4,
            size: 400,
            users: vec![user(1, 2, 1), user(2, 3, 2)],
            ..Default::default()
        }),
    );
    sim.add_node(2, 1, false, AgentConfig::DlMuSink);
    sim.add_node(3, 2, false, AgentConfig::DlMuSink);
    sim.link(1, 2, 80.0);
    sim.link(1, 3, 85.0);
    sim.run_until(SimTime::from_millis(50)).unwrap();

    assert_eq!(sim.agent::<DlMuAgent>(1).sent(), 4);
    assert_eq!(sim.agent::<DlMuSink>(2).received(), 4);
    assert_eq!(sim.agent::<DlMuSink>(3).received(), 4);
}

#[test]
fn test_create_agent_rejects_invalid_config() {
    let attached = AttachedPhy {
        node: "ap".to_string(),
        phy: EntityId(1),
        address: address(1),
        sta_id: 65535,
        bss_color: 0,
        band: Band::Ghz5,
    };
    let config = AgentConfig::Trigger(TriggerConfig::default());
    let err = create_agent(EntityId(2), attached, &config, Box::new(constant_rate(0)))
        .err()
        .unwrap();
    assert!(matches!(err, AgentError::InvalidConfig { agent: "trigger", .. }));
    assert!(err.to_string().contains("node 'ap'"));
}
