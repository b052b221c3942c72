//! PHY state machine: transmission, power management and channel switching.

mod common;

use common::*;
use wifi_ppdu::{PreambleType, TxVector, WifiMode};
use wifisim_common::{DropReason, PhyCommand, PhyState, SimError, SimTime};
use wifisim_phy::WifiPhyConfig;

/// Every reported change starts from the state the previous one ended in,
/// and versions advance by one.
fn assert_state_chain(listener: &Listener) {
    let changes = listener.state_changes();
    let mut state = PhyState::Idle;
    let mut version = 0u32;
    for change in changes {
        assert_eq!(change.previous, state, "broken state chain at {change:?}");
        assert_ne!(change.previous, change.new_state);
        assert_eq!(change.state_version, version + 1);
        state = change.new_state;
        version = change.state_version;
    }
}

fn pair() -> Harness {
    let mut h = Harness::new(2);
    h.add_phy(1, sta_config());
    h.add_phy(2, sta_config());
    h.link(1, 2, 80.0);
    h.link(2, 1, 80.0);
    h
}

// ============================================================================
// Transmission
// ============================================================================

#[test]
fn test_tx_request_rejected_while_transmitting() {
    let mut h = pair();
    h.send(0, 1, su_psdu(500), he_su(0));
    h.send(50, 1, su_psdu(500), he_su(0));
    h.run_until_us(3_000).unwrap();

    assert_eq!(h.listener(1).tx_rejections(), 1);
    let stats = h.phy(1).stats();
    assert_eq!(stats.tx_ppdus, 1);
    assert_eq!(stats.tx_rejected, 1);
    assert_eq!(h.listener(2).rx_ok().len(), 1);
    assert_state_chain(h.listener(1));
}

#[test]
fn test_transmitter_ignores_incoming_ppdu() {
    let mut h = pair();
    h.send(0, 1, su_psdu(500), he_su(0));
    h.send(10, 2, su_psdu(100), he_su(0));
    h.run_until_us(3_000).unwrap();

    assert_eq!(h.listener(1).drops(), vec![DropReason::Txing]);
    // Station 2 was decoding the header of station 1's PPDU when it transmitted.
    assert_eq!(h.listener(2).drops(), vec![DropReason::ReceptionAbortedByTx]);
}

#[test]
fn test_tx_aborts_ongoing_reception() {
    let mut h = pair();
    h.send(0, 1, su_psdu(1000), he_su(0));
    h.send(200, 2, su_psdu(100), he_su(0));

    h.run_until_us(210).unwrap();
    assert_eq!(h.phy(2).state(), PhyState::Tx);
    assert_eq!(h.phy(2).reception_uid(), None);

    h.run_until_us(5_000).unwrap();
    assert_eq!(h.listener(2).drops(), vec![DropReason::ReceptionAbortedByTx]);
    assert!(h.listener(2).rx_ok().is_empty());
    assert_eq!(h.phy(2).stats().stale_timer_fires, 0);
    assert_state_chain(h.listener(2));
}

#[test]
fn test_tx_wider_than_channel_is_an_error() {
    let mut h = pair();
    let txv = TxVector::new(WifiMode::he(0).unwrap(), PreambleType::HeSu, 40);
    h.send(0, 1, su_psdu(100), txv);
    assert!(matches!(h.run_until_us(100), Err(SimError::HandlerError { .. })));
}

// ============================================================================
// Sleep and power
// ============================================================================

#[test]
fn test_sleep_and_power_off_drop_ppdus() {
    let mut h = pair();
    h.command(0, 2, PhyCommand::Sleep);
    h.send(10, 1, su_psdu(100), he_su(0));
    h.command(1_000, 2, PhyCommand::Resume);
    h.command(1_100, 2, PhyCommand::Off);
    h.send(1_200, 1, su_psdu(100), he_su(0));
    h.command(2_000, 2, PhyCommand::On);
    h.send(2_100, 1, su_psdu(100), he_su(0));
    h.run_until_us(4_000).unwrap();

    let sta = h.listener(2);
    assert_eq!(sta.drops(), vec![DropReason::Sleeping, DropReason::PoweredOff]);
    assert_eq!(sta.rx_ok().len(), 1);
    assert_eq!(h.phy(2).state(), PhyState::Idle);
    assert_state_chain(sta);

    let now = SimTime::from_micros(4_000);
    assert_eq!(h.phy(2).time_in_state(PhyState::Sleep, now), SimTime::from_micros(1_000));
    assert_eq!(h.phy(2).time_in_state(PhyState::Off, now), SimTime::from_micros(900));
}

#[test]
fn test_sleep_postponed_during_tx() {
    let mut h = pair();
    h.send(0, 1, su_psdu(500), he_su(0));
    h.command(20, 1, PhyCommand::Sleep);

    h.run_until_us(30).unwrap();
    assert_eq!(h.phy(1).state(), PhyState::Tx);

    h.run_until_us(3_000).unwrap();
    assert_eq!(h.phy(1).state(), PhyState::Sleep);
    let states: Vec<_> = h.listener(1).state_changes().iter().map(|c| c.new_state).collect();
    assert_eq!(states, vec![PhyState::Tx, PhyState::Sleep]);
}

#[test]
fn test_tx_rejected_while_asleep() {
    let mut h = pair();
    h.command(0, 1, PhyCommand::Sleep);
    h.send(10, 1, su_psdu(100), he_su(0));
    h.run_until_us(100).unwrap();

    assert_eq!(h.listener(1).tx_rejections(), 1);
    assert_eq!(h.phy(1).stats().tx_ppdus, 0);
}

#[test]
fn test_power_off_during_tx_cancels_tx_end() {
    let mut h = pair();
    h.send(0, 1, su_psdu(500), he_su(0));
    h.command(30, 1, PhyCommand::Off);
    h.run_until_us(3_000).unwrap();

    assert_eq!(h.phy(1).state(), PhyState::Off);
    let states: Vec<_> = h.listener(1).state_changes().iter().map(|c| c.new_state).collect();
    assert_eq!(states, vec![PhyState::Tx, PhyState::Off]);
}

// ============================================================================
// Channel switching
// ============================================================================

fn switch_to_40() -> PhyCommand {
    PhyCommand::SwitchChannel {
        number: 40,
        frequency_mhz: 0,
        width_mhz: 20,
    }
}

#[test]
fn test_channel_switch() {
    let mut h = Harness::new(4);
    h.add_phy(1, sta_config());
    h.add_phy(
        2,
        WifiPhyConfig {
            channel_number: 40,
            ..sta_config()
        },
    );
    h.link(2, 1, 80.0);

    h.command(0, 1, switch_to_40());
    h.send(100, 2, su_psdu(100), he_su(0));

    h.run_until_us(200).unwrap();
    assert_eq!(h.phy(1).state(), PhyState::Switching);
    assert_eq!(h.phy(1).channel().number(), 40);

    h.send(1_000, 2, su_psdu(100), he_su(0));
    h.run_until_us(3_000).unwrap();

    let sta = h.listener(1);
    assert_eq!(sta.drops(), vec![DropReason::ChannelSwitching]);
    assert_eq!(sta.rx_ok().len(), 1);
    assert_eq!(
        h.phy(1).time_in_state(PhyState::Switching, SimTime::from_micros(3_000)),
        SimTime::from_micros(250)
    );
    assert_state_chain(sta);
}

#[test]
fn test_channel_switch_postponed_during_tx() {
    let mut h = pair();
    h.send(0, 1, su_psdu(500), he_su(0));
    h.command(20, 1, switch_to_40());
    h.run_until_us(3_000).unwrap();

    let states: Vec<_> = h.listener(1).state_changes().iter().map(|c| c.new_state).collect();
    assert_eq!(states, vec![PhyState::Tx, PhyState::Switching, PhyState::Idle]);
    assert_eq!(h.phy(1).channel().frequency_mhz(), 5200);
}

#[test]
fn test_channel_switch_while_asleep_is_immediate() {
    let mut h = pair();
    h.command(0, 1, PhyCommand::Sleep);
    h.command(10, 1, switch_to_40());
    h.run_until_us(20).unwrap();

    assert_eq!(h.phy(1).state(), PhyState::Sleep);
    assert_eq!(h.phy(1).channel().number(), 40);
}

#[test]
fn test_invalid_channel_switch_is_an_error() {
    let mut h = pair();
    h.command(
        0,
        1,
        PhyCommand::SwitchChannel {
            number: 37,
            frequency_mhz: 0,
            width_mhz: 20,
        },
    );
    assert!(matches!(h.run_until_us(10), Err(SimError::HandlerError { .. })));
    assert_eq!(h.phy(1).channel().number(), 36);
}

#[test]
fn test_power_cycle_cancels_channel_switch_end() {
    let mut h = pair();
    h.command(0, 1, switch_to_40());
    h.command(100, 1, PhyCommand::Off);
    h.command(150, 1, PhyCommand::On);
    h.command(
        200,
        1,
        PhyCommand::SwitchChannel {
            number: 36,
            frequency_mhz: 0,
            width_mhz: 20,
        },
    );

    // The first switch would have ended at 250 us.
    h.run_until_us(300).unwrap();
    assert_eq!(h.phy(1).state(), PhyState::Switching);
    assert_eq!(h.phy(1).channel().number(), 36);

    h.run_until_us(1_000).unwrap();
    assert_eq!(h.phy(1).state(), PhyState::Idle);
    assert_eq!(
        h.phy(1).time_in_state(PhyState::Switching, SimTime::from_micros(1_000)),
        SimTime::from_micros(350)
    );
    let states: Vec<_> = h.listener(1).state_changes().iter().map(|c| c.new_state).collect();
    assert_eq!(
        states,
        vec![PhyState::Switching, PhyState::Off, PhyState::Idle, PhyState::Switching, PhyState::Idle]
    );
    assert_state_chain(h.listener(1));
}
