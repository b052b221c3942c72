//! The PHY entity.
//!
//! A [`WifiPhy`] owns one radio: its operating channel, its state, the
//! signals it hears and at most one PPDU being decoded. Reception is driven
//! by timers the PHY schedules for itself (see [`event`]); transmission by
//! [`EventPayload::PhyTxRequest`]; management by [`PhyCommand`].

mod event;
mod rx;

pub use event::{PhyTimer, RxArena, RxContribution, RxEvent, RxHandle, RxStage, StaPayload};

use crate::channel::{ChannelError, OperatingChannel};
use crate::detection::{FrameCaptureConfig, PreambleDetectionConfig};
use crate::interference::{InterferenceTracker, SignalId};
use crate::state::PhyStateHelper;
use crate::PhyError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use wifi_ppdu::{Band, ErrorRateModel, ErrorRateModelKind, RxCapabilities, WifiStandard, SU_STA_ID};
use wifisim_common::{
    metric_defs, DropReason, Entity, EntityId, Event, EventId, EventPayload, MetricLabels, PhyCommand,
    PhyRxDropEvent, PhyState, PhyStateChangedEvent, PhyTxRejectedEvent, PhyTxRequestEvent, Ppdu, SimContext,
    SimError, SimTime, StaId, TransmitAirEvent,
};

// ============================================================================
// Configuration
// ============================================================================

/// PHY parameters. Every field has a default; YAML may override any subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiPhyConfig {
    pub standard: WifiStandard,
    pub band: Band,
    /// Channel number, 0 to match any.
    pub channel_number: u8,
    /// Centre frequency, 0 to match any.
    pub frequency_mhz: u16,
    pub channel_width_mhz: u16,
    pub primary20_index: u8,
    pub tx_power_dbm: f64,
    pub max_nss: u8,
    pub noise_figure_db: f64,
    /// Energy detection threshold on the primary 20 MHz.
    pub cca_ed_threshold_dbm: f64,
    /// Preamble-based CCA threshold on the primary 20 MHz.
    pub cca_sensitivity_dbm: f64,
    pub preamble_detection: PreambleDetectionConfig,
    /// Frame capture model; `None` disables capture.
    pub frame_capture: Option<FrameCaptureConfig>,
    /// Spatial reuse level for inter-BSS PPDUs; `None` disables OBSS PD.
    pub obss_pd_level_dbm: Option<f64>,
    pub bss_color: u8,
    /// STA-ID assigned by the AP, used to find this station's MU payload.
    pub sta_id: StaId,
    pub is_ap: bool,
    pub error_rate_model: ErrorRateModelKind,
    pub channel_switch_delay_us: u64,
}

impl Default for WifiPhyConfig {
    fn default() -> Self {
        Self {
            standard: WifiStandard::Ieee80211ax,
            band: Band::Ghz5,
            channel_number: 0,
            frequency_mhz: 0,
            channel_width_mhz: 20,
            primary20_index: 0,
            tx_power_dbm: 20.0,
            max_nss: 1,
            noise_figure_db: 7.0,
            cca_ed_threshold_dbm: -62.0,
            cca_sensitivity_dbm: -82.0,
            preamble_detection: PreambleDetectionConfig::default(),
            frame_capture: Some(FrameCaptureConfig::default()),
            obss_pd_level_dbm: None,
            bss_color: 0,
            sta_id: SU_STA_ID,
            is_ap: false,
            error_rate_model: ErrorRateModelKind::Awgn,
            channel_switch_delay_us: 250,
        }
    }
}

impl WifiPhyConfig {
    /// Resolves the configured channel. With neither number nor frequency
    /// given, the first channel of the width in the band is used.
    pub fn operating_channel(&self) -> Result<OperatingChannel, ChannelError> {
        resolve_channel(
            self.channel_number,
            self.frequency_mhz,
            self.channel_width_mhz,
            self.standard,
            self.band,
        )?
        .with_primary20(self.primary20_index)
    }

    pub fn validate(&self) -> Result<(), PhyError> {
        if self.max_nss == 0 || self.max_nss > 8 {
            return Err(PhyError::InvalidConfig(format!("max_nss {} out of 1..=8", self.max_nss)));
        }
        if self.bss_color > 63 {
            return Err(PhyError::InvalidConfig(format!("bss_color {} out of 0..=63", self.bss_color)));
        }
        if self.cca_sensitivity_dbm > self.cca_ed_threshold_dbm {
            tracing::warn!(
                sensitivity = self.cca_sensitivity_dbm,
                ed = self.cca_ed_threshold_dbm,
                "CCA sensitivity above the energy detection threshold"
            );
        }
        Ok(())
    }
}

fn resolve_channel(
    number: u8,
    frequency_mhz: u16,
    width_mhz: u16,
    standard: WifiStandard,
    band: Band,
) -> Result<OperatingChannel, ChannelError> {
    if number == 0 && frequency_mhz == 0 {
        OperatingChannel::set_default(width_mhz, standard, band)
    } else {
        OperatingChannel::set(number, frequency_mhz, width_mhz, standard, band)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters kept by a PHY for inspection after a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhyStats {
    pub tx_ppdus: u64,
    pub tx_rejected: u64,
    pub rx_ok: u64,
    pub rx_error: u64,
    pub mpdus_ok: u64,
    pub mpdus_failed: u64,
    pub drops: BTreeMap<DropReason, u64>,
    /// Reception timers that fired after their reception was released.
    pub stale_timer_fires: u64,
    pub state_changes: u64,
}

impl PhyStats {
    pub fn drops_for(&self, reason: DropReason) -> u64 {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_drops(&self) -> u64 {
        self.drops.values().sum()
    }
}

/// HE TB responses the PHY expects after sending a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TbExpectation {
    uid: u64,
    first_arrival: Option<SimTime>,
}

// ============================================================================
// WifiPhy
// ============================================================================

/// A Wi-Fi PHY entity.
pub struct WifiPhy {
    id: EntityId,
    config: WifiPhyConfig,
    channel: OperatingChannel,
    medium: EntityId,
    listeners: Vec<EntityId>,
    state: PhyStateHelper,
    interference: InterferenceTracker,
    error_model: Box<dyn ErrorRateModel>,
    caps: RxCapabilities,
    arena: RxArena,
    current: Option<RxHandle>,
    tb_expectation: Option<TbExpectation>,
    tx_end: Option<EventId>,
    switch_end: Option<EventId>,
    pending_sleep: bool,
    pending_switch: Option<OperatingChannel>,
    stats: PhyStats,
    metric_labels: MetricLabels,
}

impl WifiPhy {
    /// Builds a PHY attached to `medium`. Fails if the configured channel
    /// cannot be selected.
    pub fn new(
        id: EntityId,
        config: WifiPhyConfig,
        medium: EntityId,
        metric_labels: MetricLabels,
    ) -> Result<Self, PhyError> {
        config.validate()?;
        let channel = config.operating_channel()?;
        let caps = RxCapabilities {
            standard: config.standard,
            max_channel_width: channel.width_mhz(),
            max_nss: config.max_nss,
            bss_color: config.bss_color,
            sta_id: config.sta_id,
            is_ap: config.is_ap,
            obss_pd_level_dbm: config.obss_pd_level_dbm,
        };
        tracing::debug!(phy = %id, %channel, standard = %config.standard, "PHY configured");
        Ok(Self {
            id,
            channel,
            medium,
            listeners: Vec::new(),
            state: PhyStateHelper::new(PhyState::Idle, SimTime::ZERO),
            interference: InterferenceTracker::new(config.noise_figure_db),
            error_model: config.error_rate_model.build(),
            caps,
            arena: RxArena::default(),
            current: None,
            tb_expectation: None,
            tx_end: None,
            switch_end: None,
            pending_sleep: false,
            pending_switch: None,
            stats: PhyStats::default(),
            metric_labels,
            config,
        })
    }

    /// Registers an entity to receive PSDUs, drops and state changes.
    pub fn add_listener(&mut self, listener: EntityId) {
        if !self.listeners.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    pub fn state(&self) -> PhyState {
        self.state.state()
    }

    pub fn stats(&self) -> &PhyStats {
        &self.stats
    }

    pub fn config(&self) -> &WifiPhyConfig {
        &self.config
    }

    pub fn channel(&self) -> &OperatingChannel {
        &self.channel
    }

    pub fn time_in_state(&self, state: PhyState, now: SimTime) -> SimTime {
        self.state.time_in(state, now)
    }

    /// UID of the PPDU being received, if any.
    pub fn reception_uid(&self) -> Option<u64> {
        self.current.and_then(|h| self.arena.get(h)).map(|ev| ev.uid)
    }

    // ------------------------------------------------------------------------
    // State and CCA
    // ------------------------------------------------------------------------

    fn labels_with(&self, key: &'static str, value: &str) -> Vec<(&'static str, String)> {
        let mut labels = self.metric_labels.to_labels();
        labels.push((key, value.to_string()));
        labels
    }

    fn set_state(&mut self, new_state: PhyState, ctx: &mut SimContext) {
        let Some((previous, spent)) = self.state.switch_to(new_state, ctx.time()) else {
            return;
        };
        self.stats.state_changes += 1;
        tracing::trace!(phy = %self.id, from = %previous, to = %new_state, "state change");

        let labels = self.labels_with("state", previous.as_label());
        metrics::counter!(metric_defs::PHY_STATE_TIME.name, &labels).increment(spent.as_micros());
        let labels = self.labels_with("state", new_state.as_label());
        metrics::counter!(metric_defs::PHY_STATE_CHANGES.name, &labels).increment(1);

        if !self.listeners.is_empty() {
            ctx.post_immediate(
                self.listeners.clone(),
                EventPayload::PhyStateChanged(PhyStateChangedEvent {
                    previous,
                    new_state,
                    state_version: self.state.version(),
                }),
            );
        }
    }

    /// Idle or CcaBusy, from what is on the primary 20 MHz right now.
    fn cca_state(&self, now: SimTime) -> PhyState {
        let primary = self.channel.primary20_center_mhz();
        let energy_busy = self.interference.energy_dbm(primary, now) >= self.config.cca_ed_threshold_dbm;
        let signal_busy = self
            .interference
            .signal_above(primary, now, self.config.cca_sensitivity_dbm);
        if energy_busy || signal_busy {
            PhyState::CcaBusy
        } else {
            PhyState::Idle
        }
    }

    /// Re-evaluates CCA when the PHY is listening.
    fn refresh_cca(&mut self, ctx: &mut SimContext) {
        if matches!(self.state.state(), PhyState::Idle | PhyState::CcaBusy) {
            let next = self.cca_state(ctx.time());
            self.set_state(next, ctx);
        }
    }

    /// Called when TX, RX or a channel switch ends: applies postponed
    /// commands, otherwise goes back to listening.
    fn end_of_activity(&mut self, ctx: &mut SimContext) {
        if let Some(channel) = self.pending_switch.take() {
            self.begin_switch(channel, ctx);
            return;
        }
        if self.pending_sleep {
            self.pending_sleep = false;
            self.set_state(PhyState::Sleep, ctx);
            return;
        }
        let next = self.cca_state(ctx.time());
        self.set_state(next, ctx);
    }

    fn notify_drop(&mut self, ppdu: &Ppdu, reason: DropReason, rx_power_dbm: f64, ctx: &mut SimContext) {
        *self.stats.drops.entry(reason).or_insert(0) += 1;
        tracing::debug!(
            phy = %self.id,
            uid = ppdu.uid(),
            preamble = %ppdu.preamble(),
            rx_power_dbm,
            reason = %reason,
            "PPDU dropped"
        );
        let labels = self.labels_with("reason", reason.as_label());
        metrics::counter!(metric_defs::PHY_RX_DROP.name, &labels).increment(1);
        if !self.listeners.is_empty() {
            ctx.post_immediate(
                self.listeners.clone(),
                EventPayload::PhyRxDrop(PhyRxDropEvent {
                    ppdu_uid: ppdu.uid(),
                    preamble: ppdu.preamble(),
                    reason,
                    rx_power_dbm,
                }),
            );
        }
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    fn start_tx(&mut self, requester: EntityId, request: &PhyTxRequestEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        let state = self.state.state();
        if matches!(state, PhyState::Tx | PhyState::Sleep | PhyState::Off | PhyState::Switching) {
            self.stats.tx_rejected += 1;
            tracing::debug!(phy = %self.id, %state, "transmission request rejected");
            let labels = self.labels_with("state", state.as_label());
            metrics::counter!(metric_defs::PHY_TX_REJECTED.name, &labels).increment(1);
            ctx.post_immediate(vec![requester], EventPayload::PhyTxRejected(PhyTxRejectedEvent { state }));
            return Ok(());
        }

        let txv = &request.tx_vector;
        if txv.channel_width() > self.channel.width_mhz() {
            return Err(SimError::HandlerError {
                entity: self.id,
                message: format!(
                    "TX width {} MHz exceeds the {} MHz operating channel",
                    txv.channel_width(),
                    self.channel.width_mhz()
                ),
            });
        }
        let uid = request.uid.unwrap_or_else(|| ctx.next_ppdu_uid());
        let center = self.channel.primary_center_mhz(txv.channel_width());
        let ppdu = Ppdu::new(request.psdus.clone(), txv, self.channel.band(), center, uid).map_err(|e| {
            SimError::HandlerError {
                entity: self.id,
                message: format!("cannot build PPDU: {e}"),
            }
        })?;

        if let Some(handle) = self.current {
            self.abort_reception(handle, DropReason::ReceptionAbortedByTx, ctx);
        }
        if request.solicits_tb {
            self.tb_expectation = Some(TbExpectation {
                uid,
                first_arrival: None,
            });
        }

        let now = ctx.time();
        let duration = SimTime::from(ppdu.tx_duration());
        let end_time = now + duration;
        self.stats.tx_ppdus += 1;
        let labels = self.labels_with("preamble", ppdu.preamble().as_label());
        metrics::counter!(metric_defs::PHY_TX_PPDUS.name, &labels).increment(1);
        metrics::counter!(metric_defs::PHY_TX_AIRTIME.name, &labels).increment(duration.as_micros());
        tracing::debug!(
            phy = %self.id,
            uid,
            preamble = %ppdu.preamble(),
            mode = %txv.mode().name(),
            duration_us = duration.as_micros(),
            "start transmission"
        );

        self.set_state(PhyState::Tx, ctx);
        ctx.post_immediate(
            vec![self.medium],
            EventPayload::TransmitAir(TransmitAirEvent {
                phy_id: self.id,
                ppdu: Arc::new(ppdu),
                tx_power_dbm: self.config.tx_power_dbm,
                end_time,
            }),
        );
        let timer = ctx.post_event(
            duration,
            vec![self.id],
            EventPayload::Timer {
                timer_id: PhyTimer::TxEnd.encode(),
            },
        );
        self.tx_end = Some(timer);
        Ok(())
    }

    fn end_tx(&mut self, ctx: &mut SimContext) {
        self.tx_end = None;
        tracing::trace!(phy = %self.id, "transmission complete");
        self.end_of_activity(ctx);
    }

    // ------------------------------------------------------------------------
    // Management commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: &PhyCommand, ctx: &mut SimContext) -> Result<(), SimError> {
        tracing::debug!(phy = %self.id, ?command, state = %self.state.state(), "PHY command");
        match command {
            PhyCommand::Sleep => self.sleep(ctx),
            PhyCommand::Resume => {
                self.pending_sleep = false;
                if self.state.state() == PhyState::Sleep {
                    let next = self.cca_state(ctx.time());
                    self.set_state(next, ctx);
                }
            }
            PhyCommand::Off => self.power_off(ctx),
            PhyCommand::On => {
                if self.state.state() == PhyState::Off {
                    self.interference.purge(ctx.time());
                    let next = self.cca_state(ctx.time());
                    self.set_state(next, ctx);
                }
            }
            PhyCommand::SwitchChannel {
                number,
                frequency_mhz,
                width_mhz,
            } => {
                let channel = resolve_channel(*number, *frequency_mhz, *width_mhz, self.config.standard, self.config.band)
                    .map_err(|e| SimError::HandlerError {
                        entity: self.id,
                        message: e.to_string(),
                    })?;
                self.switch_channel(channel, ctx);
            }
        }
        Ok(())
    }

    fn sleep(&mut self, ctx: &mut SimContext) {
        match self.state.state() {
            PhyState::Tx | PhyState::Rx | PhyState::Switching => {
                tracing::debug!(phy = %self.id, "sleep postponed until the current activity ends");
                self.pending_sleep = true;
            }
            PhyState::Sleep => {}
            PhyState::Off => tracing::warn!(phy = %self.id, "cannot sleep while powered off"),
            PhyState::Idle | PhyState::CcaBusy => {
                if let Some(handle) = self.current {
                    self.abort_reception(handle, DropReason::Sleeping, ctx);
                }
                self.set_state(PhyState::Sleep, ctx);
            }
        }
    }

    fn power_off(&mut self, ctx: &mut SimContext) {
        if let Some(timer) = self.tx_end.take() {
            ctx.cancel_event(timer);
        }
        if let Some(timer) = self.switch_end.take() {
            ctx.cancel_event(timer);
        }
        if let Some(handle) = self.current {
            self.abort_reception(handle, DropReason::PoweredOff, ctx);
        }
        self.pending_sleep = false;
        self.pending_switch = None;
        self.set_state(PhyState::Off, ctx);
    }

    fn switch_channel(&mut self, channel: OperatingChannel, ctx: &mut SimContext) {
        match self.state.state() {
            PhyState::Tx | PhyState::Switching => {
                tracing::debug!(phy = %self.id, %channel, "channel switch postponed");
                self.pending_switch = Some(channel);
            }
            PhyState::Sleep | PhyState::Off => {
                self.apply_channel(channel);
                self.interference.clear();
            }
            PhyState::Rx | PhyState::Idle | PhyState::CcaBusy => {
                if let Some(handle) = self.current {
                    self.abort_reception(handle, DropReason::ChannelSwitching, ctx);
                }
                self.begin_switch(channel, ctx);
            }
        }
    }

    fn apply_channel(&mut self, channel: OperatingChannel) {
        tracing::info!(phy = %self.id, from = %self.channel, to = %channel, "operating channel changed");
        self.channel = channel;
        self.caps.max_channel_width = channel.width_mhz();
    }

    fn begin_switch(&mut self, channel: OperatingChannel, ctx: &mut SimContext) {
        self.apply_channel(channel);
        self.interference.clear();
        self.set_state(PhyState::Switching, ctx);
        if let Some(timer) = self.switch_end.take() {
            ctx.cancel_event(timer);
        }
        let timer = ctx.post_event(
            SimTime::from_micros(self.config.channel_switch_delay_us),
            vec![self.id],
            EventPayload::Timer {
                timer_id: PhyTimer::SwitchEnd.encode(),
            },
        );
        self.switch_end = Some(timer);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn handle_timer(&mut self, event_id: EventId, timer_id: u64, ctx: &mut SimContext) {
        let Some(timer) = PhyTimer::decode(timer_id) else {
            tracing::warn!(phy = %self.id, timer_id, "unknown timer");
            return;
        };

        if let Some(handle) = timer.rx_handle() {
            let live = self.current == Some(handle);
            match self.arena.get_mut(handle) {
                Some(ev) if live => ev.timers.retain(|t| *t != event_id),
                _ => {
                    self.stats.stale_timer_fires += 1;
                    tracing::warn!(phy = %self.id, ?timer, "stale reception timer ignored");
                    return;
                }
            }
        }

        match timer {
            PhyTimer::PreambleDetectionEnd(h) => self.end_preamble_detection_period(h, ctx),
            PhyTimer::FieldEnd(h, field) => self.end_receive_field(h, field, ctx),
            PhyTimer::PayloadStart(h) => self.start_receive_data(h, ctx),
            PhyTimer::MpduEnd { rx, payload, index } => self.end_of_mpdu(rx, payload as usize, index as usize, ctx),
            PhyTimer::ReceiveEnd(h) => self.end_receive(h, ctx),
            PhyTimer::TxEnd => self.end_tx(ctx),
            PhyTimer::SignalEnd(id) => self.end_of_signal(id, ctx),
            PhyTimer::SwitchEnd => {
                if self.switch_end != Some(event_id) {
                    tracing::warn!(phy = %self.id, "stale channel switch timer ignored");
                    return;
                }
                self.switch_end = None;
                if self.state.state() == PhyState::Switching {
                    tracing::debug!(phy = %self.id, channel = %self.channel, "channel switch complete");
                    self.end_of_activity(ctx);
                }
            }
        }
    }

    fn end_of_signal(&mut self, _id: SignalId, ctx: &mut SimContext) {
        let now = ctx.time();
        let keep_from = self
            .current
            .and_then(|h| self.arena.get(h))
            .map(|ev| ev.start.min(now))
            .unwrap_or(now);
        self.interference.purge(keep_from);
        self.refresh_cca(ctx);
    }
}

impl Entity for WifiPhy {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ReceiveAir(rx) => self.start_receive_preamble(rx, ctx),
            EventPayload::PhyTxRequest(request) => self.start_tx(event.source, request, ctx)?,
            EventPayload::PhyControl(command) => self.handle_command(command, ctx)?,
            EventPayload::Timer { timer_id } => self.handle_timer(event.id, *timer_id, ctx),
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
