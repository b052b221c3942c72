//! # wifisim-common
//!
//! Common types and traits for the wifisim simulation framework.
//!
//! This crate provides core simulation primitives including:
//! - Time representation with nanosecond resolution ([`SimTime`])
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`]) and the cancellable
//!   scheduler ([`SimContext`], [`EventQueue`])
//! - Entity traits ([`Entity`]) and the registry
//! - PHY state ([`PhyState`]) shared by the PHY and its listeners
//! - Metric definitions ([`metric_defs`]) and labels ([`MetricLabels`])

pub mod labels;
pub mod metric_defs;

pub use labels::MetricLabels;
pub use metrics;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Re-export the PPDU types carried by events
pub use wifi_ppdu::{DropReason, MacAddr, Mpdu, Ppdu, PreambleType, Psdu, StaId, TxVector};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
///
/// PPDU field boundaries fall on multiples of 100 ns (guard intervals of
/// 0.4 us, HE-LTF symbols of 3.2 us), so time is kept as an integer count of
/// nanoseconds and never accumulated in floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float), rounded to the nearest nanosecond.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000_000.0).round().max(0.0) as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Interpret this time as a duration since simulation start.
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Add duration to time.
    pub fn add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }
}

impl From<Duration> for SimTime {
    fn from(d: Duration) -> Self {
        SimTime(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> Self::Output {
        self + SimTime::from(rhs)
    }
}

impl std::ops::AddAssign for SimTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

// ============================================================================
// PHY State
// ============================================================================

/// State of a Wi-Fi PHY. A PHY is in exactly one of these at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhyState {
    Idle,
    CcaBusy,
    Rx,
    Tx,
    Switching,
    Sleep,
    Off,
}

impl PhyState {
    pub const ALL: [PhyState; 7] = [
        PhyState::Idle,
        PhyState::CcaBusy,
        PhyState::Rx,
        PhyState::Tx,
        PhyState::Switching,
        PhyState::Sleep,
        PhyState::Off,
    ];

    /// Get the state label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PhyState::Idle => "idle",
            PhyState::CcaBusy => "cca_busy",
            PhyState::Rx => "rx",
            PhyState::Tx => "tx",
            PhyState::Switching => "switching",
            PhyState::Sleep => "sleep",
            PhyState::Off => "off",
        }
    }
}

impl fmt::Display for PhyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_label().to_ascii_uppercase())
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then FIFO)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Transmit air event - a PHY starts sending a PPDU.
/// Directed to the Medium entity which routes it to the other PHYs.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// PHY that is transmitting.
    pub phy_id: EntityId,
    /// The PPDU on air.
    pub ppdu: Arc<Ppdu>,
    /// Total transmit power in dBm.
    pub tx_power_dbm: f64,
    /// When transmission will end.
    pub end_time: SimTime,
}

/// Receive air event - the start of a PPDU reaching a PHY.
#[derive(Debug, Clone)]
pub struct ReceiveAirEvent {
    /// PHY that transmitted.
    pub source_phy_id: EntityId,
    /// The PPDU being received.
    pub ppdu: Arc<Ppdu>,
    /// Received power in dBm per occupied 20 MHz subchannel, keyed by the
    /// subchannel centre frequency in MHz.
    pub rx_power_dbm: BTreeMap<u16, f64>,
    /// When the signal leaves the air at this receiver.
    pub end_time: SimTime,
}

impl ReceiveAirEvent {
    /// Total received power in dBm over all subchannels.
    pub fn total_rx_power_dbm(&self) -> f64 {
        let mw: f64 = self.rx_power_dbm.values().map(|dbm| 10f64.powf(dbm / 10.0)).sum();
        if mw > 0.0 {
            10.0 * mw.log10()
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Request to transmit, sent to a PHY by a traffic source.
#[derive(Debug, Clone)]
pub struct PhyTxRequestEvent {
    /// PSDUs keyed by STA-ID (`SU_STA_ID` for single-user PPDUs).
    pub psdus: BTreeMap<StaId, Psdu>,
    /// Transmission parameters.
    pub tx_vector: TxVector,
    /// PPDU uid to reuse. HE TB responses carry the uid of the soliciting
    /// trigger; a fresh uid is drawn when unset.
    pub uid: Option<u64>,
    /// The PPDU solicits HE TB responses that the PHY should accept.
    pub solicits_tb: bool,
}

/// PSDU delivered to PHY listeners at the end of a reception.
#[derive(Debug, Clone)]
pub struct PhyRxPsduEvent {
    /// UID of the PPDU that carried the PSDU.
    pub ppdu_uid: u64,
    /// PHY that sent the PPDU.
    pub source_phy_id: EntityId,
    /// STA-ID the PSDU was addressed to (`SU_STA_ID` for SU PPDUs).
    pub sta_id: StaId,
    /// The PSDU.
    pub psdu: Psdu,
    /// TXVECTOR decoded from the PPDU header.
    pub tx_vector: TxVector,
    /// Outcome of each MPDU of the PSDU, in order.
    pub mpdu_success: Vec<bool>,
    /// Lowest SINR observed over the payload, in dB.
    pub snr_db: f64,
    /// Received signal power in dBm.
    pub rx_power_dbm: f64,
    /// When the PPDU started arriving.
    pub start_time: SimTime,
    /// When the reception ended.
    pub end_time: SimTime,
}

/// A PPDU the PHY did not receive, and why.
#[derive(Debug, Clone)]
pub struct PhyRxDropEvent {
    /// UID of the dropped PPDU.
    pub ppdu_uid: u64,
    /// Preamble of the dropped PPDU.
    pub preamble: PreambleType,
    /// Why it was dropped.
    pub reason: DropReason,
    /// Received signal power in dBm.
    pub rx_power_dbm: f64,
}

/// PHY state transition, sent to PHY listeners.
#[derive(Debug, Clone)]
pub struct PhyStateChangedEvent {
    /// State being left.
    pub previous: PhyState,
    /// The new PHY state.
    pub new_state: PhyState,
    /// Incremented on each state change for ordering.
    pub state_version: u32,
}

/// A transmission request the PHY refused.
#[derive(Debug, Clone)]
pub struct PhyTxRejectedEvent {
    /// State the PHY was in.
    pub state: PhyState,
}

/// Management commands accepted by a PHY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PhyCommand {
    /// Enter sleep; refused while transmitting.
    Sleep,
    /// Leave sleep.
    Resume,
    /// Power off immediately, aborting any activity.
    Off,
    /// Power on.
    On,
    /// Move to another operating channel. Zero means "any" for number and
    /// frequency.
    SwitchChannel {
        #[serde(default)]
        number: u8,
        #[serde(default)]
        frequency_mhz: u16,
        width_mhz: u16,
    },
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Medium Events ===========
    /// A PHY started transmitting (directed to the Medium entity).
    TransmitAir(TransmitAirEvent),
    /// A PPDU starts arriving at a PHY (from the Medium entity).
    ReceiveAir(ReceiveAirEvent),

    // =========== Traffic source → PHY Events ===========
    /// Transmission request.
    PhyTxRequest(PhyTxRequestEvent),
    /// Management command.
    PhyControl(PhyCommand),

    // =========== PHY → listener Events ===========
    /// PSDU received with at least one correct MPDU.
    PhyRxOk(PhyRxPsduEvent),
    /// PSDU received with every MPDU in error.
    PhyRxError(PhyRxPsduEvent),
    /// PPDU dropped before the payload could be decoded.
    PhyRxDrop(PhyRxDropEvent),
    /// PHY state changed.
    PhyStateChanged(PhyStateChangedEvent),
    /// Transmission request refused.
    PhyTxRejected(PhyTxRejectedEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// Entity-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

impl EventPayload {
    /// Short name of the payload variant for traces and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TransmitAir(_) => "transmit_air",
            EventPayload::ReceiveAir(_) => "receive_air",
            EventPayload::PhyTxRequest(_) => "phy_tx_request",
            EventPayload::PhyControl(_) => "phy_control",
            EventPayload::PhyRxOk(_) => "phy_rx_ok",
            EventPayload::PhyRxError(_) => "phy_rx_error",
            EventPayload::PhyRxDrop(_) => "phy_rx_drop",
            EventPayload::PhyStateChanged(_) => "phy_state_changed",
            EventPayload::PhyTxRejected(_) => "phy_tx_rejected",
            EventPayload::Timer { .. } => "timer",
            EventPayload::SimulationEnd => "simulation_end",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    cancelled: Vec<EventId>,
    next_event_id: u64,
    next_ppdu_uid: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            cancelled: Vec::new(),
            next_event_id: 0,
            next_ppdu_uid: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay. The returned id can be passed
    /// to [`cancel_event`](Self::cancel_event).
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let id = EventId(self.next_event_id);
        let event = Event {
            id,
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
        id
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Cancel a posted event. Cancelling an event that already fired is a
    /// no-op.
    pub fn cancel_event(&mut self, id: EventId) {
        let before = self.pending_events.len();
        self.pending_events.retain(|e| e.id != id);
        if self.pending_events.len() == before {
            self.cancelled.push(id);
        }
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Take all cancellations of already queued events (used by event loop).
    pub fn take_cancelled(&mut self) -> Vec<EventId> {
        std::mem::take(&mut self.cancelled)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Draw a fresh PPDU uid, unique for this simulation.
    pub fn next_ppdu_uid(&mut self) -> u64 {
        let uid = self.next_ppdu_uid;
        self.next_ppdu_uid += 1;
        uid
    }
}

// ============================================================================
// Event Queue
// ============================================================================

/// Time-ordered event queue with cancellation.
///
/// Events pop in `(time, id)` order, so events posted for the same instant
/// run in the order they were posted. Cancelled events are skipped.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    cancelled: HashSet<EventId>,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event.
    pub fn push(&mut self, event: Event) {
        self.heap.push(event);
    }

    /// Cancel a queued event.
    pub fn cancel(&mut self, id: EventId) {
        self.cancelled.insert(id);
    }

    /// Move pending events and cancellations out of the context.
    pub fn absorb(&mut self, ctx: &mut SimContext) {
        for id in ctx.take_cancelled() {
            self.cancel(id);
        }
        for event in ctx.take_pending_events() {
            self.push(event);
        }
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if !self.cancelled.remove(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Time of the next live event.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_cancelled();
        self.heap.peek().map(|e| e.time)
    }

    /// Remove and return the next live event.
    pub fn pop(&mut self) -> Option<Event> {
        self.discard_cancelled();
        self.heap.pop()
    }

    /// Number of queued events, cancelled ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop the next live event, advance the clock to it and dispatch it.
    ///
    /// [`EventPayload::SimulationEnd`] is returned without being dispatched.
    pub fn step(&mut self, registry: &mut EntityRegistry, ctx: &mut SimContext) -> Result<Option<Event>, SimError> {
        let Some(event) = self.pop() else {
            return Ok(None);
        };
        ctx.set_time(event.time);
        if !matches!(event.payload, EventPayload::SimulationEnd) {
            registry.dispatch_event(&event, ctx)?;
        }
        self.absorb(ctx);
        Ok(Some(event))
    }

    /// Process every event up to and including `end`, then leave the clock
    /// at `end`. Returns the number of events dispatched.
    pub fn run_until(
        &mut self,
        registry: &mut EntityRegistry,
        ctx: &mut SimContext,
        end: SimTime,
    ) -> Result<u64, SimError> {
        self.absorb(ctx);
        let mut dispatched = 0;
        while self.peek_time().is_some_and(|t| t <= end) {
            match self.step(registry, ctx)? {
                Some(event) if matches!(event.payload, EventPayload::SimulationEnd) => break,
                Some(_) => dispatched += 1,
                None => break,
            }
        }
        if ctx.time() < end {
            ctx.set_time(end);
        }
        Ok(dispatched)
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;

    /// Downcasting support for inspection after a run.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcasting support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: BTreeMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Get an entity as its concrete type.
    pub fn get_as<T: 'static>(&self, id: EntityId) -> Option<&T> {
        self.entities.get(&id).and_then(|e| e.as_any().downcast_ref::<T>())
    }

    /// Get an entity mutably as its concrete type.
    pub fn get_as_mut<T: 'static>(&mut self, id: EntityId) -> Option<&mut T> {
        self.entities.get_mut(&id).and_then(|e| e.as_any_mut().downcast_mut::<T>())
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                tracing::error!(target = %target, kind = event.payload.kind(), "entity not found when dispatching");
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
