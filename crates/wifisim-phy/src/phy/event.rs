//! Reception records and PHY timer encoding.
//!
//! Each PPDU being decoded lives in an [`RxArena`] slot. Timers scheduled for
//! it carry the slot and its generation; once the slot is released the
//! generation moves on and any timer still in flight is recognised as stale.

use std::sync::Arc;
use wifi_ppdu::{PpduField, Psdu, PreambleType, StaId, TxVector, WifiMode};
use wifisim_common::{EntityId, EventId, Ppdu, SimTime};

use crate::interference::SignalId;
use crate::mw_to_dbm;

/// Generation-checked reference to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxHandle {
    slot: u16,
    generation: u16,
}

/// Which part of the PPDU the receiver is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStage {
    PreambleDetection,
    Header,
    Payload,
}

/// One transmitter's copy of the PPDU. HE TB receptions merge several.
#[derive(Debug, Clone)]
pub struct RxContribution {
    pub source: EntityId,
    pub ppdu: Arc<Ppdu>,
    pub signal: SignalId,
    pub rx_power_dbm: f64,
}

/// Payload state of one addressed station.
#[derive(Debug, Clone)]
pub struct StaPayload {
    pub contribution: usize,
    pub sta_id: StaId,
    pub psdu: Psdu,
    pub tx_vector: TxVector,
    pub mode: WifiMode,
    pub rate_bps: u64,
    pub bands: Vec<u16>,
    pub data_start: SimTime,
    pub mpdu_ends: Vec<SimTime>,
    pub mpdu_success: Vec<bool>,
    pub min_sinr_db: f64,
}

/// A PPDU being received.
#[derive(Debug, Clone)]
pub struct RxEvent {
    pub uid: u64,
    pub preamble: PreambleType,
    pub contributions: Vec<RxContribution>,
    pub start: SimTime,
    pub end: SimTime,
    pub stage: RxStage,
    pub tx_vector: Option<TxVector>,
    pub timers: Vec<EventId>,
    pub payloads: Vec<StaPayload>,
}

impl RxEvent {
    pub fn new(contribution: RxContribution, start: SimTime, end: SimTime) -> Self {
        Self {
            uid: contribution.ppdu.uid(),
            preamble: contribution.ppdu.preamble(),
            contributions: vec![contribution],
            start,
            end,
            stage: RxStage::PreambleDetection,
            tx_vector: None,
            timers: Vec::new(),
            payloads: Vec::new(),
        }
    }

    pub fn key(&self) -> (u64, PreambleType) {
        (self.uid, self.preamble)
    }

    pub fn ppdu(&self) -> &Arc<Ppdu> {
        &self.contributions[0].ppdu
    }

    pub fn source(&self) -> EntityId {
        self.contributions[0].source
    }

    pub fn signals(&self) -> Vec<SignalId> {
        self.contributions.iter().map(|c| c.signal).collect()
    }

    /// Combined power of all contributions.
    pub fn rx_power_dbm(&self) -> f64 {
        let mw: f64 = self.contributions.iter().map(|c| crate::dbm_to_mw(c.rx_power_dbm)).sum();
        mw_to_dbm(mw)
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug, Default)]
struct Slot {
    generation: u16,
    event: Option<RxEvent>,
}

/// Slot storage for receptions. At most one reception is live at a time, so
/// the slot count stays tiny and slot indices fit the timer encoding.
#[derive(Debug, Default)]
pub struct RxArena {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl RxArena {
    pub fn insert(&mut self, event: RxEvent) -> RxHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u16
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.event = Some(event);
        RxHandle {
            slot,
            generation: entry.generation,
        }
    }

    pub fn get(&self, handle: RxHandle) -> Option<&RxEvent> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.event.as_ref())
    }

    pub fn get_mut(&mut self, handle: RxHandle) -> Option<&mut RxEvent> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.event.as_mut())
    }

    /// Releases a slot; every outstanding handle to it becomes stale.
    pub fn remove(&mut self, handle: RxHandle) -> Option<RxEvent> {
        let entry = self.slots.get_mut(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let event = entry.event.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Some(event)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.event.is_some()).count()
    }
}

// ============================================================================
// Timer IDs
// ============================================================================

// Layout: kind (4 bits) | slot (12 bits) | generation (16 bits) | extra (32 bits)
const KIND_SHIFT: u32 = 60;
const SLOT_SHIFT: u32 = 48;
const GEN_SHIFT: u32 = 32;

const TIMER_PREAMBLE_DETECTION_END: u64 = 1;
const TIMER_FIELD_END: u64 = 2;
const TIMER_PAYLOAD_START: u64 = 3;
const TIMER_MPDU_END: u64 = 4;
const TIMER_RECEIVE_END: u64 = 5;
const TIMER_TX_END: u64 = 6;
const TIMER_SIGNAL_END: u64 = 7;
const TIMER_SWITCH_END: u64 = 8;

/// Timers a PHY schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyTimer {
    PreambleDetectionEnd(RxHandle),
    FieldEnd(RxHandle, PpduField),
    PayloadStart(RxHandle),
    MpduEnd { rx: RxHandle, payload: u16, index: u16 },
    ReceiveEnd(RxHandle),
    TxEnd,
    SignalEnd(SignalId),
    SwitchEnd,
}

fn field_code(field: PpduField) -> u64 {
    match field {
        PpduField::Preamble => 0,
        PpduField::NonHtHeader => 1,
        PpduField::HtSig => 2,
        PpduField::Training => 3,
        PpduField::SigA => 4,
        PpduField::SigB => 5,
        PpduField::Data => 6,
    }
}

fn field_from_code(code: u64) -> Option<PpduField> {
    Some(match code {
        0 => PpduField::Preamble,
        1 => PpduField::NonHtHeader,
        2 => PpduField::HtSig,
        3 => PpduField::Training,
        4 => PpduField::SigA,
        5 => PpduField::SigB,
        6 => PpduField::Data,
        _ => return None,
    })
}

fn pack(kind: u64, rx: Option<RxHandle>, extra: u64) -> u64 {
    let (slot, generation) = rx.map(|h| (h.slot as u64, h.generation as u64)).unwrap_or((0, 0));
    (kind << KIND_SHIFT) | ((slot & 0xfff) << SLOT_SHIFT) | (generation << GEN_SHIFT) | (extra & 0xffff_ffff)
}

impl PhyTimer {
    pub fn encode(self) -> u64 {
        match self {
            PhyTimer::PreambleDetectionEnd(h) => pack(TIMER_PREAMBLE_DETECTION_END, Some(h), 0),
            PhyTimer::FieldEnd(h, field) => pack(TIMER_FIELD_END, Some(h), field_code(field)),
            PhyTimer::PayloadStart(h) => pack(TIMER_PAYLOAD_START, Some(h), 0),
            PhyTimer::MpduEnd { rx, payload, index } => {
                pack(TIMER_MPDU_END, Some(rx), (u64::from(payload) << 16) | u64::from(index))
            }
            PhyTimer::ReceiveEnd(h) => pack(TIMER_RECEIVE_END, Some(h), 0),
            PhyTimer::TxEnd => pack(TIMER_TX_END, None, 0),
            PhyTimer::SignalEnd(id) => pack(TIMER_SIGNAL_END, None, u64::from(id.0)),
            PhyTimer::SwitchEnd => pack(TIMER_SWITCH_END, None, 0),
        }
    }

    pub fn decode(timer_id: u64) -> Option<Self> {
        let kind = timer_id >> KIND_SHIFT;
        let handle = RxHandle {
            slot: ((timer_id >> SLOT_SHIFT) & 0xfff) as u16,
            generation: ((timer_id >> GEN_SHIFT) & 0xffff) as u16,
        };
        let extra = timer_id & 0xffff_ffff;
        Some(match kind {
            TIMER_PREAMBLE_DETECTION_END => PhyTimer::PreambleDetectionEnd(handle),
            TIMER_FIELD_END => PhyTimer::FieldEnd(handle, field_from_code(extra)?),
            TIMER_PAYLOAD_START => PhyTimer::PayloadStart(handle),
            TIMER_MPDU_END => PhyTimer::MpduEnd {
                rx: handle,
                payload: (extra >> 16) as u16,
                index: (extra & 0xffff) as u16,
            },
            TIMER_RECEIVE_END => PhyTimer::ReceiveEnd(handle),
            TIMER_TX_END => PhyTimer::TxEnd,
            TIMER_SIGNAL_END => PhyTimer::SignalEnd(SignalId(extra as u32)),
            TIMER_SWITCH_END => PhyTimer::SwitchEnd,
            _ => return None,
        })
    }

    /// Reception the timer belongs to, if any.
    pub fn rx_handle(&self) -> Option<RxHandle> {
        match self {
            PhyTimer::PreambleDetectionEnd(h)
            | PhyTimer::FieldEnd(h, _)
            | PhyTimer::PayloadStart(h)
            | PhyTimer::ReceiveEnd(h) => Some(*h),
            PhyTimer::MpduEnd { rx, .. } => Some(*rx),
            PhyTimer::TxEnd | PhyTimer::SignalEnd(_) | PhyTimer::SwitchEnd => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wifi_ppdu::{Band, MacAddr, Mpdu, SU_STA_ID};

    fn rx_event(uid: u64) -> RxEvent {
        let txv = TxVector::new(WifiMode::ofdm_rate(6).unwrap(), PreambleType::NonHt, 20);
        let psdu = Psdu::single(Mpdu::new(MacAddr::BROADCAST, MacAddr::new([2, 0, 0, 0, 0, 1]), 0, vec![0; 100]));
        let ppdu = Ppdu::new(BTreeMap::from([(SU_STA_ID, psdu)]), &txv, Band::Ghz5, 5180, uid).unwrap();
        RxEvent::new(
            RxContribution {
                source: EntityId(1),
                ppdu: Arc::new(ppdu),
                signal: SignalId(0),
                rx_power_dbm: -60.0,
            },
            SimTime::ZERO,
            SimTime::from_micros(200),
        )
    }

    #[test]
    fn test_arena_generations() {
        let mut arena = RxArena::default();
        let first = arena.insert(rx_event(1));
        assert_eq!(arena.get(first).unwrap().uid, 1);
        assert!(arena.remove(first).is_some());
        assert!(arena.get(first).is_none());

        let second = arena.insert(rx_event(2));
        assert_eq!(second.slot, first.slot);
        assert_ne!(second, first);
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn test_timer_encoding() {
        let h = RxHandle {
            slot: 3,
            generation: 0xbeef,
        };
        let timers = [
            PhyTimer::PreambleDetectionEnd(h),
            PhyTimer::FieldEnd(h, PpduField::SigB),
            PhyTimer::PayloadStart(h),
            PhyTimer::MpduEnd {
                rx: h,
                payload: 2,
                index: 63,
            },
            PhyTimer::ReceiveEnd(h),
            PhyTimer::TxEnd,
            PhyTimer::SignalEnd(SignalId(77)),
            PhyTimer::SwitchEnd,
        ];
        for timer in timers {
            assert_eq!(PhyTimer::decode(timer.encode()), Some(timer));
        }
        assert_eq!(PhyTimer::decode(0), None);
    }

    #[test]
    fn test_combined_power() {
        let mut ev = rx_event(1);
        let mut extra = ev.contributions[0].clone();
        extra.signal = SignalId(1);
        ev.contributions.push(extra);
        assert!((ev.rx_power_dbm() - (-56.99)).abs() < 0.01);
        assert_eq!(ev.signals(), vec![SignalId(0), SignalId(1)]);
    }
}
