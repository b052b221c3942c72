//! Single-valued PHY state with time accounting.

use std::collections::BTreeMap;
use wifisim_common::{PhyState, SimTime};

/// Holds the current [`PhyState`] and how long each state was occupied.
#[derive(Debug, Clone)]
pub struct PhyStateHelper {
    state: PhyState,
    since: SimTime,
    version: u32,
    accumulated: BTreeMap<PhyState, SimTime>,
}

impl PhyStateHelper {
    pub fn new(initial: PhyState, now: SimTime) -> Self {
        Self {
            state: initial,
            since: now,
            version: 0,
            accumulated: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> PhyState {
        self.state
    }

    pub fn since(&self) -> SimTime {
        self.since
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Moves to `to`. Returns the state left and how long it lasted, or
    /// `None` if the state did not change.
    pub fn switch_to(&mut self, to: PhyState, now: SimTime) -> Option<(PhyState, SimTime)> {
        if to == self.state {
            return None;
        }
        let previous = self.state;
        let spent = now - self.since;
        *self.accumulated.entry(previous).or_insert(SimTime::ZERO) += spent;
        self.state = to;
        self.since = now;
        self.version = self.version.wrapping_add(1);
        Some((previous, spent))
    }

    /// Total time spent in `state` up to `now`.
    pub fn time_in(&self, state: PhyState, now: SimTime) -> SimTime {
        let past = self.accumulated.get(&state).copied().unwrap_or(SimTime::ZERO);
        if state == self.state {
            past + (now - self.since)
        } else {
            past
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_accounting() {
        let mut helper = PhyStateHelper::new(PhyState::Idle, SimTime::ZERO);
        assert!(helper.switch_to(PhyState::Idle, SimTime::from_micros(5)).is_none());

        let (prev, spent) = helper.switch_to(PhyState::Tx, SimTime::from_micros(10)).unwrap();
        assert_eq!(prev, PhyState::Idle);
        assert_eq!(spent, SimTime::from_micros(10));
        helper.switch_to(PhyState::Idle, SimTime::from_micros(30)).unwrap();

        assert_eq!(helper.version(), 2);
        assert_eq!(helper.time_in(PhyState::Tx, SimTime::from_micros(50)), SimTime::from_micros(20));
        assert_eq!(helper.time_in(PhyState::Idle, SimTime::from_micros(50)), SimTime::from_micros(30));
    }
}
