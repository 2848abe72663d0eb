//! The ordered set of known slaves.

use crate::amps::Centiamps;
use crate::message::{ProtocolVersion, Sign, TwcId};
use crate::session::SlaveSession;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A real master only ever drives up to three slaves; anything beyond that
/// indicates ghosts from id churn, so the oldest entry is dropped first.
pub const MAX_SLAVES: usize = 3;

/// A slave silent for longer than this is scratched from the registry and
/// stops receiving heartbeats.
pub const IDLE_EVICT_AFTER: Duration = Duration::from_secs(26);

/// Insertion-ordered slave sessions with id lookup and a round-robin
/// cursor.
///
/// The ordered list and the id index always hold exactly the same
/// membership; both are updated together by every mutation.
#[derive(Debug, Default)]
pub struct SlaveRegistry {
    sessions: Vec<SlaveSession>,
    index: HashMap<TwcId, usize>,
    cursor: usize,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: TwcId) -> Option<&SlaveSession> {
        self.index.get(&id).map(|i| &self.sessions[*i])
    }

    pub fn get_mut(&mut self, id: TwcId) -> Option<&mut SlaveSession> {
        match self.index.get(&id) {
            Some(i) => self.sessions.get_mut(*i),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlaveSession> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SlaveSession> {
        self.sessions.iter_mut()
    }

    /// Look a session up by id, creating it from a link-ready if unknown.
    ///
    /// Adding a fourth slave evicts the oldest. Version and derived
    /// minimum amps are latched at creation and left alone on later
    /// link-readies.
    pub fn find_or_create(
        &mut self,
        id: TwcId,
        sign: Sign,
        version: ProtocolVersion,
        advertised_max_amps: Centiamps,
        wiring_max_per_outlet: Centiamps,
        now: Instant,
    ) -> &mut SlaveSession {
        if let Some(&i) = self.index.get(&id) {
            return &mut self.sessions[i];
        }

        if self.sessions.len() >= MAX_SLAVES {
            let oldest = self.sessions[0].id;

            log::warn!(
                "more than {} slaves seen on the bus, dropping oldest {}",
                MAX_SLAVES,
                oldest
            );

            self.evict(oldest);
        }

        let session = SlaveSession::new(
            id,
            sign,
            version,
            advertised_max_amps,
            wiring_max_per_outlet,
            now,
        );

        self.sessions.push(session);
        self.index.insert(id, self.sessions.len() - 1);

        self.sessions.last_mut().expect("just pushed")
    }

    /// Remove a session from both views and keep the cursor in range.
    pub fn evict(&mut self, id: TwcId) {
        let Some(pos) = self.index.remove(&id) else {
            return;
        };

        self.sessions.remove(pos);

        // Positions after the removal shifted down.
        self.index.clear();
        for (i, session) in self.sessions.iter().enumerate() {
            self.index.insert(session.id, i);
        }

        if pos < self.cursor {
            self.cursor -= 1;
        }

        if self.sessions.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.sessions.len();
        }
    }

    /// Evict every slave that has been silent past the idle deadline,
    /// returning how many went.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let stale: Vec<TwcId> = self
            .sessions
            .iter()
            .filter(|s| now.duration_since(s.time_last_rx) > IDLE_EVICT_AFTER)
            .map(|s| s.id)
            .collect();

        for id in &stale {
            log::warn!(
                "no frames from slave {} for over {} seconds, dropping it and \
                 stopping its heartbeats",
                id,
                IDLE_EVICT_AFTER.as_secs()
            );

            self.evict(*id);
        }

        stale.len()
    }

    /// The id whose heartbeat turn is next; advances the cursor.
    pub fn round_robin_next(&mut self) -> Option<TwcId> {
        if self.sessions.is_empty() {
            return None;
        }

        let id = self.sessions[self.cursor % self.sessions.len()].id;
        self.cursor = (self.cursor + 1) % self.sessions.len();

        Some(id)
    }

    /// Sum of amps every slave reports actually flowing.
    pub fn total_amps_in_use(&self) -> Centiamps {
        self.sessions.iter().map(|s| s.reported_amps_actual).sum()
    }

    #[cfg(test)]
    fn views_agree(&self) -> bool {
        self.sessions.len() == self.index.len()
            && self
                .sessions
                .iter()
                .enumerate()
                .all(|(i, s)| self.index.get(&s.id) == Some(&i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn add(reg: &mut SlaveRegistry, id: [u8; 2]) {
        reg.find_or_create(
            TwcId(id),
            Sign(0x77),
            ProtocolVersion::V1,
            Centiamps::from_whole_amps(80),
            Centiamps::from_whole_amps(40),
            Instant::now(),
        );
    }

    #[test]
    fn create_is_idempotent() {
        let mut reg = SlaveRegistry::new();

        add(&mut reg, [0xAB, 0xCD]);
        add(&mut reg, [0xAB, 0xCD]);

        assert_eq!(reg.len(), 1);
        assert!(reg.views_agree());
    }

    #[test]
    fn fourth_slave_evicts_oldest() {
        let mut reg = SlaveRegistry::new();

        add(&mut reg, [0x00, 0x01]);
        add(&mut reg, [0x00, 0x02]);
        add(&mut reg, [0x00, 0x03]);
        add(&mut reg, [0x00, 0x04]);

        assert_eq!(reg.len(), MAX_SLAVES);
        assert!(reg.get(TwcId([0x00, 0x01])).is_none());
        assert!(reg.get(TwcId([0x00, 0x04])).is_some());
        assert!(reg.views_agree());
    }

    #[test]
    fn round_robin_wraps_in_insertion_order() {
        let mut reg = SlaveRegistry::new();

        add(&mut reg, [0x00, 0x01]);
        add(&mut reg, [0x00, 0x02]);

        assert_eq!(reg.round_robin_next(), Some(TwcId([0x00, 0x01])));
        assert_eq!(reg.round_robin_next(), Some(TwcId([0x00, 0x02])));
        assert_eq!(reg.round_robin_next(), Some(TwcId([0x00, 0x01])));
    }

    #[test]
    fn eviction_normalizes_cursor() {
        let mut reg = SlaveRegistry::new();

        add(&mut reg, [0x00, 0x01]);
        add(&mut reg, [0x00, 0x02]);
        add(&mut reg, [0x00, 0x03]);

        reg.round_robin_next();
        reg.round_robin_next();

        reg.evict(TwcId([0x00, 0x01]));
        reg.evict(TwcId([0x00, 0x03]));

        // Only one entry left; the cursor must still land on it.
        assert_eq!(reg.round_robin_next(), Some(TwcId([0x00, 0x02])));
        assert!(reg.views_agree());
    }

    #[test]
    fn idle_slaves_dropped() {
        let mut reg = SlaveRegistry::new();

        add(&mut reg, [0x00, 0x01]);
        add(&mut reg, [0x00, 0x02]);

        let now = Instant::now() + Duration::from_secs(27);
        reg.get_mut(TwcId([0x00, 0x02])).unwrap().time_last_rx = now;

        assert_eq!(reg.evict_idle(now), 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(TwcId([0x00, 0x01])).is_none());
        assert!(reg.views_agree());
    }

    #[test]
    fn empty_registry_has_no_turn() {
        let mut reg = SlaveRegistry::new();

        assert_eq!(reg.round_robin_next(), None);
        assert_eq!(reg.total_amps_in_use(), Centiamps::ZERO);
    }
}
