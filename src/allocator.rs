//! Amperage budget computation and per-slave division.
//!
//! The budget is a pure function of telemetry, schedule policy and the
//! charge-now override; replaying identical inputs yields identical
//! outputs. Policy precedence is strictly `chargeNow > scheduled >
//! nonScheduled > green energy`, where `None` (persisted as `-1`) means a
//! tier is unset and evaluation falls through to the next.

use crate::amps::Centiamps;
use crate::registry::SlaveRegistry;
use bitflags::bitflags;
use std::collections::HashMap;
use std::time::Instant;

/// North American chargers see a nominal 240 V line; generation and
/// consumption telemetry converts to amps at this voltage.
pub const LINE_VOLTS: u32 = 240;

bitflags! {
    /// Days a scheduled charging window applies to. Bit 0 is Monday.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Days: u8 {
        const MONDAY = 1 << 0;
        const TUESDAY = 1 << 1;
        const WEDNESDAY = 1 << 2;
        const THURSDAY = 1 << 3;
        const FRIDAY = 1 << 4;
        const SATURDAY = 1 << 5;
        const SUNDAY = 1 << 6;
    }
}

impl Days {
    pub fn contains_weekday(self, weekday_from_monday: u32) -> bool {
        self.bits() & (1u8 << weekday_from_monday) != 0
    }
}

impl Default for Days {
    fn default() -> Self {
        Self::all()
    }
}

/// The operator's scheduled charging window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Amps while inside the window. `None` disables the tier.
    pub scheduled_amps_max: Option<Centiamps>,
    /// Window start, minutes after local midnight.
    pub start_minutes: Option<u16>,
    /// Window end, minutes after local midnight. May be before the start,
    /// in which case the window wraps midnight and is keyed on the bitmap
    /// bit of the day it started.
    pub end_minutes: Option<u16>,
    pub days: Days,
}

impl SchedulePolicy {
    pub fn in_window(&self, weekday_from_monday: u32, minute_of_day: u16) -> bool {
        let (Some(start), Some(end)) = (self.start_minutes, self.end_minutes) else {
            return false;
        };

        if start <= end {
            self.days.contains_weekday(weekday_from_monday)
                && (start..end).contains(&minute_of_day)
        } else {
            let yesterday = (weekday_from_monday + 6) % 7;

            (self.days.contains_weekday(weekday_from_monday) && minute_of_day >= start)
                || (self.days.contains_weekday(yesterday) && minute_of_day < end)
        }
    }
}

/// Process-wide allocator inputs and outputs, shared between the bus loop
/// and the background worker behind one mutex. Lock holders only snapshot
/// or write — no I/O under the lock.
#[derive(Debug, Default)]
pub struct AllocatorState {
    generation_sources: HashMap<String, f64>,
    consumption_sources: HashMap<String, f64>,
    /// Exclude our own chargers' draw from the consumption figure.
    pub subtract_charger_load: bool,
    /// Sum of `reported_amps_actual` over the registry, refreshed by the
    /// bus loop every tick.
    pub total_amps_in_use: Centiamps,
    /// The budget most recently handed to the division step.
    pub max_amps_to_divide: Centiamps,
    pub schedule: SchedulePolicy,
    /// Amps outside the scheduled window. `None` falls through to green
    /// energy tracking.
    pub non_scheduled_amps_max: Option<Centiamps>,
    /// Local time (minutes after midnight) at which `non_scheduled` is
    /// cleared so green energy tracking resumes.
    pub hour_resume_green: Option<u16>,
    pub charge_now_amps: Centiamps,
    pub charge_now_until: Option<Instant>,
    /// Lifetime energy delivered while impersonating a slave.
    pub kwh_delivered: f64,
}

impl AllocatorState {
    pub fn new(subtract_charger_load: bool) -> Self {
        Self {
            subtract_charger_load,
            ..Self::default()
        }
    }

    pub fn set_generation(&mut self, source: &str, watts: f64) {
        self.generation_sources.insert(source.to_owned(), watts);
    }

    pub fn set_consumption(&mut self, source: &str, watts: f64) {
        self.consumption_sources.insert(source.to_owned(), watts);
    }

    /// Total generation in watts, never negative.
    pub fn generation_w(&self) -> f64 {
        self.generation_sources.values().sum::<f64>().max(0.0)
    }

    /// Total consumption in watts, never negative.
    pub fn consumption_w(&self) -> f64 {
        self.consumption_sources.values().sum::<f64>().max(0.0)
    }

    /// The load our own chargers put on the house feed.
    pub fn charger_load_w(&self) -> f64 {
        self.total_amps_in_use.watts_at(LINE_VOLTS)
    }

    /// Watts to subtract from generation before conversion to amps.
    fn generation_offset_w(&self) -> f64 {
        let mut offset = self.consumption_w();

        if self.subtract_charger_load {
            offset -= self.charger_load_w();
        }

        offset.max(0.0)
    }

    /// Amps derivable from surplus generation alone.
    pub fn green_budget(&self) -> Centiamps {
        let surplus = (self.generation_w() - self.generation_offset_w()).max(0.0);

        Centiamps::from_watts(surplus, LINE_VOLTS)
    }

    pub fn charge_now_active(&self, now: Instant) -> bool {
        self.charge_now_until.is_some_and(|until| now < until)
    }

    pub fn start_charge_now(&mut self, amps: Centiamps, until: Instant) {
        self.charge_now_amps = amps;
        self.charge_now_until = Some(until);
    }

    pub fn cancel_charge_now(&mut self) {
        self.charge_now_amps = Centiamps::ZERO;
        self.charge_now_until = None;
    }

    /// Evaluate the policy chain and clamp to the aggregate wiring limit.
    pub fn compute_budget(
        &self,
        weekday_from_monday: u32,
        minute_of_day: u16,
        now: Instant,
        wiring_max_all: Centiamps,
    ) -> Centiamps {
        let budget = if self.charge_now_active(now) {
            self.charge_now_amps
        } else if let Some(scheduled) = self
            .schedule
            .scheduled_amps_max
            .filter(|_| self.schedule.in_window(weekday_from_monday, minute_of_day))
        {
            scheduled
        } else if let Some(non_scheduled) = self.non_scheduled_amps_max {
            non_scheduled
        } else {
            self.green_budget()
        };

        budget.min(wiring_max_all)
    }
}

/// Spread a budget across the registry, writing each session's offer.
///
/// Shares are equal, clamped to `[min_amps, per-slave ceiling]` and
/// rounded down to a tenth of an amp. When the budget cannot give every
/// slave the minimum, slaves already drawing current keep their place and
/// idle ones are shed first, in reverse registry order. A budget below the
/// minimum stops everyone.
pub fn divide_among_slaves(
    budget: Centiamps,
    min_amps: Centiamps,
    registry: &mut SlaveRegistry,
) {
    if registry.is_empty() {
        return;
    }

    if budget < min_amps {
        for session in registry.iter_mut() {
            session.set_offer(Centiamps::ZERO);
        }

        return;
    }

    // Charging slaves first, idle ones after, registry order within each
    // group. Only the first `n` get a share.
    let mut order: Vec<(bool, crate::message::TwcId)> = registry
        .iter()
        .map(|s| (s.is_charging(), s.id))
        .collect();
    order.sort_by_key(|(charging, _)| !charging);

    let mut n = order.len();
    let mut share = budget.div(n as u32);

    while share < min_amps && n > 1 {
        n -= 1;
        share = budget.div(n as u32);
    }

    for (i, (_, id)) in order.iter().enumerate() {
        let Some(session) = registry.get_mut(*id) else {
            continue;
        };

        let offer = if i < n && session.offer_ceiling() >= min_amps {
            share.clamp(min_amps, session.offer_ceiling()).floor_tenth()
        } else {
            Centiamps::ZERO
        };

        session.set_offer(offer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ProtocolVersion, Sign, TwcId};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry_with(outlets: &[(u32, u32)]) -> SlaveRegistry {
        let mut reg = SlaveRegistry::new();

        for (i, (max, wiring)) in outlets.iter().enumerate() {
            reg.find_or_create(
                TwcId([0x00, i as u8 + 1]),
                Sign(0x77),
                ProtocolVersion::V1,
                Centiamps::from_whole_amps(*max),
                Centiamps::from_whole_amps(*wiring),
                Instant::now(),
            );
        }

        reg
    }

    fn offers(reg: &SlaveRegistry) -> Vec<Centiamps> {
        reg.iter().map(|s| s.last_amps_offered()).collect()
    }

    #[test]
    fn green_surplus_split_equally() {
        let mut state = AllocatorState::new(false);
        state.set_generation("inverter", 15360.0);
        state.set_consumption("house", 0.0);

        let budget = state.compute_budget(0, 600, Instant::now(), Centiamps::from_whole_amps(60));

        // 64 A of surplus clamped to the 60 A wiring limit.
        assert_eq!(budget, Centiamps::from_whole_amps(60));

        let mut reg = registry_with(&[(80, 40), (80, 40)]);
        divide_among_slaves(budget, Centiamps::from_whole_amps(6), &mut reg);

        assert_eq!(
            offers(&reg),
            vec![Centiamps(3000), Centiamps(3000)]
        );
        assert!(reg.iter().map(|s| s.last_amps_offered()).sum::<Centiamps>() <= budget);
    }

    #[test]
    fn policy_precedence_is_strict() {
        let mut state = AllocatorState::new(false);
        state.set_generation("inverter", 2400.0);
        state.non_scheduled_amps_max = Some(Centiamps::from_whole_amps(12));
        state.schedule = SchedulePolicy {
            scheduled_amps_max: Some(Centiamps::from_whole_amps(20)),
            start_minutes: Some(0),
            end_minutes: Some(24 * 60),
            days: Days::all(),
        };

        let now = Instant::now();
        let wiring = Centiamps::from_whole_amps(80);

        state.start_charge_now(Centiamps::from_whole_amps(40), now + Duration::from_secs(60));
        assert_eq!(state.compute_budget(0, 600, now, wiring), Centiamps(4000));

        state.cancel_charge_now();
        assert_eq!(state.compute_budget(0, 600, now, wiring), Centiamps(2000));

        state.schedule.scheduled_amps_max = None;
        assert_eq!(state.compute_budget(0, 600, now, wiring), Centiamps(1200));

        state.non_scheduled_amps_max = None;
        // 2400 W / 240 V green fallback.
        assert_eq!(state.compute_budget(0, 600, now, wiring), Centiamps(1000));
    }

    #[test]
    fn expired_charge_now_falls_through() {
        let mut state = AllocatorState::new(false);
        let now = Instant::now();

        state.start_charge_now(Centiamps::from_whole_amps(40), now);

        assert_eq!(
            state.compute_budget(0, 600, now, Centiamps::from_whole_amps(80)),
            Centiamps::ZERO
        );
    }

    #[test]
    fn scheduled_window_respects_days() {
        let schedule = SchedulePolicy {
            scheduled_amps_max: Some(Centiamps::from_whole_amps(20)),
            start_minutes: Some(8 * 60),
            end_minutes: Some(17 * 60),
            days: Days::MONDAY | Days::FRIDAY,
        };

        assert!(schedule.in_window(0, 9 * 60));
        assert!(!schedule.in_window(1, 9 * 60));
        assert!(!schedule.in_window(0, 17 * 60));
    }

    #[test]
    fn scheduled_window_wraps_midnight() {
        let schedule = SchedulePolicy {
            scheduled_amps_max: Some(Centiamps::from_whole_amps(20)),
            start_minutes: Some(22 * 60),
            end_minutes: Some(6 * 60),
            days: Days::MONDAY,
        };

        // Monday 23:00 is inside, Tuesday 05:00 belongs to Monday's window.
        assert!(schedule.in_window(0, 23 * 60));
        assert!(schedule.in_window(1, 5 * 60));
        assert!(!schedule.in_window(1, 7 * 60));
        assert!(!schedule.in_window(3, 23 * 60));
    }

    #[test]
    fn subtracting_charger_load_restores_surplus() {
        let mut state = AllocatorState::new(true);
        state.set_generation("inverter", 9600.0);
        state.set_consumption("house", 7200.0);
        state.total_amps_in_use = Centiamps::from_whole_amps(30);

        // The 30 A our own chargers draw is 7200 W of the consumption, so
        // the full generation is surplus.
        assert_eq!(state.green_budget(), Centiamps::from_whole_amps(40));
    }

    #[test]
    fn budget_below_minimum_stops_everyone() {
        let mut reg = registry_with(&[(80, 40), (80, 40)]);

        for session in reg.iter_mut() {
            session.set_offer(Centiamps::from_whole_amps(10));
        }

        divide_among_slaves(
            Centiamps::from_whole_amps(5),
            Centiamps::from_whole_amps(6),
            &mut reg,
        );

        assert_eq!(offers(&reg), vec![Centiamps::ZERO, Centiamps::ZERO]);
    }

    #[test]
    fn charging_slave_kept_when_budget_short() {
        let mut reg = registry_with(&[(80, 40), (80, 40)]);

        // Second slave is mid-charge, first is idle.
        reg.get_mut(TwcId([0x00, 0x02])).unwrap().reported_amps_actual =
            Centiamps::from_whole_amps(9);

        divide_among_slaves(
            Centiamps::from_whole_amps(10),
            Centiamps::from_whole_amps(6),
            &mut reg,
        );

        assert_eq!(
            offers(&reg),
            vec![Centiamps::ZERO, Centiamps::from_whole_amps(10)]
        );
    }

    #[test]
    fn shares_round_down_to_tenths() {
        let mut reg = registry_with(&[(80, 40), (80, 40), (80, 40)]);

        divide_among_slaves(
            Centiamps::from_whole_amps(20),
            Centiamps::from_whole_amps(6),
            &mut reg,
        );

        // 20 / 3 = 6.66 A, floored to 6.6 A each.
        assert_eq!(
            offers(&reg),
            vec![Centiamps(660), Centiamps(660), Centiamps(660)]
        );
    }
}
