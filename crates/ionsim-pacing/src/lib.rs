//! # ionsim Pacing
//!
//! Stimulus protocols that drive a cell model through its bound pace variables.
//!
//! Two kinds of source exist:
//!
//! - **Event-based** ([`Protocol`] + [`EventPacing`]): rectangular windows of
//!   constant level, optionally repeated with a period. The level is 0 outside
//!   every window. Each window start or end is a discontinuity the simulation
//!   driver must land on exactly, so the cursor reports the next such time.
//! - **Fixed-form** ([`FixedFormProtocol`]): a piecewise-linear table. It has
//!   no abrupt steps and is evaluated directly inside the right-hand side.
//!
//! A [`PacingSystem`] holds one source per binding label.

use ionsim_core::{IonsimError, Result, Time};
use log::debug;
use serde::{Deserialize, Serialize};

// ============================================================================
// EVENT-BASED PROTOCOLS
// ============================================================================

/// A rectangular stimulus window, optionally repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Stimulus level while the window is active
    pub level: f64,
    /// Start of the first occurrence
    pub start: Time,
    /// Window length
    pub duration: Time,
    /// Time between occurrences (0 = one-off)
    #[serde(default)]
    pub period: Time,
    /// Number of occurrences for a periodic event (0 = unbounded)
    #[serde(default)]
    pub multiplier: u32,
}

impl ProtocolEvent {
    fn validate(&self) -> Result<()> {
        if !(self.level.is_finite() && self.start.is_finite()) {
            return Err(IonsimError::InvalidInput(
                "Event level and start must be finite".into(),
            ));
        }
        if !(self.duration >= 0.0 && self.duration.is_finite()) {
            return Err(IonsimError::InvalidInput(format!(
                "Event duration must be non-negative, got {}",
                self.duration
            )));
        }
        if !(self.period >= 0.0 && self.period.is_finite()) {
            return Err(IonsimError::InvalidInput(format!(
                "Event period must be non-negative, got {}",
                self.period
            )));
        }
        if self.period == 0.0 && self.multiplier != 0 {
            return Err(IonsimError::InvalidInput(
                "Non-periodic event cannot have a multiplier".into(),
            ));
        }
        if self.period > 0.0 && self.duration > self.period {
            return Err(IonsimError::InvalidInput(format!(
                "Event duration {} exceeds its period {}",
                self.duration, self.period
            )));
        }
        Ok(())
    }

    fn is_periodic(&self) -> bool {
        self.period > 0.0
    }

    /// Start of occurrence `k`.
    fn occurrence(&self, k: u64) -> Time {
        self.start + k as f64 * self.period
    }

    fn has_occurrence(&self, k: u64) -> bool {
        if !self.is_periodic() {
            return k == 0;
        }
        self.multiplier == 0 || k < u64::from(self.multiplier)
    }
}

/// An event-based pacing protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    events: Vec<ProtocolEvent>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a protocol from a list of events, validating each.
    pub fn from_events(events: Vec<ProtocolEvent>) -> Result<Self> {
        let mut protocol = Self::new();
        for event in events {
            protocol.add(event)?;
        }
        Ok(protocol)
    }

    /// Schedule a new event.
    pub fn schedule(
        &mut self,
        level: f64,
        start: Time,
        duration: Time,
        period: Time,
        multiplier: u32,
    ) -> Result<()> {
        self.add(ProtocolEvent {
            level,
            start,
            duration,
            period,
            multiplier,
        })
    }

    fn add(&mut self, event: ProtocolEvent) -> Result<()> {
        event.validate()?;
        // Overlaps between periodic events are detected while pacing
        if !event.is_periodic() && event.duration > 0.0 {
            let end = event.start + event.duration;
            let clash = self.events.iter().find(|other| {
                !other.is_periodic()
                    && other.duration > 0.0
                    && event.start < other.start + other.duration
                    && other.start < end
            });
            if let Some(other) = clash {
                return Err(IonsimError::InvalidInput(format!(
                    "Event at t = {} overlaps event at t = {}",
                    event.start, other.start
                )));
            }
        }
        let position = self.events.partition_point(|e| e.start <= event.start);
        self.events.insert(position, event);
        Ok(())
    }

    /// Periodic block pulses of `level`, starting at `offset`.
    pub fn blocktrain(
        period: Time,
        duration: Time,
        offset: Time,
        level: f64,
        limit: u32,
    ) -> Result<Self> {
        let mut protocol = Self::new();
        protocol.schedule(level, offset, duration, period, limit)?;
        Ok(protocol)
    }

    /// Voltage-step train: for every step, hold for `tpre`, step for `tstep`,
    /// then hold for `tpost`.
    pub fn steptrain(
        steps: &[f64],
        hold: f64,
        tpre: Time,
        tstep: Time,
        tpost: Time,
    ) -> Result<Self> {
        let mut protocol = Self::new();
        let mut t = 0.0;
        for &level in steps {
            protocol.schedule(hold, t, tpre, 0.0, 0)?;
            protocol.schedule(level, t + tpre, tstep, 0.0, 0)?;
            protocol.schedule(hold, t + tpre + tstep, tpost, 0.0, 0)?;
            t += tpre + tstep + tpost;
        }
        Ok(protocol)
    }

    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        self.events.iter().try_for_each(ProtocolEvent::validate)
    }

    /// End of the last finite event, or the period of the longest-running
    /// unbounded periodic event.
    pub fn characteristic_time(&self) -> Time {
        let mut t: Time = 0.0;
        for event in &self.events {
            if event.is_periodic() && event.multiplier == 0 {
                t = t.max(event.start + event.period);
            } else {
                let count = if event.is_periodic() { event.multiplier } else { 1 };
                let last = event.occurrence(u64::from(count.saturating_sub(1)));
                t = t.max(last + event.duration);
            }
        }
        t
    }

    /// Level of the protocol at time `t`, without any cursor state.
    pub fn level_at(&self, t: Time) -> f64 {
        for event in &self.events {
            if t < event.start {
                continue;
            }
            let k = if event.is_periodic() {
                ((t - event.start) / event.period).floor() as u64
            } else {
                0
            };
            // Guard against floor() landing one occurrence late
            for k in [k.saturating_sub(1), k] {
                if !event.has_occurrence(k) {
                    continue;
                }
                let start = event.occurrence(k);
                if start <= t && t < start + event.duration {
                    return event.level;
                }
            }
        }
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    start: Time,
    event: usize,
    occurrence: u64,
}

/// Stateful cursor over an event-based protocol.
#[derive(Debug, Clone)]
pub struct EventPacing {
    events: Vec<ProtocolEvent>,
    queue: Vec<Pending>,
    time: Time,
    tnext: Time,
    tdown: Time,
    level: f64,
    active: bool,
}

impl EventPacing {
    /// Create a cursor positioned before the first event.
    pub fn populate(protocol: &Protocol) -> Result<Self> {
        protocol.validate()?;
        let events = protocol.events().to_vec();
        let mut queue: Vec<Pending> = events
            .iter()
            .enumerate()
            .map(|(event, e)| Pending {
                start: e.start,
                event,
                occurrence: 0,
            })
            .collect();
        queue.sort_by(|a, b| a.start.total_cmp(&b.start));
        let tnext = queue.first().map_or(f64::INFINITY, |p| p.start);
        debug!("Event pacing populated with {} events", events.len());
        Ok(Self {
            events,
            queue,
            time: f64::NEG_INFINITY,
            tnext,
            tdown: f64::INFINITY,
            level: 0.0,
            active: false,
        })
    }

    /// Move the cursor to `new_time`, firing and ending windows on the way.
    pub fn advance_time(&mut self, new_time: Time) -> Result<()> {
        if new_time < self.time {
            return Err(IonsimError::InvalidInput(format!(
                "Pacing cannot go back in time (from {} to {new_time})",
                self.time
            )));
        }
        while self.tnext <= new_time {
            if self.active && self.tnext >= self.tdown {
                self.active = false;
                self.level = 0.0;
            }
            if let Some(pending) = self.queue.first().copied() {
                if pending.start <= self.tnext {
                    if self.active {
                        return Err(IonsimError::InvalidInput(format!(
                            "Event starting at t = {} overlaps an active event",
                            pending.start
                        )));
                    }
                    self.queue.remove(0);
                    let event = &self.events[pending.event];
                    self.level = event.level;
                    self.tdown = pending.start + event.duration;
                    self.active = true;

                    let next = pending.occurrence + 1;
                    if event.is_periodic() && event.has_occurrence(next) {
                        let start = event.occurrence(next);
                        let position = self.queue.partition_point(|p| p.start <= start);
                        self.queue.insert(
                            position,
                            Pending {
                                start,
                                event: pending.event,
                                occurrence: next,
                            },
                        );
                    }
                }
            }
            let next_start = self.queue.first().map_or(f64::INFINITY, |p| p.start);
            self.tnext = if self.active {
                next_start.min(self.tdown)
            } else {
                next_start
            };
        }
        self.time = new_time;
        Ok(())
    }

    /// Next window start or end after the current time (infinity if none).
    pub fn next_time(&self) -> Time {
        self.tnext
    }

    /// Current level (0 outside every window).
    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn time(&self) -> Time {
        self.time
    }
}

// ============================================================================
// FIXED-FORM PROTOCOLS
// ============================================================================

/// Piecewise-linear stimulus table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedFormProtocol {
    times: Vec<Time>,
    values: Vec<f64>,
}

impl FixedFormProtocol {
    pub fn new(times: Vec<Time>, values: Vec<f64>) -> Result<Self> {
        let protocol = Self { times, values };
        protocol.validate()?;
        Ok(protocol)
    }

    pub fn validate(&self) -> Result<()> {
        if self.times.len() != self.values.len() {
            return Err(IonsimError::InvalidInput(format!(
                "Fixed-form protocol has {} times but {} values",
                self.times.len(),
                self.values.len()
            )));
        }
        if self.times.len() < 2 {
            return Err(IonsimError::InvalidInput(
                "Fixed-form protocol needs at least two points".into(),
            ));
        }
        if self.times.iter().chain(&self.values).any(|v| !v.is_finite()) {
            return Err(IonsimError::InvalidInput(
                "Fixed-form protocol contains non-finite values".into(),
            ));
        }
        if self.times.windows(2).any(|w| w[1] < w[0]) {
            return Err(IonsimError::InvalidInput(
                "Fixed-form protocol times must be non-decreasing".into(),
            ));
        }
        Ok(())
    }

    pub fn times(&self) -> &[Time] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Linearly interpolated level, held constant outside the table.
    pub fn level_at(&self, t: Time) -> f64 {
        let (Some(&first), Some(&last)) = (self.times.first(), self.times.last()) else {
            return 0.0;
        };
        if t <= first {
            return self.values[0];
        }
        if t >= last {
            return self.values[self.values.len() - 1];
        }
        let hi = self.times.partition_point(|&x| x <= t);
        let lo = hi - 1;
        let (t0, t1) = (self.times[lo], self.times[hi]);
        let (v0, v1) = (self.values[lo], self.values[hi]);
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }
}

// ============================================================================
// PACING SYSTEM
// ============================================================================

/// Serializable description of one pacing source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolSpec {
    Events { events: Vec<ProtocolEvent> },
    FixedForm { times: Vec<Time>, values: Vec<f64> },
}

impl ProtocolSpec {
    pub fn events(protocol: &Protocol) -> Self {
        Self::Events {
            events: protocol.events().to_vec(),
        }
    }

    pub fn fixed_form(protocol: &FixedFormProtocol) -> Self {
        Self::FixedForm {
            times: protocol.times().to_vec(),
            values: protocol.values().to_vec(),
        }
    }
}

/// A live pacing source in one slot.
#[derive(Debug, Clone)]
pub enum PacingSource {
    Event(EventPacing),
    FixedForm(FixedFormProtocol),
}

impl PacingSource {
    pub fn from_spec(spec: &ProtocolSpec) -> Result<Self> {
        match spec {
            ProtocolSpec::Events { events } => {
                let protocol = Protocol::from_events(events.clone())?;
                Ok(Self::Event(EventPacing::populate(&protocol)?))
            }
            ProtocolSpec::FixedForm { times, values } => Ok(Self::FixedForm(
                FixedFormProtocol::new(times.clone(), values.clone())?,
            )),
        }
    }
}

/// One pacing source per binding label.
#[derive(Debug, Clone, Default)]
pub struct PacingSystem {
    labels: Vec<String>,
    sources: Vec<PacingSource>,
    time: Time,
}

impl PacingSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source and return its slot index.
    pub fn add(&mut self, label: &str, source: PacingSource) -> Result<usize> {
        if self.slot(label).is_some() {
            return Err(IonsimError::InvalidInput(format!(
                "Duplicate pacing label: {label}"
            )));
        }
        self.labels.push(label.to_string());
        self.sources.push(source);
        Ok(self.sources.len() - 1)
    }

    pub fn add_spec(&mut self, label: &str, spec: &ProtocolSpec) -> Result<usize> {
        self.add(label, PacingSource::from_spec(spec)?)
    }

    pub fn slot(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Advance every event-based source to `t`.
    pub fn advance_time(&mut self, t: Time) -> Result<()> {
        for source in &mut self.sources {
            if let PacingSource::Event(cursor) = source {
                cursor.advance_time(t)?;
            }
        }
        self.time = t;
        Ok(())
    }

    /// Earliest upcoming discontinuity over all event-based sources.
    pub fn next_time(&self) -> Time {
        self.sources
            .iter()
            .filter_map(|s| match s {
                PacingSource::Event(cursor) => Some(cursor.next_time()),
                PacingSource::FixedForm(_) => None,
            })
            .fold(f64::INFINITY, f64::min)
    }

    /// Level of slot `slot`: the current event level, or the fixed-form table
    /// evaluated at `t`.
    pub fn level(&self, slot: usize, t: Time) -> f64 {
        match self.sources.get(slot) {
            Some(PacingSource::Event(cursor)) => cursor.level(),
            Some(PacingSource::FixedForm(table)) => table.level_at(t),
            None => 0.0,
        }
    }

    pub fn time(&self) -> Time {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_pulse() -> Protocol {
        let mut p = Protocol::new();
        p.schedule(1.0, 10.0, 0.5, 0.0, 0).unwrap();
        p
    }

    #[test]
    fn test_window_boundaries_are_half_open() {
        let mut cursor = EventPacing::populate(&single_pulse()).unwrap();
        cursor.advance_time(0.0).unwrap();
        assert_eq!(cursor.level(), 0.0);
        assert_eq!(cursor.next_time(), 10.0);

        cursor.advance_time(9.999999).unwrap();
        assert_eq!(cursor.level(), 0.0);
        cursor.advance_time(10.0).unwrap();
        assert_eq!(cursor.level(), 1.0);
        assert_eq!(cursor.next_time(), 10.5);
        cursor.advance_time(10.5).unwrap();
        assert_eq!(cursor.level(), 0.0);
        assert_eq!(cursor.next_time(), f64::INFINITY);
    }

    #[test]
    fn test_advance_is_idempotent_inside_window() {
        let mut cursor = EventPacing::populate(&single_pulse()).unwrap();
        cursor.advance_time(10.2).unwrap();
        cursor.advance_time(10.2).unwrap();
        assert_eq!(cursor.level(), 1.0);
        assert_eq!(cursor.next_time(), 10.5);
    }

    #[test]
    fn test_cannot_go_back() {
        let mut cursor = EventPacing::populate(&single_pulse()).unwrap();
        cursor.advance_time(5.0).unwrap();
        assert!(matches!(
            cursor.advance_time(4.0),
            Err(IonsimError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_periodic_with_multiplier() {
        let protocol = Protocol::blocktrain(100.0, 2.0, 10.0, 1.0, 3).unwrap();
        let mut cursor = EventPacing::populate(&protocol).unwrap();
        let mut starts = Vec::new();
        let mut t = 0.0;
        while cursor.next_time().is_finite() {
            t = cursor.next_time();
            cursor.advance_time(t).unwrap();
            if cursor.level() == 1.0 {
                starts.push(t);
            }
        }
        assert_eq!(starts, vec![10.0, 110.0, 210.0]);
        assert_eq!(t, 212.0);
        assert_eq!(protocol.characteristic_time(), 212.0);
    }

    #[test]
    fn test_unbounded_periodic_event() {
        let protocol = Protocol::blocktrain(1000.0, 0.5, 50.0, 1.0, 0).unwrap();
        let mut cursor = EventPacing::populate(&protocol).unwrap();
        cursor.advance_time(10_050.25).unwrap();
        assert_eq!(cursor.level(), 1.0);
        assert_eq!(cursor.next_time(), 10_050.5);
        assert_eq!(protocol.level_at(10_050.25), 1.0);
        assert_eq!(protocol.level_at(10_050.5), 0.0);
    }

    #[test]
    fn test_level_query_matches_cursor() {
        let protocol = single_pulse();
        assert_eq!(protocol.level_at(9.999999), 0.0);
        assert_eq!(protocol.level_at(10.0), 1.0);
        assert_eq!(protocol.level_at(10.5), 0.0);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut p = single_pulse();
        assert!(p.schedule(2.0, 10.25, 1.0, 0.0, 0).is_err());
        // Touching windows are fine
        p.schedule(2.0, 10.5, 1.0, 0.0, 0).unwrap();
    }

    #[test]
    fn test_periodic_overlap_detected_while_pacing() {
        let mut p = Protocol::new();
        p.schedule(1.0, 0.0, 5.0, 10.0, 0).unwrap();
        p.schedule(2.0, 12.0, 5.0, 0.0, 0).unwrap();
        let mut cursor = EventPacing::populate(&p).unwrap();
        assert!(cursor.advance_time(20.0).is_err());
    }

    #[test]
    fn test_invalid_events() {
        let mut p = Protocol::new();
        assert!(p.schedule(1.0, 0.0, -1.0, 0.0, 0).is_err());
        assert!(p.schedule(1.0, 0.0, 1.0, 0.0, 2).is_err());
        assert!(p.schedule(1.0, 0.0, 5.0, 2.0, 0).is_err());
    }

    #[test]
    fn test_steptrain() {
        let p = Protocol::steptrain(&[-20.0, 0.0], -80.0, 10.0, 5.0, 10.0).unwrap();
        assert_eq!(p.events().len(), 6);
        assert_eq!(p.level_at(12.0), -20.0);
        assert_eq!(p.level_at(37.0), 0.0);
        assert_eq!(p.level_at(45.0), -80.0);
    }

    #[test]
    fn test_fixed_form_interpolation() {
        let table = FixedFormProtocol::new(vec![0.0, 1.0, 3.0], vec![0.0, 2.0, -2.0]).unwrap();
        assert_eq!(table.level_at(-1.0), 0.0);
        assert_eq!(table.level_at(0.5), 1.0);
        assert_eq!(table.level_at(1.0), 2.0);
        assert_eq!(table.level_at(2.0), 0.0);
        assert_eq!(table.level_at(5.0), -2.0);
    }

    #[test]
    fn test_fixed_form_validation() {
        assert!(FixedFormProtocol::new(vec![0.0], vec![1.0]).is_err());
        assert!(FixedFormProtocol::new(vec![0.0, 1.0], vec![1.0]).is_err());
        assert!(FixedFormProtocol::new(vec![1.0, 0.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_system_takes_minimum_next_time() {
        let mut system = PacingSystem::new();
        system
            .add("pace", PacingSource::Event(EventPacing::populate(&single_pulse()).unwrap()))
            .unwrap();
        let other = Protocol::blocktrain(7.0, 1.0, 3.0, 2.0, 0).unwrap();
        system
            .add("other", PacingSource::Event(EventPacing::populate(&other).unwrap()))
            .unwrap();
        let table = FixedFormProtocol::new(vec![0.0, 10.0], vec![0.0, 10.0]).unwrap();
        system.add("clamp", PacingSource::FixedForm(table)).unwrap();

        system.advance_time(0.0).unwrap();
        assert_eq!(system.next_time(), 3.0);
        system.advance_time(3.0).unwrap();
        assert_eq!(system.level(1, 3.0), 2.0);
        assert_eq!(system.next_time(), 4.0);
        assert_eq!(system.level(2, 4.5), 4.5);
        assert!(system.add("pace", PacingSource::FixedForm(
            FixedFormProtocol::new(vec![0.0, 1.0], vec![0.0, 0.0]).unwrap()
        )).is_err());
    }

    #[test]
    fn test_spec_round_trip_through_json() {
        let json = r#"{"kind": "events", "events": [{"level": 1.0, "start": 10.0, "duration": 0.5}]}"#;
        let spec: ProtocolSpec = serde_json::from_str(json).unwrap();
        let PacingSource::Event(cursor) = PacingSource::from_spec(&spec).unwrap() else {
            panic!("expected an event source");
        };
        assert_eq!(cursor.next_time(), 10.0);
    }
}
