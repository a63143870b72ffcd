//! Fixed-grid cycle tracking
//!
//! Wall-clock time is cut into windows of `width`; window `k` covers
//! `[k * width, (k + 1) * width)` and its cycle id is `k`. Each window has
//! three stage offsets (claim, swap, distribute). `CycleTracker::next_due`
//! hands out every stage whose offset has passed exactly once per cycle id,
//! in order, so a delayed tick fires all overdue stages back-to-back.
//!
//! The tracker never reads the clock itself; callers pass `now`, which keeps
//! it testable without real time.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::{CycleId, Stage};

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// `chrono::Utc` backed clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Phase of the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Claiming,
    Swapping,
    Distributing,
    Cooldown,
}

impl CyclePhase {
    fn rank(self) -> u8 {
        match self {
            CyclePhase::Idle => 0,
            CyclePhase::Claiming => 1,
            CyclePhase::Swapping => 2,
            CyclePhase::Distributing => 3,
            CyclePhase::Cooldown => 4,
        }
    }

    /// Phases only move forward within a cycle; `Idle` is re-entered by
    /// starting a new cycle, never by a transition.
    pub fn can_advance_to(self, next: CyclePhase) -> bool {
        next.rank() > self.rank()
    }

    pub fn for_stage(stage: Stage) -> CyclePhase {
        match stage {
            Stage::Claim => CyclePhase::Claiming,
            Stage::Swap => CyclePhase::Swapping,
            Stage::Distribute => CyclePhase::Distributing,
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "Idle"),
            CyclePhase::Claiming => write!(f, "Claiming"),
            CyclePhase::Swapping => write!(f, "Swapping"),
            CyclePhase::Distributing => write!(f, "Distributing"),
            CyclePhase::Cooldown => write!(f, "Cooldown"),
        }
    }
}

/// Window width and stage offsets
#[derive(Debug, Clone)]
pub struct CycleSchedule {
    width_ms: i64,
    claim_offset_ms: i64,
    swap_offset_ms: i64,
    distribute_offset_ms: i64,
}

impl CycleSchedule {
    /// Offsets must be strictly increasing and fall inside the window.
    pub fn new(
        width: Duration,
        claim_offset: Duration,
        swap_offset: Duration,
        distribute_offset: Duration,
    ) -> Result<Self> {
        let width_ms = width.as_millis() as i64;
        let claim_offset_ms = claim_offset.as_millis() as i64;
        let swap_offset_ms = swap_offset.as_millis() as i64;
        let distribute_offset_ms = distribute_offset.as_millis() as i64;

        if width_ms <= 0 {
            bail!("Cycle width must be positive");
        }
        if !(claim_offset_ms < swap_offset_ms && swap_offset_ms < distribute_offset_ms) {
            bail!(
                "Stage offsets must be strictly increasing (claim={}ms, swap={}ms, distribute={}ms)",
                claim_offset_ms,
                swap_offset_ms,
                distribute_offset_ms
            );
        }
        if distribute_offset_ms >= width_ms {
            bail!(
                "Distribute offset {}ms must be inside the {}ms window",
                distribute_offset_ms,
                width_ms
            );
        }

        Ok(Self {
            width_ms,
            claim_offset_ms,
            swap_offset_ms,
            distribute_offset_ms,
        })
    }

    pub fn width(&self) -> Duration {
        Duration::from_millis(self.width_ms as u64)
    }

    pub fn offset_ms(&self, stage: Stage) -> i64 {
        match stage {
            Stage::Claim => self.claim_offset_ms,
            Stage::Swap => self.swap_offset_ms,
            Stage::Distribute => self.distribute_offset_ms,
        }
    }

    /// The cycle containing `now_ms`
    pub fn cycle_at(&self, now_ms: i64) -> Cycle {
        let index = now_ms.div_euclid(self.width_ms);
        let window_start_ms = index * self.width_ms;
        Cycle {
            id: CycleId(index.max(0) as u64),
            window_start_ms,
            window_end_ms: window_start_ms + self.width_ms,
            fired: BTreeSet::new(),
            phase: CyclePhase::Idle,
        }
    }
}

/// One window of the grid and the stages already fired in it
#[derive(Debug, Clone)]
pub struct Cycle {
    pub id: CycleId,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    fired: BTreeSet<Stage>,
    phase: CyclePhase,
}

impl Cycle {
    pub fn has_fired(&self, stage: Stage) -> bool {
        self.fired.contains(&stage)
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.window_start_ms)
            .single()
            .unwrap_or_default()
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.window_end_ms)
            .single()
            .unwrap_or_default()
    }

    fn advance(&mut self, next: CyclePhase) {
        if self.phase.can_advance_to(next) {
            self.phase = next;
        } else {
            warn!(
                "[cycle {}] Ignoring phase transition {} -> {}",
                self.id, self.phase, next
            );
        }
    }
}

/// Hands out due stages at most once per cycle id
#[derive(Debug)]
pub struct CycleTracker {
    schedule: CycleSchedule,
    current: Option<Cycle>,
    clock_behind: bool,
}

impl CycleTracker {
    pub fn new(schedule: CycleSchedule) -> Self {
        Self {
            schedule,
            current: None,
            clock_behind: false,
        }
    }

    pub fn schedule(&self) -> &CycleSchedule {
        &self.schedule
    }

    pub fn current(&self) -> Option<&Cycle> {
        self.current.as_ref()
    }

    pub fn phase(&self) -> CyclePhase {
        self.current.as_ref().map_or(CyclePhase::Idle, |c| c.phase)
    }

    /// Replace the current cycle if `now_ms` is past its window.
    ///
    /// Returns true when a new cycle was started. Unfired stages of the old
    /// cycle are abandoned. Cycle ids never go backwards: a clock that
    /// stepped back keeps the current cycle until it catches up.
    pub fn roll(&mut self, now_ms: i64) -> bool {
        let next = self.schedule.cycle_at(now_ms);
        if let Some(current) = &self.current {
            if next.id == current.id {
                self.clock_behind = false;
                return false;
            }
            if next.id < current.id {
                if !self.clock_behind {
                    warn!(
                        "[cycle {}] Clock moved back into cycle {}, holding until it catches up",
                        current.id, next.id
                    );
                    self.clock_behind = true;
                }
                return false;
            }
        }
        self.clock_behind = false;

        if let Some(old) = &self.current {
            let missed: Vec<&str> = Stage::ALL
                .iter()
                .filter(|s| !old.has_fired(**s))
                .map(|s| s.as_str())
                .collect();
            if !missed.is_empty() {
                warn!(
                    "[cycle {}] Window closed with unfired stage(s): {}",
                    old.id,
                    missed.join(", ")
                );
            }
        }
        info!(
            "[cycle {}] Window {} .. {}",
            next.id,
            next.window_start().format("%H:%M:%S"),
            next.window_end().format("%H:%M:%S")
        );
        self.current = Some(next);
        true
    }

    /// Next overdue stage of the cycle containing `now_ms`, marked fired.
    pub fn next_due(&mut self, now_ms: i64) -> Option<(CycleId, Stage)> {
        self.roll(now_ms);
        let schedule = &self.schedule;
        let cycle = self.current.as_mut()?;
        let elapsed = now_ms - cycle.window_start_ms;

        let stage = Stage::ALL
            .into_iter()
            .find(|s| !cycle.has_fired(*s) && elapsed >= schedule.offset_ms(*s))?;

        cycle.fired.insert(stage);
        cycle.advance(CyclePhase::for_stage(stage));
        debug!("[cycle {}] Stage {} due at +{}ms", cycle.id, stage, elapsed);
        Some((cycle.id, stage))
    }

    /// Mark every unfired stage of the current cycle fired, ignoring offsets.
    ///
    /// Used for operator-triggered runs; still at most once per cycle id.
    pub fn force_due(&mut self, now_ms: i64) -> Vec<(CycleId, Stage)> {
        self.roll(now_ms);
        let Some(cycle) = self.current.as_mut() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for stage in Stage::ALL {
            if cycle.fired.insert(stage) {
                cycle.advance(CyclePhase::for_stage(stage));
                due.push((cycle.id, stage));
            }
        }
        due
    }

    /// Record that a stage finished (or was abandoned) for `id`.
    ///
    /// After distribution the cycle cools down until its window ends.
    pub fn complete(&mut self, id: CycleId, stage: Stage) {
        if let Some(cycle) = self.current.as_mut() {
            if cycle.id == id && stage == Stage::Distribute {
                cycle.advance(CyclePhase::Cooldown);
            }
        }
    }
}
