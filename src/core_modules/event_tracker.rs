// THEORY:
// The `event_tracker` module is the heart of the behavioural analysis layer. It gives
// the detector memory: the stateless local events of one frame are associated with
// the global events followed so far.
//
// Key architectural principles:
// 1.  **Overlap Association**: A local event joins a global event whose accumulated
//     ownership map it touches. When several qualify, the oldest one wins (ties go
//     to the lowest id), which favours long-lived trails over fresh spawns. A global
//     event takes at most one local event per frame; any further touching local
//     events of the same frame only widen its map.
// 2.  **Bounded Concurrency**: Unmatched local events spawn new global events only
//     while fewer than `max_global_events` are active, bounding the per-frame
//     association cost.
// 3.  **Lifecycle Management**:
//     - **Birth**: an unmatched local event seeds a global event.
//     - **Tracking**: every tick ages all events; events seen this tick reset their
//       idle counter.
//     - **Retirement**: events are judged oldest first. An event idle for longer
//       than the grace window is finished and either saved or discarded. A still
//       active event can be killed early (too old, or not moving in a line). Near
//       the end of a finite acquisition pending events are finished right away.
// 4.  **One Save Per Tick**: Discards never stop the retirement loop, but the first
//     save does. Storage downstream therefore receives at most one event per frame.

use crate::core_modules::global_event::{
    DiscardReason, GlobalEvent, KillRules, SaveRules, TrajectoryRules, Verdict,
};
use crate::core_modules::local_event::LocalEvent;
use std::cmp::Reverse;
use tracing::{Span, debug, info};

/// Tuning of the global event lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerParams {
    pub max_global_events: usize,
    /// Idle frames tolerated before an event counts as finished.
    pub grace_frames: u64,
    pub min_local_events: usize,
    pub save_good_transitions: usize,
    pub kill_good_transitions: usize,
    pub max_age: u64,
    pub max_direction_change_deg: f64,
    pub max_frame_gap_ratio: f64,
    /// Pending events are flushed once fewer than this many frames remain.
    pub end_of_stream_frames: u64,
    pub linear_tolerance_px: f64,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_global_events: 10,
            grace_frames: 5,
            min_local_events: 8,
            save_good_transitions: 4,
            kill_good_transitions: 5,
            max_age: 500,
            max_direction_change_deg: 40.0,
            max_frame_gap_ratio: 2.0,
            end_of_stream_frames: 10,
            linear_tolerance_px: 5.0,
        }
    }
}

impl TrackerParams {
    fn trajectory_rules(&self) -> TrajectoryRules {
        TrajectoryRules {
            max_direction_change_deg: self.max_direction_change_deg,
            linear_tolerance_px: self.linear_tolerance_px,
        }
    }

    fn save_rules(&self) -> SaveRules {
        SaveRules {
            min_local_events: self.min_local_events,
            save_good_transitions: self.save_good_transitions,
            max_frame_gap_ratio: self.max_frame_gap_ratio,
        }
    }

    fn kill_rules(&self) -> KillRules {
        KillRules {
            max_age: self.max_age,
            kill_good_transitions: self.kill_good_transitions,
        }
    }
}

/// What happened to the global events during one tick.
#[derive(Debug, Default)]
pub struct TrackerOutcome {
    /// The event promoted to storage this tick, if any.
    pub saved: Option<GlobalEvent>,
    /// Ids of events dropped this tick with the reason.
    pub discarded: Vec<(u64, DiscardReason)>,
    /// Number of global events spawned this tick.
    pub spawned: usize,
}

/// Owns the active global events of one detection session.
pub struct EventTracker {
    params: TrackerParams,
    /// Active events in creation order, so the oldest comes first.
    global_events: Vec<GlobalEvent>,
    next_id: u64,
    span: Span,
}

impl EventTracker {
    pub fn new(params: TrackerParams, span: Span) -> Self {
        Self {
            params,
            global_events: Vec::new(),
            next_id: 0,
            span,
        }
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn global_events(&self) -> &[GlobalEvent] {
        &self.global_events
    }

    /// Drops every active event.
    pub fn reset(&mut self) {
        self.global_events.clear();
    }

    /// Runs association, aging and retirement for one frame.
    ///
    /// `frames_remaining` is the number of frames left in a finite acquisition,
    /// 0 when unknown or unbounded.
    pub fn update(
        &mut self,
        local_events: Vec<LocalEvent>,
        timestamp_us: u64,
        frames_remaining: u64,
        dimensions: (u32, u32),
    ) -> TrackerOutcome {
        let _entered = self.span.enter();
        let mut outcome = TrackerOutcome::default();

        // --- 1. Association ---
        for local_event in local_events {
            let target = self
                .global_events
                .iter()
                .enumerate()
                .filter(|(_, ge)| ge.overlaps(&local_event))
                .max_by_key(|(_, ge)| (ge.age(), Reverse(ge.id())))
                .map(|(index, _)| index);

            match target {
                Some(index) => {
                    let ge = &mut self.global_events[index];
                    if ge.updated_this_tick() {
                        ge.absorb_into_map(&local_event);
                    } else {
                        ge.attach(local_event);
                    }
                }
                None if self.global_events.len() < self.params.max_global_events => {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!(id, frame = local_event.frame_index(), "global event spawned");
                    self.global_events.push(GlobalEvent::new(
                        id,
                        local_event,
                        timestamp_us,
                        dimensions,
                        self.params.trajectory_rules(),
                    ));
                    outcome.spawned += 1;
                }
                None => {
                    debug!(frame = local_event.frame_index(), "local event dropped, global event cap reached");
                }
            }
        }

        // --- 2. Aging ---
        for ge in &mut self.global_events {
            ge.age_one_tick();
        }

        // --- 3. Retirement ---
        let save_rules = self.params.save_rules();
        let kill_rules = self.params.kill_rules();
        let flushing = frames_remaining > 0 && frames_remaining < self.params.end_of_stream_frames;
        let mut index = 0;
        while index < self.global_events.len() {
            let ge = &self.global_events[index];
            let verdict = if ge.age_since_last_update() > self.params.grace_frames {
                Some(ge.finish_verdict(&save_rules))
            } else if let Some(reason) = ge.kill_reason(&kill_rules) {
                Some(Verdict::Discarded(reason))
            } else if flushing {
                Some(ge.finish_verdict(&save_rules))
            } else {
                None
            };

            match verdict {
                None => index += 1,
                Some(Verdict::Discarded(reason)) => {
                    let ge = self.global_events.remove(index);
                    debug!(id = ge.id(), ?reason, local_events = ge.local_events().len(), "global event discarded");
                    outcome.discarded.push((ge.id(), reason));
                }
                Some(Verdict::Saved) => {
                    let ge = self.global_events.remove(index);
                    info!(
                        id = ge.id(),
                        first_frame = ge.first_frame(),
                        last_frame = ge.last_frame(),
                        local_events = ge.local_events().len(),
                        "global event ready to save"
                    );
                    outcome.saved = Some(ge);
                    break;
                }
            }
        }
        outcome
    }
}
