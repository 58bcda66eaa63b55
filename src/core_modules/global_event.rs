// THEORY:
// A `GlobalEvent` is a candidate meteor trail followed across several frames. It is
// the temporal counterpart of a `LocalEvent`: every frame it is seen in contributes
// exactly one local event and one "main point" (that event's mass centre).
//
// Key architectural principles:
// 1.  **Accumulated Ownership**: The event keeps a full-frame binary map holding the
//     union of everything it has owned. Association of new local events is a pure
//     overlap test against this map; no distance gating is needed.
// 2.  **Trajectory Judgement**: Every new main point creates a transition. A
//     transition is valid when it keeps moving and does not turn by more than a
//     fixed angle. Runs of valid and invalid transitions, plus a straight-line
//     fit through the first and last main points, are the physical prior that
//     separates a meteor from noise, blinking stars or aircraft lights.
// 3.  **Lifecycle Bookkeeping**: Ages are counted in frames. `age` grows every tick;
//     `age_since_last_update` only grows on ticks without a new local event, so
//     `age >= age_since_last_update` always holds.
// 4.  **Self-Contained Verdict**: The event can judge itself (`finish_verdict`,
//     `kill_reason`). The tracker only decides *when* to ask.

use crate::core_modules::local_event::{LocalEvent, Rect};
use image::GrayImage;
use std::fmt::Write as _;

/// Geometric rules used to judge a trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryRules {
    /// Largest allowed turn between two consecutive steps, in degrees.
    pub max_direction_change_deg: f64,
    /// Largest allowed distance of a main point from the first-last line, in pixels.
    pub linear_tolerance_px: f64,
}

impl Default for TrajectoryRules {
    fn default() -> Self {
        Self {
            max_direction_change_deg: 40.0,
            linear_tolerance_px: 5.0,
        }
    }
}

/// Thresholds of the save test applied to a finished event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaveRules {
    pub min_local_events: usize,
    pub save_good_transitions: usize,
    pub max_frame_gap_ratio: f64,
}

/// Thresholds of the early kill test applied to an event still in its grace window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KillRules {
    pub max_age: u64,
    pub kill_good_transitions: usize,
}

/// Why a global event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    TooFewLocalEvents,
    UnstableTrajectory,
    IrregularSpacing,
    MaxAge,
    NotLinearRecently,
    NotLinearMostly,
}

/// Outcome of judging a global event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Saved,
    Discarded(DiscardReason),
}

/// One row of a saved event's trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub frame_index: u64,
    pub x: f64,
    pub y: f64,
    pub area: usize,
    /// Validity of the transition that led to this point; `None` for the first one.
    pub transition_valid: Option<bool>,
}

/// Everything the storage layer receives for a saved event.
#[derive(Debug, Clone)]
pub struct DetectedEvent {
    pub id: u64,
    pub created_at_us: u64,
    pub first_frame: u64,
    pub last_frame: u64,
    pub ownership_map: GrayImage,
    pub bounds: Rect,
    pub trajectory: Vec<TrajectoryPoint>,
    pub report: String,
    /// (frame index, difference std-dev) over the event's frames, when recorded.
    pub noise: Vec<(u64, f64)>,
}

#[derive(Debug, Clone)]
pub struct GlobalEvent {
    id: u64,
    created_at_us: u64,
    first_frame: u64,
    last_frame: u64,
    /// Union of the ownership of every attached local event.
    map: GrayImage,
    local_events: Vec<LocalEvent>,
    /// Mass centre of each attached local event, same order and length.
    main_points: Vec<(f64, f64)>,
    /// One flag per step between consecutive main points.
    transitions: Vec<bool>,
    bad_run: usize,
    longest_bad_run: usize,
    linear: bool,
    age: u64,
    age_since_last_update: u64,
    updated_this_tick: bool,
    rules: TrajectoryRules,
}

impl GlobalEvent {
    /// Seeds a new global event from its first local event.
    pub fn new(
        id: u64,
        seed: LocalEvent,
        created_at_us: u64,
        (width, height): (u32, u32),
        rules: TrajectoryRules,
    ) -> Self {
        let frame_index = seed.frame_index();
        let mut event = Self {
            id,
            created_at_us,
            first_frame: frame_index,
            last_frame: frame_index,
            map: GrayImage::new(width, height),
            local_events: Vec::new(),
            main_points: Vec::new(),
            transitions: Vec::new(),
            bad_run: 0,
            longest_bad_run: 0,
            linear: true,
            age: 0,
            age_since_last_update: 0,
            updated_this_tick: false,
            rules,
        };
        event.attach(seed);
        event
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn age_since_last_update(&self) -> u64 {
        self.age_since_last_update
    }

    pub fn first_frame(&self) -> u64 {
        self.first_frame
    }

    pub fn last_frame(&self) -> u64 {
        self.last_frame
    }

    pub fn map(&self) -> &GrayImage {
        &self.map
    }

    pub fn local_events(&self) -> &[LocalEvent] {
        &self.local_events
    }

    pub fn main_points(&self) -> &[(f64, f64)] {
        &self.main_points
    }

    pub fn transitions(&self) -> &[bool] {
        &self.transitions
    }

    pub fn is_linear(&self) -> bool {
        self.linear
    }

    pub fn updated_this_tick(&self) -> bool {
        self.updated_this_tick
    }

    pub fn overlaps(&self, local_event: &LocalEvent) -> bool {
        local_event.overlaps(&self.map)
    }

    /// Appends a local event as this tick's observation.
    pub fn attach(&mut self, local_event: LocalEvent) {
        local_event.paint(&mut self.map, 255);
        self.last_frame = local_event.frame_index();
        self.main_points.push(local_event.mass_center());
        self.local_events.push(local_event);
        self.judge_last_transition();
        self.linear = self.fits_line();
        self.age_since_last_update = 0;
        self.updated_this_tick = true;
    }

    /// Adds an extra local event of the current tick to the map only.
    pub fn absorb_into_map(&mut self, local_event: &LocalEvent) {
        local_event.paint(&mut self.map, 255);
    }

    /// Closes the current tick.
    pub fn age_one_tick(&mut self) {
        self.age += 1;
        if !self.updated_this_tick {
            self.age_since_last_update += 1;
        }
        self.updated_this_tick = false;
    }

    fn judge_last_transition(&mut self) {
        let n = self.main_points.len();
        if n < 2 {
            return;
        }
        let step = delta(self.main_points[n - 2], self.main_points[n - 1]);
        let valid = if n == 2 {
            length(step) > 0.0
        } else {
            let previous = delta(self.main_points[n - 3], self.main_points[n - 2]);
            length(previous) > 0.0
                && length(step) > 0.0
                && turn_angle_deg(previous, step) <= self.rules.max_direction_change_deg
        };
        self.transitions.push(valid);
        if valid {
            self.bad_run = 0;
        } else {
            self.bad_run += 1;
            self.longest_bad_run = self.longest_bad_run.max(self.bad_run);
        }
    }

    fn fits_line(&self) -> bool {
        let (Some(&first), Some(&last)) = (self.main_points.first(), self.main_points.last()) else {
            return true;
        };
        if self.main_points.len() < 3 {
            return true;
        }
        self.main_points
            .iter()
            .all(|&p| distance_to_line(p, first, last) <= self.rules.linear_tolerance_px)
    }

    /// True when the last `n` transitions (or all of them, if fewer) are valid.
    pub fn continuous_good_pos(&self, n: usize) -> bool {
        self.transitions.iter().rev().take(n).all(|&valid| valid)
    }

    /// Longest run of consecutive invalid transitions seen so far.
    pub fn longest_bad_run(&self) -> usize {
        self.longest_bad_run
    }

    /// Mean number of frames between two consecutive local events.
    pub fn mean_frame_gap(&self) -> f64 {
        let count = self.local_events.len();
        if count < 2 {
            return 1.0;
        }
        (self.last_frame - self.first_frame) as f64 / (count - 1) as f64
    }

    /// True when local events were seen at a regular enough pace.
    pub fn ratio_frames_dist(&self, max_frame_gap_ratio: f64) -> bool {
        self.mean_frame_gap() <= max_frame_gap_ratio
    }

    /// Verdict for an event that stopped receiving local events.
    pub fn finish_verdict(&self, rules: &SaveRules) -> Verdict {
        if self.local_events.len() < rules.min_local_events {
            return Verdict::Discarded(DiscardReason::TooFewLocalEvents);
        }
        if !self.continuous_good_pos(rules.save_good_transitions) {
            return Verdict::Discarded(DiscardReason::UnstableTrajectory);
        }
        if !self.ratio_frames_dist(rules.max_frame_gap_ratio) {
            return Verdict::Discarded(DiscardReason::IrregularSpacing);
        }
        Verdict::Saved
    }

    /// Reason to drop an event early, if any.
    pub fn kill_reason(&self, rules: &KillRules) -> Option<DiscardReason> {
        if self.age > rules.max_age {
            return Some(DiscardReason::MaxAge);
        }
        if !self.linear && !self.continuous_good_pos(rules.kill_good_transitions) {
            return Some(DiscardReason::NotLinearRecently);
        }
        if !self.linear && self.longest_bad_run * 2 > self.local_events.len() {
            return Some(DiscardReason::NotLinearMostly);
        }
        None
    }

    pub fn trajectory(&self) -> Vec<TrajectoryPoint> {
        self.local_events
            .iter()
            .zip(&self.main_points)
            .enumerate()
            .map(|(i, (le, &(x, y)))| TrajectoryPoint {
                frame_index: le.frame_index(),
                x,
                y,
                area: le.area(),
                transition_valid: i.checked_sub(1).map(|t| self.transitions[t]),
            })
            .collect()
    }

    /// Bounding box of everything this event ever owned.
    pub fn bounds(&self) -> Rect {
        self.local_events
            .iter()
            .map(LocalEvent::bounds)
            .reduce(|acc, b| acc.union(&b))
            .unwrap_or_default()
    }

    /// Human readable diagnostic report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let bounds = self.bounds();
        let _ = writeln!(out, "event id        : {}", self.id);
        let _ = writeln!(out, "created at (us) : {}", self.created_at_us);
        let _ = writeln!(out, "frames          : {} -> {}", self.first_frame, self.last_frame);
        let _ = writeln!(out, "age             : {}", self.age);
        let _ = writeln!(out, "local events    : {}", self.local_events.len());
        let _ = writeln!(out, "linear          : {}", self.linear);
        let _ = writeln!(out, "mean frame gap  : {:.2}", self.mean_frame_gap());
        let _ = writeln!(out, "longest bad run : {}", self.longest_bad_run);
        let _ = writeln!(
            out,
            "bounds          : x={} y={} w={} h={}",
            bounds.x, bounds.y, bounds.width, bounds.height
        );
        let flags: String = self.transitions.iter().map(|&v| if v { '+' } else { '-' }).collect();
        let _ = writeln!(out, "transitions     : {flags}");
        out
    }

    /// Packages a finished event for the storage layer.
    pub fn into_detected_event(self) -> DetectedEvent {
        DetectedEvent {
            id: self.id,
            created_at_us: self.created_at_us,
            first_frame: self.first_frame,
            last_frame: self.last_frame,
            bounds: self.bounds(),
            trajectory: self.trajectory(),
            report: self.report(),
            noise: Vec::new(),
            ownership_map: self.map,
        }
    }
}

fn delta(from: (f64, f64), to: (f64, f64)) -> (f64, f64) {
    (to.0 - from.0, to.1 - from.1)
}

fn length(v: (f64, f64)) -> f64 {
    v.0.hypot(v.1)
}

fn turn_angle_deg(a: (f64, f64), b: (f64, f64)) -> f64 {
    let cos = (a.0 * b.0 + a.1 * b.1) / (length(a) * length(b));
    cos.clamp(-1.0, 1.0).acos().to_degrees()
}

fn distance_to_line(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let ab = delta(a, b);
    let len = length(ab);
    if len == 0.0 {
        return length(delta(a, p));
    }
    let ap = delta(a, p);
    (ab.0 * ap.1 - ab.1 * ap.0).abs() / len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::local_event::{Palette, Point};
    use approx::assert_relative_eq;

    fn local_event(palette: &mut Palette, x: u32, y: u32, frame: u64) -> LocalEvent {
        palette.release_all();
        LocalEvent::new(palette.allocate().unwrap(), Point::new(x, y), frame, 10)
    }

    fn track(points: &[(u32, u32)]) -> GlobalEvent {
        let mut palette = Palette::new();
        let mut iter = points.iter().enumerate();
        let (_, &(x, y)) = iter.next().unwrap();
        let mut event = GlobalEvent::new(1, local_event(&mut palette, x, y, 0), 0, (200, 200), TrajectoryRules::default());
        event.age_one_tick();
        for (frame, &(x, y)) in iter {
            event.attach(local_event(&mut palette, x, y, frame as u64));
            event.age_one_tick();
        }
        event
    }

    #[test]
    fn straight_track_is_linear_and_valid() {
        let points: Vec<_> = (0..8).map(|i| (20 + 5 * i, 20 + 5 * i)).collect();
        let event = track(&points);
        assert!(event.is_linear());
        assert_eq!(event.transitions().len(), 7);
        assert!(event.continuous_good_pos(7));
        assert_eq!(event.longest_bad_run(), 0);
        assert_eq!(event.main_points().len(), event.local_events().len());
    }

    #[test]
    fn stationary_point_gives_invalid_transitions() {
        let event = track(&[(50, 50), (50, 50), (50, 50)]);
        assert_eq!(event.transitions(), &[false, false]);
        assert_eq!(event.longest_bad_run(), 2);
    }

    #[test]
    fn sharp_turn_is_invalid() {
        let event = track(&[(20, 20), (30, 20), (40, 20), (40, 30)]);
        assert_eq!(event.transitions(), &[true, true, false]);
        assert!(!event.is_linear());
        assert!(!event.continuous_good_pos(2));
        assert!(event.continuous_good_pos(0));
    }

    #[test]
    fn ages_only_count_idle_ticks_since_update() {
        let mut event = track(&[(20, 20), (25, 25)]);
        assert_eq!(event.age(), 2);
        assert_eq!(event.age_since_last_update(), 0);
        event.age_one_tick();
        event.age_one_tick();
        assert_eq!(event.age(), 4);
        assert_eq!(event.age_since_last_update(), 2);
    }

    #[test]
    fn finish_verdict_requires_enough_local_events() {
        let save = SaveRules {
            min_local_events: 8,
            save_good_transitions: 4,
            max_frame_gap_ratio: 2.0,
        };
        let eight: Vec<_> = (0..8).map(|i| (20 + 5 * i, 20 + 5 * i)).collect();
        assert_eq!(track(&eight).finish_verdict(&save), Verdict::Saved);
        assert_eq!(
            track(&eight[..7]).finish_verdict(&save),
            Verdict::Discarded(DiscardReason::TooFewLocalEvents)
        );
    }

    #[test]
    fn kill_reason_for_erratic_track() {
        let kill = KillRules {
            max_age: 500,
            kill_good_transitions: 5,
        };
        let event = track(&[(20, 20), (40, 20), (20, 40), (40, 40)]);
        assert_eq!(event.kill_reason(&kill), Some(DiscardReason::NotLinearRecently));
    }

    #[test]
    fn trajectory_and_report_describe_the_track() {
        let event = track(&[(20, 20), (26, 28)]);
        let trajectory = event.trajectory();
        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory[0].transition_valid, None);
        assert_eq!(trajectory[1].transition_valid, Some(true));
        assert_relative_eq!(trajectory[1].x, 25.5);
        assert!(event.report().contains("local events    : 2"));
    }

    #[test]
    fn distance_to_degenerate_line_is_point_distance() {
        assert_relative_eq!(distance_to_line((3.0, 4.0), (0.0, 0.0), (0.0, 0.0)), 5.0);
        assert_relative_eq!(distance_to_line((5.0, 3.0), (0.0, 0.0), (10.0, 0.0)), 3.0);
    }
}
