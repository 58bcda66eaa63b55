// THEORY:
// This file is the main entry point for the `meteor_vision` library crate.
// It defines the public API exposed to station software: the frame-synchronous
// `DetectionPipeline`, its asynchronous driver, the exposure controller, and the
// traits through which frames, cameras and archives are plugged in.
//
// The engine consumes an ordered stream of grayscale frames from a fixed all-sky
// camera and produces two things: saved meteor events (an ownership map, a
// trajectory and a report), and exposure commands that keep the sky background
// near a target brightness. All the internal stages (`core_modules`) can be used
// on their own, but `pipeline` is the intended front door.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod frame_source;
pub mod interfaces;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod storage;
