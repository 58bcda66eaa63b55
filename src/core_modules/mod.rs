pub mod debug_dump;
pub mod event_tracker;
pub mod exposure_control;
pub mod frame;
pub mod frame_differencer;
pub mod global_event;
pub mod histogram;
pub mod local_event;
pub mod local_event_extractor;
pub mod mask;
pub mod region_grid;
pub mod utils;
