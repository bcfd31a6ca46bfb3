//! Prefetching of the precincts upcoming windows are likely to need
//!
//! [`predictor`] turns the window history into weighted candidate precincts,
//! [`slope`] ranks their layers by rate-distortion value and [`engine`] runs
//! the background thread pulling them in.

pub mod engine;
pub mod predictor;
pub mod scaling;
pub mod slope;

pub use engine::{slope_scan, EngineState, PrefetchEngine, PrefetchStats, ScanOutcome};
pub use predictor::{bounding_box, neighbor_windows, Candidate, CandidateMap, Predictor};
pub use scaling::ScalingModel;
pub use slope::{OverlapPenalty, SlopeTable};
