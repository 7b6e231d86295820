pub mod cluster;
mod dbscan;
mod peaks;
mod slope;
pub mod transition;

pub use cluster::{ClusterDetector, ClusterOutcome};
pub use transition::{TransitionDetector, TransitionOutcome};
