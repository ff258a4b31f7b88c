pub mod runs;
pub mod steps;

pub use runs::{IngestOutcome, RunFilter};
pub use steps::StepFilter;
