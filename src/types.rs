pub mod status;
pub mod step_bitmap;

// Re-export types for convenience.
pub use crate::types::status::{JobStatus, SimulationStatus};
pub use crate::types::step_bitmap::StepBitmap;
