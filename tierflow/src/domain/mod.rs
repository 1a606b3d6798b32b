//! Domain types shared by the sensor, scheduler and supervisor.

pub mod dispatch;
pub mod file_ref;
pub mod outcome;
pub mod size_tier;

pub use dispatch::{DispatchRequest, LaunchPath, LaunchRouting};
pub use file_ref::{FileIdentity, FileReference};
pub use outcome::{TaskOutcome, TaskStatus};
pub use size_tier::{MIB, SizeClassifier, SizeTier, TierThresholds, classify};
