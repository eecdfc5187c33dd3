pub mod aspects;
pub mod json_repair;
pub mod patterns;

pub use aspects::{AspectStrategy, ExtractionContext, ASPECTS};
pub use json_repair::{FeedOutcome, RunawayDetector};
