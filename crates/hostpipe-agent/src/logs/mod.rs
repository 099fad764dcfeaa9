pub mod dedup;

pub use dedup::{Deduplicator, Observation, TemplateNormalizer};
