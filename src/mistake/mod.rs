//! Mistake bank and the curriculum sampler it drives.

pub mod bank;
pub mod sampler;

pub use bank::{score_for_sampling, MistakeBank, MistakeRecord, MistakeStatus, MistakeUpdate};
pub use sampler::sample_epoch;
