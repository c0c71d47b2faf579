//! Experience synthesis and storage.
//!
//! - [`map`] -- the flat `G<n>` experience map and its edit operations.
//! - [`similarity`] -- token-Jaccard similarity and scope extraction.
//! - [`updater`] -- the four-stage batch update.
//! - [`hierarchy`] -- L0/L1/L2 compaction.

pub mod hierarchy;
pub mod map;
pub mod similarity;
pub mod updater;

pub use hierarchy::{CompactionReport, HierarchicalExperienceManager, HierarchyState};
pub use map::{ExperienceId, ExperienceMap, OpKind, Operation};
pub use updater::{ExperienceUpdater, UpdateReport, UpdaterSettings};
