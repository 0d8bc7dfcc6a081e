//! Resumable work decomposition.
//!
//! Three strategies, each a pure function of the checkpoint plus store
//! responses:
//! - `slice`: numeric slices of a reindex
//! - `permutation`: cross product of attribute values, one update at a time
//! - `fanout`: one task per entity, bounded by shard count

mod fanout;
mod permutation;
mod slice;

pub use fanout::{
    EntityInProgress, EntityRecord, EntityResolver, FanOutController, FanOutPlan, FanOutState,
};
pub use permutation::{
    AttributeDomain, Permutation, PermutationIterator, PermutationMatrix, PermutationPlan,
    PermutationState,
};
pub use slice::{SliceIterator, SlicePlan, SliceState};
