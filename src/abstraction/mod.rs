//! The abstract domain over basic blocks.
//!
//! An [`AbstractBlock`](block::AbstractBlock) stands for a set of concrete
//! basic blocks: per instruction position a conjunction of abstract feature
//! values, plus a three-valued aliasing relation over the operands. The
//! submodules provide the feature lattices, the feature index structures,
//! the block lattice itself, and the sampler that draws concrete members.

pub mod aliasing;
pub mod block;
pub mod feature;
pub mod feature_manager;
pub mod sampler;

pub use aliasing::{AbstractAliasing, AliasPairKey, AliasValue, OperandRef};
pub use block::{AbstractBlock, AbstractInsn, Expansion};
pub use feature::{AbstractFeature, FeatureKind, FeatureStep, FeatureValue};
pub use feature_manager::{FeatureDecl, InsnFeatureManager};
pub use sampler::{Sampler, SamplingError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbstractionError {
    #[error("malformed serialized data: {0}")]
    Malformed(String),

    #[error("unknown feature name: {0}")]
    UnknownFeature(String),
}
