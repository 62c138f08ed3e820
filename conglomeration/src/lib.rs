#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

//! Segment scheduling and hierarchical conglomeration of segment proofs.
//!
//! A run proves every GL segment, derives the randomness shared by the LPP segments from the GL
//! proofs, proves the LPP segments and folds all the proofs pairwise into a single root proof.
//! Every fold is checked for consistency of the aggregated public inputs, both natively and
//! inside the conglomeration circuit, and every child's verifying key is authenticated against
//! the verifying key Merkle tree.

pub mod aggregator;
pub mod cancellation;
pub mod circuit;
pub mod config;
pub mod consistency;
pub mod error;
pub mod multiset;
pub mod pipeline;
pub mod pool;
pub mod prover;
pub mod public_inputs;
pub mod randomness;
pub mod segment;
pub mod stream;
#[cfg(feature = "testing")]
pub mod testing;
pub mod vk_tree;

pub use config::PipelineConfig;
pub use error::{Phase, PipelineError, Violation, Violations};
pub use pipeline::Pipeline;
pub use public_inputs::{BundleShape, PublicInputBundle, PublicInputTargets, PublicInputValues};
pub use segment::{SegmentKind, SegmentProof, SegmentWitness};
pub use vk_tree::{VerificationKeyMerkleTree, VerifyingKey};
