//! Collaborators the pipeline drives but does not implement.

use std::sync::Arc;

use anyhow::Result;
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;

use crate::segment::{CongloWitness, SegmentKind, SegmentProof, SegmentWitness};
use crate::vk_tree::VerifyingKey;

/// Source of the per-segment witnesses produced by segmentation.
pub trait WitnessStore<F: RichField + Extendable<D>, const D: usize>: Sync {
    fn load_witness(
        &self,
        kind: SegmentKind,
        index: usize,
    ) -> Result<SegmentWitness<'static, F, D>>;
}

/// Proves segments of one compiled module.
///
/// Implementations may attach large transient state to the returned proof through
/// [`SegmentProof::runtime`]; the pipeline clears it once it is no longer needed.
pub trait SegmentProver<F: RichField + Extendable<D>, const D: usize>: Send + Sync {
    fn prove(&self, witness: &SegmentWitness<'_, F, D>) -> Result<SegmentProof<F, D>>;
}

/// Lookup of compiled modules by name.
pub trait ModuleRegistry<F: RichField + Extendable<D>, const D: usize>: Sync {
    fn resolve_compiled_module(
        &self,
        name: &str,
        kind: SegmentKind,
    ) -> Result<Arc<dyn SegmentProver<F, D>>>;
}

/// Folds two proofs into one.
pub trait ConglomerationProver<F: RichField + Extendable<D>, const D: usize>: Sync {
    /// Key stored at the conglomeration slot of the verifying key tree.
    fn verifying_key(&self) -> VerifyingKey<F>;

    fn prove(&self, witness: &CongloWitness<'_, F, D>) -> Result<SegmentProof<F, D>>;
}
