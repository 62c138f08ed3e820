use core::any::Any;
use core::fmt;
use std::sync::Arc;

use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::{HashOut, RichField};
use serde::{Deserialize, Serialize};

use crate::public_inputs::PublicInputValues;
use crate::vk_tree::VerificationKeyMerkleTree;

/// The three kinds of proofs the engine handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Segments proved first, without shared randomness.
    Gl,
    /// Segments seeded with randomness derived from every GL proof.
    Lpp,
    /// Internal nodes produced by folding two proofs.
    Conglomeration,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Gl => write!(f, "GL"),
            SegmentKind::Lpp => write!(f, "LPP"),
            SegmentKind::Conglomeration => write!(f, "conglomeration"),
        }
    }
}

/// Transient prover state attached to a freshly produced proof. It can be large, so it is
/// dropped as soon as the proof has been consumed by a fold.
#[derive(Clone)]
pub struct RuntimeState(Arc<dyn Any + Send + Sync>);

impl RuntimeState {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RuntimeState(..)")
    }
}

#[derive(Clone, Debug)]
pub struct SegmentProof<F: RichField + Extendable<D>, const D: usize> {
    pub kind: SegmentKind,
    pub module_index: usize,
    pub segment_index: usize,
    /// Serialized proof, opaque to the engine.
    pub payload: Vec<u8>,
    pub public_inputs: PublicInputValues<F, D>,
    /// Commitment to the LPP columns of a GL segment. `None` for every other kind.
    pub lpp_commitment: Option<HashOut<F>>,
    pub runtime: Option<RuntimeState>,
}

impl<F: RichField + Extendable<D>, const D: usize> SegmentProof<F, D> {
    pub fn clear_runtime(&mut self) -> &mut Self {
        self.runtime = None;
        self
    }

    pub fn has_runtime(&self) -> bool {
        self.runtime.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct GlWitness<F: RichField> {
    pub module_name: String,
    pub module_index: usize,
    pub segment_index: usize,
    /// Number of segments of every module, as decided by the segmentation.
    pub total_segment_count: Vec<usize>,
    pub vk_merkle_root: HashOut<F>,
    pub columns: Vec<F>,
}

#[derive(Clone, Debug)]
pub struct LppWitness<F: RichField> {
    pub module_name: String,
    pub module_index: usize,
    pub segment_index: usize,
    pub total_segment_count: Vec<usize>,
    pub vk_merkle_root: HashOut<F>,
    pub columns: Vec<F>,
    /// Fiat-Shamir seed shared by all LPP segments. Set once every GL proof is known.
    pub initial_randomness: Option<HashOut<F>>,
}

/// The two proofs to fold, with the tree authenticating their verifying keys.
#[derive(Clone, Debug)]
pub struct CongloWitness<'t, F: RichField + Extendable<D>, const D: usize> {
    pub children: [SegmentProof<F, D>; 2],
    pub tree: &'t VerificationKeyMerkleTree<F>,
}

#[derive(Clone, Debug)]
pub enum SegmentWitness<'t, F: RichField + Extendable<D>, const D: usize> {
    Gl(GlWitness<F>),
    Lpp(LppWitness<F>),
    Conglo(CongloWitness<'t, F, D>),
}

impl<'t, F: RichField + Extendable<D>, const D: usize> SegmentWitness<'t, F, D> {
    pub fn kind(&self) -> SegmentKind {
        match self {
            SegmentWitness::Gl(_) => SegmentKind::Gl,
            SegmentWitness::Lpp(_) => SegmentKind::Lpp,
            SegmentWitness::Conglo(_) => SegmentKind::Conglomeration,
        }
    }

    pub fn module_name(&self) -> Option<&str> {
        match self {
            SegmentWitness::Gl(w) => Some(&w.module_name),
            SegmentWitness::Lpp(w) => Some(&w.module_name),
            SegmentWitness::Conglo(_) => None,
        }
    }

    pub fn module_index(&self) -> Option<usize> {
        match self {
            SegmentWitness::Gl(w) => Some(w.module_index),
            SegmentWitness::Lpp(w) => Some(w.module_index),
            SegmentWitness::Conglo(_) => None,
        }
    }

    /// Seeds an LPP witness. Returns `false` for any other variant.
    pub fn set_initial_randomness(&mut self, seed: HashOut<F>) -> bool {
        match self {
            SegmentWitness::Lpp(w) => {
                w.initial_randomness = Some(seed);
                true
            }
            _ => false,
        }
    }
}
