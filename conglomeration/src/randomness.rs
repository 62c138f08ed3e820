use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::hash::hash_types::{HashOut, RichField, NUM_HASH_OUT_ELTS};
use plonky2::hash::poseidon::PoseidonHash;
use plonky2::plonk::config::Hasher;

use crate::segment::SegmentProof;

/// Derives the seed shared by every LPP segment from the GL proofs, given in witness index order.
///
/// Each proof contributes its module index, its segment index and the commitment to its LPP
/// columns (zero when it has none).
pub fn derive_shared_randomness<F: RichField + Extendable<D>, const D: usize>(
    gl_proofs: &[SegmentProof<F, D>],
) -> HashOut<F> {
    let mut transcript = Vec::with_capacity(gl_proofs.len() * (2 + NUM_HASH_OUT_ELTS));
    for proof in gl_proofs {
        transcript.push(F::from_canonical_usize(proof.module_index));
        transcript.push(F::from_canonical_usize(proof.segment_index));
        match proof.lpp_commitment {
            Some(commitment) => transcript.extend(commitment.elements),
            None => transcript.extend([F::ZERO; NUM_HASH_OUT_ELTS]),
        }
    }
    PoseidonHash::hash_no_pad(&transcript)
}

#[cfg(test)]
mod tests {
    use plonky2::field::goldilocks_field::GoldilocksField;
    use plonky2::field::types::Sample;

    use super::*;
    use crate::public_inputs::{BundleShape, PublicInputValues};
    use crate::segment::SegmentKind;

    type F = GoldilocksField;
    const D: usize = 2;

    fn gl_proof(module_index: usize, segment_index: usize) -> SegmentProof<F, D> {
        SegmentProof {
            kind: SegmentKind::Gl,
            module_index,
            segment_index,
            payload: vec![],
            public_inputs: PublicInputValues::<F, D>::identity(BundleShape::new(0, 2)),
            lpp_commitment: Some(HashOut::rand()),
            runtime: None,
        }
    }

    #[test]
    fn depends_on_every_commitment() {
        let proofs = vec![gl_proof(0, 0), gl_proof(1, 0), gl_proof(0, 1)];
        let seed = derive_shared_randomness(&proofs);

        let mut tampered = proofs.clone();
        tampered[2].lpp_commitment = None;
        assert_ne!(seed, derive_shared_randomness(&tampered));

        let mut reordered = proofs;
        reordered.swap(0, 1);
        assert_ne!(seed, derive_shared_randomness(&reordered));
    }
}
