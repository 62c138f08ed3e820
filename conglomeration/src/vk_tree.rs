//! Merkle tree authenticating the verifying key of every module and of the conglomeration
//! circuit itself.
//!
//! Leaves are laid out as `[gl_0, .., gl_{n-1}, lpp_0, .., lpp_{n-1}, conglomeration, padding..]`.
//! Each leaf is the Poseidon hash of the two halves of a verifying key; padding leaves hash an
//! all-zero key. The same leaf hashing and index bit order is used by the native and by the
//! in-circuit verifier.

use anyhow::{ensure, Result};
use itertools::Itertools;
use log::debug;
use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::hash::hash_types::{HashOut, HashOutTarget, RichField, NUM_HASH_OUT_ELTS};
use plonky2::hash::merkle_proofs::{verify_merkle_proof, MerkleProof, MerkleProofTarget};
use plonky2::hash::merkle_tree::MerkleTree;
use plonky2::hash::poseidon::PoseidonHash;
use plonky2::iop::target::Target;
use plonky2::iop::witness::{PartialWitness, WitnessWrite};
use plonky2::plonk::circuit_builder::CircuitBuilder;
use plonky2::plonk::circuit_data::VerifierOnlyCircuitData;
use plonky2::plonk::config::{GenericConfig, Hasher};
use plonky2_util::log2_ceil;

use crate::segment::{SegmentKind, SegmentProof};

/// A verifying key, as the pair of digests exposed in public inputs.
pub type VerifyingKey<F> = [HashOut<F>; 2];

/// Sibling path from a leaf to the root.
pub type VkPath<F> = MerkleProof<F, PoseidonHash>;

/// Digest pair identifying a plonky2 circuit: the hash of its constants/sigmas cap and its
/// circuit digest.
pub fn verifying_key_of<F, C, const D: usize>(
    data: &VerifierOnlyCircuitData<C, D>,
) -> VerifyingKey<F>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F, Hasher = PoseidonHash>,
{
    [
        PoseidonHash::hash_no_pad(&data.constants_sigmas_cap.flatten()),
        data.circuit_digest,
    ]
}

fn leaf_data<F: Field>(vk: &VerifyingKey<F>) -> Vec<F> {
    vk.iter().flat_map(|h| h.elements).collect()
}

#[derive(Clone, Debug)]
pub struct VerificationKeyMerkleTree<F: RichField> {
    tree: MerkleTree<F, PoseidonHash>,
    leaf_keys: Vec<VerifyingKey<F>>,
    num_modules: usize,
}

impl<F: RichField> VerificationKeyMerkleTree<F> {
    /// Builds the tree over one GL and one LPP key per module plus the conglomeration key.
    pub fn build(
        gl_vks: &[VerifyingKey<F>],
        lpp_vks: &[VerifyingKey<F>],
        conglomeration_vk: VerifyingKey<F>,
    ) -> Result<Self> {
        ensure!(
            gl_vks.len() == lpp_vks.len(),
            "got {} GL keys but {} LPP keys",
            gl_vks.len(),
            lpp_vks.len()
        );
        ensure!(!gl_vks.is_empty(), "at least one module is required");
        let num_modules = gl_vks.len();
        let num_leaves = 1 << log2_ceil(2 * num_modules + 1);
        let zero = HashOut {
            elements: [F::ZERO; NUM_HASH_OUT_ELTS],
        };

        let mut leaf_keys = Vec::with_capacity(num_leaves);
        leaf_keys.extend_from_slice(gl_vks);
        leaf_keys.extend_from_slice(lpp_vks);
        leaf_keys.push(conglomeration_vk);
        leaf_keys.resize(num_leaves, [zero; 2]);

        let tree = MerkleTree::new(leaf_keys.iter().map(leaf_data).collect_vec(), 0);
        debug!(
            "built verifying key tree over {} modules ({} leaves)",
            num_modules, num_leaves
        );
        Ok(Self {
            tree,
            leaf_keys,
            num_modules,
        })
    }

    pub fn root(&self) -> HashOut<F> {
        self.tree.cap.0[0]
    }

    pub fn depth(&self) -> usize {
        log2_ceil(2 * self.num_modules + 1)
    }

    pub fn num_modules(&self) -> usize {
        self.num_modules
    }

    pub fn num_leaves(&self) -> usize {
        self.leaf_keys.len()
    }

    pub fn leaf_position(&self, kind: SegmentKind, module_index: usize) -> Option<usize> {
        match kind {
            SegmentKind::Conglomeration => Some(2 * self.num_modules),
            _ if module_index >= self.num_modules => None,
            SegmentKind::Gl => Some(module_index),
            SegmentKind::Lpp => Some(module_index + self.num_modules),
        }
    }

    pub fn verifying_key(&self, position: usize) -> Option<&VerifyingKey<F>> {
        self.leaf_keys.get(position)
    }

    pub fn conglomeration_vk(&self) -> &VerifyingKey<F> {
        &self.leaf_keys[2 * self.num_modules]
    }

    pub fn prove(&self, position: usize) -> Option<VkPath<F>> {
        (position < self.num_leaves()).then(|| self.tree.prove(position))
    }

    /// Path for the leaf a proof was produced under, as declared by its kind and module.
    pub fn prove_for<const D: usize>(&self, proof: &SegmentProof<F, D>) -> Option<VkPath<F>>
    where
        F: Extendable<D>,
    {
        let position = self.leaf_position(proof.kind, proof.module_index)?;
        self.prove(position)
    }
}

pub fn verify_membership<F: RichField>(
    position: usize,
    vk: &VerifyingKey<F>,
    root: HashOut<F>,
    path: &VkPath<F>,
) -> bool {
    if path.siblings.len() >= usize::BITS as usize || position >> path.siblings.len() != 0 {
        return false;
    }
    verify_merkle_proof::<F, PoseidonHash>(leaf_data(vk), position, root, path).is_ok()
}

pub fn add_virtual_vk_path<F: RichField + Extendable<D>, const D: usize>(
    builder: &mut CircuitBuilder<F, D>,
    depth: usize,
) -> MerkleProofTarget {
    MerkleProofTarget {
        siblings: builder.add_virtual_hashes(depth),
    }
}

pub fn set_vk_path_target<F: RichField>(
    pw: &mut PartialWitness<F>,
    target: &MerkleProofTarget,
    path: &VkPath<F>,
) -> Result<()> {
    ensure!(
        target.siblings.len() == path.siblings.len(),
        "path has {} siblings, expected {}",
        path.siblings.len(),
        target.siblings.len()
    );
    for (&t, &h) in target.siblings.iter().zip(&path.siblings) {
        pw.set_hash_target(t, h);
    }
    Ok(())
}

/// Constrains `vk` to sit at leaf `position` of the tree with root `root`.
pub fn verify_vk_membership_circuit<F: RichField + Extendable<D>, const D: usize>(
    builder: &mut CircuitBuilder<F, D>,
    position: Target,
    vk: &[[Target; NUM_HASH_OUT_ELTS]; 2],
    root: HashOutTarget,
    path: &MerkleProofTarget,
) {
    let bits = builder.split_le(position, path.siblings.len());
    let leaf = vk.iter().flatten().copied().collect_vec();
    builder.verify_merkle_proof::<PoseidonHash>(leaf, &bits, root, path);
}

#[cfg(test)]
mod tests {
    use plonky2::field::types::{PrimeField64, Sample};
    use plonky2::iop::witness::PartialWitness;
    use plonky2::plonk::circuit_data::CircuitConfig;
    use plonky2::plonk::config::PoseidonGoldilocksConfig;

    use super::*;
    use crate::tests::check_panic_or_err;

    const D: usize = 2;
    type C = PoseidonGoldilocksConfig;
    type F = <C as GenericConfig<D>>::F;

    fn random_vks(n: usize) -> Vec<VerifyingKey<F>> {
        (0..n).map(|_| [HashOut::rand(), HashOut::rand()]).collect()
    }

    fn random_tree(n: usize) -> Result<VerificationKeyMerkleTree<F>> {
        VerificationKeyMerkleTree::build(&random_vks(n), &random_vks(n), random_vks(1)[0])
    }

    fn flip_bit(vk: &mut VerifyingKey<F>) {
        let x = vk[1].elements[2].to_canonical_u64();
        vk[1].elements[2] = F::from_canonical_u64(x ^ 1);
    }

    #[test]
    fn layout_and_depth() -> Result<()> {
        let tree = random_tree(3)?;
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.num_leaves(), 8);
        assert_eq!(tree.leaf_position(SegmentKind::Gl, 2), Some(2));
        assert_eq!(tree.leaf_position(SegmentKind::Lpp, 0), Some(3));
        assert_eq!(tree.leaf_position(SegmentKind::Conglomeration, 17), Some(6));
        assert_eq!(tree.leaf_position(SegmentKind::Lpp, 3), None);
        assert_eq!(tree.verifying_key(7), Some(&[HashOut::from([F::ZERO; 4]); 2]));
        assert_eq!(random_tree(1)?.depth(), 2);
        assert_eq!(random_tree(4)?.depth(), 4);
        Ok(())
    }

    #[test]
    fn rejects_unbalanced_module_lists() {
        assert!(VerificationKeyMerkleTree::build(&random_vks(2), &random_vks(3), random_vks(1)[0])
            .is_err());
    }

    #[test]
    fn every_leaf_is_a_member() -> Result<()> {
        let tree = random_tree(3)?;
        for position in 0..tree.num_leaves() {
            let path = tree.prove(position).expect("position in range");
            let vk = tree.verifying_key(position).expect("position in range");
            assert!(verify_membership(position, vk, tree.root(), &path));
            assert!(!verify_membership(position ^ 1, vk, tree.root(), &path));
        }
        assert!(tree.prove(8).is_none());
        Ok(())
    }

    #[test]
    fn tampered_key_is_rejected() -> Result<()> {
        let tree = random_tree(2)?;
        let path = tree.prove(1).expect("position in range");
        let mut vk = *tree.verifying_key(1).expect("position in range");
        flip_bit(&mut vk);
        assert!(!verify_membership(1, &vk, tree.root(), &path));
        Ok(())
    }

    fn membership_circuit(
        tree: &VerificationKeyMerkleTree<F>,
        position: usize,
        vk: &VerifyingKey<F>,
    ) -> Result<()> {
        let mut builder = CircuitBuilder::<F, D>::new(CircuitConfig::standard_recursion_config());
        let position_t = builder.add_virtual_target();
        let vk_t = [
            core::array::from_fn(|_| builder.add_virtual_target()),
            core::array::from_fn(|_| builder.add_virtual_target()),
        ];
        let root_t = builder.add_virtual_hash();
        let path_t = add_virtual_vk_path(&mut builder, tree.depth());
        verify_vk_membership_circuit(&mut builder, position_t, &vk_t, root_t, &path_t);
        let data = builder.build::<C>();

        let mut pw = PartialWitness::new();
        pw.set_target(position_t, F::from_canonical_usize(position));
        for (half_t, half) in vk_t.iter().zip(vk) {
            for (&t, &v) in half_t.iter().zip(&half.elements) {
                pw.set_target(t, v);
            }
        }
        pw.set_hash_target(root_t, tree.root());
        set_vk_path_target(&mut pw, &path_t, &tree.prove(position).expect("position in range"))?;
        let proof = data.prove(pw)?;
        data.verify(proof)
    }

    #[test]
    fn circuit_accepts_the_same_leaves() -> Result<()> {
        let tree = random_tree(2)?;
        for position in [0, 3, 4] {
            let vk = *tree.verifying_key(position).expect("position in range");
            membership_circuit(&tree, position, &vk)?;
        }
        Ok(())
    }

    #[test]
    fn circuit_rejects_tampered_key() -> Result<()> {
        let tree = random_tree(2)?;
        let mut vk = *tree.verifying_key(4).expect("position in range");
        flip_bit(&mut vk);
        check_panic_or_err!(
            || membership_circuit(&tree, 4, &vk),
            "tampered key was accepted in circuit"
        );
        Ok(())
    }
}
