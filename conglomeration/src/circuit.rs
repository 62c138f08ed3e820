//! In-circuit consistency checks and the plonky2 circuit proving a fold.

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{debug, Level};
use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::gates::noop::NoopGate;
use plonky2::hash::hash_types::{HashOutTarget, RichField, NUM_HASH_OUT_ELTS};
use plonky2::hash::merkle_proofs::MerkleProofTarget;
use plonky2::hash::poseidon::PoseidonHash;
use plonky2::iop::target::Target;
use plonky2::iop::witness::{PartialWitness, WitnessWrite};
use plonky2::plonk::circuit_builder::CircuitBuilder;
use plonky2::plonk::circuit_data::{
    CircuitConfig, CircuitData, CommonCircuitData, VerifierCircuitTarget, VerifierOnlyCircuitData,
};
use plonky2::plonk::config::GenericConfig;
use plonky2::plonk::proof::{ProofWithPublicInputs, ProofWithPublicInputsTarget};
use plonky2::timed;
use plonky2::util::serialization::{Buffer, Read, Write};
use plonky2::util::timing::TimingTree;
use plonky2_util::log2_ceil;

use crate::consistency::AGGREGATION_ARITY;
use crate::multiset::CircuitBuilderMultisetHash;
use crate::prover::ConglomerationProver;
use crate::public_inputs::{BundleShape, PublicInputBundle, PublicInputTargets, PublicInputValues};
use crate::segment::{CongloWitness, RuntimeState, SegmentKind, SegmentProof};
use crate::vk_tree::{
    add_virtual_vk_path, set_vk_path_target, verify_vk_membership_circuit, verifying_key_of,
    VerificationKeyMerkleTree, VerifyingKey, VkPath,
};

/// Leaf position of `bundle` in the verifying key tree, derived from its segment counts the same
/// way as [`crate::consistency::locate_leaf`]. Fails if the bundle counts no segment.
pub fn vk_position_circuit<F: RichField + Extendable<D>, const D: usize>(
    builder: &mut CircuitBuilder<F, D>,
    bundle: &PublicInputTargets<D>,
) -> Target {
    let num_modules = bundle.segment_count_gl.len();
    let zero = builder.zero();
    let one = builder.one();
    let mut sum_gl = zero;
    let mut sum_lpp = zero;
    let mut module_index = zero;
    for module in 0..num_modules {
        let gl = bundle.segment_count_gl[module];
        let lpp = bundle.segment_count_lpp[module];
        sum_gl = builder.add(sum_gl, gl);
        sum_lpp = builder.add(sum_lpp, lpp);
        let count = builder.add(gl, lpp);
        let absent = builder.is_equal(count, zero);
        let here = builder.constant(F::from_canonical_usize(module));
        module_index = builder.select(absent, module_index, here);
    }

    let total = builder.add(sum_gl, sum_lpp);
    let has_nothing = builder.is_equal(total, zero);
    builder.assert_zero(has_nothing.target);

    let no_gl = builder.is_equal(sum_gl, zero);
    let no_lpp = builder.is_equal(sum_lpp, zero);
    let one_gl = builder.is_equal(sum_gl, one);
    let one_lpp = builder.is_equal(sum_lpp, one);
    let is_gl = builder.and(no_lpp, one_gl);
    let is_lpp = builder.and(no_gl, one_lpp);

    let lpp_position = builder.add_const(module_index, F::from_canonical_usize(num_modules));
    let conglomeration_position = builder.constant(F::from_canonical_usize(2 * num_modules));
    let not_gl = builder.select(is_lpp, lpp_position, conglomeration_position);
    builder.select(is_gl, module_index, not_gl)
}

/// Constrains `parent` to be the fold of `children`, with each child's verifying key a member of
/// the tree whose root the children carry.
pub fn check_fold_circuit<F: RichField + Extendable<D>, const D: usize>(
    builder: &mut CircuitBuilder<F, D>,
    children: [&PublicInputTargets<D>; AGGREGATION_ARITY],
    parent: &PublicInputTargets<D>,
    paths: [&MerkleProofTarget; AGGREGATION_ARITY],
) {
    let [a, b] = children;

    for (k, &p) in parent.functionals.iter().enumerate() {
        let sum = builder.add(a.functionals[k], b.functionals[k]);
        builder.connect(sum, p);
    }

    for module in 0..parent.target_segment_count.len() {
        for child in children {
            builder.connect(
                child.target_segment_count[module],
                parent.target_segment_count[module],
            );
        }
        let gl = builder.add(a.segment_count_gl[module], b.segment_count_gl[module]);
        builder.connect(gl, parent.segment_count_gl[module]);
        let lpp = builder.add(a.segment_count_lpp[module], b.segment_count_lpp[module]);
        builder.connect(lpp, parent.segment_count_lpp[module]);
    }

    let general = builder.combine_multiset_hash(&a.general_multiset_hash, &b.general_multiset_hash);
    let shared = builder.combine_multiset_hash(
        &a.shared_randomness_multiset_hash,
        &b.shared_randomness_multiset_hash,
    );
    for i in 0..general.len() {
        builder.connect(general[i], parent.general_multiset_hash[i]);
        builder.connect(shared[i], parent.shared_randomness_multiset_hash[i]);
    }

    let log_derivative_sum = builder.add_extension(a.log_derivative_sum, b.log_derivative_sum);
    builder.connect_extension(log_derivative_sum, parent.log_derivative_sum);
    let horner_sum = builder.add_extension(a.horner_sum, b.horner_sum);
    builder.connect_extension(horner_sum, parent.horner_sum);
    let grand_product = builder.mul_extension(a.grand_product, b.grand_product);
    builder.connect_extension(grand_product, parent.grand_product);

    // The parent takes each element from `a` unless it is unset there; `b` must then be unset or
    // agree with it.
    let zero = builder.zero();
    for i in 0..parent.shared_randomness.len() {
        let a_unset = builder.is_equal(a.shared_randomness[i], zero);
        let selected = builder.select(a_unset, b.shared_randomness[i], a.shared_randomness[i]);
        builder.connect(selected, parent.shared_randomness[i]);
        let diff = builder.sub(b.shared_randomness[i], parent.shared_randomness[i]);
        let b_conflict = builder.mul(b.shared_randomness[i], diff);
        builder.assert_zero(b_conflict);
    }

    for child in children {
        for i in 0..parent.vkey_merkle_root.len() {
            builder.connect(child.vkey_merkle_root[i], parent.vkey_merkle_root[i]);
        }
    }

    for (child, path) in children.into_iter().zip(paths) {
        let position = vk_position_circuit(builder, child);
        let root = HashOutTarget::from(child.vkey_merkle_root);
        verify_vk_membership_circuit(builder, position, &child.verifying_key, root, path);
    }
}

/// Pads the circuit under construction so that it builds with exactly `common` as common data,
/// provided its own gates fit in `common.degree()` rows.
pub fn pad_to_common_data<F: RichField + Extendable<D>, const D: usize>(
    builder: &mut CircuitBuilder<F, D>,
    common: &CommonCircuitData<F, D>,
) {
    while builder.num_gates() < common.degree() / 2 {
        builder.add_gate(NoopGate, vec![]);
    }
    for gate in &common.gates {
        builder.add_gate_to_gate_set(gate.clone());
    }
}

/// Serializes a proof together with the verifier data of the circuit that produced it. This is
/// the payload [`ConglomerationCircuit`] expects from every child proof.
pub fn encode_payload<F, C, const D: usize>(
    proof: &ProofWithPublicInputs<F, C, D>,
    verifier_data: &VerifierOnlyCircuitData<C, D>,
) -> Result<Vec<u8>>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F>,
{
    let mut bytes = Vec::new();
    bytes
        .write_verifier_only_circuit_data(verifier_data)
        .map_err(|_| anyhow!("could not serialize verifier data"))?;
    bytes
        .write_proof_with_public_inputs(proof)
        .map_err(|_| anyhow!("could not serialize proof"))?;
    Ok(bytes)
}

pub fn decode_payload<F, C, const D: usize>(
    payload: &[u8],
    common: &CommonCircuitData<F, D>,
) -> Result<(ProofWithPublicInputs<F, C, D>, VerifierOnlyCircuitData<C, D>)>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F>,
{
    let mut buffer = Buffer::new(payload);
    let verifier_data = buffer
        .read_verifier_only_circuit_data()
        .map_err(|_| anyhow!("payload does not start with verifier data"))?;
    let proof = buffer
        .read_proof_with_public_inputs(common)
        .map_err(|_| anyhow!("payload does not hold a proof over the shared common data"))?;
    ensure!(
        buffer.unread_bytes().is_empty(),
        "{} trailing bytes after the proof",
        buffer.unread_bytes().len()
    );
    Ok((proof, verifier_data))
}

// vk[0] is the hash of the constants/sigmas cap and vk[1] the circuit digest, as computed by
// `verifying_key_of`
fn connect_verifying_key<F: RichField + Extendable<D>, const D: usize>(
    builder: &mut CircuitBuilder<F, D>,
    verifier_data: &VerifierCircuitTarget,
    vk: &[[Target; NUM_HASH_OUT_ELTS]; 2],
) {
    let cap = verifier_data
        .constants_sigmas_cap
        .0
        .iter()
        .flat_map(|h| h.elements)
        .collect();
    let cap_hash = builder.hash_n_to_hash_no_pad::<PoseidonHash>(cap);
    builder.connect_hashes(cap_hash, HashOutTarget::from(vk[0]));
    builder.connect_hashes(verifier_data.circuit_digest, HashOutTarget::from(vk[1]));
}

/// Number of times the circuit is rebuilt against its own common data before giving up.
const MAX_COMMON_DATA_ROUNDS: usize = 8;

/// Circuit proving one fold.
///
/// Both children are plonky2 proofs verified inside the circuit. A child's public inputs are its
/// bundle, and the verifier data it is checked against must hash to the verifying key that bundle
/// declares, which in turn must be a member of the verifying key tree. Every child, conglomeration
/// proofs included, shares the common data of this circuit; leaf circuits are padded to it with
/// [`pad_to_common_data`]. The parent bundle is the public input.
pub struct ConglomerationCircuit<F, C, const D: usize>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F>,
{
    pub data: CircuitData<F, C, D>,
    shape: BundleShape,
    proofs: [ProofWithPublicInputsTarget<D>; AGGREGATION_ARITY],
    verifier_data: [VerifierCircuitTarget; AGGREGATION_ARITY],
    parent: PublicInputTargets<D>,
    paths: [MerkleProofTarget; AGGREGATION_ARITY],
}

impl<F, C, const D: usize> ConglomerationCircuit<F, C, D>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F, Hasher = PoseidonHash> + 'static,
{
    /// Builds the circuit for bundles of `shape`. The circuit is rebuilt against the common data
    /// of its previous build until the two agree, so that it can verify its own proofs.
    pub fn build(config: CircuitConfig, shape: BundleShape) -> Result<Self> {
        let mut common = Self::seed_common_data(config.clone(), shape);
        for round in 1..=MAX_COMMON_DATA_ROUNDS {
            let circuit = Self::build_against(config.clone(), shape, &common)?;
            if circuit.data.common == common {
                debug!(
                    "conglomeration circuit of degree 2^{} over {} modules, \
                     settled after {} rounds",
                    common.degree_bits(),
                    shape.num_modules,
                    round
                );
                return Ok(circuit);
            }
            common = circuit.data.common;
        }
        bail!("conglomeration circuit did not settle after {MAX_COMMON_DATA_ROUNDS} rounds")
    }

    fn seed_common_data(config: CircuitConfig, shape: BundleShape) -> CommonCircuitData<F, D> {
        let mut builder = CircuitBuilder::<F, D>::new(config);
        PublicInputTargets::add_virtual(&mut builder, shape).register_public_inputs(&mut builder);
        builder.build::<C>().common
    }

    fn build_against(
        config: CircuitConfig,
        shape: BundleShape,
        common: &CommonCircuitData<F, D>,
    ) -> Result<Self> {
        let mut builder = CircuitBuilder::<F, D>::new(config);
        let parent = PublicInputTargets::add_virtual(&mut builder, shape);
        parent.register_public_inputs(&mut builder);

        let cap_height = common.config.fri_config.cap_height;
        let proofs = [
            builder.add_virtual_proof_with_pis(common),
            builder.add_virtual_proof_with_pis(common),
        ];
        let verifier_data = [
            builder.add_virtual_verifier_data(cap_height),
            builder.add_virtual_verifier_data(cap_height),
        ];
        let children = [
            PublicInputTargets::from_targets(shape, &proofs[0].public_inputs)?,
            PublicInputTargets::from_targets(shape, &proofs[1].public_inputs)?,
        ];
        for i in 0..AGGREGATION_ARITY {
            builder.verify_proof::<C>(&proofs[i], &verifier_data[i], common);
            connect_verifying_key(&mut builder, &verifier_data[i], &children[i].verifying_key);
        }

        let depth = log2_ceil(2 * shape.num_modules + 1);
        let paths = [
            add_virtual_vk_path(&mut builder, depth),
            add_virtual_vk_path(&mut builder, depth),
        ];
        check_fold_circuit(
            &mut builder,
            [&children[0], &children[1]],
            &parent,
            [&paths[0], &paths[1]],
        );

        pad_to_common_data(&mut builder, common);
        let data = builder.build::<C>();
        Ok(Self {
            data,
            shape,
            proofs,
            verifier_data,
            parent,
            paths,
        })
    }

    pub fn shape(&self) -> BundleShape {
        self.shape
    }

    /// Common data every child proof must be produced with.
    pub fn common_data(&self) -> &CommonCircuitData<F, D> {
        &self.data.common
    }

    pub fn verifying_key(&self) -> VerifyingKey<F> {
        verifying_key_of::<F, C, D>(&self.data.verifier_only)
    }

    /// Proves an explicit assignment of the fold.
    pub fn prove_assignment(
        &self,
        children: [&ProofWithPublicInputs<F, C, D>; AGGREGATION_ARITY],
        verifier_data: [&VerifierOnlyCircuitData<C, D>; AGGREGATION_ARITY],
        parent: &PublicInputValues<F, D>,
        paths: [&VkPath<F>; AGGREGATION_ARITY],
    ) -> Result<ProofWithPublicInputs<F, C, D>> {
        let mut pw = PartialWitness::new();
        for i in 0..AGGREGATION_ARITY {
            pw.set_proof_with_pis_target(&self.proofs[i], children[i]);
            pw.set_verifier_data_target(&self.verifier_data[i], verifier_data[i]);
            set_vk_path_target(&mut pw, &self.paths[i], paths[i])?;
        }
        self.parent.set_witness(&mut pw, parent)?;

        let mut timing = TimingTree::new("prove conglomeration", Level::Debug);
        let proof = timed!(timing, "prove fold", self.data.prove(pw))?;
        timing.print();
        Ok(proof)
    }

    /// Decodes the payload of a child and checks it carries the bundle the child declares.
    pub fn decode_child(
        &self,
        child: &SegmentProof<F, D>,
    ) -> Result<(ProofWithPublicInputs<F, C, D>, VerifierOnlyCircuitData<C, D>)> {
        let (proof, verifier_data) =
            decode_payload::<F, C, D>(&child.payload, &self.data.common).with_context(|| {
                format!(
                    "bad payload for {} module {} segment {}",
                    child.kind, child.module_index, child.segment_index
                )
            })?;
        ensure!(
            proof.public_inputs == child.public_inputs.to_field_elements::<D>(),
            "{} module {} segment {}: proof public inputs differ from the declared bundle",
            child.kind,
            child.module_index,
            child.segment_index
        );
        Ok((proof, verifier_data))
    }

    /// Folds two proofs, authenticating each child under the leaf its kind and module declare.
    pub fn prove_fold(
        &self,
        a: &SegmentProof<F, D>,
        b: &SegmentProof<F, D>,
        tree: &VerificationKeyMerkleTree<F>,
    ) -> Result<SegmentProof<F, D>> {
        ensure!(
            tree.conglomeration_vk() == &self.verifying_key(),
            "verifying key tree was not built for this conglomeration circuit"
        );
        let (proof_a, vd_a) = self.decode_child(a)?;
        let (proof_b, vd_b) = self.decode_child(b)?;
        let path_a = tree
            .prove_for(a)
            .with_context(|| format!("no leaf for {} module {}", a.kind, a.module_index))?;
        let path_b = tree
            .prove_for(b)
            .with_context(|| format!("no leaf for {} module {}", b.kind, b.module_index))?;
        let parent = PublicInputBundle::conglomerate(
            &a.public_inputs,
            &b.public_inputs,
            tree.conglomeration_vk(),
        );

        let proof = self.prove_assignment(
            [&proof_a, &proof_b],
            [&vd_a, &vd_b],
            &parent,
            [&path_a, &path_b],
        )?;
        Ok(SegmentProof {
            kind: SegmentKind::Conglomeration,
            module_index: 0,
            segment_index: 0,
            payload: encode_payload(&proof, &self.data.verifier_only)?,
            public_inputs: parent,
            lpp_commitment: None,
            runtime: Some(RuntimeState::new(proof)),
        })
    }

    /// Checks a proof produced by [`Self::prove_fold`] against its declared public inputs.
    pub fn verify(&self, proof: &SegmentProof<F, D>) -> Result<()> {
        ensure!(
            proof.kind == SegmentKind::Conglomeration,
            "not a conglomeration proof"
        );
        let (decoded, verifier_data) = self.decode_child(proof)?;
        ensure!(
            verifier_data == self.data.verifier_only,
            "proof was not produced by this conglomeration circuit"
        );
        self.data.verify(decoded)
    }
}

impl<F, C, const D: usize> ConglomerationProver<F, D> for ConglomerationCircuit<F, C, D>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F, Hasher = PoseidonHash> + 'static,
{
    fn verifying_key(&self) -> VerifyingKey<F> {
        ConglomerationCircuit::verifying_key(self)
    }

    fn prove(&self, witness: &CongloWitness<'_, F, D>) -> Result<SegmentProof<F, D>> {
        let [a, b] = &witness.children;
        self.prove_fold(a, b, witness.tree)
    }
}
