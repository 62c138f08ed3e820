//! Synthetic collaborators for exercising the pipeline without real segment circuits.
//!
//! Every module gets pseudo verifying keys derived from its index, leaf proofs carry
//! identity-valued accumulators, and the conglomeration prover folds public inputs natively.
//! Modules can instead be backed by small plonky2 circuits that expose a bundle as their public
//! inputs, so that a [`ConglomerationCircuit`] can verify their proofs.
//! Witness loading can be made to fail, panic or stall for a chosen index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::hash::hash_types::{HashOut, RichField, NUM_HASH_OUT_ELTS};
use plonky2::hash::poseidon::PoseidonHash;
use plonky2::iop::witness::PartialWitness;
use plonky2::plonk::circuit_builder::CircuitBuilder;
use plonky2::plonk::circuit_data::{CircuitData, CommonCircuitData};
use plonky2::plonk::config::{GenericConfig, Hasher};

use crate::circuit::{encode_payload, pad_to_common_data, ConglomerationCircuit};
use crate::prover::{ConglomerationProver, ModuleRegistry, SegmentProver, WitnessStore};
use crate::public_inputs::{BundleShape, PublicInputBundle, PublicInputTargets, PublicInputValues};
use crate::segment::{
    CongloWitness, GlWitness, LppWitness, RuntimeState, SegmentKind, SegmentProof, SegmentWitness,
};
use crate::vk_tree::{verifying_key_of, VerificationKeyMerkleTree, VerifyingKey};

fn kind_tag(kind: SegmentKind) -> u64 {
    match kind {
        SegmentKind::Gl => 1,
        SegmentKind::Lpp => 2,
        SegmentKind::Conglomeration => 3,
    }
}

/// Pseudo verifying key of a synthetic module.
pub fn synthetic_vk<F: RichField>(kind: SegmentKind, module_index: usize) -> VerifyingKey<F> {
    let seed = [
        F::from_canonical_u64(kind_tag(kind)),
        F::from_canonical_usize(module_index),
    ];
    [
        PoseidonHash::hash_no_pad(&seed),
        PoseidonHash::hash_no_pad(&[seed[0], seed[1], F::ONE]),
    ]
}

pub fn synthetic_module_name(module_index: usize) -> String {
    format!("module-{module_index}")
}

/// Commitment a synthetic GL segment reports for its LPP columns.
pub fn synthetic_lpp_commitment<F: RichField>(
    module_index: usize,
    segment_index: usize,
) -> HashOut<F> {
    PoseidonHash::hash_no_pad(&[
        F::from_canonical_usize(module_index),
        F::from_canonical_usize(segment_index),
    ])
}

/// Proves the public inputs of a synthetic leaf.
pub trait LeafCircuit<F: RichField + Extendable<D>, const D: usize>: Send + Sync {
    fn verifying_key(&self) -> VerifyingKey<F>;

    /// Payload of a proof exposing `public_inputs`.
    fn prove(&self, public_inputs: &PublicInputValues<F, D>) -> Result<Vec<u8>>;
}

/// Leaf circuit exposing an arbitrary bundle as its public inputs, padded to the common data
/// shared with a conglomeration circuit. Circuits of different modules differ by a constant.
pub struct SyntheticSegmentCircuit<F, C, const D: usize>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F>,
{
    pub data: CircuitData<F, C, D>,
    bundle: PublicInputTargets<D>,
}

impl<F, C, const D: usize> SyntheticSegmentCircuit<F, C, D>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F, Hasher = PoseidonHash> + 'static,
{
    pub fn build(
        common: &CommonCircuitData<F, D>,
        shape: BundleShape,
        kind: SegmentKind,
        module_index: usize,
    ) -> Result<Self> {
        let mut builder = CircuitBuilder::<F, D>::new(common.config.clone());
        let bundle = PublicInputTargets::add_virtual(&mut builder, shape);
        bundle.register_public_inputs(&mut builder);
        let tag = F::from_canonical_u64((kind_tag(kind) << 32) | module_index as u64);
        let _tagged = builder.add_const(bundle.vkey_merkle_root[0], tag);
        pad_to_common_data(&mut builder, common);

        let data = builder.build::<C>();
        ensure!(
            data.common == *common,
            "{kind} module {module_index} circuit does not fit the shared common data"
        );
        Ok(Self { data, bundle })
    }
}

impl<F, C, const D: usize> LeafCircuit<F, D> for SyntheticSegmentCircuit<F, C, D>
where
    F: RichField + Extendable<D>,
    C: GenericConfig<D, F = F, Hasher = PoseidonHash> + 'static,
{
    fn verifying_key(&self) -> VerifyingKey<F> {
        verifying_key_of::<F, C, D>(&self.data.verifier_only)
    }

    fn prove(&self, public_inputs: &PublicInputValues<F, D>) -> Result<Vec<u8>> {
        let mut pw = PartialWitness::new();
        self.bundle.set_witness(&mut pw, public_inputs)?;
        let proof = self.data.prove(pw)?;
        encode_payload(&proof, &self.data.verifier_only)
    }
}

type LeafCircuits<F, const D: usize> = HashMap<(SegmentKind, usize), Arc<dyn LeafCircuit<F, D>>>;

/// A set of synthetic modules and the verifying key tree over them.
#[derive(Clone)]
pub struct SyntheticModules<F: RichField + Extendable<D>, const D: usize> {
    target_segment_count: Vec<usize>,
    shape: BundleShape,
    tree: VerificationKeyMerkleTree<F>,
    circuits: LeafCircuits<F, D>,
    /// Shared randomness reported by leaves built with [`Self::leaf`].
    pub seed: HashOut<F>,
}

impl<F: RichField + Extendable<D>, const D: usize> SyntheticModules<F, D> {
    /// One module per entry of `target_segment_count`, with synthetic keys throughout.
    pub fn new(target_segment_count: &[usize], num_functionals: usize) -> Result<Self> {
        let shape = BundleShape::new(num_functionals, target_segment_count.len());
        Self::assemble(
            target_segment_count,
            shape,
            synthetic_vk(SegmentKind::Conglomeration, 0),
            HashMap::new(),
        )
    }

    /// Modules backed by one [`SyntheticSegmentCircuit`] per module and kind, all sharing the
    /// common data of `conglomeration`. The tree holds the real verifying keys.
    pub fn with_circuits<C>(
        target_segment_count: &[usize],
        conglomeration: &ConglomerationCircuit<F, C, D>,
    ) -> Result<Self>
    where
        C: GenericConfig<D, F = F, Hasher = PoseidonHash> + 'static,
    {
        let shape = conglomeration.shape();
        ensure!(
            shape.num_modules == target_segment_count.len(),
            "conglomeration circuit is built for {} modules, got {}",
            shape.num_modules,
            target_segment_count.len()
        );
        let mut circuits = LeafCircuits::<F, D>::new();
        for module_index in 0..shape.num_modules {
            for kind in [SegmentKind::Gl, SegmentKind::Lpp] {
                let circuit = SyntheticSegmentCircuit::<F, C, D>::build(
                    conglomeration.common_data(),
                    shape,
                    kind,
                    module_index,
                )?;
                circuits.insert((kind, module_index), Arc::new(circuit));
            }
        }
        Self::assemble(
            target_segment_count,
            shape,
            conglomeration.verifying_key(),
            circuits,
        )
    }

    fn assemble(
        target_segment_count: &[usize],
        shape: BundleShape,
        conglomeration_vk: VerifyingKey<F>,
        circuits: LeafCircuits<F, D>,
    ) -> Result<Self> {
        let vks = |kind: SegmentKind| {
            (0..shape.num_modules)
                .map(|i| {
                    circuits
                        .get(&(kind, i))
                        .map_or_else(|| synthetic_vk(kind, i), |c| c.verifying_key())
                })
                .collect::<Vec<_>>()
        };
        let tree = VerificationKeyMerkleTree::build(
            &vks(SegmentKind::Gl),
            &vks(SegmentKind::Lpp),
            conglomeration_vk,
        )?;
        Ok(Self {
            target_segment_count: target_segment_count.to_vec(),
            shape,
            tree,
            circuits,
            seed: PoseidonHash::hash_no_pad(&[F::from_canonical_u64(0x5eed)]),
        })
    }

    pub fn tree(&self) -> &VerificationKeyMerkleTree<F> {
        &self.tree
    }

    pub fn num_modules(&self) -> usize {
        self.shape.num_modules
    }

    pub fn conglomeration_vk(&self) -> VerifyingKey<F> {
        *self.tree.conglomeration_vk()
    }

    pub fn leaf_circuit(
        &self,
        kind: SegmentKind,
        module_index: usize,
    ) -> Option<&Arc<dyn LeafCircuit<F, D>>> {
        self.circuits.get(&(kind, module_index))
    }

    fn leaf_vk(&self, kind: SegmentKind, module_index: usize) -> VerifyingKey<F> {
        self.tree
            .leaf_position(kind, module_index)
            .and_then(|position| self.tree.verifying_key(position))
            .copied()
            .unwrap_or_else(|| synthetic_vk(kind, module_index))
    }

    /// Identity-valued leaf proof for one segment of `module_index`, without a payload.
    pub fn leaf(
        &self,
        kind: SegmentKind,
        module_index: usize,
        segment_index: usize,
    ) -> SegmentProof<F, D> {
        let randomness = match kind {
            SegmentKind::Lpp => Some(self.seed),
            _ => None,
        };
        let pi = leaf_public_inputs(
            self.shape,
            kind,
            module_index,
            &self.leaf_vk(kind, module_index),
            &self.target_segment_count,
            self.tree.root(),
            randomness,
            &[],
        );
        SegmentProof {
            kind,
            module_index,
            segment_index,
            payload: vec![],
            public_inputs: pi,
            lpp_commitment: (kind == SegmentKind::Gl)
                .then(|| synthetic_lpp_commitment(module_index, segment_index)),
            runtime: None,
        }
    }

    /// Like [`Self::leaf`], with the payload proved by the module's leaf circuit.
    pub fn prove_leaf(
        &self,
        kind: SegmentKind,
        module_index: usize,
        segment_index: usize,
    ) -> Result<SegmentProof<F, D>> {
        let circuit = self
            .leaf_circuit(kind, module_index)
            .ok_or_else(|| anyhow!("no circuit for {kind} module {module_index}"))?;
        let mut proof = self.leaf(kind, module_index, segment_index);
        proof.payload = circuit.prove(&proof.public_inputs)?;
        Ok(proof)
    }

    /// Witnesses for GL segments of `gl_modules[i]` and LPP segments of `lpp_modules[i]`,
    /// numbered per module in order of appearance.
    pub fn witness_store(
        &self,
        gl_modules: &[usize],
        lpp_modules: &[usize],
    ) -> InMemoryWitnessStore<F> {
        let root = self.tree.root();
        let mut next = vec![0; self.num_modules()];
        let mut gl = Vec::with_capacity(gl_modules.len());
        for &module_index in gl_modules {
            gl.push(GlWitness {
                module_name: synthetic_module_name(module_index),
                module_index,
                segment_index: next[module_index],
                total_segment_count: self.target_segment_count.clone(),
                vk_merkle_root: root,
                columns: vec![F::from_canonical_usize(next[module_index] + 1)],
            });
            next[module_index] += 1;
        }
        let mut next = vec![0; self.num_modules()];
        let mut lpp = Vec::with_capacity(lpp_modules.len());
        for &module_index in lpp_modules {
            lpp.push(LppWitness {
                module_name: synthetic_module_name(module_index),
                module_index,
                segment_index: next[module_index],
                total_segment_count: self.target_segment_count.clone(),
                vk_merkle_root: root,
                columns: vec![],
                initial_randomness: None,
            });
            next[module_index] += 1;
        }
        InMemoryWitnessStore {
            gl,
            lpp,
            injections: HashMap::new(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> SyntheticRegistry<F, D> {
        let mut provers = HashMap::new();
        for module_index in 0..self.num_modules() {
            for kind in [SegmentKind::Gl, SegmentKind::Lpp] {
                let prover: Arc<dyn SegmentProver<F, D>> = Arc::new(SyntheticSegmentProver {
                    kind,
                    module_index,
                    shape: self.shape,
                    vk: self.leaf_vk(kind, module_index),
                    circuit: self.leaf_circuit(kind, module_index).cloned(),
                });
                provers.insert((synthetic_module_name(module_index), kind), prover);
            }
        }
        SyntheticRegistry { provers }
    }
}

fn leaf_public_inputs<F: RichField + Extendable<D>, const D: usize>(
    shape: BundleShape,
    kind: SegmentKind,
    module_index: usize,
    vk: &VerifyingKey<F>,
    target_segment_count: &[usize],
    vk_merkle_root: HashOut<F>,
    shared_randomness: Option<HashOut<F>>,
    functionals: &[F],
) -> PublicInputValues<F, D> {
    let mut pi = PublicInputValues::<F, D>::identity(shape);
    for (slot, &count) in pi.target_segment_count.iter_mut().zip(target_segment_count) {
        *slot = F::from_canonical_usize(count);
    }
    match kind {
        SegmentKind::Gl => pi.segment_count_gl[module_index] = F::ONE,
        SegmentKind::Lpp => pi.segment_count_lpp[module_index] = F::ONE,
        SegmentKind::Conglomeration => {}
    }
    for (slot, &value) in pi.functionals.iter_mut().zip(functionals) {
        *slot = value;
    }
    pi.vkey_merkle_root = vk_merkle_root.elements;
    pi.set_verifying_key(vk);
    pi.shared_randomness = shared_randomness
        .map(|h| h.elements)
        .unwrap_or([F::ZERO; NUM_HASH_OUT_ELTS]);
    pi
}

/// Proves segments of one synthetic module. Functionals are read off the witness columns and
/// the columns are kept as runtime state. Without a leaf circuit the payload is the raw columns.
pub struct SyntheticSegmentProver<F: RichField + Extendable<D>, const D: usize> {
    kind: SegmentKind,
    module_index: usize,
    shape: BundleShape,
    vk: VerifyingKey<F>,
    circuit: Option<Arc<dyn LeafCircuit<F, D>>>,
}

impl<F: RichField + Extendable<D>, const D: usize> SegmentProver<F, D>
    for SyntheticSegmentProver<F, D>
{
    fn prove(&self, witness: &SegmentWitness<'_, F, D>) -> Result<SegmentProof<F, D>> {
        let (segment_index, total, root, columns, randomness) = match witness {
            SegmentWitness::Gl(w) => (
                w.segment_index,
                &w.total_segment_count,
                w.vk_merkle_root,
                &w.columns,
                None,
            ),
            SegmentWitness::Lpp(w) => {
                let seed = w
                    .initial_randomness
                    .ok_or_else(|| anyhow!("LPP segment proved before shared randomness"))?;
                (
                    w.segment_index,
                    &w.total_segment_count,
                    w.vk_merkle_root,
                    &w.columns,
                    Some(seed),
                )
            }
            SegmentWitness::Conglo(_) => return Err(anyhow!("not a segment witness")),
        };
        ensure!(
            witness.kind() == self.kind && witness.module_index() == Some(self.module_index),
            "witness does not belong to {} module {}",
            self.kind,
            self.module_index
        );
        let public_inputs = leaf_public_inputs(
            self.shape,
            self.kind,
            self.module_index,
            &self.vk,
            total,
            root,
            randomness,
            columns,
        );
        let payload = match &self.circuit {
            Some(circuit) => circuit.prove(&public_inputs)?,
            None => columns
                .iter()
                .flat_map(|c| c.to_canonical_u64().to_le_bytes())
                .collect(),
        };
        Ok(SegmentProof {
            kind: self.kind,
            module_index: self.module_index,
            segment_index,
            payload,
            public_inputs,
            lpp_commitment: (self.kind == SegmentKind::Gl)
                .then(|| synthetic_lpp_commitment(self.module_index, segment_index)),
            runtime: Some(RuntimeState::new(columns.clone())),
        })
    }
}

pub struct SyntheticRegistry<F: RichField + Extendable<D>, const D: usize> {
    provers: HashMap<(String, SegmentKind), Arc<dyn SegmentProver<F, D>>>,
}

impl<F: RichField + Extendable<D>, const D: usize> ModuleRegistry<F, D>
    for SyntheticRegistry<F, D>
{
    fn resolve_compiled_module(
        &self,
        name: &str,
        kind: SegmentKind,
    ) -> Result<Arc<dyn SegmentProver<F, D>>> {
        self.provers
            .get(&(name.to_string(), kind))
            .cloned()
            .ok_or_else(|| anyhow!("unknown {kind} module `{name}`"))
    }
}

/// Misbehaviour injected when loading a witness.
#[derive(Clone, Copy, Debug)]
pub enum Injection {
    Fail,
    Panic,
    Delay(Duration),
}

pub struct InMemoryWitnessStore<F: RichField> {
    gl: Vec<GlWitness<F>>,
    lpp: Vec<LppWitness<F>>,
    injections: HashMap<(SegmentKind, usize), Injection>,
    loads: AtomicUsize,
}

impl<F: RichField> InMemoryWitnessStore<F> {
    pub fn inject(mut self, kind: SegmentKind, index: usize, injection: Injection) -> Self {
        self.injections.insert((kind, index), injection);
        self
    }

    pub fn num_segments(&self, kind: SegmentKind) -> usize {
        match kind {
            SegmentKind::Gl => self.gl.len(),
            SegmentKind::Lpp => self.lpp.len(),
            SegmentKind::Conglomeration => 0,
        }
    }

    /// Number of witnesses requested so far, including failed ones.
    pub fn num_loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl<F: RichField + Extendable<D>, const D: usize> WitnessStore<F, D> for InMemoryWitnessStore<F> {
    fn load_witness(
        &self,
        kind: SegmentKind,
        index: usize,
    ) -> Result<SegmentWitness<'static, F, D>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.injections.get(&(kind, index)) {
            Some(Injection::Fail) => {
                return Err(anyhow!("witness file for {kind} segment {index} is corrupted"))
            }
            Some(Injection::Panic) => panic!("{kind} witness {index} could not be decoded"),
            Some(Injection::Delay(delay)) => thread::sleep(*delay),
            None => {}
        }
        let missing = || anyhow!("no {kind} witness {index}");
        let witness = match kind {
            SegmentKind::Gl => self.gl.get(index).cloned().map(SegmentWitness::Gl),
            SegmentKind::Lpp => self.lpp.get(index).cloned().map(SegmentWitness::Lpp),
            SegmentKind::Conglomeration => {
                return Err(anyhow!("conglomeration witnesses are built in memory"))
            }
        };
        witness.ok_or_else(missing)
    }
}

/// Folds public inputs natively, without producing a proof.
#[derive(Debug)]
pub struct NativeConglomerationProver<F: RichField> {
    vk: VerifyingKey<F>,
    folds: AtomicUsize,
    panic_on_fold: Option<usize>,
}

impl<F: RichField> NativeConglomerationProver<F> {
    pub fn new(vk: VerifyingKey<F>) -> Self {
        Self {
            vk,
            folds: AtomicUsize::new(0),
            panic_on_fold: None,
        }
    }

    /// Panics on the `fold`-th call to `prove`, counting from zero.
    pub fn panicking_on(mut self, fold: usize) -> Self {
        self.panic_on_fold = Some(fold);
        self
    }

    pub fn num_folds(&self) -> usize {
        self.folds.load(Ordering::SeqCst)
    }
}

impl<F: RichField + Extendable<D>, const D: usize> ConglomerationProver<F, D>
    for NativeConglomerationProver<F>
{
    fn verifying_key(&self) -> VerifyingKey<F> {
        self.vk
    }

    fn prove(&self, witness: &CongloWitness<'_, F, D>) -> Result<SegmentProof<F, D>> {
        let fold = self.folds.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_fold == Some(fold) {
            panic!("conglomeration prover ran out of memory on fold {fold}");
        }
        let [a, b] = &witness.children;
        Ok(SegmentProof {
            kind: SegmentKind::Conglomeration,
            module_index: 0,
            segment_index: fold,
            payload: vec![],
            public_inputs: PublicInputBundle::conglomerate(
                &a.public_inputs,
                &b.public_inputs,
                &self.vk,
            ),
            lpp_commitment: None,
            runtime: Some(RuntimeState::new(fold)),
        })
    }
}
