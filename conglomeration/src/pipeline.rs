//! End-to-end orchestration of one proving run.
//!
//! GL segments are proved first by a bounded pool. Their proofs feed both the aggregator and the
//! derivation of the shared randomness, which seeds the LPP pool. The aggregator runs on its own
//! thread for the whole run and folds proofs as they arrive, whatever their kind.

use std::sync::OnceLock;
use std::thread::{self, ScopedJoinHandle};

use anyhow::anyhow;
use log::{debug, info, Level};
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::{HashOut, RichField};
use plonky2::timed;
use plonky2::util::timing::TimingTree;

use crate::aggregator::Aggregator;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::consistency::{check_root, RootExpectations};
use crate::error::{fault_from_panic, Phase, PipelineError};
use crate::pool::run_segment_pool;
use crate::prover::{ConglomerationProver, ModuleRegistry, WitnessStore};
use crate::randomness::derive_shared_randomness;
use crate::segment::{SegmentKind, SegmentProof};
use crate::stream::{proof_stream, ProofSender};
use crate::vk_tree::VerificationKeyMerkleTree;

type AggregatorHandle<'scope, F, const D: usize> =
    ScopedJoinHandle<'scope, Result<SegmentProof<F, D>, PipelineError>>;

pub struct Pipeline<'a, F: RichField + Extendable<D>, const D: usize> {
    config: PipelineConfig,
    witnesses: &'a dyn WitnessStore<F, D>,
    registry: &'a dyn ModuleRegistry<F, D>,
    conglomeration: &'a dyn ConglomerationProver<F, D>,
    tree: &'a VerificationKeyMerkleTree<F>,
    cancel: CancellationToken,
}

impl<'a, F: RichField + Extendable<D>, const D: usize> Pipeline<'a, F, D> {
    pub fn new(
        config: PipelineConfig,
        witnesses: &'a dyn WitnessStore<F, D>,
        registry: &'a dyn ModuleRegistry<F, D>,
        conglomeration: &'a dyn ConglomerationProver<F, D>,
        tree: &'a VerificationKeyMerkleTree<F>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        if tree.num_modules() != config.num_modules {
            return Err(PipelineError::Config(format!(
                "verifying key tree covers {} modules, configuration expects {}",
                tree.num_modules(),
                config.num_modules
            )));
        }
        if conglomeration.verifying_key() != *tree.conglomeration_vk() {
            return Err(PipelineError::Config(
                "conglomeration prover key is not the one committed in the verifying key tree"
                    .into(),
            ));
        }
        Ok(Self {
            config,
            witnesses,
            registry,
            conglomeration,
            tree,
            cancel: CancellationToken::new(),
        })
    }

    /// Token aborting this run when cancelled from outside, e.g. on a deadline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Proves every segment and folds the proofs into the root proof.
    pub fn run(self) -> Result<SegmentProof<F, D>, PipelineError> {
        let mut timing = TimingTree::new("conglomeration pipeline", Level::Info);
        let total = self.config.total_segments();
        info!(
            "starting pipeline: {} GL and {} LPP segments over {} modules",
            self.config.num_gl_segments, self.config.num_lpp_segments, self.config.num_modules
        );

        let root = thread::scope(|scope| {
            let (sender, receiver) = proof_stream(total);
            let aggregator =
                Aggregator::new(self.conglomeration, self.tree, total, self.cancel.clone());
            let handle = thread::Builder::new()
                .name("conglomeration".into())
                .spawn_scoped(scope, move || aggregator.run(receiver))
                .map_err(|err| PipelineError::Conglomeration(anyhow!(err)))?;

            let gl_slots: Vec<OnceLock<SegmentProof<F, D>>> = (0..self.config.num_gl_segments)
                .map(|_| OnceLock::new())
                .collect();
            let gl = timed!(
                timing,
                "prove GL segments",
                self.run_pool(SegmentKind::Gl, &sender, |index| {
                    let proof = self.prove_segment(SegmentKind::Gl, index, None)?;
                    let mut kept = proof.clone();
                    kept.clear_runtime();
                    let _ = gl_slots[index].set(kept);
                    Ok(proof)
                })
            );
            if let Err(err) = gl {
                return Err(self.abort(Phase::Gl, err, sender, handle));
            }

            let gl_proofs = gl_slots
                .into_iter()
                .map(OnceLock::into_inner)
                .collect::<Option<Vec<_>>>();
            let Some(gl_proofs) = gl_proofs else {
                return Err(self.abort(Phase::Gl, PipelineError::Cancelled, sender, handle));
            };
            let seed = derive_shared_randomness(&gl_proofs);
            info!("shared randomness derived from {} GL proofs", gl_proofs.len());
            debug!("shared randomness: {:?}", seed.elements);
            drop(gl_proofs);

            let lpp = timed!(
                timing,
                "prove LPP segments",
                self.run_pool(SegmentKind::Lpp, &sender, |index| {
                    self.prove_segment(SegmentKind::Lpp, index, Some(seed))
                })
            );
            if let Err(err) = lpp {
                return Err(self.abort(Phase::Lpp, err, sender, handle));
            }

            sender.close();
            let root = timed!(
                timing,
                "finish conglomeration",
                join_aggregator(handle, total)
            );
            root.map_err(|err| err.in_phase(Phase::Conglomeration, None))
        })?;

        check_root(
            &root.public_inputs,
            RootExpectations {
                num_gl: self.config.num_gl_segments,
                num_lpp: self.config.num_lpp_segments,
            },
        )
        .map_err(|violations| {
            PipelineError::from(violations).in_phase(Phase::Conglomeration, None)
        })?;

        timing.print();
        info!("pipeline finished with a valid root proof");
        Ok(root)
    }

    fn run_pool<J>(
        &self,
        kind: SegmentKind,
        sender: &ProofSender<F, D>,
        job: J,
    ) -> Result<(), PipelineError>
    where
        J: Fn(usize) -> Result<SegmentProof<F, D>, PipelineError> + Sync,
    {
        run_segment_pool(
            kind,
            self.config.num_segments(kind),
            self.config.concurrency(kind),
            &self.cancel,
            sender,
            job,
        )
    }

    /// Loads, resolves and proves witness `index` of `kind`. LPP witnesses are seeded first.
    fn prove_segment(
        &self,
        kind: SegmentKind,
        index: usize,
        seed: Option<HashOut<F>>,
    ) -> Result<SegmentProof<F, D>, PipelineError> {
        let mut witness = self
            .witnesses
            .load_witness(kind, index)
            .map_err(|source| PipelineError::WitnessLoad {
                kind,
                index,
                source,
            })?;
        if witness.kind() != kind {
            return Err(PipelineError::UnexpectedWitness { kind, index });
        }
        if let Some(seed) = seed {
            witness.set_initial_randomness(seed);
        }
        let name = witness
            .module_name()
            .ok_or(PipelineError::UnexpectedWitness { kind, index })?;
        let module = self
            .registry
            .resolve_compiled_module(name, kind)
            .map_err(|source| PipelineError::ModuleResolution {
                kind,
                index,
                module: name.to_string(),
                source,
            })?;
        let proof = module
            .prove(&witness)
            .map_err(|source| PipelineError::Prover {
                kind,
                index,
                source,
            })?;
        debug!("{} segment {} of module `{}` proved", kind, index, name);
        Ok(proof)
    }

    /// Stops the run after a pool failure and collects what the aggregator has to say.
    fn abort(
        &self,
        phase: Phase,
        err: PipelineError,
        sender: ProofSender<F, D>,
        handle: AggregatorHandle<'_, F, D>,
    ) -> PipelineError {
        self.cancel.cancel();
        sender.close();
        let aggregator = join_aggregator(handle, self.config.total_segments()).err();
        match aggregator {
            // The pool only stopped because the aggregator gave up first.
            Some(agg) if err.is_secondary() && !agg.is_cancelled() => {
                agg.in_phase(Phase::Conglomeration, None)
            }
            aggregator => err.in_phase(phase, aggregator),
        }
    }
}

/// The aggregator reports its own panics with the fold they hit. A panic escaping it anyway is
/// reported against the fold count the run was expected to reach.
fn join_aggregator<F: RichField + Extendable<D>, const D: usize>(
    handle: AggregatorHandle<'_, F, D>,
    total: usize,
) -> Result<SegmentProof<F, D>, PipelineError> {
    handle.join().unwrap_or_else(|payload| {
        Err(fault_from_panic(
            SegmentKind::Conglomeration,
            total.saturating_sub(1),
            payload.as_ref(),
        ))
    })
}
