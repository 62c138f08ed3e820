//! Streaming pairwise reduction of segment proofs.
//!
//! The aggregator owns a stack of pending proofs. After every arrival the two most recent entries
//! are folded until a single one is left, so the fold is a left fold over arrival order. All the
//! aggregated channels are commutative, which makes the root public inputs independent of that
//! order.

use std::cell::Cell;

use anyhow::anyhow;
use crossbeam::channel::select;
use log::{debug, info, warn};
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;

use crate::cancellation::CancellationToken;
use crate::consistency::check_fold;
use crate::error::{recover_fault_at, PipelineError};
use crate::prover::ConglomerationProver;
use crate::segment::{CongloWitness, SegmentKind, SegmentProof};
use crate::stream::ProofReceiver;
use crate::vk_tree::VerificationKeyMerkleTree;

pub struct Aggregator<'a, F: RichField + Extendable<D>, const D: usize> {
    prover: &'a dyn ConglomerationProver<F, D>,
    tree: &'a VerificationKeyMerkleTree<F>,
    total: usize,
    cancel: CancellationToken,
}

impl<'a, F: RichField + Extendable<D>, const D: usize> Aggregator<'a, F, D> {
    /// An aggregator expecting `total` segment proofs.
    pub fn new(
        prover: &'a dyn ConglomerationProver<F, D>,
        tree: &'a VerificationKeyMerkleTree<F>,
        total: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            prover,
            tree,
            total,
            cancel,
        }
    }

    /// Consumes the stream until the root proof is known. Any failure other than cancellation
    /// cancels the rest of the pipeline, including a panic anywhere in the fold loop, which is
    /// reported as a fault of the fold in progress. The stream is only released afterwards.
    pub fn run(self, stream: ProofReceiver<F, D>) -> Result<SegmentProof<F, D>, PipelineError> {
        let folds = Cell::new(0);
        let result = recover_fault_at(
            SegmentKind::Conglomeration,
            || folds.get(),
            || self.drain(&stream, &folds),
        )
        .and_then(|root| root);
        if let Err(err) = &result {
            if !err.is_cancelled() && self.cancel.cancel() {
                warn!("aggregator cancelled the pipeline: {err}");
            }
        }
        drop(stream);
        result
    }

    fn drain(
        &self,
        stream: &ProofReceiver<F, D>,
        folds: &Cell<usize>,
    ) -> Result<SegmentProof<F, D>, PipelineError> {
        let mut stack: Vec<SegmentProof<F, D>> = Vec::new();
        let mut received = 0;

        loop {
            while let Some(b) = stack.pop() {
                let Some(a) = stack.pop() else {
                    stack.push(b);
                    break;
                };
                let parent = self.fold(a, b, folds.get())?;
                folds.set(folds.get() + 1);
                stack.push(parent);
            }

            if received == self.total {
                return match (stack.pop(), stack.len()) {
                    (Some(root), 0) => {
                        info!("aggregated {} segments in {} folds", received, folds.get());
                        Ok(root)
                    }
                    (root, rest) => Err(PipelineError::UnbalancedStack(
                        rest + usize::from(root.is_some()),
                    )),
                };
            }

            select! {
                recv(stream.rx) -> msg => match msg {
                    Ok(proof) => {
                        received += 1;
                        info!(
                            "received {} proof {} of module {} ({}/{})",
                            proof.kind,
                            proof.segment_index,
                            proof.module_index,
                            received,
                            self.total
                        );
                        stack.push(proof);
                    }
                    Err(_) if self.cancel.is_cancelled() => {
                        debug!("proof stream closed after cancellation");
                        return Err(PipelineError::Cancelled);
                    }
                    Err(_) => {
                        if stack.len() == 1 {
                            warn!(
                                "proof stream closed after {} of {} proofs, \
                                 returning the pending one",
                                received, self.total
                            );
                            return stack.pop().ok_or(PipelineError::UnbalancedStack(0));
                        }
                        return Err(PipelineError::StreamClosedPrematurely {
                            stack: stack.len(),
                            received,
                            total: self.total,
                        });
                    }
                },
                recv(self.cancel.receiver()) -> _ => {
                    debug!(
                        "aggregator observed cancellation with {} pending proofs",
                        stack.len()
                    );
                    return Err(PipelineError::Cancelled);
                }
            }
        }
    }

    /// Folds `b` (the latest arrival) into `a`, then checks the parent against both children.
    fn fold(
        &self,
        mut a: SegmentProof<F, D>,
        mut b: SegmentProof<F, D>,
        fold_index: usize,
    ) -> Result<SegmentProof<F, D>, PipelineError> {
        a.clear_runtime();
        b.clear_runtime();

        let mut paths = Vec::with_capacity(2);
        for child in [&a, &b] {
            let path = self.tree.prove_for(child).ok_or_else(|| {
                PipelineError::Conglomeration(anyhow!(
                    "no verifying key leaf for {} module {}",
                    child.kind,
                    child.module_index
                ))
            })?;
            paths.push(path);
        }

        let witness = CongloWitness {
            children: [a, b],
            tree: self.tree,
        };
        let parent = self
            .prover
            .prove(&witness)
            .map_err(PipelineError::Conglomeration)?;

        let [a, b] = &witness.children;
        check_fold(
            self.tree,
            [&a.public_inputs, &b.public_inputs],
            &parent.public_inputs,
            [&paths[0], &paths[1]],
        )?;
        debug!(
            "fold {}: {} {} + {} {} verified",
            fold_index, a.kind, a.segment_index, b.kind, b.segment_index
        );
        Ok(parent)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::Result;
    use plonky2::field::extension::Extendable;
    use plonky2::field::types::Field;
    use plonky2::plonk::config::{GenericConfig, PoseidonGoldilocksConfig};

    use super::*;
    use crate::segment::RuntimeState;
    use crate::stream::proof_stream;
    use crate::testing::{NativeConglomerationProver, SyntheticModules};

    const D: usize = 2;
    type C = PoseidonGoldilocksConfig;
    type F = <C as GenericConfig<D>>::F;
    type FE = <F as Extendable<D>>::Extension;

    fn leaves(modules: &SyntheticModules<F, D>) -> Vec<SegmentProof<F, D>> {
        let mut leaves = vec![
            modules.leaf(SegmentKind::Gl, 0, 0),
            modules.leaf(SegmentKind::Gl, 1, 0),
            modules.leaf(SegmentKind::Lpp, 0, 0),
        ];
        leaves[1].public_inputs.grand_product = FE::TWO;
        leaves[2].public_inputs.grand_product = FE::TWO.inverse();
        leaves
    }

    #[test]
    fn folds_everything_into_one_root() -> Result<()> {
        let modules = SyntheticModules::<F, D>::new(&[2, 1], 1)?;
        let prover = NativeConglomerationProver::new(modules.conglomeration_vk());
        let cancel = CancellationToken::new();
        let (tx, rx) = proof_stream(3);
        for leaf in leaves(&modules) {
            assert!(tx.push(leaf));
        }
        let root = Aggregator::<F, D>::new(&prover, modules.tree(), 3, cancel.clone()).run(rx)?;
        assert_eq!(root.kind, SegmentKind::Conglomeration);
        assert_eq!(root.public_inputs.grand_product, FE::ONE);
        assert_eq!(root.public_inputs.segment_total(SegmentKind::Gl), 2);
        assert!(!cancel.is_cancelled());
        drop(tx);
        Ok(())
    }

    #[test]
    fn premature_close_is_an_error() -> Result<()> {
        let modules = SyntheticModules::<F, D>::new(&[2, 1], 1)?;
        let prover = NativeConglomerationProver::new(modules.conglomeration_vk());
        let cancel = CancellationToken::new();
        let (tx, rx) = proof_stream(3);
        let mut leaves = leaves(&modules);
        tx.push(leaves.remove(0));
        tx.close();

        // A single pending proof is handed back as is.
        let root = Aggregator::<F, D>::new(&prover, modules.tree(), 3, cancel.clone()).run(rx)?;
        assert_eq!(root.kind, SegmentKind::Gl);

        let (tx, rx) = proof_stream::<F, D>(3);
        tx.close();
        let err = Aggregator::<F, D>::new(&prover, modules.tree(), 3, cancel.clone())
            .run(rx)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StreamClosedPrematurely {
                stack: 0,
                received: 0,
                total: 3
            }
        ));
        assert!(cancel.is_cancelled());
        Ok(())
    }

    #[test]
    fn cancellation_wakes_the_aggregator() -> Result<()> {
        let modules = SyntheticModules::<F, D>::new(&[2, 1], 1)?;
        let prover = NativeConglomerationProver::new(modules.conglomeration_vk());
        let cancel = CancellationToken::new();
        let (tx, rx) = proof_stream::<F, D>(3);

        let err = thread::scope(|s| {
            let handle = s.spawn(|| {
                Aggregator::<F, D>::new(&prover, modules.tree(), 3, cancel.clone()).run(rx)
            });
            cancel.cancel();
            handle.join().expect("aggregator panicked")
        })
        .unwrap_err();
        assert!(err.is_cancelled());
        drop(tx);
        Ok(())
    }

    #[test]
    fn inconsistent_fold_is_reported() -> Result<()> {
        let modules = SyntheticModules::<F, D>::new(&[2, 1], 1)?;
        let prover = NativeConglomerationProver::new(modules.conglomeration_vk());
        let cancel = CancellationToken::new();
        let (tx, rx) = proof_stream(3);
        let mut leaves = leaves(&modules);
        leaves[1].public_inputs.target_segment_count[0] = F::from_canonical_u64(9);
        for leaf in leaves {
            tx.push(leaf);
        }
        let err = Aggregator::<F, D>::new(&prover, modules.tree(), 3, cancel.clone())
            .run(rx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConsistencyViolation(_)));
        assert!(cancel.is_cancelled());
        Ok(())
    }

    struct PanicsOnRelease;

    impl Drop for PanicsOnRelease {
        fn drop(&mut self) {
            if !thread::panicking() {
                panic!("runtime state released twice");
            }
        }
    }

    #[test]
    fn panic_outside_the_prover_cancels_the_run() -> Result<()> {
        let modules = SyntheticModules::<F, D>::new(&[2, 1], 1)?;
        let prover = NativeConglomerationProver::new(modules.conglomeration_vk());
        let cancel = CancellationToken::new();
        let (tx, rx) = proof_stream(3);
        let mut leaves = leaves(&modules);
        leaves[2].runtime = Some(RuntimeState::new(PanicsOnRelease));
        for leaf in leaves {
            assert!(tx.push(leaf));
        }
        let err = Aggregator::<F, D>::new(&prover, modules.tree(), 3, cancel.clone())
            .run(rx)
            .unwrap_err();
        match err {
            PipelineError::ProverFault {
                kind,
                index,
                message,
                ..
            } => {
                assert_eq!((kind, index), (SegmentKind::Conglomeration, 1));
                assert_eq!(message, "runtime state released twice");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(cancel.is_cancelled());
        assert_eq!(prover.num_folds(), 1);
        // The stream is gone, so pools can tell the run is over.
        assert!(!tx.push(modules.leaf(SegmentKind::Lpp, 1, 0)));
        Ok(())
    }
}
