use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error};
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;

use crate::segment::SegmentProof;

/// Producer side of the proof stream. Cloned into every worker.
#[derive(Clone, Debug)]
pub struct ProofSender<F: RichField + Extendable<D>, const D: usize> {
    tx: Sender<SegmentProof<F, D>>,
}

/// Consumer side of the proof stream, owned by the aggregator.
#[derive(Debug)]
pub struct ProofReceiver<F: RichField + Extendable<D>, const D: usize> {
    pub(crate) rx: Receiver<SegmentProof<F, D>>,
}

/// Creates a stream holding up to `capacity` proofs. Sized to the number of expected segments,
/// pushing never has to wait for the aggregator.
pub fn proof_stream<F: RichField + Extendable<D>, const D: usize>(
    capacity: usize,
) -> (ProofSender<F, D>, ProofReceiver<F, D>) {
    let (tx, rx) = bounded(capacity);
    (ProofSender { tx }, ProofReceiver { rx })
}

impl<F: RichField + Extendable<D>, const D: usize> ProofSender<F, D> {
    /// Delivers a proof without blocking. Returns `false` if it could not be delivered, either
    /// because the aggregator is gone or because more proofs were pushed than the stream holds.
    pub fn push(&self, proof: SegmentProof<F, D>) -> bool {
        match self.tx.try_send(proof) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(proof)) => {
                debug!(
                    "aggregator gone, dropping {} proof {}",
                    proof.kind, proof.segment_index
                );
                false
            }
            Err(TrySendError::Full(proof)) => {
                error!(
                    "proof stream full, dropping {} proof {}",
                    proof.kind,
                    proof.segment_index
                );
                false
            }
        }
    }

    /// Signals that no more proofs will be pushed by this handle.
    pub fn close(self) {
        drop(self.tx);
    }
}

impl<F: RichField + Extendable<D>, const D: usize> ProofReceiver<F, D> {
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use plonky2::field::goldilocks_field::GoldilocksField;

    use super::*;
    use crate::public_inputs::{BundleShape, PublicInputValues};
    use crate::segment::SegmentKind;

    type F = GoldilocksField;
    const D: usize = 2;

    fn proof(segment_index: usize) -> SegmentProof<F, D> {
        SegmentProof {
            kind: SegmentKind::Lpp,
            module_index: 0,
            segment_index,
            payload: vec![],
            public_inputs: PublicInputValues::<F, D>::identity(BundleShape::new(0, 1)),
            lpp_commitment: None,
            runtime: None,
        }
    }

    #[test]
    fn push_never_blocks() {
        let (tx, rx) = proof_stream::<F, D>(2);
        assert!(tx.push(proof(0)));
        assert!(tx.clone().push(proof(1)));
        assert!(!tx.push(proof(2)));
        assert_eq!(rx.len(), 2);

        tx.close();
        let received: Vec<_> = rx.rx.iter().map(|p| p.segment_index).collect();
        assert_eq!(received, vec![0, 1]);
    }

    #[test]
    fn push_after_receiver_dropped() {
        let (tx, rx) = proof_stream::<F, D>(1);
        drop(rx);
        assert!(!tx.push(proof(0)));
    }
}
