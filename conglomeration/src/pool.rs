use std::sync::{Mutex, PoisonError};

use log::{debug, error, info};
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;
use rayon::ThreadPoolBuilder;

use crate::cancellation::CancellationToken;
use crate::error::{recover_fault, PipelineError};
use crate::segment::{SegmentKind, SegmentProof};
use crate::stream::ProofSender;

/// Proves segments `0..count` of `kind` with at most `concurrency` of them in flight, pushing
/// every proof to `sender` as soon as it is ready.
///
/// `job` produces the proof for one witness index. Panics inside it are recovered as
/// [`PipelineError::ProverFault`]. A proof the stream refuses fails its task with
/// [`PipelineError::ProofRejected`]. The first failing task raises `cancel`; tasks not yet started
/// are then skipped and finished ones drop their proof instead of pushing it. Returns once every
/// task has finished or been skipped.
pub fn run_segment_pool<F, const D: usize, J>(
    kind: SegmentKind,
    count: usize,
    concurrency: usize,
    cancel: &CancellationToken,
    sender: &ProofSender<F, D>,
    job: J,
) -> Result<(), PipelineError>
where
    F: RichField + Extendable<D>,
    J: Fn(usize) -> Result<SegmentProof<F, D>, PipelineError> + Sync,
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .thread_name(move |i| format!("{kind}-prover-{i}"))
        .build()
        .map_err(|source| PipelineError::PoolStartup { kind, source })?;
    let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);

    info!(
        "proving {} {} segments, {} at a time",
        count, kind, concurrency
    );
    pool.scope_fifo(|scope| {
        for index in 0..count {
            let job = &job;
            let first_error = &first_error;
            scope.spawn_fifo(move |_| {
                if cancel.is_cancelled() {
                    debug!("skipping {} segment {}: cancelled", kind, index);
                    return;
                }
                let proved = recover_fault(kind, index, || {
                    job(index).map(|mut proof| {
                        proof.clear_runtime();
                        proof
                    })
                });
                let pushed = proved.and_then(|proof| proof).and_then(|proof| {
                    if cancel.is_cancelled() {
                        debug!("discarding {} proof {}: cancelled", kind, index);
                        Ok(())
                    } else if sender.push(proof) {
                        Ok(())
                    } else {
                        Err(PipelineError::ProofRejected { kind, index })
                    }
                });
                if let Err(err) = pushed {
                    error!("{} segment {} failed: {}", kind, index, err);
                    let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    drop(slot);
                    cancel.cancel();
                }
            });
        }
    });

    match first_error
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        Some(err) => Err(err),
        None if cancel.is_cancelled() => Err(PipelineError::Cancelled),
        None => {
            info!("all {} {} segments proved", count, kind);
            Ok(())
        }
    }
}
