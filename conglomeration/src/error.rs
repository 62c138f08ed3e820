use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use log::error;
use thiserror::Error;

use crate::segment::SegmentKind;

/// Stage of the pipeline an error surfaced in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Gl,
    Lpp,
    Conglomeration,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Gl => write!(f, "GL"),
            Phase::Lpp => write!(f, "LPP"),
            Phase::Conglomeration => write!(f, "conglomeration"),
        }
    }
}

/// A single failed check between two children and their parent.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("functional {index}: parent is not the sum of the children")]
    Functional { index: usize },
    #[error("target segment count of module {module} differs on instance {instance}")]
    TargetSegmentCount { module: usize, instance: usize },
    #[error("GL segment count of module {module}: parent is not the sum of the children")]
    SegmentCountGl { module: usize },
    #[error("LPP segment count of module {module}: parent is not the sum of the children")]
    SegmentCountLpp { module: usize },
    #[error("general multiset hash element {index} does not combine")]
    GeneralMultisetHash { index: usize },
    #[error("shared-randomness multiset hash element {index} does not combine")]
    SharedRandomnessMultisetHash { index: usize },
    #[error("log-derivative sum: parent is not the sum of the children")]
    LogDerivativeSum,
    #[error("horner sum: parent is not the sum of the children")]
    HornerSum,
    #[error("grand product: parent is not the product of the children")]
    GrandProduct,
    #[error("shared randomness of instance {instance} disagrees with the parent")]
    SharedRandomness { instance: usize },
    #[error("vkey merkle root of instance {instance} differs from the parent")]
    VkMerkleRoot { instance: usize },
    #[error("parent vkey merkle root is not the root of the verifying key tree")]
    ForeignVkMerkleRoot,
    #[error("instance {instance} has a different bundle shape than the parent")]
    ShapeMismatch { instance: usize },
    #[error("instance {instance} carries no segment counts")]
    EmptySegmentCounts { instance: usize },
    #[error(
        "verifying key of instance {instance} ({kind} module {module_index}) \
         is not a member of the tree at position {position}"
    )]
    VkMembership {
        instance: usize,
        position: usize,
        kind: SegmentKind,
        module_index: usize,
    },
    #[error("root {field} is not at its terminal value")]
    RootTerminal { field: &'static str },
    #[error("root counts {found} {kind} segments, expected {expected}")]
    RootSegmentTotal {
        kind: SegmentKind,
        found: u64,
        expected: u64,
    },
}

impl Violation {
    pub fn is_membership(&self) -> bool {
        matches!(self, Violation::VkMembership { .. })
    }
}

/// Every check that failed on one fold, in the order they were evaluated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn push(&mut self, violation: Violation) {
        self.0.push(violation);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    pub fn only_membership(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(Violation::is_membership)
    }

    pub fn into_result(self) -> Result<(), Violations> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Violations {}

impl From<Violation> for Violations {
    fn from(v: Violation) -> Self {
        Violations(vec![v])
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not load {kind} witness {index}")]
    WitnessLoad {
        kind: SegmentKind,
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("{kind} witness {index} has the wrong variant")]
    UnexpectedWitness { kind: SegmentKind, index: usize },
    #[error("could not resolve {kind} module `{module}` for witness {index}")]
    ModuleResolution {
        kind: SegmentKind,
        index: usize,
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{kind} prover failed on witness {index}")]
    Prover {
        kind: SegmentKind,
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("{kind} prover panicked on witness {index}: {message}")]
    ProverFault {
        kind: SegmentKind,
        index: usize,
        message: String,
        trace: String,
    },
    #[error("{kind} proof {index} could not be handed to the aggregator")]
    ProofRejected { kind: SegmentKind, index: usize },
    #[error("could not start the {kind} worker pool")]
    PoolStartup {
        kind: SegmentKind,
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("conglomeration prover failed")]
    Conglomeration(#[source] anyhow::Error),
    #[error(
        "proof stream closed with {stack} pending proofs after {received} of {total} arrivals"
    )]
    StreamClosedPrematurely {
        stack: usize,
        received: usize,
        total: usize,
    },
    #[error("all segments received but {0} proofs remain on the stack")]
    UnbalancedStack(usize),
    #[error("consistency violation: {0}")]
    ConsistencyViolation(Violations),
    #[error("merkle membership failure: {0}")]
    MerkleMembership(Violations),
    #[error("cancelled")]
    Cancelled,
    #[error("{phase} error: {source}{}", aggregator_suffix(.aggregator))]
    Phase {
        phase: Phase,
        source: Box<PipelineError>,
        aggregator: Option<Box<PipelineError>>,
    },
}

fn aggregator_suffix(aggregator: &Option<Box<PipelineError>>) -> String {
    match aggregator {
        Some(err) => format!(" (aggregator error: {err})"),
        None => String::new(),
    }
}

impl PipelineError {
    pub fn in_phase(self, phase: Phase, aggregator: Option<PipelineError>) -> Self {
        PipelineError::Phase {
            phase,
            source: Box::new(self),
            aggregator: aggregator.map(Box::new),
        }
    }

    /// Strips any phase wrapping.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::Phase { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), PipelineError::Cancelled)
    }

    /// Whether this error only reports that another part of the run stopped first.
    pub fn is_secondary(&self) -> bool {
        matches!(
            self.root_cause(),
            PipelineError::Cancelled | PipelineError::ProofRejected { .. }
        )
    }
}

impl From<Violations> for PipelineError {
    fn from(v: Violations) -> Self {
        if v.only_membership() {
            PipelineError::MerkleMembership(v)
        } else {
            PipelineError::ConsistencyViolation(v)
        }
    }
}

/// Runs `f`, turning a panic into [`PipelineError::ProverFault`] for `kind` witness `index`.
pub(crate) fn recover_fault<T>(
    kind: SegmentKind,
    index: usize,
    f: impl FnOnce() -> T,
) -> Result<T, PipelineError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| fault_from_panic(kind, index, payload.as_ref()))
}

/// Like [`recover_fault`], but the index is only read once `f` has panicked.
pub(crate) fn recover_fault_at<T>(
    kind: SegmentKind,
    index: impl FnOnce() -> usize,
    f: impl FnOnce() -> T,
) -> Result<T, PipelineError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| fault_from_panic(kind, index(), payload.as_ref()))
}

pub(crate) fn fault_from_panic(
    kind: SegmentKind,
    index: usize,
    payload: &(dyn Any + Send),
) -> PipelineError {
    let message = panic_message(payload);
    let trace = Backtrace::force_capture().to_string();
    error!("{} prover panicked on witness {}: {}", kind, index, message);
    PipelineError::ProverFault {
        kind,
        index,
        message,
        trace,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
