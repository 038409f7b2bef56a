//! Error taxonomy for the engine boundary.
//!
//! Structural errors (`LoadError`, `CompileError`) are fatal for the chart
//! that produced them and surface to the caller. Everything the interpreter
//! hits at runtime is an `EngineError`: resolution and user-code failures
//! abort the offending step but leave the instance alive, while
//! `MicrostepOverflow` and `StepTimeout` park the instance in an error
//! status until it is stopped.

use thiserror::Error;

/// What went wrong while reading a chart description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The input is not valid JSON/YAML at all.
    Syntax,
    /// A key has the wrong shape (e.g. `after` key that is not integer ms).
    BadShape,
    /// A required key is missing (`id`, compound `initial`).
    MissingKey,
    /// A key is present where the dialect forbids it (parallel `initial`).
    ForbiddenKey,
    /// An unknown structured-action `type`.
    UnknownActionType,
}

impl std::fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadErrorKind::Syntax => "syntax",
            LoadErrorKind::BadShape => "bad shape",
            LoadErrorKind::MissingKey => "missing key",
            LoadErrorKind::ForbiddenKey => "forbidden key",
            LoadErrorKind::UnknownActionType => "unknown action type",
        };
        f.write_str(s)
    }
}

/// Loader failure, annotated with the dotted path of the offending node.
#[derive(Clone, Debug, Error)]
#[error("load error at `{path}` ({kind}): {detail}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub path: String,
    pub detail: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Compile-time (verify + lower) failure.
#[derive(Clone, Debug, Error)]
pub enum CompileError {
    #[error("structural error at `{path}`: {detail}")]
    Structural { path: String, detail: String },

    #[error("duplicate state path `{path}`")]
    DuplicateState { path: String },

    #[error("invalid target reference `{target}` from `{from_path}`")]
    UnresolvedTarget { from_path: String, target: String },

    #[error(
        "dense layout rejected: {namespace} namespace has {count} entries \
         (ceiling {ceiling}); use the frozen layout instead"
    )]
    IdOverflow {
        namespace: &'static str,
        count: usize,
        ceiling: usize,
    },
}

/// Anything the engine facade can fail with: loading, compiling, or a
/// runtime refusal.
#[derive(Clone, Debug, Error)]
pub enum ChartError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Runtime failures surfaced at the engine boundary.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    #[error("context registries are frozen")]
    ContextFrozen,

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("unknown guard `{0}`")]
    UnknownGuard(String),

    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error("unknown peer `{0}`")]
    UnknownPeer(String),

    #[error("unknown machine `{0}`")]
    UnknownMachine(String),

    #[error("microstep fixpoint exceeded {0} iterations")]
    MicrostepOverflow(u32),

    #[error("step exceeded its wall-time bound of {0} ms")]
    StepTimeout(u64),

    #[error("invalid target reference `{0}`")]
    InvalidTargetReference(String),

    /// A host-supplied action or guard returned an error.
    #[error("host {kind} `{name}` failed: {message}")]
    HostFault {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// The instance's mailbox is gone (stopped and dropped).
    #[error("instance `{0}` is not running")]
    InstanceGone(String),
}

impl EngineError {
    /// Short machine-readable code recorded under the `error_code` context
    /// key when a step fails.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ContextFrozen => "context_frozen",
            EngineError::UnknownAction(_) => "unknown_action",
            EngineError::UnknownGuard(_) => "unknown_guard",
            EngineError::UnknownService(_) => "unknown_service",
            EngineError::UnknownPeer(_) => "unknown_peer",
            EngineError::UnknownMachine(_) => "unknown_machine",
            EngineError::MicrostepOverflow(_) => "microstep_overflow",
            EngineError::StepTimeout(_) => "step_timeout",
            EngineError::InvalidTargetReference(_) => "invalid_target",
            EngineError::HostFault { .. } => "host_fault",
            EngineError::InstanceGone(_) => "instance_gone",
        }
    }

    /// Infrastructure faults stop event intake until the instance is
    /// explicitly stopped or reset.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::MicrostepOverflow(_) | EngineError::StepTimeout(_)
        )
    }
}
