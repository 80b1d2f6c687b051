//! Error types for the reader and its collaborators.
//!
//! Engine calls fail with an [`EngineError`]. Most of them are soft: the
//! orchestrator logs them and abandons the current job chain. Only session
//! setup failures surface through [`ReaderError`].

use thiserror::Error;

use crate::engine::{InteropKind, PipelineKind};

/// A failed call into the decode engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine library could not be loaded or instantiated
    #[error("decode engine is not available")]
    Unavailable,
    /// The engine rejected the call with a failure code
    #[error("{call} failed (code {code:#x})")]
    Call {
        /// Name of the engine call
        call: &'static str,
        /// Engine failure code
        code: i32,
    },
    /// The engine does not implement the requested capability
    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),
}

impl EngineError {
    /// Generic failure code used when the engine does not report one.
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;

    /// Shorthand for a failed call with the generic failure code.
    pub fn failed(call: &'static str) -> Self {
        EngineError::Call {
            call,
            code: Self::E_FAIL,
        }
    }
}

/// Result of a decode engine call.
pub type EngineResult<T> = Result<T, EngineError>;

/// Pipeline or device selection failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// No enumerated pipeline/interop pair matches the request
    #[error("no {pipeline:?} pipeline with {interop:?} interop is available")]
    NoPipeline {
        /// Requested pipeline (`None` for auto)
        pipeline: Option<PipelineKind>,
        /// Requested interop
        interop: InteropKind,
    },
    /// The selected pipeline enumerated no usable device
    #[error("no device for {pipeline:?} pipeline{}", filter_suffix(.filter))]
    NoDevice {
        /// Pipeline that was selected
        pipeline: PipelineKind,
        /// Device name filter in effect, if any
        filter: Option<String>,
    },
    /// Binding or preparing the device failed
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn filter_suffix(filter: &Option<String>) -> String {
    match filter {
        Some(f) => format!(" matching '{f}'"),
        None => String::new(),
    }
}

/// Host mapping of a native buffer failed on every fallback path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The buffer has no resource manager to map through
    #[error("buffer has no resource manager")]
    NoResourceManager,
    /// The load session that produced the buffer has been torn down
    #[error("buffer outlived its session")]
    SessionClosed,
    /// Direct host pointer, readback copy and interop paths all failed
    #[error("no host mapping available for {0:?} resource")]
    Unmappable(crate::engine::ResourceType),
    /// An engine call inside the fallback chain failed hard
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value '{value}' for option '{key}'")]
pub struct OptionsError {
    /// Option key
    pub key: String,
    /// Rejected value
    pub value: String,
}

/// Reason a `load` did not produce a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    /// A session is already loaded
    #[error("a clip is already loaded")]
    AlreadyLoaded,
    /// The source could not be opened as a clip
    #[error("failed to open clip '{locator}': {source}")]
    OpenFailed {
        /// Source locator passed to `load`
        locator: String,
        /// Underlying engine failure
        source: EngineError,
    },
    /// The clip has no frames
    #[error("clip has no frames")]
    EmptyClip,
    /// Pipeline selection failed
    #[error(transparent)]
    Select(#[from] SelectError),
    /// An engine call during setup failed
    #[error(transparent)]
    Engine(#[from] EngineError),
}
