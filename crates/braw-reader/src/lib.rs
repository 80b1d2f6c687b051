//! braw-reader: Blackmagic RAW frame reader.
//!
//! This crate plugs a callback-driven raw decode engine into a media
//! framework's frame reader contract. It contains:
//!
//! - Orchestrator: [`reader`] (load, play, seek, unload and the job chain)
//! - Engine contract: [`engine`], [`jobs`], with [`simulated`] as an
//!   in-process engine for tests and demos
//! - Pipeline and device selection: [`device`]
//! - Seek coordination: [`seek`]
//! - Native buffer lifetime and host mapping: [`buffer_pool`], [`interop`]
//! - Framework-facing types: [`video`], [`frame_queue`], [`registry`]
//! - Configuration and counters: [`options`], [`diagnostics`], [`error`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use braw_reader::frame_queue::FrameQueue;
//! use braw_reader::reader::BrawReader;
//! use braw_reader::simulated::SimulatedEngine;
//! use braw_reader::ReaderOptions;
//!
//! let queue = Arc::new(FrameQueue::new(4));
//! let reader = BrawReader::new(
//!     Arc::new(SimulatedEngine::default()),
//!     queue.clone(),
//!     ReaderOptions::default(),
//! );
//! reader.try_load("A001_C001.braw").unwrap();
//! while let Some(frame) = queue.pop_blocking(Duration::from_secs(1)) {
//!     println!("frame at {:.3}s", frame.timestamp);
//! }
//! ```

// === Contract types ===

pub mod engine;
pub mod error;
pub mod jobs;
pub mod video;

// === Session building blocks ===

pub mod buffer_pool;
pub mod device;
pub mod diagnostics;
pub mod interop;
pub mod options;
pub mod seek;

// === Orchestration ===

pub mod frame_queue;
pub mod reader;
pub mod registry;
pub mod simulated;

pub use buffer_pool::{NativeBuffer, NativeBufferPool, NativeBufferRef};
pub use diagnostics::StatsSnapshot;
pub use error::{BufferError, EngineError, OptionsError, ReaderError, SelectError};
pub use options::{OutputSize, ReaderOptions};
pub use reader::BrawReader;
pub use seek::{SeekFlags, SeekMode, SeekOutcome};
pub use video::{
    FrameReader, FrameSink, MediaInfo, MediaStatus, PixelFormat, PlaybackState, ReaderEvent,
    VideoFrame,
};
