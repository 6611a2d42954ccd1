//! # seqcache-core
//!
//! Core types, traits, and error definitions for the seqcache memory layer.
//!
//! This crate provides the foundational abstractions used across all other crates
//! in the workspace, including:
//!
//! - Sequence ids, positions, sequence sets and status values
//! - The `Memory` and `MemoryContext` traits implemented by every cache variant
//! - Batch validation and micro-batch splitting
//! - The byte-stream codec used for state save/restore
//! - Unified error handling via `MemoryError`
//! - Configuration structures

pub mod batch;
pub mod config;
pub mod error;
pub mod io;
pub mod tensor;
pub mod traits;
pub mod types;

pub use batch::{Batch, BatchAllocator, BatchOptions, Ubatch};
pub use config::{
    CacheConfig, CacheKind, DType, LoggingConfig, MetricsConfig, ModelConfig, RuntimeConfig,
    SeqcacheConfig, SwaType,
};
pub use error::{MemoryError, MemoryResult};
pub use io::{
    BufferWriter, FileReader, FileWriter, SizeCounter, SliceReader, SliceWriter, StateRead,
    StateWrite,
};
pub use tensor::TensorBuf;
pub use traits::{LayerLayout, Memory, MemoryContext, StatusContext};
pub use types::{
    MemoryStatus, Pos, SEQ_ID_ALL, SEQ_MAX, SeqId, SeqSet, StateFlags, Token, is_valid_seq,
    normalize_range,
};
