//! # runtime
//!
//! Orchestration around the seqcache memories.
//!
//! This crate provides:
//! - [`DecodeSession`]: batch validation, prepare, compute, apply and rollback
//! - The [`GraphCompute`] seam and a deterministic mock backend
//! - Session files holding the token history and the whole memory
//! - Structured logging and Prometheus metrics

pub mod compute;
pub mod logging;
pub mod metrics;
pub mod session;

pub use compute::{GraphCompute, MockCompute, mock_row};
pub use logging::{LogFormat, init_logging, init_logging_from_config, init_logging_from_env};
pub use metrics::CacheMetrics;
pub use session::{DecodeOutcome, DecodeSession, SESSION_MAGIC, SESSION_VERSION};
