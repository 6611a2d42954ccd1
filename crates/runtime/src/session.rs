//! Decode session: drives a memory through prepare, compute and apply.

use std::path::Path;
use std::time::Instant;

use kv_memory::build_memory;
use seqcache_core::{
    Batch, BatchAllocator, BatchOptions, BufferWriter, FileReader, FileWriter, Memory,
    MemoryError, MemoryResult, MemoryStatus, ModelConfig, Pos, SEQ_ID_ALL, SeqId, SeqcacheConfig,
    SizeCounter, SliceReader, StateFlags, StateRead, StateWrite, Token,
};
use tracing::{debug, info, instrument, warn};

use crate::compute::{GraphCompute, MockCompute};
use crate::metrics::CacheMetrics;

/// Leading tag of a session file.
pub const SESSION_MAGIC: &str = "seqcache-session";

/// Session file layout version.
pub const SESSION_VERSION: u32 = 1;

/// Upper bound on the token history accepted from a session file.
const MAX_SESSION_TOKENS: u32 = 1 << 24;

/// Result of [`DecodeSession::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// `Success`, `FailedPrepare` (nothing changed) or `FailedCompute`
    /// (everything rolled back).
    pub status: MemoryStatus,
    /// Micro-batches computed and applied.
    pub n_ubatches: usize,
    /// Tokens flagged as outputs.
    pub n_outputs: u32,
}

impl DecodeOutcome {
    pub fn is_success(&self) -> bool {
        self.status == MemoryStatus::Success
    }
}

/// One memory plus the compute step that fills it.
pub struct DecodeSession {
    memory: Box<dyn Memory>,
    compute: Box<dyn GraphCompute>,
    n_layer: u32,
    n_ubatch: u32,
    n_seq_max: u32,
    tokens: Vec<Token>,
    metrics: CacheMetrics,
}

impl DecodeSession {
    /// Build the memory described by `config` and drive it with `compute`.
    pub fn new(config: &SeqcacheConfig, compute: Box<dyn GraphCompute>) -> MemoryResult<Self> {
        let memory = build_memory(&config.cache, &config.model)?;
        Ok(Self::with_memory(
            memory,
            compute,
            &config.model,
            config.cache.n_ubatch,
            config.cache.n_seq_max,
        ))
    }

    /// Session over `config` using [`MockCompute`].
    pub fn new_mock(config: &SeqcacheConfig) -> MemoryResult<Self> {
        Self::new(config, Box::new(MockCompute::new()))
    }

    /// Wrap an existing memory.
    pub fn with_memory(
        memory: Box<dyn Memory>,
        compute: Box<dyn GraphCompute>,
        model: &ModelConfig,
        n_ubatch: u32,
        n_seq_max: u32,
    ) -> Self {
        info!(
            kind = memory.name(),
            n_layer = model.n_layer,
            n_ubatch,
            n_seq_max,
            "decode session created"
        );
        Self {
            memory,
            compute,
            n_layer: model.n_layer,
            n_ubatch,
            n_seq_max,
            tokens: Vec::new(),
            metrics: CacheMetrics::init_noop(),
        }
    }

    /// Report through `metrics` instead of the no-op recorder.
    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn memory(&self) -> &dyn Memory {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut dyn Memory {
        self.memory.as_mut()
    }

    /// Tokens decoded so far, in submission order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Decode one batch.
    ///
    /// Pending maintenance runs first. A batch that does not fit returns
    /// `FailedPrepare` and leaves the memory untouched; a compute failure
    /// rolls back every micro-batch of the batch and returns `FailedCompute`.
    ///
    /// # Errors
    /// Invalid batches (bad ids, broken position sequences) are errors.
    #[instrument(skip(self, batch), fields(n_tokens = batch.len()))]
    pub fn decode(&mut self, batch: &Batch) -> MemoryResult<DecodeOutcome> {
        let start = Instant::now();

        let mut balloc = BatchAllocator::new();
        balloc.init(
            batch,
            Some(self.memory.as_ref()),
            BatchOptions::new(self.n_seq_max),
        )?;
        let n_outputs = balloc.n_outputs();

        self.update(false)?;

        let n_layer = self.n_layer;
        let embd_all = balloc.all_outputs();
        let mut ctx = self.memory.init_batch(&mut balloc, self.n_ubatch, embd_all);
        if ctx.status() != MemoryStatus::Success {
            debug!(status = %ctx.status(), "batch does not fit");
            self.metrics.prepare_failed();
            return Ok(DecodeOutcome {
                status: ctx.status(),
                n_ubatches: 0,
                n_outputs: 0,
            });
        }

        let mut n_ubatches = 0;
        loop {
            if !ctx.apply() {
                warn!(status = %ctx.status(), "apply refused");
                ctx.rollback();
                self.metrics.prepare_failed();
                return Ok(DecodeOutcome {
                    status: MemoryStatus::FailedPrepare,
                    n_ubatches: 0,
                    n_outputs: 0,
                });
            }
            if let Err(e) = self.compute.compute(&mut *ctx, n_layer) {
                warn!(error = %e, ubatch = n_ubatches, "compute failed, rolling back batch");
                ctx.rollback();
                self.metrics.compute_failed();
                return Ok(DecodeOutcome {
                    status: ctx.status(),
                    n_ubatches: 0,
                    n_outputs: 0,
                });
            }
            n_ubatches += 1;
            if !ctx.next() {
                break;
            }
        }
        drop(ctx);

        self.tokens.extend_from_slice(&batch.token);
        self.metrics.batch_applied(n_ubatches);
        self.metrics
            .record_decode_latency(start.elapsed().as_secs_f64() * 1000.0);
        self.metrics
            .set_occupancy(self.memory.name(), self.memory.used(), self.memory.size());

        Ok(DecodeOutcome {
            status: MemoryStatus::Success,
            n_ubatches,
            n_outputs,
        })
    }

    /// Run pending maintenance.
    ///
    /// # Returns
    /// `true` if a K-shift or defragmentation was applied.
    pub fn update(&mut self, optimize: bool) -> MemoryResult<bool> {
        let n_layer = self.n_layer;
        let mut ctx = self.memory.init_update(optimize);
        match ctx.status() {
            MemoryStatus::NoUpdate => Ok(false),
            MemoryStatus::Success => {
                self.compute.shift(&*ctx, n_layer)?;
                ctx.apply();
                self.metrics.update_applied();
                debug!(optimize, "maintenance applied");
                Ok(true)
            }
            status => Err(MemoryError::internal(format!(
                "maintenance context reported {status}"
            ))),
        }
    }

    pub fn clear(&mut self) {
        self.memory.clear(true);
        self.tokens.clear();
    }

    pub fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        self.memory.seq_rm(seq, p0, p1)
    }

    pub fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        self.memory.seq_cp(src, dst, p0, p1);
    }

    pub fn seq_keep(&mut self, seq: SeqId) {
        self.memory.seq_keep(seq);
    }

    pub fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, shift: Pos) {
        self.memory.seq_add(seq, p0, p1, shift);
    }

    pub fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32) {
        self.memory.seq_div(seq, p0, p1, d);
    }

    pub fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.memory.seq_pos_min(seq)
    }

    pub fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.memory.seq_pos_max(seq)
    }

    /// Bytes [`DecodeSession::seq_state`] would produce.
    pub fn seq_state_size(&self, seq: SeqId, flags: StateFlags) -> MemoryResult<usize> {
        let mut counter = SizeCounter::new();
        self.memory.state_write(&mut counter, seq, flags)?;
        Ok(counter.n_bytes())
    }

    /// Serialize one sequence (or all with `-1`) into memory.
    pub fn seq_state(&self, seq: SeqId, flags: StateFlags) -> MemoryResult<Vec<u8>> {
        let mut out = BufferWriter::with_capacity(self.seq_state_size(seq, flags)?);
        self.memory.state_write(&mut out, seq, flags)?;
        self.metrics.record_state_bytes(out.n_bytes());
        Ok(out.into_inner())
    }

    /// Restore bytes from [`DecodeSession::seq_state`] into `seq`.
    ///
    /// # Returns
    /// Number of bytes consumed.
    pub fn set_seq_state(&mut self, seq: SeqId, data: &[u8], flags: StateFlags) -> MemoryResult<usize> {
        let mut reader = SliceReader::new(data);
        self.memory.state_read(&mut reader, seq, flags)?;
        let consumed = reader.n_bytes();
        self.metrics.record_state_bytes(consumed);
        Ok(consumed)
    }

    /// Write the token history and the whole memory to `path`.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn save_session(&self, path: impl AsRef<Path>) -> MemoryResult<usize> {
        let mut out = FileWriter::create(path.as_ref())?;
        out.write_string(SESSION_MAGIC)?;
        out.write_u32(SESSION_VERSION)?;
        out.write_u32(self.tokens.len() as u32)?;
        for &t in &self.tokens {
            out.write_u32(t)?;
        }
        self.memory
            .state_write(&mut out, SEQ_ID_ALL, StateFlags::empty())?;
        let written = out.finish()?;
        self.metrics.record_state_bytes(written);
        info!(bytes = written, n_tokens = self.tokens.len(), "session saved");
        Ok(written)
    }

    /// Replace the memory and token history with the contents of `path`.
    ///
    /// On error the session is left unchanged.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> MemoryResult<usize> {
        let mut input = FileReader::open(path.as_ref())?;
        let magic = input.read_string()?;
        if magic != SESSION_MAGIC {
            return Err(MemoryError::state_format(format!(
                "not a session file (found {magic:?})"
            )));
        }
        let version = input.read_u32()?;
        if version != SESSION_VERSION {
            return Err(MemoryError::state_format(format!(
                "unsupported session version {version}"
            )));
        }
        let n_tokens = input.read_u32()?;
        if n_tokens > MAX_SESSION_TOKENS {
            return Err(MemoryError::state_format(format!(
                "session holds {n_tokens} tokens, limit is {MAX_SESSION_TOKENS}"
            )));
        }
        let mut tokens = Vec::with_capacity(n_tokens as usize);
        for _ in 0..n_tokens {
            tokens.push(input.read_u32()?);
        }

        self.memory
            .state_read(&mut input, SEQ_ID_ALL, StateFlags::empty())?;
        self.tokens = tokens;
        let consumed = input.n_bytes();
        self.metrics.record_state_bytes(consumed);
        info!(bytes = consumed, n_tokens, "session loaded");
        Ok(consumed)
    }
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("memory", &self.memory.name())
            .field("used", &self.memory.used())
            .field("size", &self.memory.size())
            .field("n_tokens", &self.tokens.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcache_core::CacheConfig;

    fn config(kv_size: u32) -> SeqcacheConfig {
        SeqcacheConfig {
            model: ModelConfig::tiny(),
            cache: CacheConfig {
                kv_size,
                n_pad: 1,
                n_seq_max: 2,
                ..CacheConfig::default()
            },
            runtime: Default::default(),
        }
    }

    fn tokens(seq: SeqId, start: Pos, n: Pos) -> Batch {
        let mut batch = Batch::new();
        for p in start..start + n {
            batch.add(p as Token, p, &[seq], p == start + n - 1);
        }
        batch
    }

    #[test]
    fn test_decode_success() {
        let mut session = DecodeSession::new_mock(&config(16)).unwrap();
        let outcome = session.decode(&tokens(0, 0, 4)).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.n_ubatches, 1);
        assert_eq!(outcome.n_outputs, 1);
        assert_eq!(session.seq_pos_max(0), 3);
        assert_eq!(session.tokens(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_decode_full_memory() {
        let mut session = DecodeSession::new_mock(&config(4)).unwrap();
        assert!(session.decode(&tokens(0, 0, 4)).unwrap().is_success());
        let outcome = session.decode(&tokens(0, 4, 1)).unwrap();
        assert_eq!(outcome.status, MemoryStatus::FailedPrepare);
        assert_eq!(session.tokens().len(), 4);
    }

    #[test]
    fn test_compute_failure_rolls_back() {
        let cfg = config(16);
        let mut session = DecodeSession::new(&cfg, Box::new(MockCompute::failing_at(1))).unwrap();
        assert!(session.decode(&tokens(0, 0, 2)).unwrap().is_success());
        let outcome = session.decode(&tokens(0, 2, 2)).unwrap();
        assert_eq!(outcome.status, MemoryStatus::FailedCompute);
        assert_eq!(session.seq_pos_max(0), 1);
        assert_eq!(session.memory().used(), 2);
    }

    #[test]
    fn test_invalid_batch_is_error() {
        let mut session = DecodeSession::new_mock(&config(16)).unwrap();
        assert!(session.decode(&tokens(5, 0, 1)).is_err());
        assert!(session.decode(&Batch::new()).is_err());
    }

    #[test]
    fn test_update_after_shift() {
        let mut session = DecodeSession::new_mock(&config(16)).unwrap();
        session.decode(&tokens(0, 0, 4)).unwrap();
        assert!(!session.update(false).unwrap());
        session.seq_add(0, -1, -1, 2);
        assert!(session.update(false).unwrap());
        assert!(!session.update(false).unwrap());
    }

    #[test]
    fn test_seq_state_size_matches() {
        let mut session = DecodeSession::new_mock(&config(16)).unwrap();
        session.decode(&tokens(1, 0, 3)).unwrap();
        let size = session.seq_state_size(1, StateFlags::empty()).unwrap();
        let data = session.seq_state(1, StateFlags::empty()).unwrap();
        assert_eq!(data.len(), size);

        session.seq_rm(1, -1, -1);
        assert_eq!(session.set_seq_state(0, &data, StateFlags::empty()).unwrap(), size);
        assert_eq!(session.seq_pos_max(0), 2);
    }
}
