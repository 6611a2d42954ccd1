//! Trait definitions shared by every memory variant.

use crate::batch::{BatchAllocator, Ubatch};
use crate::error::MemoryResult;
use crate::io::{StateRead, StateWrite};
use crate::types::{MemoryStatus, Pos, SeqId, StateFlags};

/// Row layout of one layer as seen by the compute step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerLayout {
    /// Recurrent layers are written once per sequence set, attention layers
    /// once per token.
    pub recurrent: bool,
    /// Bytes per K (or rolling state) row.
    pub k_row_bytes: usize,
    /// Bytes per V (or recurrent state) row.
    pub v_row_bytes: usize,
}

/// Sequence-indexed memory of a decoder.
///
/// Every mutating operation takes `&mut self`, and prepared contexts borrow
/// the memory mutably for their whole lifetime.
pub trait Memory: Send {
    /// Short variant name for logs.
    fn name(&self) -> &'static str;

    /// Split `balloc` into micro-batches and reserve room for all of them.
    ///
    /// # Arguments
    /// * `balloc` - Initialized allocator; it is reset and consumed
    /// * `n_ubatch` - Maximum tokens per micro-batch
    /// * `embd_all` - Every token is an output
    ///
    /// # Returns
    /// A context positioned on the first micro-batch, or a context in
    /// [`MemoryStatus::FailedPrepare`]. Nothing is committed until `apply`.
    fn init_batch<'a>(
        &'a mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
        embd_all: bool,
    ) -> Box<dyn MemoryContext + 'a>;

    /// Context spanning the whole memory, used to reserve compute graphs.
    fn init_full<'a>(&'a mut self) -> Box<dyn MemoryContext + 'a>;

    /// Context for pending maintenance (position shifts, defragmentation).
    ///
    /// # Returns
    /// [`MemoryStatus::NoUpdate`] when nothing is pending.
    fn init_update<'a>(&'a mut self, optimize: bool) -> Box<dyn MemoryContext + 'a>;

    /// Drop all sequences. With `data`, buffers are zeroed too.
    fn clear(&mut self, data: bool);

    /// Remove `seq` (or every sequence for `-1`) from positions `[p0, p1)`.
    ///
    /// # Returns
    /// `false` when the removal cannot be represented; nothing changes then.
    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool;

    /// Make `dst` share the `src` entries in `[p0, p1)`.
    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos);

    /// Drop every sequence except `seq`.
    fn seq_keep(&mut self, seq: SeqId);

    /// Add `shift` to the positions of `seq` in `[p0, p1)`.
    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, shift: Pos);

    /// Integer-divide the positions of `seq` in `[p0, p1)` by `d`.
    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32);

    /// Smallest stored position of `seq`, `-1` if none.
    fn seq_pos_min(&self, seq: SeqId) -> Pos;

    /// Largest stored position of `seq`, `-1` if none.
    fn seq_pos_max(&self, seq: SeqId) -> Pos;

    /// Whether stored positions may be shifted in place.
    fn can_shift(&self) -> bool;

    /// Serialize one sequence, or all of them for `-1`.
    fn state_write(&self, io: &mut dyn StateWrite, seq: SeqId, flags: StateFlags) -> MemoryResult<()>;

    /// Restore state written by [`Memory::state_write`].
    ///
    /// On error the memory is left unchanged.
    fn state_read(&mut self, io: &mut dyn StateRead, seq: SeqId, flags: StateFlags) -> MemoryResult<()>;

    /// Number of layers with storage in this memory.
    fn n_layer_owned(&self) -> u32;

    /// Total buffer size in bytes.
    fn total_size(&self) -> usize;

    /// Occupied cells or slots.
    fn used(&self) -> u32;

    /// Capacity in cells or slots.
    fn size(&self) -> u32;
}

/// A prepared unit of work against a [`Memory`].
///
/// Batch contexts are driven as: `apply`, compute, `next`, until `next`
/// returns false. Dropping a context before `apply` leaves the memory
/// untouched.
pub trait MemoryContext {
    fn status(&self) -> MemoryStatus;

    /// Current micro-batch (batch contexts only).
    fn ubatch(&self) -> Option<&Ubatch>;

    /// Advance to the next micro-batch.
    ///
    /// # Returns
    /// `false` when there are no more micro-batches.
    fn next(&mut self) -> bool;

    /// Commit the current micro-batch (or the pending update).
    ///
    /// # Returns
    /// `false` if the context is in a failure status.
    fn apply(&mut self) -> bool;

    /// Undo everything applied through this context.
    ///
    /// Afterwards the status is [`MemoryStatus::FailedCompute`].
    fn rollback(&mut self);

    /// Layout of layer `il`, `None` if the memory has no storage for it.
    fn layer_layout(&self, il: u32) -> Option<LayerLayout>;

    /// Store the compute step's output for one row of the current micro-batch.
    ///
    /// For attention layers `row` is a token index within the micro-batch;
    /// for recurrent layers it is a sequence-set index.
    fn write_layer(&mut self, il: u32, row: usize, k: &[u8], v: &[u8]) -> MemoryResult<()>;

    /// Number of cells the attention kernel must visit for layer `il`.
    fn n_kv(&self, _il: u32) -> u32 {
        0
    }

    /// Cells (or slots) written by the current micro-batch for layer `il`.
    fn slots(&self, _il: u32) -> Option<Vec<u32>> {
        None
    }

    /// Attention mask for layer `il`: `n_tokens * n_kv` values of `0.0` or
    /// negative infinity.
    fn kq_mask(&self, _il: u32) -> Option<Vec<f32>> {
        None
    }

    /// Pending per-cell position shifts for layer `il` (update contexts).
    fn k_shift(&self, _il: u32) -> Option<Vec<Pos>> {
        None
    }
}

/// Context that carries only a status.
#[derive(Debug, Clone, Copy)]
pub struct StatusContext {
    status: MemoryStatus,
}

impl StatusContext {
    pub fn new(status: MemoryStatus) -> Self {
        Self { status }
    }
}

impl MemoryContext for StatusContext {
    fn status(&self) -> MemoryStatus {
        self.status
    }

    fn ubatch(&self) -> Option<&Ubatch> {
        None
    }

    fn next(&mut self) -> bool {
        false
    }

    fn apply(&mut self) -> bool {
        !self.status.is_fail()
    }

    fn rollback(&mut self) {
        self.status = MemoryStatus::FailedCompute;
    }

    fn layer_layout(&self, _il: u32) -> Option<LayerLayout> {
        None
    }

    fn write_layer(&mut self, il: u32, _row: usize, _k: &[u8], _v: &[u8]) -> MemoryResult<()> {
        Err(crate::error::MemoryError::internal(format!(
            "status context has no storage for layer {il}"
        )))
    }
}
