//! Compute step seam.
//!
//! The memory layer never runs a model. A [`GraphCompute`] stands in for the
//! graph: after a micro-batch is applied it produces one K/V row per token
//! for attention layers and one r/s row per sequence set for recurrent
//! layers, and stores them through the context.

use seqcache_core::{MemoryContext, MemoryError, MemoryResult, Pos, SeqId};
use tracing::trace;

/// Trait for compute backends driven by a decode session.
pub trait GraphCompute: Send {
    /// Run the graph for the current micro-batch of `ctx`.
    ///
    /// # Arguments
    /// * `ctx` - Applied context positioned on the micro-batch
    /// * `n_layer` - Number of model layers
    ///
    /// # Returns
    /// An error if the graph failed; the caller rolls the batch back.
    fn compute(&mut self, ctx: &mut dyn MemoryContext, n_layer: u32) -> MemoryResult<()>;

    /// Re-rotate cached keys after a position shift. Most backends do this
    /// inside the graph, so the default does nothing.
    fn shift(&mut self, _ctx: &dyn MemoryContext, _n_layer: u32) -> MemoryResult<()> {
        Ok(())
    }
}

/// Deterministic row contents for layer `il`, position `pos`, sequence `seq`.
///
/// `salt` separates the two rows of a layer (0 for K/r, 1 for V/s).
pub fn mock_row(il: u32, pos: Pos, seq: SeqId, salt: u8, n: usize) -> Vec<u8> {
    let seed = (il as u64)
        .wrapping_mul(0x9e37_79b9)
        .wrapping_add((pos as u64).wrapping_mul(0x85eb_ca6b))
        .wrapping_add((seq as u64).wrapping_mul(0xc2b2_ae35))
        .wrapping_add(salt as u64);
    (0..n as u64)
        .map(|j| (seed.wrapping_add(j.wrapping_mul(31)) >> 3) as u8)
        .collect()
}

/// Compute backend writing [`mock_row`] values.
#[derive(Debug, Default, Clone)]
pub struct MockCompute {
    calls: usize,
    fail_at: Option<usize>,
}

impl MockCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th call to `compute` (0-based).
    pub fn failing_at(n: usize) -> Self {
        Self {
            calls: 0,
            fail_at: Some(n),
        }
    }

    /// Number of `compute` calls so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl GraphCompute for MockCompute {
    fn compute(&mut self, ctx: &mut dyn MemoryContext, n_layer: u32) -> MemoryResult<()> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_at == Some(call) {
            return Err(MemoryError::compute(format!("mock failure on call {call}")));
        }

        let ub = ctx
            .ubatch()
            .cloned()
            .ok_or_else(|| MemoryError::internal("compute called without a micro-batch"))?;

        for il in 0..n_layer {
            let Some(layout) = ctx.layer_layout(il) else {
                continue;
            };
            if layout.recurrent {
                // One state per sequence set, taken at the set's last token.
                for s in 0..ub.n_seqs {
                    let last = ((s + 1) * ub.n_seq_tokens - 1) as usize;
                    let seq = ub.seq_set[last].first().unwrap_or(0);
                    let r = mock_row(il, ub.pos[last], seq, 0, layout.k_row_bytes);
                    let st = mock_row(il, ub.pos[last], seq, 1, layout.v_row_bytes);
                    ctx.write_layer(il, s as usize, &r, &st)?;
                }
            } else {
                for i in 0..ub.n_tokens as usize {
                    let seq = ub.seq_set[i].first().unwrap_or(0);
                    let k = mock_row(il, ub.pos[i], seq, 0, layout.k_row_bytes);
                    let v = mock_row(il, ub.pos[i], seq, 1, layout.v_row_bytes);
                    ctx.write_layer(il, i, &k, &v)?;
                }
            }
        }
        trace!(n_tokens = ub.n_tokens, n_layer, "mock graph computed");
        Ok(())
    }
}
