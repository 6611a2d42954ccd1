//! # kv-memory
//!
//! Sequence-indexed memory for transformer and state-space decoders.
//!
//! This crate provides the cache variants behind the `Memory` trait:
//! - `KvCache`: unified attention cache, optionally sliding-window
//! - `RecurrentMemory`: one state slot per sequence, copy-on-write sharing
//! - `KvCacheIswa`: full-context cache plus window cache, routed by layer
//! - `HybridMemory`: attention cache plus recurrent cache, routed by layer
//!
//! # Example
//!
//! ```ignore
//! use kv_memory::build_memory;
//! use seqcache_core::{Batch, BatchAllocator, BatchOptions, CacheConfig, ModelConfig};
//!
//! let mut memory = build_memory(&CacheConfig::default(), &ModelConfig::tiny())?;
//!
//! let mut batch = Batch::new();
//! batch.add(1, 0, &[0], false).add(2, 1, &[0], true);
//!
//! let mut balloc = BatchAllocator::new();
//! balloc.init(&batch, Some(&*memory), BatchOptions::default())?;
//!
//! let mut ctx = memory.init_batch(&mut balloc, 512, false);
//! while ctx.apply() {
//!     // run the graph, then store rows through ctx.write_layer(...)
//!     if !ctx.next() {
//!         break;
//!     }
//! }
//! ```

pub mod cells;
pub mod hybrid;
pub mod iswa;
pub mod kv_cache;
pub mod recurrent;

// Re-exports for convenience
pub use cells::KvCells;
pub use hybrid::{HybridContext, HybridMemory};
pub use iswa::{IswaContext, KvCacheIswa, windowed_size};
pub use kv_cache::{KV_STATE_TAG, KvCache, KvCacheContext, KvCacheParams, SlotInfo};
pub use recurrent::{RS_STATE_TAG, RecurrentContext, RecurrentMemory, RecurrentParams};

use seqcache_core::{CacheConfig, CacheKind, Memory, MemoryError, MemoryResult, ModelConfig};
use tracing::info;

/// Build the cache variant selected by `config.kind` for `model`.
///
/// # Arguments
/// * `config` - Cache parameters
/// * `model` - Layer dimensions and layer classification
///
/// # Returns
/// A boxed memory, or a configuration error when the variant cannot serve
/// the model's layers.
pub fn build_memory(config: &CacheConfig, model: &ModelConfig) -> MemoryResult<Box<dyn Memory>> {
    config.validate()?;
    model.validate()?;

    let memory: Box<dyn Memory> = match config.kind {
        CacheKind::Unified => {
            if model.has_recurrent() {
                return Err(MemoryError::config(
                    "model has recurrent layers, use kind=hybrid",
                ));
            }
            let mut params = KvCacheParams::from_config(config);
            if model.has_swa() {
                let all_swa = (0..model.n_layer).all(|il| model.is_swa(il));
                if !all_swa {
                    return Err(MemoryError::config(
                        "model mixes window and full-attention layers, use kind=iswa",
                    ));
                }
                params = params.with_swa(model.n_swa, model.swa_type);
            }
            Box::new(KvCache::new("unified", model, params, &|_| true)?)
        }
        CacheKind::Recurrent => {
            if model.has_attention() {
                return Err(MemoryError::config(
                    "model has attention layers, use kind=hybrid",
                ));
            }
            Box::new(RecurrentMemory::new(
                "recurrent",
                model,
                RecurrentParams::from_config(config),
                &|_| true,
            )?)
        }
        CacheKind::Iswa => {
            if model.has_recurrent() {
                return Err(MemoryError::config(
                    "model has recurrent layers, use kind=hybrid",
                ));
            }
            if !model.has_swa() {
                return Err(MemoryError::config(
                    "kind=iswa needs sliding-window layers",
                ));
            }
            Box::new(KvCacheIswa::new(model, config)?)
        }
        CacheKind::Hybrid => {
            if !model.has_recurrent() {
                return Err(MemoryError::config(
                    "kind=hybrid needs recurrent layers",
                ));
            }
            Box::new(HybridMemory::new(model, config)?)
        }
    };

    info!(
        kind = memory.name(),
        size = memory.size(),
        n_layer = memory.n_layer_owned(),
        total_bytes = memory.total_size(),
        "memory built"
    );
    Ok(memory)
}
