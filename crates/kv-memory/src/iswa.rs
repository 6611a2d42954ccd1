//! Sliding-window dual cache.
//!
//! Full-attention layers live in a context-sized cache, window layers in a
//! cache sized for the window. Both see the same micro-batches.

use seqcache_core::{
    BatchAllocator, CacheConfig, LayerLayout, Memory, MemoryContext, MemoryResult, MemoryStatus,
    ModelConfig, Pos, SeqId, StateFlags, StateRead, StateWrite, Ubatch,
};
use tracing::{debug, info};

use crate::kv_cache::{KvCache, KvCacheContext, KvCacheParams, SlotInfo};

/// Cells needed by the window cache: every sequence's window plus one
/// micro-batch, padded.
pub fn windowed_size(config: &CacheConfig, n_swa: u32) -> u32 {
    if config.swa_full {
        return config.kv_size;
    }
    let need = n_swa
        .saturating_mul(config.n_seq_max)
        .saturating_add(config.n_ubatch);
    let padded = need.div_ceil(config.n_pad).saturating_mul(config.n_pad);
    config.kv_size.min(padded)
}

#[derive(Debug, Clone)]
pub struct KvCacheIswa {
    full: KvCache,
    windowed: KvCache,
}

impl KvCacheIswa {
    pub fn new(model: &ModelConfig, config: &CacheConfig) -> MemoryResult<Self> {
        let base = KvCacheParams::from_config(config);
        let size_swa = windowed_size(config, model.n_swa);

        let full = KvCache::new("full", model, base.clone(), &|il| {
            !model.is_recurrent(il) && !model.is_swa(il)
        })?;
        let windowed = KvCache::new(
            "windowed",
            model,
            base.with_swa(model.n_swa, model.swa_type)
                .with_size(size_swa),
            &|il| !model.is_recurrent(il) && model.is_swa(il),
        )?;

        info!(
            kv_size = config.kv_size,
            size_swa,
            swa_full = config.swa_full,
            "sliding-window cache ready"
        );
        Ok(Self { full, windowed })
    }

    /// Cache holding the full-attention layers.
    pub fn full(&self) -> &KvCache {
        &self.full
    }

    /// Cache holding the window layers.
    pub fn windowed(&self) -> &KvCache {
        &self.windowed
    }

    fn split_and_prepare(
        &mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
    ) -> Option<(Vec<Ubatch>, Vec<SlotInfo>, Vec<SlotInfo>)> {
        for equal in [false, true] {
            balloc.split_reset();
            let mut ubatches = Vec::new();
            loop {
                let ub = if equal {
                    balloc.split_equal(n_ubatch, false)
                } else {
                    balloc.split_simple(n_ubatch)
                };
                if ub.is_empty() {
                    break;
                }
                ubatches.push(ub);
            }
            if !balloc.is_done() {
                continue;
            }
            let Some(sinfos_full) = self.full.prepare(&ubatches) else {
                debug!(equal, "full cache cannot hold the batch");
                continue;
            };
            let Some(sinfos_swa) = self.windowed.prepare(&ubatches) else {
                debug!(equal, "window cache cannot hold the batch");
                continue;
            };
            return Some((ubatches, sinfos_full, sinfos_swa));
        }
        None
    }
}

impl Memory for KvCacheIswa {
    fn name(&self) -> &'static str {
        "iswa"
    }

    fn init_batch<'a>(
        &'a mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
        _embd_all: bool,
    ) -> Box<dyn MemoryContext + 'a> {
        match self.split_and_prepare(balloc, n_ubatch) {
            Some((ubatches, sinfos_full, sinfos_swa)) => Box::new(IswaContext::new(
                KvCacheContext::for_batch(&mut self.full, ubatches.clone(), sinfos_full),
                KvCacheContext::for_batch(&mut self.windowed, ubatches, sinfos_swa),
            )),
            None => Box::new(IswaContext::new(
                KvCacheContext::failed(&mut self.full, MemoryStatus::FailedPrepare),
                KvCacheContext::failed(&mut self.windowed, MemoryStatus::FailedPrepare),
            )),
        }
    }

    fn init_full<'a>(&'a mut self) -> Box<dyn MemoryContext + 'a> {
        Box::new(IswaContext::new(
            KvCacheContext::full(&mut self.full),
            KvCacheContext::full(&mut self.windowed),
        ))
    }

    fn init_update<'a>(&'a mut self, optimize: bool) -> Box<dyn MemoryContext + 'a> {
        let full = KvCacheContext::update(&mut self.full, optimize);
        let windowed = KvCacheContext::update(&mut self.windowed, optimize);
        let status = full.status().combine_update(windowed.status());
        Box::new(IswaContext {
            full,
            windowed,
            status,
        })
    }

    fn clear(&mut self, data: bool) {
        self.full.clear(data);
        self.windowed.clear(data);
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        let res_full = self.full.seq_rm(seq, p0, p1);
        let res_swa = self.windowed.seq_rm(seq, p0, p1);
        res_full && res_swa
    }

    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        self.full.seq_cp(src, dst, p0, p1);
        self.windowed.seq_cp(src, dst, p0, p1);
    }

    fn seq_keep(&mut self, seq: SeqId) {
        self.full.seq_keep(seq);
        self.windowed.seq_keep(seq);
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, shift: Pos) {
        self.full.seq_add(seq, p0, p1, shift);
        self.windowed.seq_add(seq, p0, p1, shift);
    }

    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32) {
        self.full.seq_div(seq, p0, p1, d);
        self.windowed.seq_div(seq, p0, p1, d);
    }

    fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.windowed.seq_pos_min(seq)
    }

    fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.windowed.seq_pos_max(seq)
    }

    fn can_shift(&self) -> bool {
        self.full.can_shift() && self.windowed.can_shift() && self.full.size() == self.windowed.size()
    }

    fn state_write(&self, io: &mut dyn StateWrite, seq: SeqId, flags: StateFlags) -> MemoryResult<()> {
        if !flags.contains(StateFlags::SWA_ONLY) {
            self.full.state_write(io, seq, flags)?;
        }
        self.windowed.state_write(io, seq, flags)
    }

    fn state_read(&mut self, io: &mut dyn StateRead, seq: SeqId, flags: StateFlags) -> MemoryResult<()> {
        if flags.contains(StateFlags::SWA_ONLY) {
            return self.windowed.state_read(io, seq, flags);
        }
        let saved_full = self.full.clone();
        self.full.state_read(io, seq, flags)?;
        if let Err(e) = self.windowed.state_read(io, seq, flags) {
            self.full = saved_full;
            return Err(e);
        }
        Ok(())
    }

    fn n_layer_owned(&self) -> u32 {
        self.full.n_layer_owned() + self.windowed.n_layer_owned()
    }

    fn total_size(&self) -> usize {
        self.full.total_size() + self.windowed.total_size()
    }

    fn used(&self) -> u32 {
        self.full.used() + self.windowed.used()
    }

    fn size(&self) -> u32 {
        self.full.size() + self.windowed.size()
    }
}

/// Pair of contexts sharing the same micro-batches, routed by layer.
pub struct IswaContext<'a> {
    full: KvCacheContext<'a>,
    windowed: KvCacheContext<'a>,
    status: MemoryStatus,
}

impl<'a> IswaContext<'a> {
    pub fn new(full: KvCacheContext<'a>, windowed: KvCacheContext<'a>) -> Self {
        let status = full.status().combine(windowed.status());
        Self {
            full,
            windowed,
            status,
        }
    }

    pub fn full(&self) -> &KvCacheContext<'a> {
        &self.full
    }

    pub fn windowed(&self) -> &KvCacheContext<'a> {
        &self.windowed
    }

    fn route(&self, il: u32) -> &KvCacheContext<'a> {
        if self.full.cache().has_layer(il) {
            &self.full
        } else {
            &self.windowed
        }
    }
}

impl MemoryContext for IswaContext<'_> {
    fn status(&self) -> MemoryStatus {
        self.status
    }

    fn ubatch(&self) -> Option<&Ubatch> {
        self.full.ubatch()
    }

    fn next(&mut self) -> bool {
        let more_full = self.full.next();
        let more_swa = self.windowed.next();
        debug_assert_eq!(more_full, more_swa);
        more_full && more_swa
    }

    fn apply(&mut self) -> bool {
        if self.status.is_fail() {
            return false;
        }
        let ok_full = self.full.apply();
        let ok_swa = self.windowed.apply();
        ok_full && ok_swa
    }

    fn rollback(&mut self) {
        self.windowed.rollback();
        self.full.rollback();
        self.status = MemoryStatus::FailedCompute;
    }

    fn layer_layout(&self, il: u32) -> Option<LayerLayout> {
        self.full
            .layer_layout(il)
            .or_else(|| self.windowed.layer_layout(il))
    }

    fn write_layer(&mut self, il: u32, row: usize, k: &[u8], v: &[u8]) -> MemoryResult<()> {
        if self.full.cache().has_layer(il) {
            self.full.write_layer(il, row, k, v)
        } else {
            self.windowed.write_layer(il, row, k, v)
        }
    }

    fn n_kv(&self, il: u32) -> u32 {
        self.route(il).n_kv(il)
    }

    fn slots(&self, il: u32) -> Option<Vec<u32>> {
        self.route(il).slots(il)
    }

    fn kq_mask(&self, il: u32) -> Option<Vec<f32>> {
        self.route(il).kq_mask(il)
    }

    fn k_shift(&self, il: u32) -> Option<Vec<Pos>> {
        self.route(il).k_shift(il)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcache_core::{Batch, BatchOptions, BufferWriter, SwaType};

    fn model() -> ModelConfig {
        ModelConfig::attention(4, 8, 8).with_swa(4, SwaType::Standard, 2)
    }

    fn config(kv_size: u32) -> CacheConfig {
        CacheConfig {
            kv_size,
            n_pad: 1,
            n_ubatch: 1,
            n_seq_max: 1,
            ..CacheConfig::default()
        }
    }

    fn step(mem: &mut KvCacheIswa, pos: Pos) -> MemoryStatus {
        let mut batch = Batch::new();
        batch.add(1, pos, &[0], true);
        let mut balloc = BatchAllocator::new();
        balloc
            .init(&batch, Some(&*mem), BatchOptions::new(1))
            .unwrap();
        let mut ctx = mem.init_batch(&mut balloc, 8, false);
        let status = ctx.status();
        if status == MemoryStatus::Success {
            assert!(ctx.apply());
        }
        status
    }

    #[test]
    fn test_window_size() {
        let mut cfg = config(100);
        assert_eq!(windowed_size(&cfg, 4), 5);
        cfg.n_pad = 4;
        assert_eq!(windowed_size(&cfg, 4), 8);
        cfg.swa_full = true;
        assert_eq!(windowed_size(&cfg, 4), 100);
    }

    #[test]
    fn test_layers_split_between_caches() {
        let mem = KvCacheIswa::new(&model(), &config(100)).unwrap();
        assert_eq!(mem.full().n_layer_owned(), 2);
        assert_eq!(mem.windowed().n_layer_owned(), 2);
        assert!(mem.windowed().has_layer(0));
        assert!(mem.full().has_layer(1));
        assert!(!mem.can_shift());
    }

    #[test]
    fn test_window_retains_recent_positions() {
        let mut mem = KvCacheIswa::new(&model(), &config(100)).unwrap();
        for p in 0..20 {
            assert_eq!(step(&mut mem, p), MemoryStatus::Success);
        }
        assert_eq!(mem.full().seq_pos_min(0), 0);
        assert_eq!(mem.full().seq_pos_max(0), 19);
        assert_eq!(mem.seq_pos_min(0), 16);
        assert_eq!(mem.seq_pos_max(0), 19);
        assert_eq!(mem.windowed().used(), 4);

        let mut swa_only = BufferWriter::new();
        mem.state_write(&mut swa_only, 0, StateFlags::SWA_ONLY).unwrap();
        let mut both = BufferWriter::new();
        mem.state_write(&mut both, 0, StateFlags::empty()).unwrap();
        assert!(swa_only.n_bytes() < both.n_bytes());
    }

    #[test]
    fn test_update_status_combines() {
        let mut mem = KvCacheIswa::new(&model(), &config(16)).unwrap();
        assert_eq!(
            mem.init_update(false).status(),
            MemoryStatus::NoUpdate
        );
        step(&mut mem, 0);
        step(&mut mem, 1);
        mem.seq_add(0, -1, -1, 2);
        assert_eq!(mem.init_update(false).status(), MemoryStatus::Success);
    }
}
