//! Hybrid cache: attention layers and recurrent layers side by side.

use seqcache_core::{
    BatchAllocator, CacheConfig, LayerLayout, Memory, MemoryContext, MemoryError, MemoryResult,
    MemoryStatus, ModelConfig, Pos, SeqId, StateFlags, StateRead, StateWrite, SwaType, Ubatch,
    is_valid_seq, normalize_range,
};
use tracing::{debug, info, warn};

use crate::kv_cache::{KvCache, KvCacheContext, KvCacheParams};
use crate::recurrent::{RecurrentContext, RecurrentMemory, RecurrentParams};

#[derive(Debug, Clone)]
pub struct HybridMemory {
    attn: KvCache,
    recr: RecurrentMemory,
}

impl HybridMemory {
    /// Attention layers either all use the model's window or none do.
    pub fn new(model: &ModelConfig, config: &CacheConfig) -> MemoryResult<Self> {
        let mut params = KvCacheParams::from_config(config);
        let attn_layers: Vec<u32> = (0..model.n_layer)
            .filter(|&il| !model.is_recurrent(il))
            .collect();
        let n_swa = attn_layers.iter().filter(|&&il| model.is_swa(il)).count();
        if model.swa_type != SwaType::None && n_swa > 0 {
            if n_swa < attn_layers.len() {
                return Err(MemoryError::config(
                    "hybrid model mixes window and full-attention layers",
                ));
            }
            params = params.with_swa(model.n_swa, model.swa_type);
        }
        let attn = KvCache::new("attn", model, params, &|il| !model.is_recurrent(il))?;
        let recr = RecurrentMemory::new(
            "recr",
            model,
            RecurrentParams::from_config(config),
            &|il| model.is_recurrent(il),
        )?;
        info!(
            attn_layers = attn.n_layer_owned(),
            recr_layers = recr.n_layer_owned(),
            "hybrid cache ready"
        );
        Ok(Self { attn, recr })
    }

    pub fn attn(&self) -> &KvCache {
        &self.attn
    }

    pub fn recr(&self) -> &RecurrentMemory {
        &self.recr
    }

    fn prepare(
        &mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
        embd_all: bool,
    ) -> Option<(Vec<Ubatch>, Vec<Vec<u32>>, Vec<crate::kv_cache::SlotInfo>)> {
        let ubatches = RecurrentMemory::split(balloc, n_ubatch, embd_all)?;
        let slots = self.recr.prepare(&ubatches)?;
        let sinfos = self.attn.prepare(&ubatches)?;
        Some((ubatches, slots, sinfos))
    }
}

impl Memory for HybridMemory {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn init_batch<'a>(
        &'a mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
        embd_all: bool,
    ) -> Box<dyn MemoryContext + 'a> {
        match self.prepare(balloc, n_ubatch, embd_all) {
            Some((ubatches, slots, sinfos)) => Box::new(HybridContext::new(
                KvCacheContext::for_batch(&mut self.attn, ubatches.clone(), sinfos),
                RecurrentContext::for_batch(&mut self.recr, ubatches, slots),
            )),
            None => {
                debug!("hybrid cache cannot hold the batch");
                Box::new(HybridContext::new(
                    KvCacheContext::failed(&mut self.attn, MemoryStatus::FailedPrepare),
                    RecurrentContext::failed(&mut self.recr, MemoryStatus::FailedPrepare),
                ))
            }
        }
    }

    fn init_full<'a>(&'a mut self) -> Box<dyn MemoryContext + 'a> {
        Box::new(HybridContext::new(
            KvCacheContext::full(&mut self.attn),
            RecurrentContext::full(&mut self.recr),
        ))
    }

    fn init_update<'a>(&'a mut self, optimize: bool) -> Box<dyn MemoryContext + 'a> {
        let attn = KvCacheContext::update(&mut self.attn, optimize);
        let recr = RecurrentContext::failed(&mut self.recr, MemoryStatus::NoUpdate);
        let status = attn.status().combine_update(recr.status());
        Box::new(HybridContext { attn, recr, status })
    }

    fn clear(&mut self, data: bool) {
        self.attn.clear(data);
        self.recr.clear(data);
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        if !self.recr.can_rm(seq, p0, p1) {
            return false;
        }
        let res_recr = self.recr.seq_rm(seq, p0, p1);
        let res_attn = self.attn.seq_rm(seq, p0, p1);
        res_recr && res_attn
    }

    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        if src == dst || !is_valid_seq(src) || !is_valid_seq(dst) {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);
        let (min, max) = (self.seq_pos_min(src), self.seq_pos_max(src));
        if max >= 0 && (p0 > min || p1 <= max) {
            warn!(src, dst, p0, p1, "partial copy of a hybrid sequence ignored");
            return;
        }
        self.attn.seq_rm(dst, -1, -1);
        self.recr.seq_rm(dst, -1, -1);
        self.attn.seq_cp(src, dst, p0, p1);
        self.recr.seq_cp(src, dst, p0, p1);
    }

    fn seq_keep(&mut self, seq: SeqId) {
        self.attn.seq_keep(seq);
        self.recr.seq_keep(seq);
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, shift: Pos) {
        self.attn.seq_add(seq, p0, p1, shift);
        self.recr.seq_add(seq, p0, p1, shift);
    }

    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32) {
        self.attn.seq_div(seq, p0, p1, d);
        self.recr.seq_div(seq, p0, p1, d);
    }

    fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.attn.seq_pos_min(seq).max(self.recr.seq_pos_min(seq))
    }

    fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.attn.seq_pos_max(seq).min(self.recr.seq_pos_max(seq))
    }

    fn can_shift(&self) -> bool {
        self.attn.can_shift() && self.recr.can_shift()
    }

    fn state_write(&self, io: &mut dyn StateWrite, seq: SeqId, flags: StateFlags) -> MemoryResult<()> {
        self.attn.state_write(io, seq, flags)?;
        self.recr.state_write(io, seq, flags)
    }

    fn state_read(&mut self, io: &mut dyn StateRead, seq: SeqId, flags: StateFlags) -> MemoryResult<()> {
        let saved_attn = self.attn.clone();
        self.attn.state_read(io, seq, flags)?;
        if let Err(e) = self.recr.state_read(io, seq, flags) {
            self.attn = saved_attn;
            return Err(e);
        }
        Ok(())
    }

    fn n_layer_owned(&self) -> u32 {
        self.attn.n_layer_owned() + self.recr.n_layer_owned()
    }

    fn total_size(&self) -> usize {
        self.attn.total_size() + self.recr.total_size()
    }

    fn used(&self) -> u32 {
        self.attn.used() + self.recr.used()
    }

    fn size(&self) -> u32 {
        self.attn.size() + self.recr.size()
    }
}

/// Attention and recurrent contexts over the same micro-batches.
pub struct HybridContext<'a> {
    attn: KvCacheContext<'a>,
    recr: RecurrentContext<'a>,
    status: MemoryStatus,
}

impl<'a> HybridContext<'a> {
    pub fn new(attn: KvCacheContext<'a>, recr: RecurrentContext<'a>) -> Self {
        let status = attn.status().combine(recr.status());
        Self { attn, recr, status }
    }

    fn is_recurrent(&self, il: u32) -> bool {
        self.recr.memory().has_layer(il)
    }
}

impl MemoryContext for HybridContext<'_> {
    fn status(&self) -> MemoryStatus {
        self.status
    }

    fn ubatch(&self) -> Option<&Ubatch> {
        self.attn.ubatch()
    }

    fn next(&mut self) -> bool {
        let more_attn = self.attn.next();
        let more_recr = self.recr.next();
        debug_assert_eq!(more_attn, more_recr);
        more_attn && more_recr
    }

    fn apply(&mut self) -> bool {
        if self.status.is_fail() {
            return false;
        }
        let ok_attn = self.attn.apply();
        let ok_recr = self.recr.apply();
        if !ok_recr {
            self.status = MemoryStatus::FailedPrepare;
        }
        ok_attn && ok_recr
    }

    fn rollback(&mut self) {
        self.recr.rollback();
        self.attn.rollback();
        self.status = MemoryStatus::FailedCompute;
    }

    fn layer_layout(&self, il: u32) -> Option<LayerLayout> {
        if self.is_recurrent(il) {
            self.recr.layer_layout(il)
        } else {
            self.attn.layer_layout(il)
        }
    }

    fn write_layer(&mut self, il: u32, row: usize, k: &[u8], v: &[u8]) -> MemoryResult<()> {
        if self.is_recurrent(il) {
            self.recr.write_layer(il, row, k, v)
        } else {
            self.attn.write_layer(il, row, k, v)
        }
    }

    fn n_kv(&self, il: u32) -> u32 {
        if self.is_recurrent(il) {
            self.recr.n_kv(il)
        } else {
            self.attn.n_kv(il)
        }
    }

    fn slots(&self, il: u32) -> Option<Vec<u32>> {
        if self.is_recurrent(il) {
            self.recr.slots(il)
        } else {
            self.attn.slots(il)
        }
    }

    fn kq_mask(&self, il: u32) -> Option<Vec<f32>> {
        self.attn.kq_mask(il)
    }

    fn k_shift(&self, il: u32) -> Option<Vec<Pos>> {
        self.attn.k_shift(il)
    }
}
