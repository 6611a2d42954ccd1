//! Unified attention cache.
//!
//! One K and one V buffer per attention layer, `kv_size` rows each. Every
//! token of a micro-batch occupies one cell; cells may be shared by several
//! sequences after `seq_cp`.

use seqcache_core::{
    BatchAllocator, CacheConfig, DType, LayerLayout, Memory, MemoryContext, MemoryError,
    MemoryResult, MemoryStatus, ModelConfig, Pos, SEQ_ID_ALL, SEQ_MAX, SeqId, SeqSet, StateFlags,
    StateRead, StateWrite, SwaType, TensorBuf, Ubatch, is_valid_seq, normalize_range,
};
use tracing::{debug, info, instrument, warn};

use crate::cells::KvCells;

/// Section tag written before attention cache state.
pub const KV_STATE_TAG: &str = "kv-cache";

/// Construction parameters for a [`KvCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct KvCacheParams {
    pub type_k: DType,
    pub type_v: DType,
    pub kv_size: u32,
    pub n_seq_max: u32,
    pub n_pad: u32,
    pub n_swa: u32,
    pub swa_type: SwaType,
    pub offload: bool,
    pub defrag_thold: f32,
}

impl KvCacheParams {
    /// Parameters of a cache without a sliding window.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            type_k: config.type_k,
            type_v: config.type_v,
            kv_size: config.kv_size,
            n_seq_max: config.n_seq_max,
            n_pad: config.n_pad,
            n_swa: 0,
            swa_type: SwaType::None,
            offload: config.offload,
            defrag_thold: config.defrag_thold,
        }
    }

    pub fn with_swa(mut self, n_swa: u32, swa_type: SwaType) -> Self {
        self.n_swa = n_swa;
        self.swa_type = swa_type;
        self
    }

    pub fn with_size(mut self, kv_size: u32) -> Self {
        self.kv_size = kv_size;
        self
    }
}

/// Cells chosen for one micro-batch, one per token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotInfo {
    pub idxs: Vec<u32>,
}

#[derive(Debug, Clone)]
struct KvLayer {
    il: u32,
    k: TensorBuf,
    v: TensorBuf,
}

/// Saved K/V rows of one cell across all layers.
#[derive(Debug, Clone)]
pub(crate) struct RowBackup {
    cell: u32,
    rows: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct KvCache {
    name: &'static str,
    params: KvCacheParams,
    layers: Vec<KvLayer>,
    layer_ids: Vec<Option<usize>>,
    cells: KvCells,
    head: u32,
}

impl KvCache {
    /// Allocate buffers for every layer of `model` accepted by `filter`.
    pub fn new(
        name: &'static str,
        model: &ModelConfig,
        params: KvCacheParams,
        filter: &dyn Fn(u32) -> bool,
    ) -> MemoryResult<Self> {
        if params.kv_size == 0 {
            return Err(MemoryError::config(format!("{name}: kv_size must be positive")));
        }
        if params.n_pad == 0 {
            return Err(MemoryError::config(format!("{name}: n_pad must be positive")));
        }

        let mut layers = Vec::new();
        let mut layer_ids = vec![None; model.n_layer as usize];
        for il in (0..model.n_layer).filter(|&il| filter(il)) {
            layer_ids[il as usize] = Some(layers.len());
            layers.push(KvLayer {
                il,
                k: TensorBuf::zeros(
                    format!("cache_k_l{il}"),
                    params.type_k,
                    model.n_embd_k_gqa as usize,
                    params.kv_size as usize,
                ),
                v: TensorBuf::zeros(
                    format!("cache_v_l{il}"),
                    params.type_v,
                    model.n_embd_v_gqa as usize,
                    params.kv_size as usize,
                ),
            });
        }

        let cache = Self {
            name,
            cells: KvCells::new(params.kv_size),
            params,
            layers,
            layer_ids,
            head: 0,
        };
        info!(
            cache = name,
            kv_size = cache.params.kv_size,
            n_layer = cache.layers.len(),
            type_k = %cache.params.type_k,
            type_v = %cache.params.type_v,
            n_swa = cache.params.n_swa,
            size_mib = cache.total_size() as f64 / (1024.0 * 1024.0),
            "attention cache allocated"
        );
        Ok(cache)
    }

    pub fn params(&self) -> &KvCacheParams {
        &self.params
    }

    /// The cell ledger.
    pub fn cells(&self) -> &KvCells {
        &self.cells
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn has_layer(&self, il: u32) -> bool {
        self.layer_index(il).is_some()
    }

    fn layer_index(&self, il: u32) -> Option<usize> {
        self.layer_ids.get(il as usize).copied().flatten()
    }

    pub fn layer_layout(&self, il: u32) -> Option<LayerLayout> {
        self.layer_index(il).map(|li| LayerLayout {
            recurrent: false,
            k_row_bytes: self.layers[li].k.row_bytes(),
            v_row_bytes: self.layers[li].v.row_bytes(),
        })
    }

    /// K row of `cell` in layer `il`.
    pub fn k_row(&self, il: u32, cell: u32) -> Option<&[u8]> {
        let li = self.layer_index(il)?;
        (cell < self.size()).then(|| self.layers[li].k.row(cell as usize))
    }

    /// V row of `cell` in layer `il`.
    pub fn v_row(&self, il: u32, cell: u32) -> Option<&[u8]> {
        let li = self.layer_index(il)?;
        (cell < self.size()).then(|| self.layers[li].v.row(cell as usize))
    }

    pub fn is_masked_swa(&self, p0: Pos, p1: Pos) -> bool {
        self.params.swa_type.is_masked(self.params.n_swa, p0, p1)
    }

    fn is_windowed(&self) -> bool {
        self.params.swa_type != SwaType::None && self.params.n_swa > 0
    }

    /// Number of cells the attention kernel must visit.
    pub fn n_kv(&self) -> u32 {
        let n_pad = self.params.n_pad;
        let padded = self.cells.used_max_p1().div_ceil(n_pad) * n_pad;
        self.size().min(padded.max(n_pad))
    }

    /// Share of the occupied range that is holes.
    pub fn fragmentation(&self) -> f32 {
        let n_kv = self.cells.used_max_p1();
        if n_kv == 0 {
            return 0.0;
        }
        1.0 - self.cells.used() as f32 / n_kv as f32
    }

    /// Find cells for `ub`, scanning from `head`.
    ///
    /// With `cont` the cells must be consecutive.
    pub fn find_slot(&self, ub: &Ubatch, cont: bool) -> Option<SlotInfo> {
        let size = self.size();
        let n_tokens = ub.n_tokens;
        if n_tokens == 0 || n_tokens > size {
            return None;
        }

        let mut head_cur = self.head;
        if head_cur > self.cells.used() + 2 * n_tokens {
            head_cur = 0;
        }

        let n_test = if cont { n_tokens } else { 1 };
        let mut idxs: Vec<u32> = Vec::with_capacity(n_tokens as usize);
        let mut n_tested = 0u32;
        loop {
            if head_cur + n_test > size {
                n_tested += size - head_cur;
                head_cur = 0;
                if n_tested >= size {
                    return None;
                }
                continue;
            }
            for _ in 0..n_test {
                let idx = head_cur;
                head_cur += 1;
                n_tested += 1;

                if self.cell_usable(idx) {
                    idxs.push(idx);
                } else if cont {
                    break;
                }
            }
            if idxs.len() == n_tokens as usize {
                return Some(SlotInfo { idxs });
            }
            if cont {
                idxs.clear();
            }
            if n_tested >= size {
                return None;
            }
        }
    }

    /// Empty, or held by a single sequence that has moved past it.
    fn cell_usable(&self, idx: u32) -> bool {
        if self.cells.is_empty(idx) {
            return true;
        }
        if self.cells.seq_count(idx) != 1 || !self.is_windowed() {
            return false;
        }
        self.cells.seq_get(idx).is_some_and(|seq| {
            let p_next = self.cells.seq_pos_max(seq).saturating_add(1);
            self.is_masked_swa(self.cells.pos_get(idx), p_next)
        })
    }

    /// Reserve cells for every micro-batch without committing anything.
    ///
    /// Later micro-batches see the effect of earlier ones.
    pub fn prepare(&mut self, ubatches: &[Ubatch]) -> Option<Vec<SlotInfo>> {
        let saved_cells = self.cells.clone();
        let saved_head = self.head;

        let mut res = Vec::with_capacity(ubatches.len());
        for ub in ubatches {
            match self.find_slot(ub, false) {
                Some(sinfo) => {
                    self.apply_ubatch(&sinfo, ub);
                    res.push(sinfo);
                }
                None => {
                    debug!(
                        cache = self.name,
                        n_tokens = ub.n_tokens,
                        used = self.cells.used(),
                        size = self.size(),
                        "no room for micro-batch"
                    );
                    res.clear();
                    break;
                }
            }
        }

        self.cells = saved_cells;
        self.head = saved_head;
        (res.len() == ubatches.len()).then_some(res)
    }

    /// Write positions and owners of `ub` into the chosen cells.
    pub fn apply_ubatch(&mut self, sinfo: &SlotInfo, ub: &Ubatch) {
        let mut seq_pos_max_rm = [-1 as Pos; SEQ_MAX];

        for (ii, &idx) in sinfo.idxs.iter().enumerate() {
            if !self.cells.is_empty(idx) {
                if let Some(seq) = self.cells.seq_get(idx) {
                    let s = seq as usize;
                    seq_pos_max_rm[s] = seq_pos_max_rm[s].max(self.cells.pos_get(idx));
                }
                self.cells.rm(idx);
            }
            self.cells.pos_set(idx, ub.pos[ii]);
            for seq in ub.seq_set[ii].iter() {
                self.cells.seq_add(idx, seq);
            }
        }

        // Keep each sequence contiguous: drop whatever is older than a reused cell.
        for (s, &p_rm) in seq_pos_max_rm.iter().enumerate() {
            if p_rm < 0 {
                continue;
            }
            let seq = s as SeqId;
            let p_min = self.cells.seq_pos_min(seq);
            if p_min >= 0 && p_min <= p_rm {
                self.remove_range(seq, p_min, p_rm + 1);
            }
        }

        if self.is_windowed() {
            self.prune_swa(ub);
        }

        if let Some(&last) = sinfo.idxs.last() {
            self.head = (last + 1) % self.size();
        }
    }

    /// Drop, per sequence in `ub`, cells that no token of `ub` or later can see.
    fn prune_swa(&mut self, ub: &Ubatch) {
        for &seq in &ub.seq_id_unq {
            let Some(p_min) = ub.seq_pos_min(seq) else {
                continue;
            };
            let masked: Vec<u32> = self
                .cells
                .used_cells()
                .filter(|&i| {
                    let p = self.cells.pos_get(i);
                    self.cells.seq_has(i, seq) && p < p_min && self.is_masked_swa(p, p_min)
                })
                .collect();
            for i in masked {
                self.cells.seq_rm(i, seq);
            }
        }
    }

    fn remove_range(&mut self, seq: SeqId, p0: Pos, p1: Pos) {
        let mut new_head = self.size();
        let cells: Vec<u32> = self.cells.used_cells().collect();
        for i in cells {
            if !self.cells.pos_in(i, p0, p1) {
                continue;
            }
            let freed = if seq == SEQ_ID_ALL {
                self.cells.rm(i);
                true
            } else if self.cells.seq_has(i, seq) {
                self.cells.seq_rm(i, seq)
            } else {
                false
            };
            if freed && i < new_head {
                new_head = i;
            }
        }
        if new_head < self.size() && new_head < self.head {
            self.head = new_head;
        }
    }

    /// Causal, per-sequence, window-aware mask for `ub` over `n_kv` cells.
    pub fn build_kq_mask(&self, ub: &Ubatch, n_kv: u32) -> Vec<f32> {
        let n_kv = n_kv.min(self.size()) as usize;
        let mut mask = vec![f32::NEG_INFINITY; ub.n_tokens as usize * n_kv];
        for (i, (&p1, &set)) in ub.pos.iter().zip(&ub.seq_set).enumerate() {
            let row = &mut mask[i * n_kv..(i + 1) * n_kv];
            for (j, m) in row.iter_mut().enumerate() {
                let j = j as u32;
                if self.cells.is_empty(j) || !self.cells.seqs(j).intersects(set) {
                    continue;
                }
                let p0 = self.cells.pos_get(j);
                if p0 > p1 || self.is_masked_swa(p0, p1) {
                    continue;
                }
                *m = 0.0;
            }
        }
        mask
    }

    /// Compaction plan: moves from the end of the occupied range into holes.
    pub fn defrag_moves(&self) -> Vec<(u32, u32)> {
        let n_kv = self.cells.used_max_p1();
        let mut empty: Vec<bool> = (0..n_kv).map(|i| self.cells.is_empty(i)).collect();
        let mut moves = Vec::new();
        if n_kv == 0 {
            return moves;
        }

        let mut dst = 0u32;
        let mut src = n_kv - 1;
        loop {
            while dst < n_kv && !empty[dst as usize] {
                dst += 1;
            }
            while src > dst && empty[src as usize] {
                src -= 1;
            }
            if src <= dst || dst >= n_kv {
                break;
            }
            moves.push((src, dst));
            empty[dst as usize] = false;
            empty[src as usize] = true;
        }
        moves
    }

    fn apply_update(&mut self, do_shift: bool, moves: &[(u32, u32)]) {
        if do_shift {
            self.cells.reset_shift();
        }
        if moves.is_empty() {
            return;
        }
        for &(src, dst) in moves {
            self.cells.mv(src, dst);
            for layer in &mut self.layers {
                let (s, d) = (src as usize, dst as usize);
                layer.k.copy_row(s, d);
                layer.v.copy_row(s, d);
            }
        }
        self.head = self.cells.used() % self.size();
        info!(cache = self.name, n_moves = moves.len(), "defragmented");
    }

    fn write_row(&mut self, il: u32, cell: u32, k: &[u8], v: &[u8]) -> MemoryResult<()> {
        let li = self.layer_index(il).ok_or_else(|| {
            MemoryError::internal(format!("layer {il} has no storage in {}", self.name))
        })?;
        if cell >= self.size() {
            return Err(MemoryError::internal(format!("cell {cell} out of range")));
        }
        let layer = &mut self.layers[li];
        if k.len() != layer.k.row_bytes() || v.len() != layer.v.row_bytes() {
            return Err(MemoryError::compute(format!(
                "layer {il}: row sizes {}/{} do not match {}/{}",
                k.len(),
                v.len(),
                layer.k.row_bytes(),
                layer.v.row_bytes()
            )));
        }
        layer.k.row_mut(cell as usize).copy_from_slice(k);
        layer.v.row_mut(cell as usize).copy_from_slice(v);
        Ok(())
    }

    pub(crate) fn backup_cell(&self, cell: u32) -> RowBackup {
        RowBackup {
            cell,
            rows: self
                .layers
                .iter()
                .map(|l| {
                    (
                        l.k.row(cell as usize).to_vec(),
                        l.v.row(cell as usize).to_vec(),
                    )
                })
                .collect(),
        }
    }

    pub(crate) fn restore_cell(&mut self, backup: &RowBackup) {
        let cell = backup.cell as usize;
        for (layer, (k, v)) in self.layers.iter_mut().zip(&backup.rows) {
            layer.k.row_mut(cell).copy_from_slice(k);
            layer.v.row_mut(cell).copy_from_slice(v);
        }
    }

    /// Contiguous cell ranges selected for serialization.
    fn cell_ranges(&self, seq: SeqId) -> Vec<(u32, u32)> {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for i in 0..self.size() {
            let selected = if seq == SEQ_ID_ALL {
                !self.cells.is_empty(i)
            } else {
                self.cells.seq_has(i, seq)
            };
            if !selected {
                continue;
            }
            match ranges.last_mut() {
                Some((_, end)) if *end == i => *end = i + 1,
                _ => ranges.push((i, i + 1)),
            }
        }
        ranges
    }

    fn write_state(&self, io: &mut dyn StateWrite, seq: SeqId) -> MemoryResult<()> {
        let ranges = self.cell_ranges(seq);
        let cell_count: u32 = ranges.iter().map(|(a, b)| b - a).sum();

        io.write_string(KV_STATE_TAG)?;
        io.write_u32(cell_count)?;
        for &(a, b) in &ranges {
            for i in a..b {
                io.write_i32(self.cells.pos_get(i))?;
                if seq == SEQ_ID_ALL {
                    let owners = self.cells.seqs(i);
                    io.write_u32(owners.len() as u32)?;
                    for s in owners.iter() {
                        io.write_i32(s)?;
                    }
                } else {
                    io.write_u32(0)?;
                }
            }
        }

        io.write_u32(self.layers.len() as u32)?;
        for key in [true, false] {
            for layer in &self.layers {
                let tensor = if key { &layer.k } else { &layer.v };
                let rb = tensor.row_bytes();
                io.write_u32(layer.il)?;
                io.write_string(tensor.dtype().name())?;
                io.write_u64(rb as u64)?;
                for &(a, b) in &ranges {
                    io.write_tensor(tensor, a as usize * rb, (b - a) as usize * rb)?;
                }
            }
        }
        Ok(())
    }

    fn read_state(&mut self, io: &mut dyn StateRead, seq: SeqId) -> MemoryResult<()> {
        if seq != SEQ_ID_ALL && !is_valid_seq(seq) {
            return Err(MemoryError::state_format(format!(
                "invalid destination sequence {seq}"
            )));
        }
        let tag = io.read_string()?;
        if tag != KV_STATE_TAG {
            return Err(MemoryError::state_format(format!(
                "expected section {KV_STATE_TAG:?}, found {tag:?}"
            )));
        }
        let cell_count = io.read_u32()?;
        if cell_count > self.size() {
            return Err(MemoryError::capacity(format!(
                "{cell_count} cells do not fit into {} ({} cells)",
                self.name,
                self.size()
            )));
        }

        let mut meta: Vec<(Pos, SeqSet)> = Vec::with_capacity(cell_count as usize);
        for _ in 0..cell_count {
            let pos = io.read_i32()?;
            if pos < 0 {
                return Err(MemoryError::state_format(format!("negative cell position {pos}")));
            }
            let n_seq = io.read_u32()?;
            let owners = if seq == SEQ_ID_ALL {
                if n_seq == 0 {
                    return Err(MemoryError::state_format("cell without owner"));
                }
                let mut owners = SeqSet::EMPTY;
                for _ in 0..n_seq {
                    let s = io.read_i32()?;
                    if !is_valid_seq(s) || s as u32 >= self.params.n_seq_max {
                        return Err(MemoryError::state_format(format!(
                            "invalid owner sequence {s}"
                        )));
                    }
                    owners.insert(s);
                }
                owners
            } else {
                if n_seq != 0 {
                    return Err(MemoryError::state_format(
                        "single-sequence state carries owner ids",
                    ));
                }
                SeqSet::single(seq)
            };
            meta.push((pos, owners));
        }

        let n_layer = io.read_u32()?;
        if n_layer as usize != self.layers.len() {
            return Err(MemoryError::state_format(format!(
                "state has {n_layer} layers, cache has {}",
                self.layers.len()
            )));
        }
        let k_rows = self.read_rows(io, cell_count as usize, true)?;
        let v_rows = self.read_rows(io, cell_count as usize, false)?;

        if seq == SEQ_ID_ALL {
            self.cells.reset();
            for (i, &(pos, owners)) in meta.iter().enumerate() {
                self.cells.pos_set(i as u32, pos);
                for s in owners.iter() {
                    self.cells.seq_add(i as u32, s);
                }
            }
            for (li, layer) in self.layers.iter_mut().enumerate() {
                let n = cell_count as usize;
                layer.k.rows_mut(0, n).copy_from_slice(&k_rows[li]);
                layer.v.rows_mut(0, n).copy_from_slice(&v_rows[li]);
            }
            self.head = 0;
            return Ok(());
        }

        let saved_cells = self.cells.clone();
        let saved_head = self.head;
        self.remove_range(seq, 0, Pos::MAX);
        if meta.is_empty() {
            return Ok(());
        }

        let positions: Vec<Pos> = meta.iter().map(|&(p, _)| p).collect();
        let ub = Ubatch::from_positions(&positions, seq);
        let Some(sinfo) = self.find_slot(&ub, true) else {
            self.cells = saved_cells;
            self.head = saved_head;
            return Err(MemoryError::capacity(format!(
                "no {cell_count} consecutive free cells in {} for sequence {seq}",
                self.name
            )));
        };
        self.apply_ubatch(&sinfo, &ub);
        for (li, layer) in self.layers.iter_mut().enumerate() {
            let (krb, vrb) = (layer.k.row_bytes(), layer.v.row_bytes());
            for (j, &cell) in sinfo.idxs.iter().enumerate() {
                layer
                    .k
                    .row_mut(cell as usize)
                    .copy_from_slice(&k_rows[li][j * krb..(j + 1) * krb]);
                layer
                    .v
                    .row_mut(cell as usize)
                    .copy_from_slice(&v_rows[li][j * vrb..(j + 1) * vrb]);
            }
        }
        Ok(())
    }

    fn read_rows(
        &self,
        io: &mut dyn StateRead,
        n_cells: usize,
        key: bool,
    ) -> MemoryResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let tensor = if key { &layer.k } else { &layer.v };
            let il = io.read_u32()?;
            if il != layer.il {
                return Err(MemoryError::state_format(format!(
                    "expected layer {}, found {il}",
                    layer.il
                )));
            }
            let dtype = io.read_string()?;
            if dtype != tensor.dtype().name() {
                return Err(MemoryError::state_format(format!(
                    "layer {il}: type {dtype} does not match {}",
                    tensor.dtype()
                )));
            }
            let row_bytes = io.read_u64()?;
            if row_bytes != tensor.row_bytes() as u64 {
                return Err(MemoryError::state_format(format!(
                    "layer {il}: row size {row_bytes} does not match {}",
                    tensor.row_bytes()
                )));
            }
            let mut buf = vec![0u8; n_cells * tensor.row_bytes()];
            io.read_to(&mut buf)?;
            out.push(buf);
        }
        Ok(out)
    }
}

impl Memory for KvCache {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init_batch<'a>(
        &'a mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
        _embd_all: bool,
    ) -> Box<dyn MemoryContext + 'a> {
        balloc.split_reset();
        let mut ubatches = Vec::new();
        loop {
            let ub = balloc.split_simple(n_ubatch);
            if ub.is_empty() {
                break;
            }
            ubatches.push(ub);
        }
        if !balloc.is_done() {
            return Box::new(KvCacheContext::failed(self, MemoryStatus::FailedPrepare));
        }

        match self.prepare(&ubatches) {
            Some(sinfos) => Box::new(KvCacheContext::for_batch(self, ubatches, sinfos)),
            None => Box::new(KvCacheContext::failed(self, MemoryStatus::FailedPrepare)),
        }
    }

    fn init_full<'a>(&'a mut self) -> Box<dyn MemoryContext + 'a> {
        Box::new(KvCacheContext::full(self))
    }

    fn init_update<'a>(&'a mut self, optimize: bool) -> Box<dyn MemoryContext + 'a> {
        Box::new(KvCacheContext::update(self, optimize))
    }

    fn clear(&mut self, data: bool) {
        self.cells.reset();
        self.head = 0;
        if data {
            for layer in &mut self.layers {
                layer.k.zero();
                layer.v.zero();
            }
        }
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        if seq != SEQ_ID_ALL && !is_valid_seq(seq) {
            return true;
        }
        let (p0, p1) = normalize_range(p0, p1);
        if p0 < p1 {
            self.remove_range(seq, p0, p1);
        }
        true
    }

    fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        if src == dst || !is_valid_seq(src) || !is_valid_seq(dst) {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);
        let cells: Vec<u32> = self.cells.used_cells().collect();
        for i in cells {
            if self.cells.seq_has(i, src) && self.cells.pos_in(i, p0, p1) {
                self.cells.seq_add(i, dst);
            }
        }
    }

    fn seq_keep(&mut self, seq: SeqId) {
        if !is_valid_seq(seq) {
            return;
        }
        let mut new_head = self.size();
        let cells: Vec<u32> = self.cells.used_cells().collect();
        for i in cells {
            if self.cells.seq_keep(i, seq) && i < new_head {
                new_head = i;
            }
        }
        if new_head < self.size() && new_head < self.head {
            self.head = new_head;
        }
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, shift: Pos) {
        if shift == 0 || !is_valid_seq(seq) {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);
        if p0 >= p1 {
            return;
        }
        let mut new_head = self.size();
        let cells: Vec<u32> = self.cells.used_cells().collect();
        for i in cells {
            if !self.cells.seq_has(i, seq) || !self.cells.pos_in(i, p0, p1) {
                continue;
            }
            if self.cells.pos_add(i, shift) && i < new_head {
                new_head = i;
            }
        }
        self.head = if new_head < self.size() { new_head } else { 0 };
    }

    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32) {
        if d <= 1 || !is_valid_seq(seq) {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);
        if p0 >= p1 {
            return;
        }
        let cells: Vec<u32> = self.cells.used_cells().collect();
        for i in cells {
            if self.cells.seq_has(i, seq) && self.cells.pos_in(i, p0, p1) {
                self.cells.pos_div(i, d);
            }
        }
    }

    fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.cells.seq_pos_min(seq)
    }

    fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.cells.seq_pos_max(seq)
    }

    fn can_shift(&self) -> bool {
        true
    }

    #[instrument(skip(self, io), fields(cache = self.name))]
    fn state_write(&self, io: &mut dyn StateWrite, seq: SeqId, _flags: StateFlags) -> MemoryResult<()> {
        self.write_state(io, seq)
    }

    #[instrument(skip(self, io), fields(cache = self.name))]
    fn state_read(&mut self, io: &mut dyn StateRead, seq: SeqId, _flags: StateFlags) -> MemoryResult<()> {
        let res = self.read_state(io, seq);
        if let Err(e) = &res {
            warn!(error = %e, "failed to restore attention cache state");
        }
        res
    }

    fn n_layer_owned(&self) -> u32 {
        self.layers.len() as u32
    }

    fn total_size(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.k.n_bytes() + l.v.n_bytes())
            .sum()
    }

    fn used(&self) -> u32 {
        self.cells.used()
    }

    fn size(&self) -> u32 {
        self.cells.size()
    }
}

struct Undo {
    cells: KvCells,
    head: u32,
    rows: Vec<RowBackup>,
}

enum Mode {
    Batch {
        ubatches: Vec<Ubatch>,
        sinfos: Vec<SlotInfo>,
        i_cur: usize,
        applied: Option<usize>,
        undo: Option<Undo>,
    },
    Full,
    Update {
        do_shift: bool,
        shifts: Vec<Pos>,
        moves: Vec<(u32, u32)>,
        applied: bool,
    },
    Idle,
}

/// Context over a [`KvCache`].
pub struct KvCacheContext<'a> {
    kv: &'a mut KvCache,
    status: MemoryStatus,
    mode: Mode,
}

impl<'a> KvCacheContext<'a> {
    pub fn failed(kv: &'a mut KvCache, status: MemoryStatus) -> Self {
        Self {
            kv,
            status,
            mode: Mode::Idle,
        }
    }

    pub fn for_batch(kv: &'a mut KvCache, ubatches: Vec<Ubatch>, sinfos: Vec<SlotInfo>) -> Self {
        Self {
            kv,
            status: MemoryStatus::Success,
            mode: Mode::Batch {
                ubatches,
                sinfos,
                i_cur: 0,
                applied: None,
                undo: None,
            },
        }
    }

    pub fn full(kv: &'a mut KvCache) -> Self {
        Self {
            kv,
            status: MemoryStatus::Success,
            mode: Mode::Full,
        }
    }

    pub fn update(kv: &'a mut KvCache, optimize: bool) -> Self {
        let do_shift = kv.cells.has_shift();
        let thold = kv.params.defrag_thold;
        let fragmented = thold >= 0.0 && kv.fragmentation() > thold;
        let moves = if optimize || fragmented {
            kv.defrag_moves()
        } else {
            Vec::new()
        };
        if !do_shift && moves.is_empty() {
            return Self::failed(kv, MemoryStatus::NoUpdate);
        }
        debug!(
            cache = kv.name,
            do_shift,
            n_moves = moves.len(),
            "maintenance pending"
        );
        let shifts = if do_shift {
            kv.cells.shifts().to_vec()
        } else {
            Vec::new()
        };
        Self {
            kv,
            status: MemoryStatus::Success,
            mode: Mode::Update {
                do_shift,
                shifts,
                moves,
                applied: false,
            },
        }
    }

    /// The cache behind this context.
    pub fn cache(&self) -> &KvCache {
        self.kv
    }

    fn current_slot(&self) -> Option<&SlotInfo> {
        match &self.mode {
            Mode::Batch { sinfos, i_cur, .. } => sinfos.get(*i_cur),
            _ => None,
        }
    }
}

impl MemoryContext for KvCacheContext<'_> {
    fn status(&self) -> MemoryStatus {
        self.status
    }

    fn ubatch(&self) -> Option<&Ubatch> {
        match &self.mode {
            Mode::Batch { ubatches, i_cur, .. } => ubatches.get(*i_cur),
            _ => None,
        }
    }

    fn next(&mut self) -> bool {
        match &mut self.mode {
            Mode::Batch { ubatches, i_cur, .. } if *i_cur + 1 < ubatches.len() => {
                *i_cur += 1;
                true
            }
            _ => false,
        }
    }

    fn apply(&mut self) -> bool {
        if self.status.is_fail() {
            return false;
        }
        match &mut self.mode {
            Mode::Batch {
                ubatches,
                sinfos,
                i_cur,
                applied,
                undo,
            } => {
                if *applied == Some(*i_cur) {
                    return true;
                }
                let undo = undo.get_or_insert_with(|| Undo {
                    cells: self.kv.cells.clone(),
                    head: self.kv.head,
                    rows: Vec::new(),
                });
                let sinfo = &sinfos[*i_cur];
                for &idx in &sinfo.idxs {
                    if !self.kv.cells.is_empty(idx) {
                        undo.rows.push(self.kv.backup_cell(idx));
                    }
                }
                self.kv.apply_ubatch(sinfo, &ubatches[*i_cur]);
                *applied = Some(*i_cur);
                true
            }
            Mode::Update {
                do_shift,
                moves,
                applied,
                ..
            } => {
                if !*applied {
                    self.kv.apply_update(*do_shift, moves);
                    *applied = true;
                }
                true
            }
            Mode::Full | Mode::Idle => true,
        }
    }

    fn rollback(&mut self) {
        if let Mode::Batch { undo, applied, .. } = &mut self.mode {
            if let Some(undo) = undo.take() {
                for backup in undo.rows.iter().rev() {
                    self.kv.restore_cell(backup);
                }
                self.kv.cells = undo.cells;
                self.kv.head = undo.head;
                debug!(cache = self.kv.name, "rolled back batch");
            }
            *applied = None;
        }
        self.status = MemoryStatus::FailedCompute;
    }

    fn layer_layout(&self, il: u32) -> Option<LayerLayout> {
        self.kv.layer_layout(il)
    }

    fn write_layer(&mut self, il: u32, row: usize, k: &[u8], v: &[u8]) -> MemoryResult<()> {
        let (cell, is_applied) = match &self.mode {
            Mode::Batch {
                sinfos,
                i_cur,
                applied,
                ..
            } => (
                sinfos[*i_cur].idxs.get(row).copied(),
                *applied == Some(*i_cur),
            ),
            _ => {
                return Err(MemoryError::internal(
                    "only batch contexts accept layer writes",
                ));
            }
        };
        if !is_applied {
            return Err(MemoryError::internal(
                "micro-batch must be applied before writing rows",
            ));
        }
        let cell = cell
            .ok_or_else(|| MemoryError::internal(format!("row {row} outside the micro-batch")))?;
        self.kv.write_row(il, cell, k, v)
    }

    fn n_kv(&self, il: u32) -> u32 {
        if !self.kv.has_layer(il) {
            return 0;
        }
        match self.mode {
            Mode::Full => self.kv.size(),
            _ => self.kv.n_kv(),
        }
    }

    fn slots(&self, il: u32) -> Option<Vec<u32>> {
        if !self.kv.has_layer(il) {
            return None;
        }
        self.current_slot().map(|s| s.idxs.clone())
    }

    fn kq_mask(&self, il: u32) -> Option<Vec<f32>> {
        if !self.kv.has_layer(il) {
            return None;
        }
        let ub = self.ubatch()?;
        Some(self.kv.build_kq_mask(ub, self.kv.n_kv()))
    }

    fn k_shift(&self, il: u32) -> Option<Vec<Pos>> {
        if !self.kv.has_layer(il) {
            return None;
        }
        match &self.mode {
            Mode::Update {
                do_shift: true,
                shifts,
                ..
            } => Some(shifts.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcache_core::{Batch, BatchOptions, BufferWriter, SliceReader};

    fn cache(kv_size: u32) -> KvCache {
        let model = ModelConfig::tiny();
        let params = KvCacheParams {
            n_pad: 1,
            kv_size,
            n_seq_max: 4,
            ..KvCacheParams::from_config(&CacheConfig::default())
        };
        KvCache::new("kv", &model, params, &|_| true).unwrap()
    }

    fn decode(kv: &mut KvCache, seq: SeqId, positions: std::ops::Range<Pos>) -> MemoryStatus {
        let mut batch = Batch::new();
        for p in positions {
            batch.add(1, p, &[seq], false);
        }
        let mut balloc = BatchAllocator::new();
        balloc
            .init(&batch, Some(&*kv), BatchOptions::new(4))
            .unwrap();
        let mut ctx = kv.init_batch(&mut balloc, 512, false);
        let status = ctx.status();
        if status == MemoryStatus::Success {
            loop {
                assert!(ctx.apply());
                if !ctx.next() {
                    break;
                }
            }
        }
        status
    }

    #[test]
    fn test_fill_and_fail() {
        let mut kv = cache(4);
        assert_eq!(decode(&mut kv, 0, 0..4), MemoryStatus::Success);
        assert_eq!(kv.used(), 4);
        assert_eq!(decode(&mut kv, 0, 4..5), MemoryStatus::FailedPrepare);
        assert_eq!(kv.used(), 4);
    }

    #[test]
    fn test_prepare_does_not_commit() {
        let mut kv = cache(8);
        let mut balloc = BatchAllocator::new();
        balloc
            .init(&Batch::from_tokens(vec![1, 2, 3]), None, BatchOptions::default())
            .unwrap();
        {
            let ctx = kv.init_batch(&mut balloc, 512, false);
            assert_eq!(ctx.status(), MemoryStatus::Success);
        }
        assert_eq!(kv.used(), 0);
        assert_eq!(kv.seq_pos_max(0), -1);
    }

    #[test]
    fn test_seq_ops() {
        let mut kv = cache(8);
        decode(&mut kv, 0, 0..4);
        kv.seq_cp(0, 1, 1, 3);
        assert_eq!(kv.seq_pos_min(1), 1);
        assert_eq!(kv.seq_pos_max(1), 2);
        assert_eq!(kv.used(), 4);

        assert!(kv.seq_rm(0, -1, -1));
        assert_eq!(kv.used(), 2);
        assert_eq!(kv.seq_pos_max(0), -1);

        kv.seq_add(1, -1, -1, 10);
        assert_eq!(kv.seq_pos_min(1), 11);
        assert!(kv.cells().has_shift());

        kv.seq_div(1, -1, -1, 2);
        assert_eq!(kv.seq_pos_max(1), 6);

        kv.seq_keep(2);
        assert_eq!(kv.used(), 0);
    }

    #[test]
    fn test_invalid_args_are_noops() {
        let mut kv = cache(8);
        decode(&mut kv, 0, 0..3);
        assert!(kv.seq_rm(99, -1, -1));
        assert!(kv.seq_rm(0, 2, 1));
        kv.seq_add(0, 1, 1, 5);
        kv.seq_div(0, -1, -1, 0);
        kv.seq_cp(0, 0, -1, -1);
        assert_eq!(kv.used(), 3);
        assert_eq!(kv.seq_pos_max(0), 2);
        assert!(!kv.cells().has_shift());
    }

    #[test]
    fn test_shift_past_max_position() {
        let mut kv = cache(8);
        decode(&mut kv, 0, 0..3);
        kv.seq_add(0, -1, -1, Pos::MAX);
        assert_eq!(kv.used(), 1);
        assert_eq!(kv.seq_pos_min(0), Pos::MAX);
        assert_eq!(kv.seq_pos_max(0), Pos::MAX);
        assert!(kv.cells().has_shift());

        let mut balloc = BatchAllocator::new();
        let err = balloc
            .init(&Batch::from_tokens(vec![1]), Some(&kv), BatchOptions::new(4))
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidBatch(_)));
    }

    #[test]
    fn test_window_reuse_near_max_position() {
        let model = ModelConfig::tiny();
        let params = KvCacheParams {
            n_pad: 1,
            kv_size: 3,
            n_seq_max: 4,
            ..KvCacheParams::from_config(&CacheConfig::default())
        }
        .with_swa(2, SwaType::Standard);
        let mut kv = KvCache::new("swa", &model, params, &|_| true).unwrap();
        decode(&mut kv, 0, 0..3);
        kv.seq_add(0, -1, -1, Pos::MAX - 2);
        assert_eq!(kv.seq_pos_max(0), Pos::MAX);

        assert_eq!(decode(&mut kv, 1, 0..1), MemoryStatus::Success);
        assert_eq!(kv.seq_pos_max(1), 0);
        assert_eq!(kv.used(), 3);
    }

    #[test]
    fn test_kq_mask_is_causal() {
        let mut kv = cache(4);
        decode(&mut kv, 0, 0..2);
        let ub = Ubatch::from_positions(&[2], 0);
        let sinfo = kv.find_slot(&ub, false).unwrap();
        kv.apply_ubatch(&sinfo, &ub);
        let mask = kv.build_kq_mask(&ub, kv.n_kv());
        assert_eq!(mask.len(), 3);
        assert!(mask.iter().all(|&m| m == 0.0));

        let early = Ubatch::from_positions(&[0], 0);
        let mask = kv.build_kq_mask(&early, 3);
        assert_eq!(mask[0], 0.0);
        assert_eq!(mask[1], f32::NEG_INFINITY);
    }

    #[test]
    fn test_n_kv_padding() {
        let model = ModelConfig::tiny();
        let params = KvCacheParams {
            n_pad: 4,
            kv_size: 10,
            ..KvCacheParams::from_config(&CacheConfig::default())
        };
        let mut kv = KvCache::new("kv", &model, params, &|_| true).unwrap();
        assert_eq!(kv.n_kv(), 4);
        decode(&mut kv, 0, 0..5);
        assert_eq!(kv.n_kv(), 8);
        decode(&mut kv, 0, 5..10);
        assert_eq!(kv.n_kv(), 10);
    }

    #[test]
    fn test_defrag_plan() {
        let mut kv = cache(6);
        decode(&mut kv, 0, 0..6);
        kv.seq_rm(0, 1, 3);
        let moves = kv.defrag_moves();
        assert_eq!(moves, vec![(5, 1), (4, 2)]);
        assert!(kv.fragmentation() > 0.0);
    }

    #[test]
    fn test_state_roundtrip_all() {
        let mut kv = cache(8);
        decode(&mut kv, 0, 0..3);
        kv.seq_cp(0, 1, -1, -1);

        let mut w = BufferWriter::new();
        kv.state_write(&mut w, SEQ_ID_ALL, StateFlags::empty())
            .unwrap();
        let bytes = w.into_inner();

        let mut restored = cache(8);
        restored
            .state_read(&mut SliceReader::new(&bytes), SEQ_ID_ALL, StateFlags::empty())
            .unwrap();
        assert_eq!(restored.used(), 3);
        assert_eq!(restored.seq_pos_max(1), 2);
    }

    #[test]
    fn test_state_read_wrong_tag() {
        let mut w = BufferWriter::new();
        w.write_string("recurrent").unwrap();
        w.write_u32(0).unwrap();
        let bytes = w.into_inner();

        let mut kv = cache(4);
        let err = kv
            .state_read(&mut SliceReader::new(&bytes), 0, StateFlags::empty())
            .unwrap_err();
        assert!(matches!(err, MemoryError::StateFormat(_)));
    }
}
