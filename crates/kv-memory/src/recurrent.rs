//! Recurrent state cache.
//!
//! Each live sequence owns one slot holding its whole state: a rolling
//! (convolution) row `r` and a recurrent row `s` per layer. Sequences that
//! were copied share a slot until one of them is written again, at which
//! point the writer moves to a free slot seeded from the shared one.

use seqcache_core::{
    BatchAllocator, CacheConfig, DType, LayerLayout, Memory, MemoryContext, MemoryError,
    MemoryResult, MemoryStatus, ModelConfig, Pos, SEQ_ID_ALL, SEQ_MAX, SeqId, SeqSet, StateFlags,
    StateRead, StateWrite, TensorBuf, Ubatch, is_valid_seq, normalize_range,
};
use tracing::{debug, info, instrument, warn};

/// Section tag written before recurrent state.
pub const RS_STATE_TAG: &str = "recurrent";

/// Construction parameters for a [`RecurrentMemory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrentParams {
    pub type_r: DType,
    pub type_s: DType,
    pub rs_size: u32,
    pub n_seq_max: u32,
    pub offload: bool,
}

impl RecurrentParams {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            type_r: config.type_r,
            type_s: config.type_s,
            rs_size: config.effective_rs_size(),
            n_seq_max: config.n_seq_max,
            offload: config.offload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RsCell {
    pos_min: Pos,
    pos_max: Pos,
    src: i32,
    src0: i32,
    seq: SeqSet,
}

impl RsCell {
    const EMPTY: RsCell = RsCell {
        pos_min: -1,
        pos_max: -1,
        src: -1,
        src0: -1,
        seq: SeqSet::EMPTY,
    };

    fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

/// How a removal range relates to a stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeCut {
    Disjoint,
    Covers,
    Partial,
}

#[derive(Debug, Clone)]
struct RsLedger {
    cells: Vec<RsCell>,
    tails: Vec<i32>,
    head: u32,
    used: u32,
    rs_z: i32,
}

impl RsLedger {
    fn new(size: u32) -> Self {
        Self {
            cells: vec![RsCell::EMPTY; size as usize],
            tails: vec![-1; SEQ_MAX],
            head: 0,
            used: 0,
            rs_z: -1,
        }
    }

    fn reset(&mut self) {
        self.cells.fill(RsCell::EMPTY);
        self.tails.fill(-1);
        self.head = 0;
        self.used = 0;
        self.rs_z = -1;
    }

    fn size(&self) -> u32 {
        self.cells.len() as u32
    }

    fn tail(&self, seq: SeqId) -> Option<usize> {
        if !is_valid_seq(seq) {
            return None;
        }
        let t = self.tails[seq as usize];
        (t >= 0).then_some(t as usize)
    }

    /// Drop `seq` from its slot; the slot is freed when no owner remains.
    fn release(&mut self, seq: SeqId) {
        let Some(t) = self.tail(seq) else {
            return;
        };
        let cell = &mut self.cells[t];
        cell.seq.remove(seq);
        self.tails[seq as usize] = -1;
        if cell.is_empty() {
            *cell = RsCell::EMPTY;
            self.used -= 1;
        }
    }

    fn next_free(&self) -> Option<usize> {
        let size = self.cells.len();
        (0..size)
            .map(|k| (self.head as usize + k) % size)
            .find(|&i| self.cells[i].is_empty())
    }

    fn cut(cell: &RsCell, p0: Pos, p1: Pos) -> RangeCut {
        if p1 <= cell.pos_min || p0 > cell.pos_max {
            RangeCut::Disjoint
        } else if p0 <= cell.pos_min && p1 > cell.pos_max {
            RangeCut::Covers
        } else {
            RangeCut::Partial
        }
    }

    /// Give every sequence set of `ub` a private slot.
    ///
    /// Returns the slot of each set, or `None` when there are not enough
    /// free slots. On `None` the ledger may be partially modified.
    fn find_slot(&mut self, ub: &Ubatch) -> Option<Vec<u32>> {
        if !ub.equal_seqs || ub.n_seqs == 0 {
            return None;
        }

        // A token shared by several sequences folds them into the state of
        // the first one.
        for s in 0..ub.n_seqs {
            for seq in ub.set_seqs(s).iter().skip(1) {
                self.release(seq);
            }
        }

        let mut slots = Vec::with_capacity(ub.n_seqs as usize);
        for s in 0..ub.n_seqs {
            let seq = ub.set_seqs(s).first()?;
            let tail = self.tail(seq);
            let owned = tail.filter(|&t| self.cells[t].seq.len() == 1);
            let slot = match owned {
                Some(t) => t,
                None => {
                    let free = self.next_free()?;
                    self.cells[free] = match tail {
                        Some(t) => {
                            let shared = &mut self.cells[t];
                            shared.seq.remove(seq);
                            RsCell {
                                seq: SeqSet::single(seq),
                                ..*shared
                            }
                        }
                        None => RsCell {
                            seq: SeqSet::single(seq),
                            ..RsCell::EMPTY
                        },
                    };
                    self.used += 1;
                    self.tails[seq as usize] = free as i32;
                    free
                }
            };
            slots.push(slot as u32);
        }

        for s in 0..ub.n_seqs {
            let slot = slots[s as usize] as usize;
            let set = ub.set_seqs(s);
            let (first, last) = (ub.set_first_pos(s), ub.set_last_pos(s));
            let cell = &mut self.cells[slot];
            if cell.pos_max >= 0 && first != cell.pos_max + 1 {
                debug!(
                    slot,
                    pos_max = cell.pos_max,
                    first,
                    "recurrent state continues at a non-consecutive position"
                );
            }
            if cell.pos_min < 0 {
                cell.pos_min = first;
            }
            cell.pos_max = last;
            cell.seq = set;
            for seq in set.iter() {
                self.tails[seq as usize] = slot as i32;
            }
        }

        self.rs_z = slots
            .iter()
            .copied()
            .find(|&slot| self.cells[slot as usize].src == -1)
            .map_or(-1, |slot| slot as i32);
        for &slot in &slots {
            let cell = &mut self.cells[slot as usize];
            cell.src0 = cell.src;
            cell.src = slot as i32;
        }
        self.head = slots[0];
        Some(slots)
    }
}

#[derive(Debug, Clone)]
struct RsLayer {
    il: u32,
    r: TensorBuf,
    s: TensorBuf,
}

#[derive(Debug, Clone)]
struct SlotBackup {
    slot: u32,
    rows: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct RecurrentMemory {
    name: &'static str,
    params: RecurrentParams,
    layers: Vec<RsLayer>,
    layer_ids: Vec<Option<usize>>,
    ledger: RsLedger,
}

impl RecurrentMemory {
    /// Allocate state buffers for every layer of `model` accepted by `filter`.
    pub fn new(
        name: &'static str,
        model: &ModelConfig,
        params: RecurrentParams,
        filter: &dyn Fn(u32) -> bool,
    ) -> MemoryResult<Self> {
        if params.rs_size == 0 {
            return Err(MemoryError::config(format!("{name}: rs_size must be positive")));
        }

        let mut layers = Vec::new();
        let mut layer_ids = vec![None; model.n_layer as usize];
        for il in (0..model.n_layer).filter(|&il| filter(il)) {
            layer_ids[il as usize] = Some(layers.len());
            layers.push(RsLayer {
                il,
                r: TensorBuf::zeros(
                    format!("cache_r_l{il}"),
                    params.type_r,
                    model.n_embd_r as usize,
                    params.rs_size as usize,
                ),
                s: TensorBuf::zeros(
                    format!("cache_s_l{il}"),
                    params.type_s,
                    model.n_embd_s as usize,
                    params.rs_size as usize,
                ),
            });
        }

        let mem = Self {
            name,
            ledger: RsLedger::new(params.rs_size),
            params,
            layers,
            layer_ids,
        };
        info!(
            cache = name,
            rs_size = mem.params.rs_size,
            n_layer = mem.layers.len(),
            type_r = %mem.params.type_r,
            type_s = %mem.params.type_s,
            size_mib = mem.total_size() as f64 / (1024.0 * 1024.0),
            "recurrent cache allocated"
        );
        Ok(mem)
    }

    pub fn params(&self) -> &RecurrentParams {
        &self.params
    }

    /// Slot zeroed by the last written micro-batch, `-1` if none.
    pub fn rs_z(&self) -> i32 {
        self.ledger.rs_z
    }

    /// Slot holding the state of `seq`.
    pub fn slot_of(&self, seq: SeqId) -> Option<u32> {
        self.ledger.tail(seq).map(|t| t as u32)
    }

    /// Owners of `slot`.
    pub fn slot_seqs(&self, slot: u32) -> SeqSet {
        self.ledger
            .cells
            .get(slot as usize)
            .map_or(SeqSet::EMPTY, |c| c.seq)
    }

    /// Copy source of `slot` for the last micro-batch (`-1` = zero state).
    pub fn slot_src0(&self, slot: u32) -> i32 {
        self.ledger
            .cells
            .get(slot as usize)
            .map_or(-1, |c| c.src0)
    }

    pub fn has_layer(&self, il: u32) -> bool {
        self.layer_index(il).is_some()
    }

    fn layer_index(&self, il: u32) -> Option<usize> {
        self.layer_ids.get(il as usize).copied().flatten()
    }

    pub fn layer_layout(&self, il: u32) -> Option<LayerLayout> {
        self.layer_index(il).map(|li| LayerLayout {
            recurrent: true,
            k_row_bytes: self.layers[li].r.row_bytes(),
            v_row_bytes: self.layers[li].s.row_bytes(),
        })
    }

    pub fn r_row(&self, il: u32, slot: u32) -> Option<&[u8]> {
        let li = self.layer_index(il)?;
        (slot < self.size()).then(|| self.layers[li].r.row(slot as usize))
    }

    pub fn s_row(&self, il: u32, slot: u32) -> Option<&[u8]> {
        let li = self.layer_index(il)?;
        (slot < self.size()).then(|| self.layers[li].s.row(slot as usize))
    }

    /// Whether `seq_rm(seq, p0, p1)` would succeed. Never mutates.
    pub fn can_rm(&self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        let (p0, p1) = normalize_range(p0, p1);
        if p0 >= p1 {
            return true;
        }
        if seq == SEQ_ID_ALL {
            return (p0, p1) == (0, Pos::MAX);
        }
        match self.ledger.tail(seq) {
            Some(t) => RsLedger::cut(&self.ledger.cells[t], p0, p1) != RangeCut::Partial,
            None => true,
        }
    }

    /// Dry-run slot assignment for every micro-batch.
    pub fn prepare(&self, ubatches: &[Ubatch]) -> Option<Vec<Vec<u32>>> {
        let mut ledger = self.ledger.clone();
        let mut res = Vec::with_capacity(ubatches.len());
        for ub in ubatches {
            match ledger.find_slot(ub) {
                Some(slots) => res.push(slots),
                None => {
                    debug!(
                        cache = self.name,
                        n_seqs = ub.n_seqs,
                        used = self.ledger.used,
                        size = self.size(),
                        "no free recurrent slot"
                    );
                    return None;
                }
            }
        }
        Some(res)
    }

    /// Assign slots for `ub` and seed their state rows.
    fn apply_ubatch(&mut self, ub: &Ubatch) -> Option<Vec<u32>> {
        let slots = self.ledger.find_slot(ub)?;
        let rs_z = self.ledger.rs_z;
        if rs_z >= 0 {
            for layer in &mut self.layers {
                layer.r.zero_row(rs_z as usize);
                layer.s.zero_row(rs_z as usize);
            }
        }
        for &slot in &slots {
            let src0 = self.ledger.cells[slot as usize].src0;
            let from = if src0 < 0 { rs_z } else { src0 };
            if from < 0 || from == slot as i32 {
                continue;
            }
            for layer in &mut self.layers {
                layer.r.copy_row(from as usize, slot as usize);
                layer.s.copy_row(from as usize, slot as usize);
            }
        }
        Some(slots)
    }

    fn backup_slot(&self, slot: u32) -> SlotBackup {
        SlotBackup {
            slot,
            rows: self
                .layers
                .iter()
                .map(|l| {
                    (
                        l.r.row(slot as usize).to_vec(),
                        l.s.row(slot as usize).to_vec(),
                    )
                })
                .collect(),
        }
    }

    fn restore_slot(&mut self, backup: &SlotBackup) {
        let slot = backup.slot as usize;
        for (layer, (r, s)) in self.layers.iter_mut().zip(&backup.rows) {
            layer.r.row_mut(slot).copy_from_slice(r);
            layer.s.row_mut(slot).copy_from_slice(s);
        }
    }

    fn write_row(&mut self, il: u32, slot: u32, r: &[u8], s: &[u8]) -> MemoryResult<()> {
        let li = self.layer_index(il).ok_or_else(|| {
            MemoryError::internal(format!("layer {il} has no storage in {}", self.name))
        })?;
        if slot >= self.size() {
            return Err(MemoryError::internal(format!("slot {slot} out of range")));
        }
        let layer = &mut self.layers[li];
        if r.len() != layer.r.row_bytes() || s.len() != layer.s.row_bytes() {
            return Err(MemoryError::compute(format!(
                "layer {il}: state sizes {}/{} do not match {}/{}",
                r.len(),
                s.len(),
                layer.r.row_bytes(),
                layer.s.row_bytes()
            )));
        }
        layer.r.row_mut(slot as usize).copy_from_slice(r);
        layer.s.row_mut(slot as usize).copy_from_slice(s);
        Ok(())
    }

    fn selected_slots(&self, seq: SeqId) -> Vec<u32> {
        if seq == SEQ_ID_ALL {
            return (0..self.size())
                .filter(|&i| !self.ledger.cells[i as usize].is_empty())
                .collect();
        }
        self.slot_of(seq).into_iter().collect()
    }

    fn write_state(&self, io: &mut dyn StateWrite, seq: SeqId) -> MemoryResult<()> {
        let slots = self.selected_slots(seq);

        io.write_string(RS_STATE_TAG)?;
        io.write_u32(slots.len() as u32)?;
        for &slot in &slots {
            let cell = &self.ledger.cells[slot as usize];
            io.write_i32(cell.pos_min)?;
            io.write_i32(cell.pos_max)?;
            if seq == SEQ_ID_ALL {
                io.write_u32(cell.seq.len() as u32)?;
                for s in cell.seq.iter() {
                    io.write_i32(s)?;
                }
            } else {
                io.write_u32(0)?;
            }
        }

        io.write_u32(self.layers.len() as u32)?;
        for rolling in [true, false] {
            for layer in &self.layers {
                let tensor = if rolling { &layer.r } else { &layer.s };
                let rb = tensor.row_bytes();
                io.write_u32(layer.il)?;
                io.write_string(tensor.dtype().name())?;
                io.write_u64(rb as u64)?;
                for &slot in &slots {
                    io.write_tensor(tensor, slot as usize * rb, rb)?;
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
        if tag != RS_STATE_TAG {
            return Err(MemoryError::state_format(format!(
                "expected section {RS_STATE_TAG:?}, found {tag:?}"
            )));
        }
        let cell_count = io.read_u32()?;
        if seq != SEQ_ID_ALL && cell_count > 1 {
            return Err(MemoryError::state_format(format!(
                "single-sequence recurrent state has {cell_count} slots"
            )));
        }
        if cell_count > self.size() {
            return Err(MemoryError::capacity(format!(
                "{cell_count} slots do not fit into {} ({} slots)",
                self.name,
                self.size()
            )));
        }

        let mut meta: Vec<(Pos, Pos, SeqSet)> = Vec::with_capacity(cell_count as usize);
        let mut seen = SeqSet::EMPTY;
        for _ in 0..cell_count {
            let pos_min = io.read_i32()?;
            let pos_max = io.read_i32()?;
            if pos_min < 0 || pos_max < pos_min {
                return Err(MemoryError::state_format(format!(
                    "invalid state bounds {pos_min}..={pos_max}"
                )));
            }
            let n_seq = io.read_u32()?;
            let owners = if seq == SEQ_ID_ALL {
                if n_seq == 0 {
                    return Err(MemoryError::state_format("slot without owner"));
                }
                let mut owners = SeqSet::EMPTY;
                for _ in 0..n_seq {
                    let s = io.read_i32()?;
                    let in_range = is_valid_seq(s) && (s as u32) < self.params.n_seq_max;
                    if !in_range || seen.contains(s) {
                        return Err(MemoryError::state_format(format!(
                            "invalid or duplicate owner sequence {s}"
                        )));
                    }
                    seen.insert(s);
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
            meta.push((pos_min, pos_max, owners));
        }

        let n_layer = io.read_u32()?;
        if n_layer as usize != self.layers.len() {
            return Err(MemoryError::state_format(format!(
                "state has {n_layer} layers, cache has {}",
                self.layers.len()
            )));
        }
        let r_rows = self.read_rows(io, cell_count as usize, true)?;
        let s_rows = self.read_rows(io, cell_count as usize, false)?;

        let targets: Vec<usize> = if seq == SEQ_ID_ALL {
            self.ledger.reset();
            (0..cell_count as usize).collect()
        } else {
            let saved = self.ledger.clone();
            self.ledger.release(seq);
            if meta.is_empty() {
                return Ok(());
            }
            match self.ledger.next_free() {
                Some(slot) => vec![slot],
                None => {
                    self.ledger = saved;
                    return Err(MemoryError::capacity(format!(
                        "no free slot in {} for sequence {seq}",
                        self.name
                    )));
                }
            }
        };

        for (j, (&slot, &(pos_min, pos_max, owners))) in targets.iter().zip(&meta).enumerate() {
            self.ledger.cells[slot] = RsCell {
                pos_min,
                pos_max,
                src: slot as i32,
                src0: slot as i32,
                seq: owners,
            };
            self.ledger.used += 1;
            for s in owners.iter() {
                self.ledger.tails[s as usize] = slot as i32;
            }
            for (li, layer) in self.layers.iter_mut().enumerate() {
                let (rrb, srb) = (layer.r.row_bytes(), layer.s.row_bytes());
                layer
                    .r
                    .row_mut(slot)
                    .copy_from_slice(&r_rows[li][j * rrb..(j + 1) * rrb]);
                layer
                    .s
                    .row_mut(slot)
                    .copy_from_slice(&s_rows[li][j * srb..(j + 1) * srb]);
            }
        }
        Ok(())
    }

    fn read_rows(
        &self,
        io: &mut dyn StateRead,
        n_slots: usize,
        rolling: bool,
    ) -> MemoryResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let tensor = if rolling { &layer.r } else { &layer.s };
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
            let mut buf = vec![0u8; n_slots * tensor.row_bytes()];
            io.read_to(&mut buf)?;
            out.push(buf);
        }
        Ok(out)
    }

    /// Split policy shared with the hybrid cache.
    pub(crate) fn split(balloc: &mut BatchAllocator, n_ubatch: u32, embd_all: bool) -> Option<Vec<Ubatch>> {
        balloc.split_reset();
        let mut ubatches = Vec::new();
        loop {
            let ub = if embd_all {
                balloc.split_seq(n_ubatch)
            } else {
                balloc.split_equal(n_ubatch, true)
            };
            if ub.is_empty() {
                break;
            }
            ubatches.push(ub);
        }
        balloc.is_done().then_some(ubatches)
    }
}

impl Memory for RecurrentMemory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init_batch<'a>(
        &'a mut self,
        balloc: &mut BatchAllocator,
        n_ubatch: u32,
        embd_all: bool,
    ) -> Box<dyn MemoryContext + 'a> {
        let Some(ubatches) = Self::split(balloc, n_ubatch, embd_all) else {
            return Box::new(RecurrentContext::failed(self, MemoryStatus::FailedPrepare));
        };
        match self.prepare(&ubatches) {
            Some(slots) => Box::new(RecurrentContext::for_batch(self, ubatches, slots)),
            None => Box::new(RecurrentContext::failed(self, MemoryStatus::FailedPrepare)),
        }
    }

    fn init_full<'a>(&'a mut self) -> Box<dyn MemoryContext + 'a> {
        Box::new(RecurrentContext::full(self))
    }

    fn init_update<'a>(&'a mut self, _optimize: bool) -> Box<dyn MemoryContext + 'a> {
        Box::new(RecurrentContext::failed(self, MemoryStatus::NoUpdate))
    }

    fn clear(&mut self, data: bool) {
        self.ledger.reset();
        if data {
            for layer in &mut self.layers {
                layer.r.zero();
                layer.s.zero();
            }
        }
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        if seq != SEQ_ID_ALL && !is_valid_seq(seq) {
            return true;
        }
        if !self.can_rm(seq, p0, p1) {
            debug!(cache = self.name, seq, p0, p1, "partial removal of recurrent state rejected");
            return false;
        }
        let (p0, p1) = normalize_range(p0, p1);
        if p0 >= p1 {
            return true;
        }
        let seqs: Vec<SeqId> = if seq == SEQ_ID_ALL {
            (0..SEQ_MAX as SeqId).collect()
        } else {
            vec![seq]
        };
        for s in seqs {
            if let Some(t) = self.ledger.tail(s) {
                if RsLedger::cut(&self.ledger.cells[t], p0, p1) == RangeCut::Covers {
                    self.ledger.release(s);
                }
            }
        }
        true
    }

    fn seq_cp(&mut self, src: SeqId, dst: SeqId, _p0: Pos, _p1: Pos) {
        if src == dst || !is_valid_seq(src) || !is_valid_seq(dst) {
            return;
        }
        self.ledger.release(dst);
        if let Some(t) = self.ledger.tail(src) {
            self.ledger.cells[t].seq.insert(dst);
            self.ledger.tails[dst as usize] = t as i32;
        }
    }

    fn seq_keep(&mut self, seq: SeqId) {
        if !is_valid_seq(seq) {
            return;
        }
        let keep = self.ledger.tails[seq as usize];
        self.ledger.tails.fill(-1);
        self.ledger.tails[seq as usize] = keep;
        let mut used = 0;
        for cell in &mut self.ledger.cells {
            if cell.seq.contains(seq) {
                cell.seq = SeqSet::single(seq);
                used += 1;
            } else {
                *cell = RsCell::EMPTY;
            }
        }
        self.ledger.used = used;
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, shift: Pos) {
        if shift == 0 {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);
        if p0 >= p1 {
            return;
        }
        let Some(t) = self.ledger.tail(seq) else {
            return;
        };
        let cell = &mut self.ledger.cells[t];
        if cell.pos_max < p0 || cell.pos_max >= p1 {
            return;
        }
        match cell.pos_max.checked_add(shift).filter(|&p| p >= 0) {
            Some(pos_max) => {
                if cell.pos_min >= p0 {
                    cell.pos_min = cell.pos_min.saturating_add(shift);
                }
                cell.pos_max = pos_max;
                cell.pos_min = cell.pos_min.clamp(0, pos_max);
            }
            None => {
                let owners: Vec<SeqId> = cell.seq.iter().collect();
                for s in owners {
                    self.ledger.release(s);
                }
            }
        }
    }

    fn seq_div(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32) {
        if d <= 1 {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);
        if p0 >= p1 {
            return;
        }
        let Some(t) = self.ledger.tail(seq) else {
            return;
        };
        let cell = &mut self.ledger.cells[t];
        if cell.pos_max < p0 || cell.pos_max >= p1 {
            return;
        }
        cell.pos_max /= d;
        if cell.pos_min >= p0 {
            cell.pos_min /= d;
        }
    }

    fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.ledger
            .tail(seq)
            .map_or(-1, |t| self.ledger.cells[t].pos_min)
    }

    fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.ledger
            .tail(seq)
            .map_or(-1, |t| self.ledger.cells[t].pos_max)
    }

    fn can_shift(&self) -> bool {
        false
    }

    #[instrument(skip(self, io), fields(cache = self.name))]
    fn state_write(&self, io: &mut dyn StateWrite, seq: SeqId, _flags: StateFlags) -> MemoryResult<()> {
        self.write_state(io, seq)
    }

    #[instrument(skip(self, io), fields(cache = self.name))]
    fn state_read(&mut self, io: &mut dyn StateRead, seq: SeqId, _flags: StateFlags) -> MemoryResult<()> {
        let res = self.read_state(io, seq);
        if let Err(e) = &res {
            warn!(error = %e, "failed to restore recurrent state");
        }
        res
    }

    fn n_layer_owned(&self) -> u32 {
        self.layers.len() as u32
    }

    fn total_size(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.r.n_bytes() + l.s.n_bytes())
            .sum()
    }

    fn used(&self) -> u32 {
        self.ledger.used
    }

    fn size(&self) -> u32 {
        self.ledger.size()
    }
}

struct RsUndo {
    ledger: RsLedger,
    rows: Vec<SlotBackup>,
}

enum RsMode {
    Batch {
        ubatches: Vec<Ubatch>,
        slots: Vec<Vec<u32>>,
        i_cur: usize,
        applied: Option<usize>,
        undo: Option<RsUndo>,
    },
    Full,
    Idle,
}

/// Context over a [`RecurrentMemory`].
pub struct RecurrentContext<'a> {
    mem: &'a mut RecurrentMemory,
    status: MemoryStatus,
    mode: RsMode,
}

impl<'a> RecurrentContext<'a> {
    pub fn failed(mem: &'a mut RecurrentMemory, status: MemoryStatus) -> Self {
        Self {
            mem,
            status,
            mode: RsMode::Idle,
        }
    }

    pub fn for_batch(
        mem: &'a mut RecurrentMemory,
        ubatches: Vec<Ubatch>,
        slots: Vec<Vec<u32>>,
    ) -> Self {
        Self {
            mem,
            status: MemoryStatus::Success,
            mode: RsMode::Batch {
                ubatches,
                slots,
                i_cur: 0,
                applied: None,
                undo: None,
            },
        }
    }

    pub fn full(mem: &'a mut RecurrentMemory) -> Self {
        Self {
            mem,
            status: MemoryStatus::Success,
            mode: RsMode::Full,
        }
    }

    /// The cache behind this context.
    pub fn memory(&self) -> &RecurrentMemory {
        self.mem
    }
}

impl MemoryContext for RecurrentContext<'_> {
    fn status(&self) -> MemoryStatus {
        self.status
    }

    fn ubatch(&self) -> Option<&Ubatch> {
        match &self.mode {
            RsMode::Batch { ubatches, i_cur, .. } => ubatches.get(*i_cur),
            _ => None,
        }
    }

    fn next(&mut self) -> bool {
        match &mut self.mode {
            RsMode::Batch { ubatches, i_cur, .. } if *i_cur + 1 < ubatches.len() => {
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
        let RsMode::Batch {
            ubatches,
            slots,
            i_cur,
            applied,
            undo,
        } = &mut self.mode
        else {
            return true;
        };
        if *applied == Some(*i_cur) {
            return true;
        }

        let undo = undo.get_or_insert_with(|| RsUndo {
            ledger: self.mem.ledger.clone(),
            rows: Vec::new(),
        });
        for &slot in &slots[*i_cur] {
            undo.rows.push(self.mem.backup_slot(slot));
        }
        match self.mem.apply_ubatch(&ubatches[*i_cur]) {
            Some(assigned) => {
                debug_assert_eq!(assigned, slots[*i_cur]);
                slots[*i_cur] = assigned;
                *applied = Some(*i_cur);
                true
            }
            None => {
                warn!(cache = self.mem.name, "prepared recurrent slots no longer available");
                self.status = MemoryStatus::FailedPrepare;
                false
            }
        }
    }

    fn rollback(&mut self) {
        if let RsMode::Batch { undo, applied, .. } = &mut self.mode {
            if let Some(undo) = undo.take() {
                for backup in undo.rows.iter().rev() {
                    self.mem.restore_slot(backup);
                }
                self.mem.ledger = undo.ledger;
                debug!(cache = self.mem.name, "rolled back batch");
            }
            *applied = None;
        }
        self.status = MemoryStatus::FailedCompute;
    }

    fn layer_layout(&self, il: u32) -> Option<LayerLayout> {
        self.mem.layer_layout(il)
    }

    fn write_layer(&mut self, il: u32, row: usize, k: &[u8], v: &[u8]) -> MemoryResult<()> {
        let slot = match &self.mode {
            RsMode::Batch {
                slots,
                i_cur,
                applied,
                ..
            } => {
                if *applied != Some(*i_cur) {
                    return Err(MemoryError::internal(
                        "micro-batch must be applied before writing state",
                    ));
                }
                slots[*i_cur].get(row).copied().ok_or_else(|| {
                    MemoryError::internal(format!("sequence set {row} outside the micro-batch"))
                })?
            }
            _ => {
                return Err(MemoryError::internal(
                    "only batch contexts accept layer writes",
                ));
            }
        };
        self.mem.write_row(il, slot, k, v)
    }

    fn n_kv(&self, il: u32) -> u32 {
        if !self.mem.has_layer(il) {
            return 0;
        }
        match &self.mode {
            RsMode::Batch { slots, i_cur, .. } => slots[*i_cur].len() as u32,
            RsMode::Full => self.mem.size(),
            RsMode::Idle => 0,
        }
    }

    fn slots(&self, il: u32) -> Option<Vec<u32>> {
        if !self.mem.has_layer(il) {
            return None;
        }
        match &self.mode {
            RsMode::Batch { slots, i_cur, .. } => Some(slots[*i_cur].clone()),
            _ => None,
        }
    }
}
