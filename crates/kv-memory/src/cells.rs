//! Cell ledger for attention caches.
//!
//! Tracks, per physical cell, the stored position, the accumulated position
//! shift and the owning sequences. Per sequence it keeps a multiset of stored
//! positions so min/max lookups stay logarithmic.

use std::collections::{BTreeMap, BTreeSet};

use seqcache_core::{Pos, SEQ_MAX, SeqId, SeqSet};

#[derive(Debug, Clone)]
pub struct KvCells {
    pos: Vec<Pos>,
    shift: Vec<Pos>,
    seq: Vec<SeqSet>,
    used: BTreeSet<u32>,
    seq_pos: Vec<BTreeMap<Pos, u32>>,
    has_shift: bool,
}

impl KvCells {
    pub fn new(size: u32) -> Self {
        let n = size as usize;
        Self {
            pos: vec![-1; n],
            shift: vec![0; n],
            seq: vec![SeqSet::EMPTY; n],
            used: BTreeSet::new(),
            seq_pos: vec![BTreeMap::new(); SEQ_MAX],
            has_shift: false,
        }
    }

    /// Free every cell.
    pub fn reset(&mut self) {
        self.pos.fill(-1);
        self.shift.fill(0);
        self.seq.fill(SeqSet::EMPTY);
        self.used.clear();
        self.seq_pos.iter_mut().for_each(BTreeMap::clear);
        self.has_shift = false;
    }

    pub fn size(&self) -> u32 {
        self.pos.len() as u32
    }

    /// Number of occupied cells.
    pub fn used(&self) -> u32 {
        self.used.len() as u32
    }

    /// One past the highest occupied cell, 0 when empty.
    pub fn used_max_p1(&self) -> u32 {
        self.used.last().map_or(0, |&i| i + 1)
    }

    /// Occupied cell indices in ascending order.
    pub fn used_cells(&self) -> impl Iterator<Item = u32> + '_ {
        self.used.iter().copied()
    }

    pub fn is_empty(&self, i: u32) -> bool {
        self.pos[i as usize] == -1
    }

    pub fn pos_get(&self, i: u32) -> Pos {
        self.pos[i as usize]
    }

    pub fn shift_get(&self, i: u32) -> Pos {
        self.shift[i as usize]
    }

    pub fn seqs(&self, i: u32) -> SeqSet {
        self.seq[i as usize]
    }

    pub fn seq_count(&self, i: u32) -> usize {
        self.seq[i as usize].len()
    }

    pub fn seq_has(&self, i: u32, seq: SeqId) -> bool {
        self.seq[i as usize].contains(seq)
    }

    /// Sole owner of a cell. Only meaningful when `seq_count(i) == 1`.
    pub fn seq_get(&self, i: u32) -> Option<SeqId> {
        self.seq[i as usize].first()
    }

    /// Whether the cell position lies in `[p0, p1)`.
    pub fn pos_in(&self, i: u32, p0: Pos, p1: Pos) -> bool {
        let p = self.pos[i as usize];
        p >= p0 && p < p1
    }

    pub fn has_shift(&self) -> bool {
        self.has_shift
    }

    /// Per-cell pending shifts.
    pub fn shifts(&self) -> &[Pos] {
        &self.shift
    }

    pub fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.seq_map(seq)
            .and_then(|m| m.keys().next().copied())
            .unwrap_or(-1)
    }

    pub fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.seq_map(seq)
            .and_then(|m| m.keys().next_back().copied())
            .unwrap_or(-1)
    }

    fn seq_map(&self, seq: SeqId) -> Option<&BTreeMap<Pos, u32>> {
        if seq < 0 {
            return None;
        }
        self.seq_pos.get(seq as usize)
    }

    /// Occupy an empty cell at position `p`. Owners are added separately.
    pub fn pos_set(&mut self, i: u32, p: Pos) {
        debug_assert!(self.is_empty(i));
        debug_assert!(p >= 0);
        self.pos[i as usize] = p;
        self.used.insert(i);
    }

    /// Add `seq` as an owner of occupied cell `i`.
    pub fn seq_add(&mut self, i: u32, seq: SeqId) {
        debug_assert!(!self.is_empty(i));
        if self.seq[i as usize].insert(seq) {
            self.seq_pos_inc(seq, self.pos[i as usize]);
        }
    }

    /// Remove `seq` from cell `i`. Returns true if the cell became empty.
    pub fn seq_rm(&mut self, i: u32, seq: SeqId) -> bool {
        let iu = i as usize;
        if self.seq[iu].remove(seq) {
            self.seq_pos_dec(seq, self.pos[iu]);
        }
        if self.seq[iu].is_empty() && self.pos[iu] >= 0 {
            self.free(i);
            return true;
        }
        false
    }

    /// Keep only `seq` in cell `i`. Returns true if the cell became empty.
    pub fn seq_keep(&mut self, i: u32, seq: SeqId) -> bool {
        let iu = i as usize;
        if self.pos[iu] < 0 {
            return false;
        }
        let others: Vec<SeqId> = self.seq[iu].iter().filter(|&s| s != seq).collect();
        for s in others {
            self.seq[iu].remove(s);
            self.seq_pos_dec(s, self.pos[iu]);
        }
        if self.seq[iu].is_empty() {
            self.free(i);
            return true;
        }
        false
    }

    /// Free cell `i` regardless of owners.
    pub fn rm(&mut self, i: u32) {
        let iu = i as usize;
        if self.pos[iu] < 0 {
            return;
        }
        let p = self.pos[iu];
        for s in self.seq[iu].iter() {
            self.seq_pos_dec(s, p);
        }
        self.seq[iu].clear();
        self.free(i);
    }

    /// Shift the position of cell `i` by `d`. Returns true if the cell left
    /// the valid position range and was freed.
    pub fn pos_add(&mut self, i: u32, d: Pos) -> bool {
        let iu = i as usize;
        let old = self.pos[iu];
        let owners = self.seq[iu];
        for s in owners.iter() {
            self.seq_pos_dec(s, old);
        }
        self.has_shift = true;

        let Some(new) = old.checked_add(d).filter(|&p| p >= 0) else {
            self.seq[iu].clear();
            self.free(i);
            return true;
        };
        self.pos[iu] = new;
        self.shift[iu] += d;
        for s in owners.iter() {
            self.seq_pos_inc(s, self.pos[iu]);
        }
        false
    }

    /// Integer-divide the position of cell `i` by `d`.
    pub fn pos_div(&mut self, i: u32, d: i32) {
        let iu = i as usize;
        let old = self.pos[iu];
        let owners = self.seq[iu];
        for s in owners.iter() {
            self.seq_pos_dec(s, old);
        }
        self.pos[iu] = old / d;
        self.shift[iu] += self.pos[iu] - old;
        self.has_shift = true;
        for s in owners.iter() {
            self.seq_pos_inc(s, self.pos[iu]);
        }
    }

    /// Move the contents of `src` into empty cell `dst`.
    pub fn mv(&mut self, src: u32, dst: u32) {
        debug_assert!(self.is_empty(dst));
        let (s, d) = (src as usize, dst as usize);
        self.pos[d] = self.pos[s];
        self.shift[d] = self.shift[s];
        self.seq[d] = self.seq[s];
        self.pos[s] = -1;
        self.shift[s] = 0;
        self.seq[s].clear();
        self.used.remove(&src);
        self.used.insert(dst);
    }

    /// Forget accumulated shifts.
    pub fn reset_shift(&mut self) {
        self.has_shift = false;
        self.shift.fill(0);
    }

    fn free(&mut self, i: u32) {
        self.pos[i as usize] = -1;
        self.shift[i as usize] = 0;
        self.used.remove(&i);
    }

    fn seq_pos_inc(&mut self, seq: SeqId, p: Pos) {
        *self.seq_pos[seq as usize].entry(p).or_insert(0) += 1;
    }

    fn seq_pos_dec(&mut self, seq: SeqId, p: Pos) {
        let map = &mut self.seq_pos[seq as usize];
        if let Some(count) = map.get_mut(&p) {
            *count -= 1;
            if *count == 0 {
                map.remove(&p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupy(cells: &mut KvCells, i: u32, p: Pos, seqs: &[SeqId]) {
        cells.pos_set(i, p);
        for &s in seqs {
            cells.seq_add(i, s);
        }
    }

    #[test]
    fn test_occupy_and_free() {
        let mut cells = KvCells::new(4);
        occupy(&mut cells, 0, 0, &[0]);
        occupy(&mut cells, 2, 1, &[0, 1]);

        assert_eq!(cells.used(), 2);
        assert_eq!(cells.used_max_p1(), 3);
        assert_eq!(cells.seq_pos_min(0), 0);
        assert_eq!(cells.seq_pos_max(0), 1);
        assert_eq!(cells.seq_pos_min(1), 1);

        assert!(!cells.seq_rm(2, 0));
        assert_eq!(cells.seq_pos_max(0), 0);
        assert!(cells.seq_rm(2, 1));
        assert_eq!(cells.seq_pos_max(1), -1);
        assert!(cells.is_empty(2));
        assert_eq!(cells.used_max_p1(), 1);
    }

    #[test]
    fn test_seq_keep() {
        let mut cells = KvCells::new(2);
        occupy(&mut cells, 0, 0, &[0, 1]);
        occupy(&mut cells, 1, 0, &[2]);
        assert!(!cells.seq_keep(0, 1));
        assert!(cells.seq_keep(1, 1));
        assert_eq!(cells.seqs(0), SeqSet::single(1));
        assert_eq!(cells.used(), 1);
        assert_eq!(cells.seq_pos_max(0), -1);
    }

    #[test]
    fn test_pos_add_frees_negative() {
        let mut cells = KvCells::new(3);
        occupy(&mut cells, 0, 0, &[0]);
        occupy(&mut cells, 1, 1, &[0]);
        occupy(&mut cells, 2, 2, &[0]);

        assert!(cells.pos_add(0, -1));
        assert!(!cells.pos_add(1, -1));
        assert!(!cells.pos_add(2, -1));
        assert!(cells.has_shift());
        assert_eq!(cells.shift_get(1), -1);
        assert_eq!(cells.seq_pos_min(0), 0);
        assert_eq!(cells.seq_pos_max(0), 1);
        assert_eq!(cells.used(), 2);

        cells.reset_shift();
        assert!(!cells.has_shift());
        assert_eq!(cells.shift_get(1), 0);
    }

    #[test]
    fn test_pos_add_frees_on_overflow() {
        let mut cells = KvCells::new(2);
        occupy(&mut cells, 0, 0, &[0]);
        occupy(&mut cells, 1, 3, &[0]);

        assert!(!cells.pos_add(0, Pos::MAX));
        assert_eq!(cells.pos_get(0), Pos::MAX);
        assert!(cells.pos_add(1, Pos::MAX));
        assert!(cells.is_empty(1));
        assert_eq!(cells.used(), 1);
        assert_eq!(cells.seq_pos_min(0), Pos::MAX);
        assert_eq!(cells.seq_pos_max(0), Pos::MAX);
    }

    #[test]
    fn test_pos_div_records_shift() {
        let mut cells = KvCells::new(1);
        occupy(&mut cells, 0, 7, &[0]);
        cells.pos_div(0, 2);
        assert_eq!(cells.pos_get(0), 3);
        assert_eq!(cells.shift_get(0), -4);
        assert_eq!(cells.seq_pos_max(0), 3);
    }

    #[test]
    fn test_move_and_snapshot() {
        let mut cells = KvCells::new(4);
        occupy(&mut cells, 3, 5, &[1]);
        let snapshot = cells.clone();

        cells.mv(3, 0);
        assert!(cells.is_empty(3));
        assert_eq!(cells.pos_get(0), 5);
        assert_eq!(cells.used_max_p1(), 1);
        assert_eq!(cells.seq_pos_max(1), 5);

        cells = snapshot;
        assert_eq!(cells.pos_get(3), 5);
        assert!(cells.is_empty(0));
    }

    #[test]
    fn test_shared_positions_counted() {
        let mut cells = KvCells::new(2);
        occupy(&mut cells, 0, 4, &[0]);
        occupy(&mut cells, 1, 4, &[0]);
        cells.rm(0);
        assert_eq!(cells.seq_pos_max(0), 4);
        cells.rm(1);
        assert_eq!(cells.seq_pos_max(0), -1);
    }
}
