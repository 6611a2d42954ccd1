//! Input batches, validation, and splitting into micro-batches.
//!
//! A [`BatchAllocator`] takes a caller [`Batch`], fills in what the caller
//! left out (positions, sequence ids, output flags), validates it against the
//! memory it will be written to, and then hands out [`Ubatch`]es with one of
//! three splitting strategies. Tokens of one sequence always leave the
//! allocator in their original order.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{MemoryError, MemoryResult};
use crate::traits::Memory;
use crate::types::{Pos, SEQ_MAX, SeqId, SeqSet, Token};

/// Caller-facing batch.
///
/// Only `token` is mandatory. Missing positions, sequence ids and output
/// flags are filled in by [`BatchAllocator::init`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub token: Vec<Token>,
    pub pos: Option<Vec<Pos>>,
    pub seq_id: Option<Vec<Vec<SeqId>>>,
    pub logits: Option<Vec<bool>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens only; everything else is defaulted at init.
    pub fn from_tokens(tokens: impl Into<Vec<Token>>) -> Self {
        Self {
            token: tokens.into(),
            ..Self::default()
        }
    }

    /// Append one fully specified token.
    ///
    /// Mixing this with [`Batch::from_tokens`] leaves the optional arrays
    /// shorter than `token`, which `init` rejects.
    pub fn add(&mut self, token: Token, pos: Pos, seq_ids: &[SeqId], logits: bool) -> &mut Self {
        self.token.push(token);
        self.pos.get_or_insert_with(Vec::new).push(pos);
        self.seq_id
            .get_or_insert_with(Vec::new)
            .push(seq_ids.to_vec());
        self.logits.get_or_insert_with(Vec::new).push(logits);
        self
    }

    pub fn len(&self) -> usize {
        self.token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

/// Validation settings for [`BatchAllocator::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Sequence ids must be in `[0, n_seq_max)`.
    pub n_seq_max: u32,
    /// Mark every token as an output.
    pub output_all: bool,
    /// Skip the contiguity and continuation checks.
    pub allow_gaps: bool,
}

impl BatchOptions {
    pub fn new(n_seq_max: u32) -> Self {
        Self {
            n_seq_max,
            output_all: false,
            allow_gaps: false,
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A micro-batch.
///
/// With `equal_seqs`, tokens are laid out set-major: `n_seqs` sequence sets
/// with `n_seq_tokens` tokens each, so set `s` starts at
/// `s * n_seq_tokens`. Otherwise every token counts as its own set
/// (`n_seqs == n_tokens`, `n_seq_tokens == 1`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ubatch {
    pub equal_seqs: bool,
    pub n_tokens: u32,
    pub n_seq_tokens: u32,
    pub n_seqs: u32,
    pub token: Vec<Token>,
    pub pos: Vec<Pos>,
    pub seq_set: Vec<SeqSet>,
    pub output: Vec<bool>,
    /// Sorted unique sequence ids present in the micro-batch.
    pub seq_id_unq: Vec<SeqId>,
    /// Index of each token in the original batch.
    pub idx: Vec<u32>,
}

impl Ubatch {
    /// Micro-batch holding `pos.len()` tokens of one sequence, used when
    /// restoring saved state.
    pub fn from_positions(pos: &[Pos], seq: SeqId) -> Self {
        let n = pos.len() as u32;
        Self {
            equal_seqs: true,
            n_tokens: n,
            n_seq_tokens: n,
            n_seqs: 1,
            token: vec![0; pos.len()],
            pos: pos.to_vec(),
            seq_set: vec![SeqSet::single(seq); pos.len()],
            output: vec![false; pos.len()],
            seq_id_unq: vec![seq],
            idx: (0..n).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    /// Index of `seq` in `seq_id_unq`.
    pub fn seq_idx(&self, seq: SeqId) -> Option<usize> {
        self.seq_id_unq.binary_search(&seq).ok()
    }

    /// Sequence set `s` (the set of its first token).
    pub fn set_seqs(&self, s: u32) -> SeqSet {
        self.seq_set[(s * self.n_seq_tokens) as usize]
    }

    /// Position of the last token of set `s`.
    pub fn set_last_pos(&self, s: u32) -> Pos {
        self.pos[((s + 1) * self.n_seq_tokens - 1) as usize]
    }

    /// Position of the first token of set `s`.
    pub fn set_first_pos(&self, s: u32) -> Pos {
        self.pos[(s * self.n_seq_tokens) as usize]
    }

    /// Smallest position among tokens that belong to `seq`.
    pub fn seq_pos_min(&self, seq: SeqId) -> Option<Pos> {
        self.pos
            .iter()
            .zip(&self.seq_set)
            .filter(|(_, set)| set.contains(seq))
            .map(|(&p, _)| p)
            .min()
    }

    pub fn n_outputs(&self) -> u32 {
        self.output.iter().filter(|&&o| o).count() as u32
    }
}

/// Validates a batch and splits it into micro-batches.
#[derive(Debug, Default)]
pub struct BatchAllocator {
    token: Vec<Token>,
    pos: Vec<Pos>,
    seq_set: Vec<SeqSet>,
    output: Vec<bool>,
    n_seq_max: u32,

    seq_pos: Vec<BTreeSet<Pos>>,
    seq_cpl: Vec<SeqSet>,
    seq_set_map: BTreeMap<SeqSet, Vec<u32>>,
    seq_id_unq: Vec<SeqId>,

    used: Vec<bool>,
    n_used: u32,
    n_outputs: u32,
    out_ids: Vec<u32>,
}

impl BatchAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate `batch`.
    ///
    /// `memory` supplies the current per-sequence position bounds for
    /// auto-filled positions and for the continuation checks.
    pub fn init(
        &mut self,
        batch: &Batch,
        memory: Option<&dyn Memory>,
        options: BatchOptions,
    ) -> MemoryResult<()> {
        *self = Self::default();

        let n_tokens = batch.token.len();
        if n_tokens == 0 {
            return Err(MemoryError::invalid_batch("batch is empty"));
        }
        if options.n_seq_max == 0 || options.n_seq_max as usize > SEQ_MAX {
            return Err(MemoryError::invalid_batch(format!(
                "n_seq_max must be in 1..={SEQ_MAX}, got {}",
                options.n_seq_max
            )));
        }
        check_len("pos", batch.pos.as_ref().map(Vec::len), n_tokens)?;
        check_len("seq_id", batch.seq_id.as_ref().map(Vec::len), n_tokens)?;
        check_len("logits", batch.logits.as_ref().map(Vec::len), n_tokens)?;

        let n_seq_max = options.n_seq_max;
        let seq_set: Vec<SeqSet> = match &batch.seq_id {
            Some(lists) => {
                let mut sets = Vec::with_capacity(n_tokens);
                for (i, ids) in lists.iter().enumerate() {
                    if ids.is_empty() {
                        return Err(MemoryError::invalid_batch(format!(
                            "token {i} has no sequence id"
                        )));
                    }
                    for &s in ids {
                        if s < 0 || s as u32 >= n_seq_max {
                            return Err(MemoryError::invalid_batch(format!(
                                "token {i}: invalid seq_id {s} (n_seq_max = {n_seq_max})"
                            )));
                        }
                    }
                    sets.push(SeqSet::from_ids(ids));
                }
                sets
            }
            None => vec![SeqSet::single(0); n_tokens],
        };

        let pos: Vec<Pos> = match &batch.pos {
            Some(pos) => {
                if let Some(i) = pos.iter().position(|&p| p < 0) {
                    return Err(MemoryError::invalid_batch(format!(
                        "token {i} has negative position {}",
                        pos[i]
                    )));
                }
                pos.clone()
            }
            None => {
                let mut next: Vec<Option<Pos>> = (0..SEQ_MAX as SeqId)
                    .map(|s| memory.map_or(Some(0), |m| m.seq_pos_max(s).checked_add(1)))
                    .collect();
                let mut pos = Vec::with_capacity(n_tokens);
                for (i, set) in seq_set.iter().enumerate() {
                    let p = match set.first() {
                        Some(s) => next[s as usize].ok_or_else(|| {
                            MemoryError::invalid_batch(format!(
                                "token {i}: sequence {s} has no position left"
                            ))
                        })?,
                        None => 0,
                    };
                    for s in set.iter() {
                        next[s as usize] = p.checked_add(1);
                    }
                    pos.push(p);
                }
                pos
            }
        };

        let output: Vec<bool> = if options.output_all {
            if batch.logits.as_ref().is_some_and(|l| l.iter().any(|&o| !o)) {
                debug!("output_all set, overriding caller output flags");
            }
            vec![true; n_tokens]
        } else {
            match &batch.logits {
                Some(logits) => logits.clone(),
                None => {
                    let mut out = vec![false; n_tokens];
                    out[n_tokens - 1] = true;
                    out
                }
            }
        };

        let mut seq_pos = vec![BTreeSet::new(); SEQ_MAX];
        let mut seq_cpl = vec![SeqSet::EMPTY; SEQ_MAX];
        let mut last_pos: Vec<Option<Pos>> = vec![None; SEQ_MAX];
        for (i, (&p, &set)) in pos.iter().zip(&seq_set).enumerate() {
            for s in set.iter() {
                let su = s as usize;
                if let Some(prev) = last_pos[su] {
                    if p < prev {
                        return Err(MemoryError::invalid_batch(format!(
                            "positions of sequence {s} decrease at token {i}: {prev} -> {p}"
                        )));
                    }
                }
                last_pos[su] = Some(p);
                seq_pos[su].insert(p);
                let mut others = set;
                others.remove(s);
                seq_cpl[su] = seq_cpl[su].union(others);
            }
        }

        if !options.allow_gaps {
            for s in 0..SEQ_MAX {
                let (Some(&p_min), Some(&p_max)) = (seq_pos[s].first(), seq_pos[s].last()) else {
                    continue;
                };
                let seq = s as SeqId;
                if let Some(m) = memory {
                    let p_mem = m.seq_pos_max(seq);
                    if p_mem >= 0 && p_min as i64 != p_mem as i64 + 1 {
                        return Err(MemoryError::invalid_batch(format!(
                            "sequence {seq} continues at position {p_min}, memory ends at {p_mem}"
                        )));
                    }
                }
                if (p_max as i64 - p_min as i64 + 1) as usize > seq_pos[s].len() {
                    return Err(MemoryError::invalid_batch(format!(
                        "positions of sequence {seq} are not contiguous ({p_min}..={p_max})"
                    )));
                }
            }
            if let Some(m) = memory {
                for s0 in 0..SEQ_MAX as SeqId {
                    for s1 in seq_cpl[s0 as usize].iter().filter(|&s1| s1 > s0) {
                        let (a, b) = (m.seq_pos_max(s0), m.seq_pos_max(s1));
                        if a != b {
                            return Err(MemoryError::invalid_batch(format!(
                                "sequences {s0} and {s1} are coupled in the batch but diverged in memory ({a} vs {b})"
                            )));
                        }
                    }
                }
            }
        }

        let mut seq_set_map: BTreeMap<SeqSet, Vec<u32>> = BTreeMap::new();
        let mut all = SeqSet::EMPTY;
        for (i, &set) in seq_set.iter().enumerate() {
            seq_set_map.entry(set).or_default().push(i as u32);
            all = all.union(set);
        }

        self.n_outputs = output.iter().filter(|&&o| o).count() as u32;
        self.token = batch.token.clone();
        self.pos = pos;
        self.seq_set = seq_set;
        self.output = output;
        self.n_seq_max = n_seq_max;
        self.seq_pos = seq_pos;
        self.seq_cpl = seq_cpl;
        self.seq_set_map = seq_set_map;
        self.seq_id_unq = all.iter().collect();
        self.used = vec![false; n_tokens];

        debug!(
            n_tokens,
            n_outputs = self.n_outputs,
            n_seqs = self.seq_id_unq.len(),
            "batch initialized"
        );
        Ok(())
    }

    pub fn n_tokens(&self) -> u32 {
        self.token.len() as u32
    }

    pub fn n_used(&self) -> u32 {
        self.n_used
    }

    pub fn n_outputs(&self) -> u32 {
        self.n_outputs
    }

    pub fn n_seq_max(&self) -> u32 {
        self.n_seq_max
    }

    /// Whether every token has been handed out.
    pub fn is_done(&self) -> bool {
        self.n_used == self.n_tokens()
    }

    /// Whether every token is marked as output.
    pub fn all_outputs(&self) -> bool {
        self.n_outputs == self.n_tokens()
    }

    /// Sorted unique sequence ids in the batch.
    pub fn seq_id_unq(&self) -> &[SeqId] {
        &self.seq_id_unq
    }

    /// Smallest position of `seq` in the batch, `-1` if absent.
    pub fn seq_pos_min(&self, seq: SeqId) -> Pos {
        self.seq_positions(seq)
            .and_then(|set| set.first().copied())
            .unwrap_or(-1)
    }

    /// Largest position of `seq` in the batch, `-1` if absent.
    pub fn seq_pos_max(&self, seq: SeqId) -> Pos {
        self.seq_positions(seq)
            .and_then(|set| set.last().copied())
            .unwrap_or(-1)
    }

    /// Whether `s0` and `s1` share a token in the batch.
    pub fn seqs_coupled(&self, s0: SeqId, s1: SeqId) -> bool {
        self.seq_cpl
            .get(s0 as usize)
            .is_some_and(|cpl| cpl.contains(s1))
    }

    /// Batch indices of output tokens, in micro-batch order.
    pub fn out_ids(&self) -> &[u32] {
        &self.out_ids
    }

    fn seq_positions(&self, seq: SeqId) -> Option<&BTreeSet<Pos>> {
        if seq < 0 {
            return None;
        }
        self.seq_pos.get(seq as usize)
    }

    /// Mark every token unused again.
    pub fn split_reset(&mut self) {
        self.used.iter_mut().for_each(|u| *u = false);
        self.n_used = 0;
        self.out_ids.clear();
    }

    /// Next `n_ubatch` unused tokens in batch order.
    pub fn split_simple(&mut self, n_ubatch: u32) -> Ubatch {
        let idxs: Vec<u32> = (0..self.n_tokens())
            .filter(|&i| !self.used[i as usize])
            .take(n_ubatch as usize)
            .collect();
        if idxs.is_empty() {
            return Ubatch::default();
        }
        self.ubatch_add(&[idxs], false)
    }

    /// Micro-batch of non-overlapping sequence sets.
    ///
    /// A set is only considered when no earlier unused token overlaps it, and
    /// tokens of a set are only taken up to the first unused token of an
    /// overlapping different set. With `force_equal` every set contributes
    /// the same number of tokens; otherwise sets fill the remaining room
    /// round-robin.
    pub fn split_equal(&mut self, n_ubatch: u32, force_equal: bool) -> Ubatch {
        let n_ubatch = n_ubatch.max(1) as usize;

        let mut sets: Vec<SeqSet> = Vec::new();
        let mut blocked = SeqSet::EMPTY;
        for i in 0..self.token.len() {
            if self.used[i] {
                continue;
            }
            let cur = self.seq_set[i];
            if sets.contains(&cur) {
                continue;
            }
            if !cur.intersects(blocked) {
                sets.push(cur);
                if sets.len() >= n_ubatch {
                    break;
                }
            }
            blocked = blocked.union(cur);
        }
        if sets.is_empty() {
            return Ubatch::default();
        }

        let candidates: Vec<Vec<u32>> = sets
            .iter()
            .map(|&set| {
                let cap = self.foreign_overlap(set);
                self.seq_set_map
                    .get(&set)
                    .map(|idxs| {
                        idxs.iter()
                            .copied()
                            .filter(|&i| !self.used[i as usize] && i < cap)
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        let n_sets = sets.len();
        let mut taken: Vec<Vec<u32>> = vec![Vec::new(); n_sets];
        let mut total = 0usize;
        if force_equal {
            let mut round = 0usize;
            while total + n_sets <= n_ubatch && candidates.iter().all(|c| round < c.len()) {
                for (s, c) in candidates.iter().enumerate() {
                    taken[s].push(c[round]);
                }
                total += n_sets;
                round += 1;
            }
        } else {
            let mut round = 0usize;
            loop {
                let mut progressed = false;
                for (s, c) in candidates.iter().enumerate() {
                    if total >= n_ubatch {
                        break;
                    }
                    if round < c.len() {
                        taken[s].push(c[round]);
                        total += 1;
                        progressed = true;
                    }
                }
                round += 1;
                if !progressed || total >= n_ubatch {
                    break;
                }
            }
        }

        taken.retain(|t| !t.is_empty());
        let equal = taken.windows(2).all(|w| w[0].len() == w[1].len());
        self.ubatch_add(&taken, equal)
    }

    /// Micro-batch of one sequence set and its subsets.
    pub fn split_seq(&mut self, n_ubatch: u32) -> Ubatch {
        let n = self.token.len();
        let Some(mut cur) = (0..n).find(|&i| !self.used[i]) else {
            return Ubatch::default();
        };
        let mut cur_set = self.seq_set[cur];
        let mut idxs = Vec::new();
        loop {
            idxs.push(cur as u32);
            if idxs.len() >= n_ubatch.max(1) as usize {
                break;
            }
            let mut next = None;
            for j in cur + 1..n {
                if self.used[j] {
                    continue;
                }
                let sj = self.seq_set[j];
                if sj.is_subset(cur_set) {
                    next = Some(j);
                    cur_set = sj;
                    break;
                }
                if sj.intersects(cur_set) {
                    break;
                }
            }
            match next {
                Some(j) => cur = j,
                None => break,
            }
        }
        self.ubatch_add(&[idxs], true)
    }

    /// First unused token whose set overlaps `set` without being equal to it.
    fn foreign_overlap(&self, set: SeqSet) -> u32 {
        (0..self.n_tokens())
            .find(|&i| {
                let other = self.seq_set[i as usize];
                !self.used[i as usize] && other != set && other.intersects(set)
            })
            .unwrap_or(u32::MAX)
    }

    fn ubatch_add(&mut self, groups: &[Vec<u32>], equal_seqs: bool) -> Ubatch {
        let idxs: Vec<u32> = groups.iter().flatten().copied().collect();
        let n_tokens = idxs.len() as u32;

        let mut ub = Ubatch {
            equal_seqs,
            n_tokens,
            ..Ubatch::default()
        };
        if equal_seqs && !groups.is_empty() {
            ub.n_seqs = groups.len() as u32;
            ub.n_seq_tokens = n_tokens / ub.n_seqs;
        } else {
            ub.equal_seqs = false;
            ub.n_seqs = n_tokens;
            ub.n_seq_tokens = 1;
        }

        let mut all = SeqSet::EMPTY;
        for &i in &idxs {
            let iu = i as usize;
            ub.token.push(self.token[iu]);
            ub.pos.push(self.pos[iu]);
            ub.seq_set.push(self.seq_set[iu]);
            ub.output.push(self.output[iu]);
            all = all.union(self.seq_set[iu]);

            self.used[iu] = true;
            self.n_used += 1;
            if self.output[iu] {
                self.out_ids.push(i);
            }
        }
        ub.seq_id_unq = all.iter().collect();
        ub.idx = idxs;
        ub
    }
}

fn check_len(name: &str, len: Option<usize>, n_tokens: usize) -> MemoryResult<()> {
    match len {
        Some(len) if len != n_tokens => Err(MemoryError::invalid_batch(format!(
            "{name} has {len} entries, batch has {n_tokens} tokens"
        ))),
        _ => Ok(()),
    }
}
