//! End-to-end scenarios for the cache variants.
//!
//! Rows written here are deterministic functions of (layer, position,
//! sequence), so moved, copied or restored rows can be checked by value.

use kv_memory::{
    HybridMemory, KvCache, KvCacheIswa, KvCacheParams, RecurrentMemory, RecurrentParams,
};
use seqcache_core::{
    Batch, BatchAllocator, BatchOptions, BufferWriter, CacheConfig, FileReader, FileWriter,
    Memory, MemoryContext, MemoryError, MemoryStatus, ModelConfig, Pos, SEQ_ID_ALL, SeqId,
    SliceReader, StateFlags, SwaType,
};

fn pattern(il: u32, pos: Pos, seq: SeqId, n: usize) -> Vec<u8> {
    (0..n)
        .map(|j| (il as usize * 31 + pos as usize * 7 + seq as usize * 13 + j) as u8)
        .collect()
}

/// Store rows for the current micro-batch of `ctx`.
fn write_rows(ctx: &mut dyn MemoryContext, n_layer: u32) {
    let ub = ctx.ubatch().cloned().expect("batch context");
    for il in 0..n_layer {
        let Some(layout) = ctx.layer_layout(il) else {
            continue;
        };
        if layout.recurrent {
            for s in 0..ub.n_seqs {
                let tok = (s * ub.n_seq_tokens + ub.n_seq_tokens - 1) as usize;
                let seq = ub.seq_set[tok].first().unwrap();
                let k = pattern(il, ub.pos[tok], seq, layout.k_row_bytes);
                let v = pattern(il + 100, ub.pos[tok], seq, layout.v_row_bytes);
                ctx.write_layer(il, s as usize, &k, &v).unwrap();
            }
        } else {
            for i in 0..ub.n_tokens as usize {
                let seq = ub.seq_set[i].first().unwrap();
                let k = pattern(il, ub.pos[i], seq, layout.k_row_bytes);
                let v = pattern(il + 100, ub.pos[i], seq, layout.v_row_bytes);
                ctx.write_layer(il, i, &k, &v).unwrap();
            }
        }
    }
}

fn allocator(memory: &dyn Memory, seqs: &[SeqId], n: Pos) -> BatchAllocator {
    let mut batch = Batch::new();
    for &seq in seqs {
        let start = memory.seq_pos_max(seq) + 1;
        for p in start..start + n {
            batch.add(1, p, &[seq], false);
        }
    }
    let mut balloc = BatchAllocator::new();
    balloc
        .init(&batch, Some(memory), BatchOptions::new(8))
        .unwrap();
    balloc
}

/// Decode `n` more tokens for each of `seqs`, writing rows for every layer.
fn decode(memory: &mut dyn Memory, n_layer: u32, seqs: &[SeqId], n: Pos) -> MemoryStatus {
    let mut balloc = allocator(memory, seqs, n);
    let mut ctx = memory.init_batch(&mut balloc, 64, false);
    let status = ctx.status();
    if status != MemoryStatus::Success {
        return status;
    }
    loop {
        assert!(ctx.apply());
        write_rows(&mut *ctx, n_layer);
        if !ctx.next() {
            break;
        }
    }
    status
}

fn unified(kv_size: u32) -> KvCache {
    let params = KvCacheParams {
        kv_size,
        n_pad: 1,
        n_seq_max: 8,
        ..KvCacheParams::from_config(&CacheConfig::default())
    };
    KvCache::new("kv", &ModelConfig::tiny(), params, &|_| true).unwrap()
}

fn recurrent(rs_size: u32) -> RecurrentMemory {
    let params = RecurrentParams {
        rs_size,
        n_seq_max: 8,
        ..RecurrentParams::from_config(&CacheConfig::default())
    };
    RecurrentMemory::new("rs", &ModelConfig::recurrent(2, 4, 8), params, &|_| true).unwrap()
}

fn cell_of(kv: &KvCache, seq: SeqId, pos: Pos) -> Option<u32> {
    kv.cells()
        .used_cells()
        .find(|&i| kv.cells().seq_has(i, seq) && kv.cells().pos_get(i) == pos)
}

fn assert_rows(kv: &KvCache, seq: SeqId, content_seq: SeqId) {
    for i in kv.cells().used_cells().filter(|&i| kv.cells().seq_has(i, seq)) {
        let pos = kv.cells().pos_get(i);
        for il in 0..2 {
            let k = kv.k_row(il, i).unwrap();
            assert_eq!(k, pattern(il, pos, content_seq, k.len()).as_slice());
        }
    }
}

#[test]
fn test_scenario_capacity_then_removal() {
    let mut kv = unified(10);
    assert_eq!(decode(&mut kv, 2, &[0], 10), MemoryStatus::Success);
    assert_eq!(decode(&mut kv, 2, &[0], 1), MemoryStatus::FailedPrepare);
    assert_eq!(kv.used(), 10);

    assert!(kv.seq_rm(0, 0, 5));
    assert_eq!(decode(&mut kv, 2, &[0], 1), MemoryStatus::Success);
    assert_eq!(kv.seq_pos_min(0), 5);
    assert_eq!(kv.seq_pos_max(0), 10);
}

#[test]
fn test_scenario_recurrent_slots() {
    let mut rs = recurrent(4);
    assert_eq!(decode(&mut rs, 2, &[0, 1, 2, 3], 2), MemoryStatus::Success);
    assert_eq!(rs.used(), 4);
    assert_eq!(decode(&mut rs, 2, &[4], 1), MemoryStatus::FailedPrepare);

    assert!(rs.seq_rm(1, -1, -1));
    assert_eq!(decode(&mut rs, 2, &[4], 1), MemoryStatus::Success);
    assert_eq!(rs.used(), 4);
    assert!(rs.used() <= rs.size());
}

#[test]
fn test_scenario_window_cache() {
    let model = ModelConfig::attention(2, 8, 8).with_swa(4, SwaType::Standard, 2);
    let config = CacheConfig {
        kv_size: 100,
        n_pad: 1,
        n_ubatch: 1,
        ..CacheConfig::default()
    };
    let mut mem = KvCacheIswa::new(&model, &config).unwrap();
    for _ in 0..20 {
        assert_eq!(decode(&mut mem, 2, &[0], 1), MemoryStatus::Success);
    }
    assert_eq!(mem.windowed().seq_pos_min(0), 16);
    assert_eq!(mem.windowed().seq_pos_max(0), 19);
    assert_eq!(mem.full().seq_pos_min(0), 0);
    assert_eq!(mem.full().seq_pos_max(0), 19);

    let mut all = BufferWriter::new();
    mem.state_write(&mut all, 0, StateFlags::empty()).unwrap();
    let mut window = BufferWriter::new();
    mem.state_write(&mut window, 0, StateFlags::SWA_ONLY).unwrap();
    assert!(window.as_bytes().len() < all.as_bytes().len());
}

#[test]
fn test_range_removal_idempotent() {
    let mut kv = unified(16);
    decode(&mut kv, 2, &[0], 8);
    assert!(kv.seq_rm(0, 2, 5));
    let (used, min, max) = (kv.used(), kv.seq_pos_min(0), kv.seq_pos_max(0));
    assert!(kv.seq_rm(0, 2, 5));
    assert_eq!((kv.used(), kv.seq_pos_min(0), kv.seq_pos_max(0)), (used, min, max));
}

#[test]
fn test_unwritten_sequence_bounds() {
    let kv = unified(4);
    let rs = recurrent(2);
    for seq in [0, 7, 63] {
        assert_eq!((kv.seq_pos_min(seq), kv.seq_pos_max(seq)), (-1, -1));
        assert_eq!((rs.seq_pos_min(seq), rs.seq_pos_max(seq)), (-1, -1));
    }
}

#[test]
fn test_copy_then_keep_moves_content() {
    let mut kv = unified(16);
    decode(&mut kv, 2, &[0], 5);
    kv.seq_cp(0, 1, -1, -1);
    kv.seq_keep(1);

    assert_eq!(kv.seq_pos_max(0), -1);
    assert_eq!(kv.seq_pos_min(1), 0);
    assert_eq!(kv.seq_pos_max(1), 4);
    assert_eq!(kv.used(), 5);
    assert_rows(&kv, 1, 0);
}

#[test]
fn test_empty_range_shift_is_noop() {
    let mut kv = unified(8);
    decode(&mut kv, 2, &[0], 4);
    kv.seq_add(0, 2, 2, 5);
    kv.seq_div(0, 2, 2, 2);
    assert_eq!(kv.seq_pos_max(0), 3);
    assert!(!kv.cells().has_shift());
    assert_eq!(kv.init_update(false).status(), MemoryStatus::NoUpdate);
}

#[test]
fn test_prepare_without_apply_is_invisible() {
    let mut kv = unified(8);
    decode(&mut kv, 2, &[0], 3);
    let before = (kv.used(), kv.head(), kv.seq_pos_max(0));
    {
        let mut balloc = allocator(&kv, &[0], 4);
        let ctx = kv.init_batch(&mut balloc, 2, false);
        assert_eq!(ctx.status(), MemoryStatus::Success);
    }
    assert_eq!((kv.used(), kv.head(), kv.seq_pos_max(0)), before);
}

#[test]
fn test_rollback_restores_attention_cache() {
    let mut kv = unified(8);
    decode(&mut kv, 2, &[0], 3);
    let before = (kv.used(), kv.head(), kv.seq_pos_max(0));
    {
        let mut balloc = allocator(&kv, &[0], 4);
        let mut ctx = kv.init_batch(&mut balloc, 2, false);
        assert!(ctx.apply());
        write_rows(&mut *ctx, 2);
        assert!(ctx.next());
        assert!(ctx.apply());
        ctx.rollback();
        assert_eq!(ctx.status(), MemoryStatus::FailedCompute);
        assert!(!ctx.apply());
    }
    assert_eq!((kv.used(), kv.head(), kv.seq_pos_max(0)), before);
    assert_rows(&kv, 0, 0);
}

#[test]
fn test_rollback_restores_reused_window_cell() {
    let params = KvCacheParams {
        kv_size: 2,
        n_pad: 1,
        ..KvCacheParams::from_config(&CacheConfig::default())
    }
    .with_swa(2, SwaType::Standard);
    let mut kv = KvCache::new("swa", &ModelConfig::tiny(), params, &|_| true).unwrap();
    decode(&mut kv, 2, &[0], 1);
    decode(&mut kv, 2, &[0], 1);
    let reused = cell_of(&kv, 0, 0).unwrap();

    {
        let mut balloc = allocator(&kv, &[0], 1);
        let mut ctx = kv.init_batch(&mut balloc, 1, false);
        assert_eq!(ctx.status(), MemoryStatus::Success);
        assert_eq!(ctx.slots(0), Some(vec![reused]));
        assert!(ctx.apply());
        write_rows(&mut *ctx, 2);
        ctx.rollback();
    }

    assert_eq!(cell_of(&kv, 0, 0), Some(reused));
    assert_eq!(kv.seq_pos_max(0), 1);
    assert_rows(&kv, 0, 0);
}

#[test]
fn test_rollback_restores_recurrent_state() {
    let mut rs = recurrent(3);
    decode(&mut rs, 2, &[0], 4);
    rs.seq_cp(0, 1, -1, -1);
    let shared = rs.slot_of(0).unwrap();
    let r_before = rs.r_row(0, shared).unwrap().to_vec();

    {
        let mut balloc = allocator(&rs, &[1], 1);
        let mut ctx = rs.init_batch(&mut balloc, 8, false);
        assert!(ctx.apply());
        write_rows(&mut *ctx, 2);
        ctx.rollback();
    }

    assert_eq!(rs.used(), 1);
    assert_eq!(rs.slot_of(1), Some(shared));
    assert_eq!(rs.seq_pos_max(1), 3);
    assert_eq!(rs.r_row(0, shared).unwrap(), r_before.as_slice());
}

#[test]
fn test_recurrent_divergence_copies_state() {
    let mut rs = recurrent(3);
    decode(&mut rs, 2, &[0], 4);
    rs.seq_cp(0, 1, -1, -1);
    let src = rs.slot_of(0).unwrap();
    let src_row = rs.s_row(1, src).unwrap().to_vec();

    let mut balloc = allocator(&rs, &[1], 1);
    let mut ctx = rs.init_batch(&mut balloc, 8, false);
    assert!(ctx.apply());
    drop(ctx);

    let dst = rs.slot_of(1).unwrap();
    assert_ne!(dst, src);
    assert_eq!(rs.slot_src0(dst), src as i32);
    assert_eq!(rs.s_row(1, dst).unwrap(), src_row.as_slice());
}

#[test]
fn test_defrag_preserves_rows() {
    let mut kv = unified(12);
    decode(&mut kv, 2, &[0, 1], 4);
    kv.seq_rm(0, 1, 3);
    kv.seq_rm(1, 0, 2);
    assert!(kv.fragmentation() > 0.0);

    let mut live: Vec<(SeqId, Pos)> = Vec::new();
    for i in kv.cells().used_cells() {
        let seq = kv.cells().seq_get(i).unwrap();
        live.push((seq, kv.cells().pos_get(i)));
    }

    {
        let mut ctx = kv.init_update(true);
        assert_eq!(ctx.status(), MemoryStatus::Success);
        assert!(ctx.apply());
    }

    assert_eq!(kv.cells().used_max_p1(), kv.used());
    for (seq, pos) in live {
        let cell = cell_of(&kv, seq, pos).unwrap();
        for il in 0..2 {
            let k = kv.k_row(il, cell).unwrap();
            assert_eq!(k, pattern(il, pos, seq, k.len()).as_slice());
            let v = kv.v_row(il, cell).unwrap();
            assert_eq!(v, pattern(il + 100, pos, seq, v.len()).as_slice());
        }
    }
}

#[test]
fn test_k_shift_reported_and_cleared() {
    let mut kv = unified(8);
    decode(&mut kv, 2, &[0], 4);
    kv.seq_add(0, 2, -1, 3);
    assert_eq!(kv.seq_pos_max(0), 6);

    {
        let mut ctx = kv.init_update(false);
        assert_eq!(ctx.status(), MemoryStatus::Success);
        let shifts = ctx.k_shift(0).unwrap();
        let moved: Vec<Pos> = shifts.iter().copied().filter(|&d| d != 0).collect();
        assert_eq!(moved, vec![3, 3]);
        assert!(ctx.apply());
    }

    assert!(!kv.cells().has_shift());
    assert_eq!(kv.init_update(false).status(), MemoryStatus::NoUpdate);
}

#[test]
fn test_sequence_state_roundtrip() {
    let mut kv = unified(16);
    decode(&mut kv, 2, &[0, 1], 5);
    let mut out = BufferWriter::new();
    kv.state_write(&mut out, 1, StateFlags::empty()).unwrap();

    let mut fresh = unified(16);
    let mut reader = SliceReader::new(out.as_bytes());
    fresh.state_read(&mut reader, 1, StateFlags::empty()).unwrap();
    assert_eq!(reader.remaining(), 0);

    assert_eq!(fresh.used(), 5);
    assert_eq!(fresh.seq_pos_min(1), 0);
    assert_eq!(fresh.seq_pos_max(1), 4);
    assert_eq!(fresh.seq_pos_max(0), -1);
    assert_rows(&fresh, 1, 1);
}

#[test]
fn test_recurrent_state_roundtrip() {
    let mut rs = recurrent(4);
    decode(&mut rs, 2, &[0, 2], 3);
    let mut out = BufferWriter::new();
    rs.state_write(&mut out, 2, StateFlags::empty()).unwrap();

    let mut fresh = recurrent(4);
    fresh
        .state_read(&mut SliceReader::new(out.as_bytes()), 2, StateFlags::empty())
        .unwrap();
    assert_eq!(fresh.seq_pos_min(2), 0);
    assert_eq!(fresh.seq_pos_max(2), 2);

    let (a, b) = (rs.slot_of(2).unwrap(), fresh.slot_of(2).unwrap());
    for il in 0..2 {
        assert_eq!(rs.r_row(il, a), fresh.r_row(il, b));
        assert_eq!(rs.s_row(il, a), fresh.s_row(il, b));
    }
}

#[test]
fn test_whole_cache_state_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.state");

    let mut kv = unified(16);
    decode(&mut kv, 2, &[0, 1], 4);
    kv.seq_cp(0, 2, -1, -1);
    let mut out = FileWriter::create(&path).unwrap();
    kv.state_write(&mut out, SEQ_ID_ALL, StateFlags::empty())
        .unwrap();
    let written = out.finish().unwrap();
    assert_eq!(written as u64, std::fs::metadata(&path).unwrap().len());

    let mut fresh = unified(16);
    let mut input = FileReader::open(&path).unwrap();
    fresh
        .state_read(&mut input, SEQ_ID_ALL, StateFlags::empty())
        .unwrap();
    assert_eq!(fresh.used(), 8);
    for seq in 0..3 {
        assert_eq!(fresh.seq_pos_min(seq), 0);
        assert_eq!(fresh.seq_pos_max(seq), 3);
    }
    assert_rows(&fresh, 0, 0);
    assert_rows(&fresh, 1, 1);
    assert_rows(&fresh, 2, 0);
}

#[test]
fn test_truncated_restore_leaves_cache_untouched() {
    let mut source = unified(16);
    decode(&mut source, 2, &[0], 6);
    let mut out = BufferWriter::new();
    source.state_write(&mut out, 0, StateFlags::empty()).unwrap();
    let bytes = out.into_inner();

    let mut kv = unified(16);
    decode(&mut kv, 2, &[1], 3);
    let err = kv
        .state_read(
            &mut SliceReader::new(&bytes[..bytes.len() - 3]),
            0,
            StateFlags::empty(),
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::StateFormat(_)));
    assert_eq!(kv.used(), 3);
    assert_eq!(kv.seq_pos_max(0), -1);
    assert_eq!(kv.seq_pos_max(1), 2);
    assert_rows(&kv, 1, 1);
}

#[test]
fn test_restore_into_mismatched_cache_fails() {
    let mut kv = unified(8);
    decode(&mut kv, 2, &[0], 2);
    let mut out = BufferWriter::new();
    kv.state_write(&mut out, -1, StateFlags::empty()).unwrap();

    let params = KvCacheParams {
        kv_size: 8,
        n_pad: 1,
        ..KvCacheParams::from_config(&CacheConfig::default())
    };
    let wide = ModelConfig::attention(2, 16, 16);
    let mut other = KvCache::new("kv", &wide, params, &|_| true).unwrap();
    assert!(
        other
            .state_read(&mut SliceReader::new(out.as_bytes()), -1, StateFlags::empty())
            .is_err()
    );
    assert_eq!(other.used(), 0);
}

#[test]
fn test_hybrid_lockstep_bounds() {
    let model = ModelConfig::attention(4, 8, 8).with_recurrent_layers(4, 8, |il| il % 2 == 1);
    let config = CacheConfig {
        kv_size: 32,
        n_seq_max: 4,
        n_pad: 1,
        ..CacheConfig::default()
    };
    let mut mem = HybridMemory::new(&model, &config).unwrap();
    decode(&mut mem, 4, &[0, 1], 4);

    let agree = |mem: &HybridMemory, seq: SeqId| {
        mem.attn().seq_pos_min(seq) == mem.recr().seq_pos_min(seq)
            && mem.attn().seq_pos_max(seq) == mem.recr().seq_pos_max(seq)
    };

    assert!(!mem.seq_rm(0, 2, -1));
    mem.seq_cp(0, 2, -1, -1);
    assert!(mem.seq_rm(1, -1, -1));
    for seq in 0..4 {
        assert!(agree(&mem, seq), "bounds diverged for sequence {seq}");
    }
    assert_eq!(mem.seq_pos_max(2), 3);
    assert_eq!(mem.seq_pos_max(1), -1);
}
