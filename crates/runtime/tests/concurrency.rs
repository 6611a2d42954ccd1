//! Independent memories used from many threads.

use std::thread;

use runtime::DecodeSession;
use seqcache_core::{
    Batch, CacheConfig, CacheKind, ModelConfig, Pos, RuntimeConfig, SeqId, SeqcacheConfig,
    StateFlags, Token,
};

fn config(kind: CacheKind) -> SeqcacheConfig {
    let model = match kind {
        CacheKind::Recurrent => ModelConfig::recurrent(2, 4, 4),
        CacheKind::Hybrid => {
            ModelConfig::attention(2, 8, 8).with_recurrent_layers(4, 4, |il| il == 0)
        }
        _ => ModelConfig::tiny(),
    };
    SeqcacheConfig {
        model,
        cache: CacheConfig {
            kind,
            kv_size: 128,
            n_pad: 8,
            n_seq_max: 4,
            n_ubatch: 16,
            ..CacheConfig::default()
        },
        runtime: RuntimeConfig::default(),
    }
}

fn run(seq: SeqId, start: Pos, n: Pos) -> Batch {
    let mut batch = Batch::new();
    for p in start..start + n {
        batch.add(p as Token, p, &[seq], p == start + n - 1);
    }
    batch
}

#[test]
fn test_sessions_on_separate_threads() {
    let handles: Vec<_> = [CacheKind::Unified, CacheKind::Recurrent, CacheKind::Hybrid]
        .into_iter()
        .cycle()
        .take(8)
        .map(|kind| {
            thread::spawn(move || {
                let mut session = DecodeSession::new_mock(&config(kind)).unwrap();
                session.decode(&run(0, 0, 10)).unwrap();
                for p in 10..40 {
                    assert!(session.decode(&run(0, p, 1)).unwrap().is_success());
                }
                (session.seq_pos_max(0), session.seq_state(0, StateFlags::empty()).unwrap())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (i, (pos_max, _)) in results.iter().enumerate() {
        assert_eq!(*pos_max, 39, "thread {i}");
    }
    // Same kind, same inputs, same bytes.
    assert_eq!(results[0].1, results[3].1);
    assert_eq!(results[1].1, results[4].1);
}

#[test]
fn test_create_and_destroy_many() {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                for round in 0..25 {
                    let mut session = DecodeSession::new_mock(&config(CacheKind::Unified)).unwrap();
                    session.decode(&run(round % 4, 0, 4)).unwrap();
                    assert_eq!(session.memory().used(), 4);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_sequence_edit_storm_keeps_bounds_consistent() {
    let mut session = DecodeSession::new_mock(&config(CacheKind::Unified)).unwrap();
    session.decode(&run(0, 0, 16)).unwrap();

    for i in 0..200 {
        let dst = 1 + (i % 3);
        session.seq_cp(0, dst, -1, -1);
        assert_eq!(session.seq_pos_max(dst), 15);
        session.seq_rm(dst, 8, -1);
        assert_eq!(session.seq_pos_max(dst), 7);
        session.seq_rm(dst, -1, -1);
        assert_eq!(session.seq_pos_max(dst), -1);
    }
    assert_eq!(session.memory().used(), 16);
    assert_eq!(session.seq_pos_min(0), 0);
    assert_eq!(session.seq_pos_max(0), 15);
}

#[tokio::test]
async fn test_sessions_in_blocking_tasks() {
    let mut tasks = Vec::new();
    for seq in 0..4 {
        tasks.push(tokio::task::spawn_blocking(move || {
            let mut session = DecodeSession::new_mock(&config(CacheKind::Unified)).unwrap();
            session.decode(&run(seq, 0, 32)).unwrap();
            session.seq_pos_max(seq)
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 31);
    }
}

#[tokio::test]
async fn test_session_moves_between_tasks() {
    let mut session = DecodeSession::new_mock(&config(CacheKind::Hybrid)).unwrap();
    session.decode(&run(0, 0, 8)).unwrap();

    let mut session = tokio::task::spawn_blocking(move || {
        session.decode(&run(0, 8, 1)).unwrap();
        session
    })
    .await
    .unwrap();

    assert!(session.decode(&run(0, 9, 1)).unwrap().is_success());
    assert_eq!(session.seq_pos_max(0), 9);
}
