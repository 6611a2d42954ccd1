//! Simulate command implementation.

use anyhow::{Context, Result, bail};
use runtime::{CacheMetrics, DecodeSession};
use seqcache_core::{Batch, MemoryStatus, Pos, SeqId, Token};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::KindArg;

/// Options for the simulate command.
#[derive(Debug)]
pub struct SimulateOptions {
    pub config: Option<PathBuf>,
    pub kind: Option<KindArg>,
    pub seqs: u32,
    pub prompt: u32,
    pub steps: u32,
    pub save: Option<PathBuf>,
    pub resume: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

/// Totals collected while simulating.
#[derive(Debug, Default)]
pub struct SimulateReport {
    pub batches: usize,
    pub ubatches: usize,
    pub failed_prepare: usize,
    pub failed_compute: usize,
    pub updates: usize,
    pub latencies_ms: Vec<f64>,
}

/// Token id for position `pos` of `seq`, stable across runs.
fn token_at(seq: SeqId, pos: Pos) -> Token {
    (seq as u32).wrapping_mul(10_007).wrapping_add(pos as u32) % 32_000
}

/// Prompt batch holding `n` tokens for each of `seqs` sequences.
fn prompt_batch(session: &DecodeSession, seqs: u32, n: u32) -> Batch {
    let mut batch = Batch::new();
    for seq in 0..seqs as SeqId {
        let start = session.seq_pos_max(seq) + 1;
        for i in 0..n as Pos {
            let pos = start + i;
            batch.add(token_at(seq, pos), pos, &[seq], i == n as Pos - 1);
        }
    }
    batch
}

/// One token per sequence.
fn step_batch(session: &DecodeSession, seqs: u32) -> Batch {
    let mut batch = Batch::new();
    for seq in 0..seqs as SeqId {
        let pos = session.seq_pos_max(seq) + 1;
        batch.add(token_at(seq, pos), pos, &[seq], true);
    }
    batch
}

/// Decode `batch`, defragmenting once and retrying when it does not fit.
fn decode_with_retry(
    session: &mut DecodeSession,
    batch: &Batch,
    report: &mut SimulateReport,
) -> Result<bool> {
    for attempt in 0..2 {
        let start = Instant::now();
        let outcome = session.decode(batch).context("batch rejected")?;
        report.latencies_ms.push(start.elapsed().as_secs_f64() * 1000.0);
        match outcome.status {
            MemoryStatus::Success => {
                report.batches += 1;
                report.ubatches += outcome.n_ubatches;
                return Ok(true);
            }
            MemoryStatus::FailedCompute => {
                report.failed_compute += 1;
                return Ok(false);
            }
            _ => {
                report.failed_prepare += 1;
                if attempt == 0 && session.update(true)? {
                    report.updates += 1;
                    continue;
                }
                return Ok(false);
            }
        }
    }
    Ok(false)
}

/// Run the simulation and return its report.
pub fn simulate(options: &SimulateOptions) -> Result<(DecodeSession, SimulateReport)> {
    let config = super::config::load(options.config.as_deref(), options.kind)?;
    if options.seqs == 0 || options.seqs > config.cache.n_seq_max {
        bail!(
            "--seqs must be in 1..={}, got {}",
            config.cache.n_seq_max,
            options.seqs
        );
    }

    let mut session = DecodeSession::new_mock(&config).context("failed to build memory")?;
    let port = options
        .metrics_port
        .or(config.runtime.metrics.enabled.then_some(config.runtime.metrics.port));
    if let Some(port) = port {
        let metrics = CacheMetrics::init(port).context("failed to start metrics exporter")?;
        info!(port, "metrics exporter listening");
        session = session.with_metrics(metrics);
    }

    if let Some(path) = &options.resume {
        session
            .load_session(path)
            .with_context(|| format!("failed to resume from {}", path.display()))?;
    }

    let mut report = SimulateReport::default();
    if options.prompt > 0 {
        let batch = prompt_batch(&session, options.seqs, options.prompt);
        if !decode_with_retry(&mut session, &batch, &mut report)? {
            warn!("prompt did not fit");
        }
    }
    for step in 0..options.steps {
        let batch = step_batch(&session, options.seqs);
        if !decode_with_retry(&mut session, &batch, &mut report)? {
            warn!(step, "memory full, stopping");
            break;
        }
    }

    if let Some(path) = &options.save {
        let bytes = session
            .save_session(path)
            .with_context(|| format!("failed to save session to {}", path.display()))?;
        info!(bytes, path = %path.display(), "session saved");
    }

    Ok((session, report))
}

/// Run the simulate command.
pub fn run(options: SimulateOptions) -> Result<()> {
    let (session, report) = simulate(&options)?;
    let memory = session.memory();

    println!("Memory: {}", memory.name());
    println!(
        "  Occupancy: {}/{} ({:.1}%)",
        memory.used(),
        memory.size(),
        100.0 * memory.used() as f64 / memory.size().max(1) as f64
    );
    println!("  Tokens decoded: {}", session.tokens().len());
    println!();
    println!("Batches:");
    println!("  Applied: {} ({} micro-batches)", report.batches, report.ubatches);
    println!("  Failed prepare: {}", report.failed_prepare);
    println!("  Failed compute: {}", report.failed_compute);
    println!("  Maintenance passes: {}", report.updates);
    if !report.latencies_ms.is_empty() {
        let avg = report.latencies_ms.iter().sum::<f64>() / report.latencies_ms.len() as f64;
        println!("  Avg: {avg:.3} ms");
        println!("  P95: {:.3} ms", percentile(&report.latencies_ms, 95));
    }
    println!();
    println!("Sequences:");
    for seq in 0..options.seqs as SeqId {
        println!(
            "  {seq}: positions {}..={}",
            session.seq_pos_min(seq),
            session.seq_pos_max(seq)
        );
    }

    Ok(())
}

/// Calculate the p-th percentile of a slice.
fn percentile(values: &[f64], p: usize) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
