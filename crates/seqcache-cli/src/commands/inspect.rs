//! Inspect command implementation.

use anyhow::{Context, Result, bail};
use runtime::{DecodeSession, SESSION_MAGIC, SESSION_VERSION};
use seqcache_core::{FileReader, SeqId, StateRead};
use std::path::Path;

/// Fixed part of a session file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub version: u32,
    pub n_tokens: u32,
    /// Tag of the first memory section.
    pub first_section: String,
    /// Cell or slot count of the first memory section.
    pub first_count: u32,
}

/// Read the header and the start of the memory state of `path`.
pub fn read_header(path: &Path) -> Result<SessionHeader> {
    let mut input = FileReader::open(path)?;
    let magic = input.read_string()?;
    if magic != SESSION_MAGIC {
        bail!("{} is not a session file", path.display());
    }
    let version = input.read_u32()?;
    if version != SESSION_VERSION {
        bail!("unsupported session version {version}");
    }
    let n_tokens = input.read_u32()?;
    for _ in 0..n_tokens {
        input.read_u32()?;
    }
    let first_section = input.read_string()?;
    let first_count = input.read_u32()?;
    Ok(SessionHeader {
        version,
        n_tokens,
        first_section,
        first_count,
    })
}

/// Run the inspect command.
pub fn run(path: &Path, config: Option<&Path>) -> Result<()> {
    let header = read_header(path)?;
    let file_size = std::fs::metadata(path)?.len();

    println!("Session: {}", path.display());
    println!("  Version: {}", header.version);
    println!("  Size: {file_size} bytes");
    println!("  Tokens: {}", header.n_tokens);
    println!(
        "  First section: {} ({} entries)",
        header.first_section, header.first_count
    );

    let Some(config) = config else {
        return Ok(());
    };
    let config = super::config::load(Some(config), None)?;
    let mut session = DecodeSession::new_mock(&config).context("failed to build memory")?;
    session
        .load_session(path)
        .context("session does not match the configuration")?;

    let memory = session.memory();
    println!();
    println!("Memory: {}", memory.name());
    println!("  Occupancy: {}/{}", memory.used(), memory.size());
    println!("Sequences:");
    for seq in 0..config.cache.n_seq_max as SeqId {
        let (p0, p1) = (session.seq_pos_min(seq), session.seq_pos_max(seq));
        if p1 >= 0 {
            println!("  {seq}: positions {p0}..={p1}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KindArg;
    use crate::commands::simulate::{SimulateOptions, simulate};

    #[test]
    fn test_header_of_simulated_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.session");
        let options = SimulateOptions {
            config: None,
            kind: Some(KindArg::Recurrent),
            seqs: 3,
            prompt: 4,
            steps: 2,
            save: Some(path.clone()),
            resume: None,
            metrics_port: None,
        };
        simulate(&options).unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.version, SESSION_VERSION);
        assert_eq!(header.n_tokens, 18);
        assert_eq!(header.first_section, kv_memory::RS_STATE_TAG);
        assert_eq!(header.first_count, 3);
    }

    #[test]
    fn test_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{}").unwrap();
        assert!(read_header(&path).is_err());
    }
}
