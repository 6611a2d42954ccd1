//! Config command implementation and configuration presets.

use anyhow::{Context, Result, bail};
use seqcache_core::{CacheConfig, CacheKind, ModelConfig, SeqcacheConfig, SwaType};
use std::path::Path;

use crate::KindArg;

impl From<KindArg> for CacheKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Unified => CacheKind::Unified,
            KindArg::Recurrent => CacheKind::Recurrent,
            KindArg::Iswa => CacheKind::Iswa,
            KindArg::Hybrid => CacheKind::Hybrid,
        }
    }
}

/// Small model and cache matching `kind`.
pub fn preset(kind: KindArg) -> SeqcacheConfig {
    let attention = ModelConfig::attention(4, 64, 64);
    let model = match kind {
        KindArg::Unified => attention,
        KindArg::Recurrent => ModelConfig::recurrent(4, 48, 256),
        KindArg::Iswa => attention.with_swa(128, SwaType::Standard, 2),
        KindArg::Hybrid => attention.with_recurrent_layers(48, 256, |il| il % 2 == 0),
    };
    SeqcacheConfig {
        model,
        cache: CacheConfig {
            kind: kind.into(),
            kv_size: 1024,
            n_seq_max: 4,
            n_ubatch: 64,
            ..CacheConfig::default()
        },
        runtime: Default::default(),
    }
}

/// Load `path`, or the preset for `kind` (unified by default).
///
/// With both, the kind in the file is replaced; the file's model must suit it.
pub fn load(path: Option<&Path>, kind: Option<KindArg>) -> Result<SeqcacheConfig> {
    match path {
        Some(path) => {
            let mut config = SeqcacheConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            if let Some(kind) = kind {
                config.cache.kind = kind.into();
            }
            Ok(config)
        }
        None => Ok(preset(kind.unwrap_or(KindArg::Unified))),
    }
}

/// Run the config command.
pub fn run(path: Option<&Path>, kind: Option<KindArg>) -> Result<()> {
    let Some(path) = path else {
        let config = preset(kind.unwrap_or(KindArg::Unified));
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    };

    let config = load(Some(path), kind)?;
    let memory = kv_memory::build_memory(&config.cache, &config.model)
        .context("configuration does not describe a buildable cache")?;
    if memory.n_layer_owned() == 0 {
        bail!("cache owns no layers");
    }

    println!("Configuration: {}", path.display());
    println!("  Kind: {:?}", config.cache.kind);
    println!("  Memory: {}", memory.name());
    println!("  Layers: {} of {}", memory.n_layer_owned(), config.model.n_layer);
    println!("  Capacity: {} cells/slots", memory.size());
    println!(
        "  Buffers: {:.2} MiB",
        memory.total_size() as f64 / (1024.0 * 1024.0)
    );
    println!("  Max sequences: {}", config.cache.n_seq_max);
    println!("  Micro-batch: {} tokens", config.cache.n_ubatch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_build() {
        for kind in [
            KindArg::Unified,
            KindArg::Recurrent,
            KindArg::Iswa,
            KindArg::Hybrid,
        ] {
            let config = preset(kind);
            assert_eq!(config.cache.kind, CacheKind::from(kind));
            assert!(kv_memory::build_memory(&config.cache, &config.model).is_ok());
        }
    }

    #[test]
    fn test_load_from_file_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let json = preset(KindArg::Iswa).to_json_pretty().unwrap();
        std::fs::write(&path, json).unwrap();

        let config = load(Some(path.as_path()), None).unwrap();
        assert_eq!(config.cache.kind, CacheKind::Iswa);
        assert!(config.model.has_swa());

        let config = load(Some(path.as_path()), Some(KindArg::Unified)).unwrap();
        assert_eq!(config.cache.kind, CacheKind::Unified);
        assert!(run(Some(path.as_path()), None).is_ok());
        assert!(run(Some(path.as_path()), Some(KindArg::Unified)).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load(Some(Path::new("/nonexistent/cache.json")), None).is_err());
    }
}
