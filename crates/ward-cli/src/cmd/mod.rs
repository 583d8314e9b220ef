pub mod audit;
pub mod config;
pub mod plan;
pub mod snapshot;

use anyhow::Context;
use std::path::Path;
use ward_core::config::WardConfig;

/// The config at `path`, or the defaults when none was given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<WardConfig> {
    match path {
        Some(p) => WardConfig::load(p)
            .with_context(|| format!("failed to load config from {}", p.display())),
        None => Ok(WardConfig::default()),
    }
}
