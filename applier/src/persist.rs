//! Rule set persistence
//!
//! Writes the live filter table in iptables-save format so the platform's
//! restore-on-boot mechanism can reload it. Off unless asked for.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::control::{FirewallControl, FILTER};

/// Capture the live filter table and write it to `path`, replacing any
/// previous file in a single rename
pub fn save_rules<C: FirewallControl + ?Sized>(control: &mut C, path: &Path) -> Result<()> {
    let dump = control
        .save(FILTER)
        .context("Failed to capture the active rule set")?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Persistence path {} has no file name", path.display()))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let tmp = parent.join(format!(".{}.dbguard-tmp", file_name.to_string_lossy()));
    let content = format!(
        "# Saved by dbguard v{} at {}\n{}",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now().to_rfc3339(),
        dump
    );
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move rule set into {}", path.display()))?;

    info!("Rule set saved to {}", path.display());
    Ok(())
}
