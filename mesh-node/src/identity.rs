//! Persisted self identifier: `<data_dir>/identity`, created once and reused.

use std::path::Path;

use anyhow::Context;
use mesh_core::PeerId;

const FILE: &str = "identity";

/// Load the stored identity, creating and persisting a fresh one on first run.
pub fn load_or_create(data_dir: &Path) -> anyhow::Result<PeerId> {
    let path = data_dir.join(FILE);
    match std::fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() && !PeerId::from(s.trim()).is_hub() => Ok(PeerId::from(s.trim())),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "stored identity unusable, regenerating");
            create(data_dir)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => create(data_dir),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn create(data_dir: &Path) -> anyhow::Result<PeerId> {
    let id = PeerId::generate();
    persist(data_dir, &id)?;
    tracing::info!(%id, "created identity");
    Ok(id)
}

/// Overwrite the stored identity (after a conflict forced a new one).
pub fn persist(data_dir: &Path, id: &PeerId) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let path = data_dir.join(FILE);
    std::fs::write(&path, id.as_str()).with_context(|| format!("writing {}", path.display()))
}
