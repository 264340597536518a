//! Line-oriented input files: keyword lists and API key files

use std::collections::HashSet;
use std::path::Path;

use credential_pool::Pool;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Non-empty lines with surrounding whitespace trimmed. `#` lines are comments.
pub fn parse_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub async fn read_lines(path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::Input {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_lines(&contents))
}

/// Add every key from `path` that the pool doesn't know yet.
///
/// Returns how many keys were added.
pub async fn import_keys(pool: &Pool, path: &Path, quota: u64) -> Result<usize> {
    let keys = read_lines(path).await?;
    let known: HashSet<String> = pool.snapshot().await.into_iter().map(|c| c.id).collect();

    let mut added = 0usize;
    for key in keys {
        if known.contains(&key) {
            continue;
        }
        match pool.add_credential(&key, None, quota).await {
            Ok(()) => added += 1,
            Err(credential_pool::Error::Duplicate(id)) => {
                warn!(credential = %id, "duplicate key in keys file");
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(path = %path.display(), added, "imported API keys");
    Ok(added)
}
