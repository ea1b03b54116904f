use super::limiter::LimiterDefinition;
use crate::error::Result;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Destination of the limiter introspection table.
///
/// Each call replaces the whole table in one write; implementations must not
/// hold a storage handle past the call.
#[async_trait]
pub trait IntrospectionSink: Send + Sync {
    async fn write_limiters(&self, rows: &[LimiterDefinition]) -> Result<()>;
}

/// Writes the table as a JSON array next to the daemon state.
pub struct FileIntrospection {
    path: PathBuf,
}

impl FileIntrospection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IntrospectionSink for FileIntrospection {
    async fn write_limiters(&self, rows: &[LimiterDefinition]) -> Result<()> {
        let content = serde_json::to_vec_pretty(rows)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || replace_file(&path, &content))
            .await
            .map_err(std::io::Error::other)??;
        tracing::debug!(path = %self.path.display(), rows = rows.len(), "Wrote limiter table");
        Ok(())
    }
}

/// Write through a uniquely named sibling temp file and rename it over `path`.
fn replace_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.persist(path)?;
    Ok(())
}

/// Keeps the latest table in memory.
#[derive(Default)]
pub struct MemoryIntrospection {
    rows: Mutex<Vec<LimiterDefinition>>,
    writes: Mutex<usize>,
}

impl MemoryIntrospection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<LimiterDefinition> {
        self.rows
            .lock()
            .expect("MemoryIntrospection lock poisoned")
            .clone()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().expect("MemoryIntrospection lock poisoned")
    }
}

#[async_trait]
impl IntrospectionSink for MemoryIntrospection {
    async fn write_limiters(&self, rows: &[LimiterDefinition]) -> Result<()> {
        *self.rows.lock().expect("MemoryIntrospection lock poisoned") = rows.to_vec();
        *self.writes.lock().expect("MemoryIntrospection lock poisoned") += 1;
        Ok(())
    }
}
