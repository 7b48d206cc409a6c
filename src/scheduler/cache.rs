//! Artifact cache seam. How artifacts are hashed and stored is up to the cache.

use crate::exec::process::ExecutionResult;
use crate::graph::action::Action;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// Consulted before an action runs; a hit means its outputs are already in place.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    async fn lookup(&self, action: &Action) -> anyhow::Result<bool>;

    /// Called after the action succeeded locally.
    async fn store(&self, action: &Action, result: &ExecutionResult) -> anyhow::Result<()>;
}

/// Remembers successful command lines for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryArtifactCache {
    entries: Mutex<HashSet<String>>,
}

impl MemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(action: &Action) -> String {
        format!("{}|{}", action.working_dir.display(), action.command_line())
    }

    /// Pre-populate an entry as if the action had already run.
    pub fn insert(&self, action: &Action) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(Self::key(action));
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactCache for MemoryArtifactCache {
    async fn lookup(&self, action: &Action) -> anyhow::Result<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&Self::key(action)))
    }

    async fn store(&self, action: &Action, _result: &ExecutionResult) -> anyhow::Result<()> {
        self.insert(action);
        Ok(())
    }
}
