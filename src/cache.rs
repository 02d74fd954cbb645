//! Per-project definition cache.
//!
//! Snapshots are keyed `project:<id>` and expire after the configured TTL.
//! Route patterns are compiled once when a snapshot is loaded.
//! Invalidation is synchronous: once `invalidate` returns, no later `load`
//! observes the dropped snapshot.

use crate::error::MockResult;
use crate::matcher::{compile_all, CompiledDefinition};
use crate::repository::DefinitionRepository;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared snapshot of a project's definitions, in stored order.
pub type DefinitionSnapshot = Arc<Vec<CompiledDefinition>>;

/// Cache key for a project.
pub fn cache_key(project_id: &str) -> String {
    format!("project:{}", project_id)
}

/// Definition cache sitting in front of the repository.
pub struct DefinitionCache {
    snapshots: Cache<String, DefinitionSnapshot>,
    /// Bumped on every invalidation; a load only populates if its generation
    /// is still current.
    generations: Mutex<HashMap<String, u64>>,
    repository: Arc<dyn DefinitionRepository>,
}

impl DefinitionCache {
    /// Create a cache with the given TTL and capacity (in projects).
    pub fn new(repository: Arc<dyn DefinitionRepository>, ttl: Duration, max_projects: u64) -> Self {
        Self {
            snapshots: Cache::builder()
                .max_capacity(max_projects)
                .time_to_live(ttl)
                .build(),
            generations: Mutex::new(HashMap::new()),
            repository,
        }
    }

    /// The repository backing this cache.
    pub fn repository(&self) -> &Arc<dyn DefinitionRepository> {
        &self.repository
    }

    /// Load a project's definitions, reading through to the repository on a miss.
    ///
    /// Empty results are returned but never cached.
    pub async fn load(&self, project_id: &str) -> MockResult<DefinitionSnapshot> {
        let key = cache_key(project_id);

        if let Some(snapshot) = self.snapshots.get(&key) {
            debug!(project_id = %project_id, "Definition cache hit");
            return Ok(snapshot);
        }

        let generation = self.generation(&key);
        debug!(project_id = %project_id, "Definition cache miss");

        let definitions = self.repository.find_by_project(project_id).await?;
        let snapshot: DefinitionSnapshot = Arc::new(compile_all(definitions));

        if !snapshot.is_empty() {
            let generations = self.generations.lock();
            if generations.get(&key).copied().unwrap_or(0) == generation {
                self.snapshots.insert(key, snapshot.clone());
            } else {
                debug!(project_id = %project_id, "Invalidated during load, not caching");
            }
        }

        Ok(snapshot)
    }

    /// Drop a project's snapshot.
    pub fn invalidate(&self, project_id: &str) {
        let key = cache_key(project_id);
        let mut generations = self.generations.lock();
        *generations.entry(key.clone()).or_insert(0) += 1;
        self.snapshots.invalidate(&key);
        debug!(project_id = %project_id, "Definition cache invalidated");
    }

    fn generation(&self, key: &str) -> u64 {
        self.generations.lock().get(key).copied().unwrap_or(0)
    }
}
