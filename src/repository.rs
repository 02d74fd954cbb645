//! Definition repository.
//!
//! The repository is the system of record for projects and their mock
//! definitions. Definitions are always returned joined with their current
//! project.

use crate::error::{MockError, MockResult};
use crate::model::{HttpMethod, MockDefinition, ParamSchema, Project};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Validated fields for a definition write.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionFields {
    pub url: String,
    pub method: HttpMethod,
    pub mode: String,
    pub params: ParamSchema,
    pub description: String,
}

/// Storage for projects and mock definitions.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// All definitions of a project, in stored order.
    async fn find_by_project(&self, project_id: &str) -> MockResult<Vec<MockDefinition>>;

    async fn find_by_id(&self, id: &str) -> MockResult<Option<MockDefinition>>;

    async fn find_project(&self, project_id: &str) -> MockResult<Option<Project>>;

    /// Insert a definition. Fails with `Conflict` if the (project, url, method)
    /// triple is taken.
    async fn create(&self, project_id: &str, fields: DefinitionFields) -> MockResult<MockDefinition>;

    /// Replace a definition's fields. Fails with `Conflict` if another
    /// definition of the project holds the same triple.
    async fn update(&self, id: &str, fields: DefinitionFields) -> MockResult<MockDefinition>;

    /// Delete the given definitions of a project, returning how many were removed.
    async fn delete(&self, project_id: &str, ids: &[String]) -> MockResult<usize>;
}

#[derive(Default)]
struct MemoryState {
    projects: HashMap<String, Project>,
    definitions: Vec<MockDefinition>,
}

impl MemoryState {
    fn joined(&self, definition: &MockDefinition) -> MockDefinition {
        let mut definition = definition.clone();
        if let Some(project) = self.projects.get(&definition.project.id) {
            definition.project = project.clone();
        }
        definition
    }

    fn has_triple(&self, project_id: &str, fields: &DefinitionFields, except: Option<&str>) -> bool {
        self.definitions.iter().any(|d| {
            d.project.id == project_id
                && d.url == fields.url
                && d.method == fields.method
                && Some(d.id.as_str()) != except
        })
    }
}

/// In-memory repository, seeded from configuration.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a project.
    pub async fn upsert_project(&self, project: Project) {
        let mut state = self.state.write().await;
        state.projects.insert(project.id.clone(), project);
    }
}

#[async_trait]
impl DefinitionRepository for MemoryRepository {
    async fn find_by_project(&self, project_id: &str) -> MockResult<Vec<MockDefinition>> {
        let state = self.state.read().await;
        Ok(state
            .definitions
            .iter()
            .filter(|d| d.project.id == project_id)
            .map(|d| state.joined(d))
            .collect())
    }

    async fn find_by_id(&self, id: &str) -> MockResult<Option<MockDefinition>> {
        let state = self.state.read().await;
        Ok(state
            .definitions
            .iter()
            .find(|d| d.id == id)
            .map(|d| state.joined(d)))
    }

    async fn find_project(&self, project_id: &str) -> MockResult<Option<Project>> {
        Ok(self.state.read().await.projects.get(project_id).cloned())
    }

    async fn create(&self, project_id: &str, fields: DefinitionFields) -> MockResult<MockDefinition> {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| MockError::InvalidRequest("project does not exist".to_string()))?;

        if state.has_triple(project_id, &fields, None) {
            return Err(MockError::Conflict);
        }

        let now = Utc::now();
        let definition = MockDefinition {
            id: new_object_id(),
            project,
            url: fields.url,
            method: fields.method,
            mode: fields.mode,
            params: fields.params,
            description: fields.description,
            created_at: now,
            updated_at: now,
        };
        state.definitions.push(definition.clone());
        Ok(definition)
    }

    async fn update(&self, id: &str, fields: DefinitionFields) -> MockResult<MockDefinition> {
        let mut state = self.state.write().await;
        let index = state
            .definitions
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| MockError::InvalidRequest("mock definition does not exist".to_string()))?;

        let project_id = state.definitions[index].project.id.clone();
        if state.has_triple(&project_id, &fields, Some(id)) {
            return Err(MockError::Conflict);
        }

        let definition = &mut state.definitions[index];
        definition.url = fields.url;
        definition.method = fields.method;
        definition.mode = fields.mode;
        definition.params = fields.params;
        definition.description = fields.description;
        definition.updated_at = Utc::now();
        let updated = definition.clone();
        Ok(state.joined(&updated))
    }

    async fn delete(&self, project_id: &str, ids: &[String]) -> MockResult<usize> {
        let mut state = self.state.write().await;
        let before = state.definitions.len();
        state
            .definitions
            .retain(|d| !(d.project.id == project_id && ids.contains(&d.id)));
        Ok(before - state.definitions.len())
    }
}

/// Generate a 24-character hex identifier.
pub fn new_object_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}
