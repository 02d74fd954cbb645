//! Definition authoring.
//!
//! Every successful mutation invalidates the project's cached snapshot before
//! returning, so the next dispatch sees it.

use crate::cache::DefinitionCache;
use crate::error::{MockError, MockResult};
use crate::matcher::PathTemplate;
use crate::model::{HttpMethod, MockDefinition, NewDefinition, Project};
use crate::repository::{DefinitionFields, DefinitionRepository};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Page size used when a listing does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 30;

/// Listing filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// Regex matched against url, description, method, mode and params
    pub keywords: Option<String>,
    pub page_size: Option<usize>,
    pub page_index: Option<usize>,
}

/// A project with its definitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MockList {
    pub project: Option<Project>,
    pub mocks: Vec<MockDefinition>,
}

/// Create, update, delete and list definitions.
pub struct DefinitionStore {
    repository: Arc<dyn DefinitionRepository>,
    cache: Arc<DefinitionCache>,
}

impl DefinitionStore {
    pub fn new(cache: Arc<DefinitionCache>) -> Self {
        Self {
            repository: cache.repository().clone(),
            cache,
        }
    }

    pub async fn create(&self, project_id: &str, new: NewDefinition) -> MockResult<MockDefinition> {
        if project_id.is_empty() {
            return Err(MockError::InvalidRequest("project_id cannot be empty".to_string()));
        }
        let fields = validate_fields(new)?;
        let definition = self.repository.create(project_id, fields).await?;
        self.cache.invalidate(project_id);
        info!(
            project_id = %project_id,
            definition_id = %definition.id,
            method = %definition.method,
            url = %definition.url,
            "Mock definition created"
        );
        Ok(definition)
    }

    pub async fn update(&self, id: &str, new: NewDefinition) -> MockResult<MockDefinition> {
        let fields = validate_fields(new)?;
        let definition = self.repository.update(id, fields).await?;
        self.cache.invalidate(&definition.project.id);
        info!(
            project_id = %definition.project.id,
            definition_id = %definition.id,
            "Mock definition updated"
        );
        Ok(definition)
    }

    /// Delete definitions of a project. Ids belonging to other projects are ignored.
    pub async fn delete(&self, project_id: &str, ids: &[String]) -> MockResult<usize> {
        if project_id.is_empty() {
            return Err(MockError::InvalidRequest("project_id cannot be empty".to_string()));
        }
        if ids.is_empty() {
            return Err(MockError::InvalidRequest("ids cannot be empty".to_string()));
        }
        if self.repository.find_project(project_id).await?.is_none() {
            return Err(MockError::InvalidRequest("project does not exist".to_string()));
        }
        let removed = self.repository.delete(project_id, ids).await?;
        self.cache.invalidate(project_id);
        info!(project_id = %project_id, removed, "Mock definitions deleted");
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> MockResult<MockDefinition> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| MockError::InvalidRequest("mock definition does not exist".to_string()))
    }

    /// A page of a project's definitions, newest first.
    pub async fn list(&self, project_id: &str, query: &ListQuery) -> MockResult<MockList> {
        if project_id.is_empty() {
            return Err(MockError::InvalidRequest("project_id cannot be empty".to_string()));
        }
        let page_size = query.page_size.filter(|n| *n > 0).unwrap_or(DEFAULT_PAGE_SIZE);
        let page_index = query.page_index.filter(|n| *n > 0).unwrap_or(1);

        let mut mocks = self.repository.find_by_project(project_id).await?;
        if let Some(keywords) = query.keywords.as_deref().filter(|k| !k.is_empty()) {
            let pattern = Regex::new(keywords)
                .or_else(|_| Regex::new(&regex::escape(keywords)))
                .map_err(|e| MockError::InvalidRequest(e.to_string()))?;
            mocks.retain(|m| matches_keywords(m, &pattern));
        }

        // Later inserts first among equal timestamps
        mocks.reverse();
        mocks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mocks = mocks
            .into_iter()
            .skip((page_index - 1) * page_size)
            .take(page_size)
            .collect();
        let project = self.repository.find_project(project_id).await?;
        Ok(MockList { project, mocks })
    }

    /// All definitions of several projects, keyed by project id. Unknown ids are skipped.
    pub async fn by_projects(&self, project_ids: &[String]) -> MockResult<BTreeMap<String, MockList>> {
        if project_ids.is_empty() {
            return Err(MockError::InvalidRequest("project_ids cannot be empty".to_string()));
        }
        let mut result = BTreeMap::new();
        for project_id in project_ids {
            let Some(project) = self.repository.find_project(project_id).await? else {
                continue;
            };
            let mocks = self.repository.find_by_project(project_id).await?;
            result.insert(
                project_id.clone(),
                MockList {
                    project: Some(project),
                    mocks,
                },
            );
        }
        Ok(result)
    }
}

fn matches_keywords(mock: &MockDefinition, pattern: &Regex) -> bool {
    let params = serde_json::to_string(&mock.params).unwrap_or_default();
    [
        mock.url.as_str(),
        mock.description.as_str(),
        mock.method.as_str(),
        mock.mode.as_str(),
        params.as_str(),
    ]
    .iter()
    .any(|field| pattern.is_match(field))
}

/// Check author-supplied fields.
fn validate_fields(new: NewDefinition) -> MockResult<DefinitionFields> {
    let invalid = |msg: &str| Err(MockError::InvalidRequest(msg.to_string()));

    if new.mode.trim().is_empty() {
        return invalid("mode cannot be empty");
    }
    if new.description.trim().is_empty() {
        return invalid("description cannot be empty");
    }
    if !new.url.starts_with('/') {
        return invalid("url must start with /");
    }
    PathTemplate::parse(&new.url)?;
    let method: HttpMethod = new.method.parse().map_err(MockError::InvalidRequest)?;

    Ok(DefinitionFields {
        url: new.url,
        method,
        mode: new.mode,
        params: new.params,
        description: new.description,
    })
}
