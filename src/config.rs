//! Configuration for the mock server.
//!
//! Defines listener, cache, sandbox, proxy and JSONP settings, the project
//! blacklist and the seed projects loaded into the in-memory repository.

use crate::dispatcher::{DispatchSettings, PROJECT_ID_LEN};
use crate::matcher::PathTemplate;
use crate::model::{HttpMethod, NewDefinition, Project};
use crate::template::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub jsonp: JsonpSettings,

    #[serde(default)]
    pub blacklist: BlacklistSettings,

    /// Seed projects and their definitions
    #[serde(default)]
    pub projects: Vec<ProjectSeed>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be greater than 0");
        }
        if self.sandbox.timeout_ms == 0 {
            anyhow::bail!("sandbox.timeout_ms must be greater than 0");
        }
        if self.sandbox.max_output_bytes == 0 {
            anyhow::bail!("sandbox.max_output_bytes must be greater than 0");
        }
        if self.proxy.timeout_ms == 0 {
            anyhow::bail!("proxy.timeout_ms must be greater than 0");
        }
        if self.jsonp.param_name.is_empty() {
            anyhow::bail!("jsonp.param_name cannot be empty");
        }

        let mut ids = HashSet::new();
        for (i, project) in self.projects.iter().enumerate() {
            project
                .validate()
                .map_err(|e| anyhow::anyhow!("Project {}: {}", i, e))?;
            if !ids.insert(project.id.as_str()) {
                anyhow::bail!("Project {}: duplicate id {}", i, project.id);
            }
        }
        Ok(())
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            jsonp_param_name: self.jsonp.param_name.clone(),
            default_callback: self.jsonp.default_callback.clone(),
            blacklist: self.blacklist.projects.iter().cloned().collect(),
        }
    }

    /// Total number of seeded definitions.
    pub fn mock_count(&self) -> usize {
        self.projects.iter().map(|p| p.mocks.len()).sum()
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7300".to_string()
}

/// Definition cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Snapshot lifetime
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of cached projects
    #[serde(default = "default_max_projects")]
    pub max_projects: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_projects: default_max_projects(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_max_projects() -> u64 {
    10_000
}

/// Template sandbox limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSettings {
    /// Wall-clock budget per evaluation
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,

    #[serde(default = "default_max_stack_bytes")]
    pub max_stack_bytes: usize,

    /// Maximum template nesting depth
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Size budget for one generated document
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            memory_limit_bytes: default_memory_limit_bytes(),
            max_stack_bytes: default_max_stack_bytes(),
            max_depth: default_max_depth(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl SandboxSettings {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            memory_limit: self.memory_limit_bytes,
            max_stack_size: self.max_stack_bytes,
            max_depth: self.max_depth,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

fn default_sandbox_timeout_ms() -> u64 {
    1000
}

fn default_memory_limit_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_max_stack_bytes() -> usize {
    512 * 1024
}

fn default_max_depth() -> usize {
    64
}

fn default_max_output_bytes() -> usize {
    32 * 1024 * 1024
}

/// Upstream proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySettings {
    #[serde(default = "default_proxy_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

impl ProxySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_proxy_timeout_ms() -> u64 {
    3000
}

/// JSONP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonpSettings {
    /// Query parameter naming the callback parameter
    #[serde(default = "default_jsonp_param_name")]
    pub param_name: String,

    /// Callback name when the named parameter is missing
    #[serde(default = "default_callback")]
    pub default_callback: String,
}

impl Default for JsonpSettings {
    fn default() -> Self {
        Self {
            param_name: default_jsonp_param_name(),
            default_callback: default_callback(),
        }
    }
}

fn default_jsonp_param_name() -> String {
    "jsonp_param_name".to_string()
}

fn default_callback() -> String {
    "callback".to_string()
}

/// Projects refused by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BlacklistSettings {
    #[serde(default)]
    pub projects: Vec<String>,
}

/// A seed project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSeed {
    pub id: String,

    #[serde(default = "default_base_path")]
    pub base_path: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub members: Vec<String>,

    /// Definitions, in match order
    #[serde(default)]
    pub mocks: Vec<NewDefinition>,
}

fn default_base_path() -> String {
    "/".to_string()
}

impl ProjectSeed {
    pub fn project(&self) -> Project {
        Project {
            id: self.id.clone(),
            base_path: self.base_path.clone(),
            owner: self.owner.clone(),
            group: self.group.clone(),
            members: self.members.clone(),
        }
    }

    /// Validate the project and its definitions.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.chars().count() != PROJECT_ID_LEN {
            anyhow::bail!("id must be {} characters: {}", PROJECT_ID_LEN, self.id);
        }
        if !self.base_path.starts_with('/') {
            anyhow::bail!("base_path must start with '/': {}", self.base_path);
        }

        let mut seen = HashSet::new();
        for (i, mock) in self.mocks.iter().enumerate() {
            let method: HttpMethod = mock
                .method
                .parse()
                .map_err(|e| anyhow::anyhow!("Mock {}: {}", i, e))?;
            if !mock.url.starts_with('/') {
                anyhow::bail!("Mock {}: url must start with '/': {}", i, mock.url);
            }
            PathTemplate::parse(&mock.url).map_err(|e| anyhow::anyhow!("Mock {}: {}", i, e))?;
            if mock.mode.trim().is_empty() {
                anyhow::bail!("Mock {}: mode cannot be empty", i);
            }
            if !seen.insert((mock.url.as_str(), method)) {
                anyhow::bail!("Mock {}: duplicate {} {}", i, method, mock.url);
            }
        }
        Ok(())
    }
}
