//! Stored entities: projects and mock definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A project owning a set of mock definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// 24-character opaque identifier
    pub id: String,

    /// Base path prefix stripped from incoming paths (`/` for none)
    #[serde(default = "default_base_path", alias = "url")]
    pub base_path: String,

    /// Owning user id
    #[serde(default)]
    pub owner: String,

    /// Optional group id
    #[serde(default)]
    pub group: Option<String>,

    /// Member user ids
    #[serde(default)]
    pub members: Vec<String>,
}

fn default_base_path() -> String {
    "/".to_string()
}

impl Project {
    /// Strip the project's base path from a mock path.
    ///
    /// A root base path leaves the path untouched; stripping everything yields `/`.
    pub fn strip_base_path<'a>(&self, path: &'a str) -> &'a str {
        if self.base_path.is_empty() || self.base_path == "/" {
            return path;
        }
        match path.strip_prefix(self.base_path.as_str()) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }
}

/// HTTP methods a definition can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[serde(alias = "GET")]
    Get,
    #[serde(alias = "POST")]
    Post,
    #[serde(alias = "PUT")]
    Put,
    #[serde(alias = "DELETE")]
    Delete,
    #[serde(alias = "PATCH")]
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "get",
            HttpMethod::Post => "post",
            HttpMethod::Put => "put",
            HttpMethod::Delete => "delete",
            HttpMethod::Patch => "patch",
        }
    }

    /// Convert to the `http` crate's method type.
    pub fn to_http(self) -> http::Method {
        match self {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Patch => http::Method::PATCH,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(HttpMethod::Get),
            "post" => Ok(HttpMethod::Post),
            "put" => Ok(HttpMethod::Put),
            "delete" => Ok(HttpMethod::Delete),
            "patch" => Ok(HttpMethod::Patch),
            other => Err(format!("unsupported method: {}", other)),
        }
    }
}

impl TryFrom<&http::Method> for HttpMethod {
    type Error = String;

    fn try_from(method: &http::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

/// A single validation rule for a declared parameter.
///
/// Either a bare type name (`"string"`) or a detailed rule object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamRule {
    Type(String),
    Detailed(RuleSpec),
}

/// Detailed parameter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    /// Type name (`string`, `int`, `number`, `object`, ...)
    #[serde(rename = "type", default = "default_rule_type")]
    pub kind: String,

    /// Whether the parameter must be present
    #[serde(default = "default_required")]
    pub required: bool,

    /// Allow an empty string
    #[serde(default)]
    pub allow_empty: Option<bool>,

    /// Lower bound (value for numbers, length for strings and arrays)
    #[serde(default)]
    pub min: Option<f64>,

    /// Upper bound (value for numbers, length for strings and arrays)
    #[serde(default)]
    pub max: Option<f64>,

    /// Regex a string must match
    #[serde(default)]
    pub format: Option<String>,

    /// Allowed values for `enum`
    #[serde(default)]
    pub values: Option<Vec<serde_json::Value>>,

    /// Item type for `array`
    #[serde(default)]
    pub item_type: Option<String>,

    /// Nested rules: a schema for `object`, an item rule for `array`
    #[serde(default)]
    pub rule: Option<serde_json::Value>,
}

fn default_rule_type() -> String {
    "string".to_string()
}

fn default_required() -> bool {
    true
}

impl ParamRule {
    /// Normalize into a detailed rule.
    pub fn spec(&self) -> RuleSpec {
        match self {
            ParamRule::Type(kind) => RuleSpec::of_type(kind),
            ParamRule::Detailed(spec) => spec.clone(),
        }
    }
}

impl RuleSpec {
    /// A required rule of the given type with no further constraints.
    pub fn of_type(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            required: true,
            allow_empty: None,
            min: None,
            max: None,
            format: None,
            values: None,
            item_type: None,
            rule: None,
        }
    }
}

/// Declared parameters: name to ordered rule list.
pub type ParamSchema = BTreeMap<String, Vec<ParamRule>>;

/// How a definition produces its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode<'a> {
    /// A data template evaluated in the sandbox
    Template(&'a str),
    /// An upstream URL template the request is forwarded to
    Proxy(&'a str),
}

/// A stored mock endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockDefinition {
    pub id: String,

    /// Owning project (joined on read)
    pub project: Project,

    /// Route pattern with `{name}` placeholders
    pub url: String,

    pub method: HttpMethod,

    /// Template source or upstream URL template
    pub mode: String,

    /// Declared parameters
    #[serde(default)]
    pub params: ParamSchema,

    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl MockDefinition {
    /// Classify the mode field. Anything starting with `http` is proxied.
    pub fn mode(&self) -> Mode<'_> {
        if self.mode.starts_with("http") {
            Mode::Proxy(&self.mode)
        } else {
            Mode::Template(&self.mode)
        }
    }
}

/// Fields of a definition supplied by an author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDefinition {
    pub url: String,
    pub method: String,
    pub mode: String,
    #[serde(default)]
    pub params: ParamSchema,
    #[serde(default)]
    pub description: String,
}
