//! Route pattern matching.
//!
//! Compiles `{name}` route patterns into anchored regexes and selects the
//! definition serving a request. The first definition in stored order whose
//! method and pattern both match wins; overlapping patterns are shadowed, not
//! rejected.

use crate::error::{MockError, MockResult};
use crate::model::{HttpMethod, MockDefinition};
use regex::{Regex, RegexBuilder};

/// Parameters extracted from a path, in declaration order.
pub type PathParams = Vec<(String, String)>;

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    segments: Vec<TemplateSegment>,
    regex: Regex,
}

#[derive(Debug, Clone, PartialEq)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    /// Parse and compile a route pattern.
    pub fn parse(template: &str) -> MockResult<Self> {
        let segments = split_segments(template);

        let mut pattern = String::from("^");
        for segment in &segments {
            match segment {
                TemplateSegment::Literal(lit) => pattern.push_str(&regex::escape(lit)),
                TemplateSegment::Param(_) => pattern.push_str("([^/]+?)"),
            }
        }
        // A single trailing slash is tolerated unless the pattern already ends with one.
        if !template.ends_with('/') {
            pattern.push_str("(?:/)?");
        }
        pattern.push('$');

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| MockError::InvalidRequest(format!("invalid route {}: {}", template, e)))?;

        Ok(Self { segments, regex })
    }

    /// Placeholder names in declaration order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            TemplateSegment::Param(name) => Some(name.as_str()),
            TemplateSegment::Literal(_) => None,
        })
    }

    /// Test a concrete path, returning the bound parameters on success.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let captures = self.regex.captures(path)?;
        let params = self
            .param_names()
            .zip(captures.iter().skip(1))
            .map(|(name, cap)| {
                let raw = cap.map(|m| m.as_str()).unwrap_or_default();
                let value = urlencoding::decode(raw)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| raw.to_string());
                (name.to_string(), value)
            })
            .collect();
        Some(params)
    }

    /// Substitute parameters into the template.
    ///
    /// Fails naming the first placeholder with no value.
    pub fn render(&self, params: &PathParams) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(lit) => out.push_str(lit),
                TemplateSegment::Param(name) => {
                    let value = params
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v)
                        .ok_or_else(|| format!("Expected \"{}\" to be defined", name))?;
                    out.push_str(&urlencoding::encode(value));
                }
            }
        }
        Ok(out)
    }
}

fn split_segments(template: &str) -> Vec<TemplateSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_param = false;
    let mut param_name = String::new();

    for ch in template.chars() {
        if ch == '{' && !in_param {
            if !current.is_empty() {
                segments.push(TemplateSegment::Literal(current.clone()));
                current.clear();
            }
            in_param = true;
            param_name.clear();
        } else if ch == '}' && in_param {
            segments.push(TemplateSegment::Param(param_name.clone()));
            in_param = false;
            param_name.clear();
        } else if in_param {
            param_name.push(ch);
        } else {
            current.push(ch);
        }
    }

    // An unterminated placeholder is kept as literal text.
    if in_param {
        current.push('{');
        current.push_str(&param_name);
    }
    if !current.is_empty() {
        segments.push(TemplateSegment::Literal(current));
    }

    segments
}

/// A definition with its route pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledDefinition {
    pub definition: MockDefinition,
    pub template: PathTemplate,
}

impl CompiledDefinition {
    pub fn compile(definition: MockDefinition) -> MockResult<Self> {
        let template = PathTemplate::parse(&definition.url)?;
        Ok(Self { definition, template })
    }
}

/// Compile every definition, keeping stored order.
///
/// Definitions whose pattern does not compile can never match and are skipped.
pub fn compile_all(definitions: Vec<MockDefinition>) -> Vec<CompiledDefinition> {
    definitions
        .into_iter()
        .filter_map(|definition| {
            let id = definition.id.clone();
            match CompiledDefinition::compile(definition) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    tracing::debug!(definition_id = %id, error = %e, "Skipping definition");
                    None
                }
            }
        })
        .collect()
}

/// Result of resolving a request against a project's definitions.
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    /// The winning definition
    pub definition: &'a MockDefinition,
    /// Parameters extracted from the path
    pub params: PathParams,
}

/// Select the first definition whose method and pattern match the path.
///
/// `path` is the mock path after the project prefix has been stripped.
pub fn find_match<'a>(
    definitions: &'a [CompiledDefinition],
    method: HttpMethod,
    path: &str,
) -> MockResult<MatchResult<'a>> {
    definitions
        .iter()
        .filter(|c| c.definition.method == method)
        .find_map(|c| {
            c.template.matches(path).map(|params| MatchResult {
                definition: &c.definition,
                params,
            })
        })
        .ok_or(MockError::NotFound)
}
