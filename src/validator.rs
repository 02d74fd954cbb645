//! Parameter validation.
//!
//! Non-GET requests validate the body against the first rule of each declared
//! parameter. GET requests only check that each declared parameter is present
//! as a non-empty string: query values are always raw text, so type and shape
//! rules cannot apply to them.

use crate::model::{HttpMethod, ParamSchema, RuleSpec};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// A single parameter validation failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub message: String,
    pub field: String,
    pub code: &'static str,
}

impl ValidationError {
    fn missing(field: &str) -> Self {
        Self {
            message: "required".to_string(),
            field: field.to_string(),
            code: "missing_field",
        }
    }

    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: field.to_string(),
            code: "invalid",
        }
    }
}

static DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static regex"));
static DATE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").expect("static regex")
});
static ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("static regex"));
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("static regex")
});

/// Validate a request against a definition's declared parameters.
///
/// `query` is used for GET, `body` for every other method.
pub fn validate_request(
    method: HttpMethod,
    schema: &ParamSchema,
    query: &[(String, String)],
    body: Option<&Value>,
) -> Vec<ValidationError> {
    if method == HttpMethod::Get {
        let query: Map<String, Value> = query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let rules = schema.keys().map(|name| (name.clone(), RuleSpec::of_type("string")));
        validate_object(rules, &query, "")
    } else {
        let empty = Map::new();
        let body = body.and_then(Value::as_object).unwrap_or(&empty);
        let rules = schema
            .iter()
            .filter_map(|(name, rules)| rules.first().map(|r| (name.clone(), r.spec())));
        validate_object(rules, body, "")
    }
}

fn validate_object(
    rules: impl Iterator<Item = (String, RuleSpec)>,
    object: &Map<String, Value>,
    prefix: &str,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (name, rule) in rules {
        let field = format!("{}{}", prefix, name);
        match object.get(&name) {
            None | Some(Value::Null) => {
                if rule.required {
                    errors.push(ValidationError::missing(&field));
                }
            }
            Some(value) => check(&field, &rule, value, &mut errors),
        }
    }
    errors
}

fn check(field: &str, rule: &RuleSpec, value: &Value, errors: &mut Vec<ValidationError>) {
    let result = match rule.kind.as_str() {
        "int" | "integer" => check_int(rule, value),
        "number" => check_number(rule, value),
        "string" => check_string(rule, value),
        "id" => check_pattern(value, &ID, "should be an id"),
        "date" => check_pattern(value, &DATE, "should be a date"),
        "dateTime" | "datetime" => check_pattern(
            value,
            &DATE_TIME,
            "should be a date with format YYYY-MM-DD HH:mm:ss",
        ),
        "boolean" | "bool" => match value {
            Value::Bool(_) => Ok(()),
            _ => Err("should be a boolean".to_string()),
        },
        "email" => check_pattern(value, &EMAIL, "should be an email"),
        "password" => check_password(rule, value),
        "url" => check_url(value),
        "enum" => check_enum(rule, value),
        "object" => {
            let Some(object) = value.as_object() else {
                errors.push(ValidationError::invalid(field, "should be an object"));
                return;
            };
            if let Some(nested) = rule.rule.as_ref().and_then(nested_schema) {
                errors.extend(validate_object(nested.into_iter(), object, &format!("{}.", field)));
            }
            Ok(())
        }
        "array" => {
            let Some(items) = value.as_array() else {
                errors.push(ValidationError::invalid(field, "should be an array"));
                return;
            };
            if let Err(msg) = check_length(rule, items.len()) {
                errors.push(ValidationError::invalid(field, msg));
                return;
            }
            if let Some(item_rule) = item_rule(rule) {
                for (i, item) in items.iter().enumerate() {
                    check(&format!("{}[{}]", field, i), &item_rule, item, errors);
                }
            }
            Ok(())
        }
        other => {
            tracing::debug!(field = %field, rule_type = %other, "Unknown rule type, skipping");
            Ok(())
        }
    };

    if let Err(message) = result {
        errors.push(ValidationError::invalid(field, message));
    }
}

fn check_int(rule: &RuleSpec, value: &Value) -> Result<(), String> {
    match value.as_f64() {
        Some(n) if n.fract() == 0.0 => check_range(rule, n),
        _ => Err("should be an integer".to_string()),
    }
}

fn check_number(rule: &RuleSpec, value: &Value) -> Result<(), String> {
    match value.as_f64() {
        Some(n) => check_range(rule, n),
        None => Err("should be a number".to_string()),
    }
}

fn check_range(rule: &RuleSpec, n: f64) -> Result<(), String> {
    if let Some(max) = rule.max {
        if n > max {
            return Err(format!("should smaller than {}", max));
        }
    }
    if let Some(min) = rule.min {
        if n < min {
            return Err(format!("should bigger than {}", min));
        }
    }
    Ok(())
}

fn check_length(rule: &RuleSpec, len: usize) -> Result<(), String> {
    if let Some(max) = rule.max {
        if len as f64 > max {
            return Err(format!("length should smaller than {}", max));
        }
    }
    if let Some(min) = rule.min {
        if (len as f64) < min {
            return Err(format!("length should bigger than {}", min));
        }
    }
    Ok(())
}

fn check_string(rule: &RuleSpec, value: &Value) -> Result<(), String> {
    let Value::String(s) = value else {
        return Err("should be a string".to_string());
    };
    let allow_empty = rule.allow_empty.unwrap_or(!rule.required);
    if s.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err("should not be empty".to_string())
        };
    }
    check_length(rule, s.chars().count())?;
    if let Some(format) = &rule.format {
        match Regex::new(format) {
            Ok(re) if !re.is_match(s) => return Err(format!("should match /{}/", format)),
            Ok(_) => {}
            Err(e) => tracing::debug!(format = %format, error = %e, "Invalid format rule"),
        }
    }
    Ok(())
}

fn check_pattern(value: &Value, pattern: &Regex, message: &str) -> Result<(), String> {
    match value {
        Value::String(s) if pattern.is_match(s) => Ok(()),
        _ => Err(message.to_string()),
    }
}

fn check_password(rule: &RuleSpec, value: &Value) -> Result<(), String> {
    let mut rule = rule.clone();
    rule.min = Some(rule.min.unwrap_or(6.0));
    rule.allow_empty = Some(false);
    check_string(&rule, value)
}

fn check_url(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) => match url::Url::parse(s) {
            Ok(u) if matches!(u.scheme(), "http" | "https") && u.host().is_some() => Ok(()),
            _ => Err("should be a url".to_string()),
        },
        _ => Err("should be a url".to_string()),
    }
}

fn check_enum(rule: &RuleSpec, value: &Value) -> Result<(), String> {
    let values = rule.values.as_deref().unwrap_or_default();
    if values.contains(value) {
        Ok(())
    } else {
        let allowed: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Err(format!("should be one of {}", allowed.join(", ")))
    }
}

fn nested_schema(rule: &Value) -> Option<Vec<(String, RuleSpec)>> {
    let object = rule.as_object()?;
    Some(
        object
            .iter()
            .filter_map(|(name, r)| parse_rule(r).map(|spec| (name.clone(), spec)))
            .collect(),
    )
}

fn item_rule(rule: &RuleSpec) -> Option<RuleSpec> {
    if let Some(nested) = &rule.rule {
        if nested.is_string() || nested.get("type").is_some() {
            return parse_rule(nested);
        }
        // A bare schema describes object items.
        let mut spec = RuleSpec::of_type("object");
        spec.rule = Some(nested.clone());
        return Some(spec);
    }
    rule.item_type.as_deref().map(RuleSpec::of_type)
}

fn parse_rule(value: &Value) -> Option<RuleSpec> {
    match value {
        Value::String(kind) => Some(RuleSpec::of_type(kind)),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamRule;
    use serde_json::json;

    fn schema(yaml: &str) -> ParamSchema {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_get_checks_presence_only() {
        let schema = schema(
            r#"
page: [{type: int, min: 1}]
q: [string]
"#,
        );
        // "abc" is not an int, but GET never checks shape
        let errors = validate_request(
            HttpMethod::Get,
            &schema,
            &query(&[("page", "abc"), ("q", "x")]),
            None,
        );
        assert!(errors.is_empty());

        let errors = validate_request(HttpMethod::Get, &schema, &query(&[("q", "x")]), None);
        assert_eq!(errors, vec![ValidationError::missing("page")]);
    }

    #[test]
    fn test_get_ignores_body() {
        let schema = schema("name: [string]");
        let body = json!({"name": "alice"});
        let errors = validate_request(HttpMethod::Get, &schema, &[], Some(&body));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "missing_field");
    }

    #[test]
    fn test_post_uses_first_rule() {
        let schema = schema(
            r#"
age:
  - type: int
    max: 150
  - string
"#,
        );
        let body = json!({"age": "ten"});
        let errors = validate_request(HttpMethod::Post, &schema, &[], Some(&body));
        assert_eq!(errors, vec![ValidationError::invalid("age", "should be an integer")]);

        let body = json!({"age": 200});
        let errors = validate_request(HttpMethod::Post, &schema, &[], Some(&body));
        assert_eq!(errors[0].message, "should smaller than 150");

        let body = json!({"age": 30});
        assert!(validate_request(HttpMethod::Post, &schema, &[], Some(&body)).is_empty());
    }

    #[test]
    fn test_optional_and_null() {
        let schema = schema(
            r#"
nickname: [{type: string, required: false}]
name: [string]
"#,
        );
        let body = json!({"name": null});
        let errors = validate_request(HttpMethod::Put, &schema, &[], Some(&body));
        assert_eq!(errors, vec![ValidationError::missing("name")]);
    }

    #[test]
    fn test_string_rules() {
        let mut rule = RuleSpec::of_type("string");
        assert_eq!(check_string(&rule, &json!("")).unwrap_err(), "should not be empty");
        assert_eq!(check_string(&rule, &json!(1)).unwrap_err(), "should be a string");

        rule.format = Some("^[a-z]+$".to_string());
        assert!(check_string(&rule, &json!("abc")).is_ok());
        assert!(check_string(&rule, &json!("ABC")).is_err());

        rule.format = None;
        rule.max = Some(3.0);
        assert!(check_string(&rule, &json!("abcd")).is_err());
    }

    #[test]
    fn test_formats() {
        assert!(check_pattern(&json!("2024-01-31"), &DATE, "x").is_ok());
        assert!(check_pattern(&json!("2024-01-31 10:00:00"), &DATE_TIME, "x").is_ok());
        assert!(check_pattern(&json!("a@b.co"), &EMAIL, "x").is_ok());
        assert!(check_pattern(&json!("nope"), &EMAIL, "x").is_err());
        assert!(check_url(&json!("https://example.com/x")).is_ok());
        assert!(check_url(&json!("ftp://example.com")).is_err());
    }

    #[test]
    fn test_enum() {
        let mut rule = RuleSpec::of_type("enum");
        rule.values = Some(vec![json!("a"), json!("b")]);
        assert!(check_enum(&rule, &json!("a")).is_ok());
        assert_eq!(
            check_enum(&rule, &json!("c")).unwrap_err(),
            r#"should be one of "a", "b""#
        );
    }

    #[test]
    fn test_nested_object_and_array() {
        let schema = schema(
            r#"
user:
  - type: object
    rule:
      name: string
      age: int
tags:
  - type: array
    itemType: string
    min: 1
"#,
        );
        let body = json!({
            "user": {"name": "bob", "age": "x"},
            "tags": ["a", 2]
        });
        let errors = validate_request(HttpMethod::Post, &schema, &[], Some(&body));
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["tags[1]", "user.age"]);

        let body = json!({"user": {"name": "bob", "age": 3}, "tags": []});
        let errors = validate_request(HttpMethod::Post, &schema, &[], Some(&body));
        assert_eq!(errors[0].message, "length should bigger than 1");
    }

    #[test]
    fn test_non_object_body_reports_missing() {
        let mut schema = ParamSchema::new();
        schema.insert("id".to_string(), vec![ParamRule::Type("int".to_string())]);
        let body = json!([1, 2]);
        let errors = validate_request(HttpMethod::Delete, &schema, &[], Some(&body));
        assert_eq!(errors, vec![ValidationError::missing("id")]);
    }
}
