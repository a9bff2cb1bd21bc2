//! Rule template instantiation
//!
//! Templates carry typed parameters and a body whose string values hold
//! `{{ name }}` or `${name}` placeholders. Instantiation validates the
//! supplied parameters against the declared types, constraints and
//! patterns, then renders the body into a concrete rule.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::error::{EngineError, Result};

use super::model::{
    ConflictResolution, Rule, RuleAction, RuleCondition, RulePriority, RuleScope, RuleStatus,
    RuleTemplate, RuleType, TemplateParameter, TemplateParameterType,
};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}|\$\{([A-Za-z0-9_]+)\}").unwrap());

/// Validate supplied parameters against the template's declarations and
/// resolve defaults. Unknown extra parameters are ignored.
pub fn resolve_parameters(
    template: &RuleTemplate,
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut resolved = Map::new();

    for parameter in &template.parameters {
        let value = supplied
            .get(&parameter.name)
            .cloned()
            .or_else(|| parameter.default_value.clone());

        let Some(value) = value else {
            if parameter.required {
                return Err(EngineError::TemplateParameter {
                    name: parameter.name.clone(),
                    message: "required parameter missing".to_string(),
                });
            }
            continue;
        };

        check_type(parameter, &value)?;

        if let Some(allowed) = &parameter.allowed_values {
            if !allowed.contains(&value) {
                return Err(EngineError::TemplateParameter {
                    name: parameter.name.clone(),
                    message: format!("value {} not in allowed set", value),
                });
            }
        }

        if let (Some(pattern), Value::String(s)) = (&parameter.validation_pattern, &value) {
            let regex = Regex::new(pattern).map_err(|e| EngineError::TemplateParameter {
                name: parameter.name.clone(),
                message: format!("invalid validation pattern: {}", e),
            })?;
            if !regex.is_match(s) {
                return Err(EngineError::TemplateParameter {
                    name: parameter.name.clone(),
                    message: format!("value '{}' does not match pattern {}", s, pattern),
                });
            }
        }

        resolved.insert(parameter.name.clone(), value);
    }

    Ok(resolved)
}

fn check_type(parameter: &TemplateParameter, value: &Value) -> Result<()> {
    let ok = match parameter.kind {
        TemplateParameterType::String => value.is_string(),
        TemplateParameterType::Integer => value.as_i64().is_some(),
        TemplateParameterType::Float => value.is_number(),
        TemplateParameterType::Boolean => value.is_boolean(),
        TemplateParameterType::List => value.is_array(),
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::TemplateParameter {
            name: parameter.name.clone(),
            message: format!("expected {:?}, got {}", parameter.kind, value),
        })
    }
}

/// Render placeholders throughout a value tree. A string consisting of
/// exactly one placeholder takes the parameter's typed value; mixed
/// strings render parameters into text.
pub fn render(value: &Value, parameters: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => render_string(s, parameters),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, parameters)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, parameters)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(text: &str, parameters: &Map<String, Value>) -> Value {
    // Whole-string placeholder keeps the parameter's type
    if let Some(captures) = PLACEHOLDER.captures(text) {
        if captures.get(0).map(|m| m.as_str()) == Some(text) {
            let name = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if let Some(value) = parameters.get(name) {
                return value.clone();
            }
        }
    }

    let rendered = PLACEHOLDER.replace_all(text, |captures: &regex::Captures<'_>| {
        let name = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match parameters.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => captures
                .get(0)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        }
    });
    Value::String(rendered.into_owned())
}

#[derive(Debug, Default, Deserialize)]
struct TemplateBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    scope: Option<RuleScope>,
    #[serde(default)]
    priority: Option<RulePriority>,
    #[serde(default)]
    status: Option<RuleStatus>,
    #[serde(default)]
    conditions: Vec<RuleCondition>,
    #[serde(default)]
    actions: Vec<RuleAction>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    conflict_resolution: Option<ConflictResolution>,
}

/// Instantiate a template into a new rule
pub fn instantiate(
    template: &RuleTemplate,
    parameters: &Map<String, Value>,
    created_by: &str,
) -> Result<Rule> {
    let resolved = resolve_parameters(template, parameters)?;
    let rendered = render(&template.template_data, &resolved);
    let body: TemplateBody =
        serde_json::from_value(rendered).map_err(|e| EngineError::TemplateParameter {
            name: "template_data".to_string(),
            message: format!("rendered body is not a valid rule body: {}", e),
        })?;

    let mut rule = Rule::new(
        body.name.unwrap_or_else(|| template.name.clone()),
        template.rule_type,
        body.scope.unwrap_or(RuleScope::Global),
        body.priority.unwrap_or(RulePriority::Normal),
        created_by,
    );
    rule.description = body.description.unwrap_or_else(|| template.description.clone());
    rule.conditions = body.conditions;
    rule.actions = body.actions;
    rule.tags = body.tags;
    if let Some(status) = body.status {
        rule.status = status;
    }
    if let Some(resolution) = body.conflict_resolution {
        rule.conflict_resolution = resolution;
    }
    rule.metadata.insert(
        "template_id".to_string(),
        Value::String(template.id.clone()),
    );
    rule.metadata.insert(
        "template_parameters".to_string(),
        Value::Object(resolved),
    );
    Ok(rule)
}

/// Built-in template library
pub fn default_templates() -> Vec<RuleTemplate> {
    vec![
        RuleTemplate {
            id: "authorship-template".to_string(),
            name: "Basic Authorship Rule".to_string(),
            description: "Template for setting work attribution".to_string(),
            rule_type: RuleType::Authorship,
            parameters: vec![
                TemplateParameter {
                    name: "author_name".to_string(),
                    kind: TemplateParameterType::String,
                    required: true,
                    default_value: None,
                    allowed_values: None,
                    validation_pattern: None,
                },
                TemplateParameter {
                    name: "organization".to_string(),
                    kind: TemplateParameterType::String,
                    required: false,
                    default_value: Some(Value::String(String::new())),
                    allowed_values: None,
                    validation_pattern: None,
                },
            ],
            template_data: serde_json::json!({
                "name": "Set Author to {{ author_name }}",
                "description": "Ensure all work is attributed to {{ author_name }}",
                "actions": [
                    {"action_type": "set", "target": "author", "value": "{{ author_name }}"},
                    {"action_type": "set", "target": "organization", "value": "{{ organization }}"}
                ],
                "tags": ["authorship", "attribution"]
            }),
            category: "authorship".to_string(),
            tags: vec!["authorship".to_string(), "template".to_string()],
            created_by: "system".to_string(),
            created_at: Utc::now(),
            metadata: Map::new(),
        },
        RuleTemplate {
            id: "security-no-secrets-template".to_string(),
            name: "No Secrets Exposure".to_string(),
            description: "Template for preventing secret exposure".to_string(),
            rule_type: RuleType::Security,
            parameters: vec![TemplateParameter {
                name: "scope_label".to_string(),
                kind: TemplateParameterType::String,
                required: false,
                default_value: Some(Value::String("all content".to_string())),
                allowed_values: None,
                validation_pattern: None,
            }],
            template_data: serde_json::json!({
                "name": "Prevent Secret Exposure in {{ scope_label }}",
                "description": "Block exposure of secrets, keys and tokens in {{ scope_label }}",
                "priority": "critical",
                "actions": [
                    {"action_type": "validate", "target": "code_content", "value": "no_secrets"},
                    {"action_type": "block", "target": "secret_exposure", "value": true}
                ],
                "tags": ["security", "secrets"]
            }),
            category: "security".to_string(),
            tags: vec!["security".to_string(), "template".to_string()],
            created_by: "system".to_string(),
            created_at: Utc::now(),
            metadata: Map::new(),
        },
        RuleTemplate {
            id: "style-comments-template".to_string(),
            name: "Comment Policy".to_string(),
            description: "Template for code comment policies".to_string(),
            rule_type: RuleType::CodingStyle,
            parameters: vec![TemplateParameter {
                name: "add_comments".to_string(),
                kind: TemplateParameterType::Boolean,
                required: true,
                default_value: None,
                allowed_values: None,
                validation_pattern: None,
            }],
            template_data: serde_json::json!({
                "name": "Comment Policy",
                "description": "Control when code comments are added",
                "conditions": [
                    {"field": "task_type", "operator": "eq", "value": "code_generation"}
                ],
                "actions": [
                    {"action_type": "set", "target": "add_comments", "value": "{{ add_comments }}"}
                ],
                "tags": ["coding", "comments"]
            }),
            category: "coding".to_string(),
            tags: vec!["coding".to_string(), "template".to_string()],
            created_by: "system".to_string(),
            created_at: Utc::now(),
            metadata: Map::new(),
        },
    ]
}

/// Create a template shell with a fresh id
pub fn new_template(
    name: impl Into<String>,
    rule_type: RuleType,
    category: impl Into<String>,
    template_data: Value,
    created_by: impl Into<String>,
) -> RuleTemplate {
    RuleTemplate {
        id: Uuid::new_v4().to_string(),
        name: name.into(),
        description: String::new(),
        rule_type,
        parameters: Vec::new(),
        template_data,
        category: category.into(),
        tags: Vec::new(),
        created_by: created_by.into(),
        created_at: Utc::now(),
        metadata: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authorship() -> RuleTemplate {
        default_templates().into_iter().next().unwrap()
    }

    #[test]
    fn test_required_parameter_enforced() {
        let template = authorship();
        let err = resolve_parameters(&template, &Map::new()).unwrap_err();
        assert!(err.to_string().contains("author_name"));
    }

    #[test]
    fn test_defaults_applied() {
        let template = authorship();
        let mut supplied = Map::new();
        supplied.insert("author_name".to_string(), json!("Ada"));
        let resolved = resolve_parameters(&template, &supplied).unwrap();
        assert_eq!(resolved["organization"], json!(""));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let template = authorship();
        let mut supplied = Map::new();
        supplied.insert("author_name".to_string(), json!(42));
        assert!(resolve_parameters(&template, &supplied).is_err());
    }

    #[test]
    fn test_allowed_values_and_pattern() {
        let mut template = authorship();
        template.parameters[0].allowed_values = Some(vec![json!("Ada"), json!("Grace")]);
        let mut supplied = Map::new();
        supplied.insert("author_name".to_string(), json!("Linus"));
        assert!(resolve_parameters(&template, &supplied).is_err());

        template.parameters[0].allowed_values = None;
        template.parameters[0].validation_pattern = Some("^[A-Z]".to_string());
        supplied.insert("author_name".to_string(), json!("lowercase"));
        assert!(resolve_parameters(&template, &supplied).is_err());
    }

    #[test]
    fn test_render_preserves_types_for_whole_placeholders() {
        let mut parameters = Map::new();
        parameters.insert("flag".to_string(), json!(false));
        parameters.insert("label".to_string(), json!("x"));
        let rendered = render(
            &json!({"value": "{{ flag }}", "text": "flag is {{ flag }} (${label})"}),
            &parameters,
        );
        assert_eq!(rendered["value"], json!(false));
        assert_eq!(rendered["text"], json!("flag is false (x)"));
    }

    #[test]
    fn test_instantiate_authorship() {
        let template = authorship();
        let mut supplied = Map::new();
        supplied.insert("author_name".to_string(), json!("Ada Lovelace"));
        supplied.insert("organization".to_string(), json!("Analytical Engines"));

        let rule = instantiate(&template, &supplied, "tests").unwrap();
        assert_eq!(rule.name, "Set Author to Ada Lovelace");
        assert_eq!(rule.rule_type, RuleType::Authorship);
        assert_eq!(rule.actions.len(), 2);
        assert_eq!(rule.actions[0].value, json!("Ada Lovelace"));
        assert_eq!(
            rule.metadata["template_id"],
            json!("authorship-template")
        );
    }

    #[test]
    fn test_instantiate_boolean_parameter() {
        let template = default_templates().into_iter().nth(2).unwrap();
        let mut supplied = Map::new();
        supplied.insert("add_comments".to_string(), json!(false));
        let rule = instantiate(&template, &supplied, "tests").unwrap();
        assert_eq!(rule.actions[0].value, json!(false));
        assert_eq!(rule.conditions.len(), 1);
    }
}
