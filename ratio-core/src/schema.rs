use crate::conditions::{self, Condition, ConditionNode, GroupLogic};
use crate::error::{EngineError, EngineResult};
use crate::types::{AttributeDef, AttributeType};
use regex::Regex;
use serde_json::{Map, Value};

/// A compiled body schema: the declared attribute list plus vanity-type
/// aliases applied before the base type check (the engine always maps
/// `file → string`, since files travel as storage paths).
#[derive(Debug)]
pub struct ObjectSchema {
    attributes: Vec<AttributeDef>,
    file_as_string: bool,
}

impl ObjectSchema {
    pub fn new(attributes: &[AttributeDef]) -> EngineResult<Self> {
        let mut seen = std::collections::BTreeSet::new();
        for attr in attributes {
            if !seen.insert(attr.name.as_str()) {
                return Err(EngineError::InvalidSchema(format!(
                    "duplicate attribute name: {}",
                    attr.name
                )));
            }
            if let Some(pattern) = &attr.regex_pattern {
                Regex::new(pattern).map_err(|err| {
                    EngineError::InvalidSchema(format!(
                        "invalid regex for attribute {}: {err}",
                        attr.name
                    ))
                })?;
            }
        }
        Ok(Self {
            attributes: attributes.to_vec(),
            file_as_string: false,
        })
    }

    /// Apply the `file → string` vanity alias used for IO bodies.
    pub fn with_file_as_string(mut self) -> Self {
        self.file_as_string = true;
        self
    }

    /// Validate a body against the schema. Absent attributes with
    /// defaults are injected; undeclared keys pass through unchanged.
    /// Returns the validated (and defaulted) body.
    pub fn validate(&self, body: &Map<String, Value>) -> EngineResult<Map<String, Value>> {
        let mut validated = body.clone();

        for attr in &self.attributes {
            let value = validated.get(&attr.name);

            let present = value.map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                if let Some(default) = &attr.default_value {
                    validated.insert(attr.name.clone(), default.clone());
                    continue;
                }

                if attr.required && self.is_required_now(attr, body)? {
                    return Err(EngineError::InvalidObjectSchema {
                        path: attr.name.clone(),
                        reason: "missing required attribute".to_string(),
                    });
                }
                continue;
            }

            let value = validated
                .get(&attr.name)
                .cloned()
                .unwrap_or(Value::Null);
            self.check_type(attr, &value)?;
            self.check_enum(attr, &value)?;
            self.check_regex(attr, &value)?;
        }

        Ok(validated)
    }

    /// A required attribute with `required_conditions` is only required
    /// while at least one clause evaluates true against the body.
    fn is_required_now(&self, attr: &AttributeDef, body: &Map<String, Value>) -> EngineResult<bool> {
        let Some(conditions) = &attr.required_conditions else {
            return Ok(true);
        };
        if conditions.is_empty() {
            return Ok(true);
        }
        Ok(evaluate_body_conditions(conditions, body, GroupLogic::Or))
    }

    fn effective_type(&self, declared: AttributeType) -> AttributeType {
        if self.file_as_string && declared == AttributeType::File {
            AttributeType::String
        } else {
            declared
        }
    }

    fn check_type(&self, attr: &AttributeDef, value: &Value) -> EngineResult<()> {
        let expected = self.effective_type(attr.type_name);
        if !expected.matches_value(value) {
            return Err(EngineError::InvalidObjectSchema {
                path: attr.name.clone(),
                reason: format!("expected {}, got {}", expected.as_str(), type_label(value)),
            });
        }
        Ok(())
    }

    fn check_enum(&self, attr: &AttributeDef, value: &Value) -> EngineResult<()> {
        if let Some(allowed) = &attr.enum_values {
            if !allowed.contains(value) {
                return Err(EngineError::InvalidObjectSchema {
                    path: attr.name.clone(),
                    reason: format!("value {value} is not one of the allowed values"),
                });
            }
        }
        Ok(())
    }

    fn check_regex(&self, attr: &AttributeDef, value: &Value) -> EngineResult<()> {
        let Some(pattern) = &attr.regex_pattern else {
            return Ok(());
        };
        let Some(text) = value.as_str() else {
            return Ok(());
        };
        // Compiled successfully in `new`.
        let regex = Regex::new(pattern).expect("validated at schema construction");
        if !regex.is_match(text) {
            return Err(EngineError::InvalidObjectSchema {
                path: attr.name.clone(),
                reason: format!("value does not match pattern {pattern}"),
            });
        }
        Ok(())
    }
}

/// Evaluate requirement conditions against the body itself: `param`
/// names a body field (absent resolves to null). Clauses that fail to
/// compare count as false.
fn evaluate_body_conditions(
    conditions: &[ConditionNode],
    body: &Map<String, Value>,
    logic: GroupLogic,
) -> bool {
    if conditions.is_empty() {
        return true;
    }

    let results = conditions.iter().map(|node| match node {
        ConditionNode::Group(group) => {
            evaluate_body_conditions(&group.conditions, body, group.logic)
        }
        ConditionNode::Single(condition) => evaluate_body_condition(condition, body),
    });

    match logic {
        GroupLogic::And => results.into_iter().all(|r| r),
        GroupLogic::Or => results.into_iter().any(|r| r),
    }
}

fn evaluate_body_condition(condition: &Condition, body: &Map<String, Value>) -> bool {
    let actual = condition
        .param
        .as_str()
        .and_then(|name| body.get(name))
        .cloned()
        .unwrap_or(Value::Null);

    match conditions::apply_operator(&actual, condition.operator, condition.value.as_ref()) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(error = %err, "requirement condition failed to evaluate");
            false
        }
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attr(name: &str, type_name: AttributeType) -> AttributeDef {
        AttributeDef {
            name: name.to_string(),
            type_name,
            required: false,
            description: None,
            regex_pattern: None,
            enum_values: None,
            default_value: None,
            required_conditions: None,
        }
    }

    fn body(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_type_checks() {
        let schema = ObjectSchema::new(&[
            attr("name", AttributeType::String),
            attr("count", AttributeType::Number),
            attr("items", AttributeType::List),
            attr("anything", AttributeType::Any),
        ])
        .unwrap();

        assert!(schema
            .validate(&body(json!({
                "name": "x", "count": 2, "items": [], "anything": {"free": true}
            })))
            .is_ok());

        let err = schema
            .validate(&body(json!({"count": "two"})))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidObjectSchema { path, .. } if path == "count"));
    }

    #[test]
    fn test_required_and_default_injection() {
        let mut required = attr("needed", AttributeType::String);
        required.required = true;
        let mut defaulted = attr("mode", AttributeType::String);
        defaulted.default_value = Some(json!("fast"));

        let schema = ObjectSchema::new(&[required, defaulted]).unwrap();

        let validated = schema.validate(&body(json!({"needed": "yes"}))).unwrap();
        assert_eq!(validated["mode"], json!("fast"));

        let err = schema.validate(&body(json!({}))).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_conditional_requirement() {
        let mut path_attr = attr("definition_path", AttributeType::String);
        path_attr.required = true;
        path_attr.required_conditions = Some(
            serde_json::from_value(json!([
                {"param": "definition", "operator": "not_exists"}
            ]))
            .unwrap(),
        );

        let schema = ObjectSchema::new(&[attr("definition", AttributeType::Object), path_attr])
            .unwrap();

        // Inline definition present -> every clause false -> path optional.
        assert!(schema
            .validate(&body(json!({"definition": {"x": 1}})))
            .is_ok());

        // Neither present -> clause true -> still required.
        assert!(schema.validate(&body(json!({}))).is_err());
    }

    #[test]
    fn test_enum_and_regex() {
        let mut format = attr("format", AttributeType::String);
        format.enum_values = Some(vec![json!("iso"), json!("unix")]);
        let mut dir = attr("working_directory", AttributeType::String);
        dir.regex_pattern = Some(r"^/[a-zA-Z0-9_\-/\.]+$".to_string());

        let schema = ObjectSchema::new(&[format, dir]).unwrap();

        assert!(schema
            .validate(&body(json!({"format": "iso", "working_directory": "/work/dir"})))
            .is_ok());
        assert!(schema.validate(&body(json!({"format": "epoch"}))).is_err());
        assert!(schema
            .validate(&body(json!({"working_directory": "relative/path"})))
            .is_err());
    }

    #[test]
    fn test_file_vanity_type() {
        let schema = ObjectSchema::new(&[attr("input_file", AttributeType::File)])
            .unwrap()
            .with_file_as_string();
        assert!(schema
            .validate(&body(json!({"input_file": "/data/in.txt"})))
            .is_ok());

        let strict = ObjectSchema::new(&[attr("input_file", AttributeType::File)]).unwrap();
        // Even without the alias a file is carried as a string path.
        assert!(strict
            .validate(&body(json!({"input_file": "/data/in.txt"})))
            .is_ok());
    }

    #[test]
    fn test_null_satisfies_presence_without_type_check() {
        let mut required = attr("x", AttributeType::String);
        required.required = true;
        let schema = ObjectSchema::new(&[required]).unwrap();

        // Null counts as absent for requirement purposes.
        assert!(schema.validate(&body(json!({"x": null}))).is_err());

        let optional = ObjectSchema::new(&[attr("y", AttributeType::String)]).unwrap();
        assert!(optional.validate(&body(json!({"y": null}))).is_ok());
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let err = ObjectSchema::new(&[
            attr("x", AttributeType::String),
            attr("x", AttributeType::Number),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema(_)));
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let schema = ObjectSchema::new(&[attr("known", AttributeType::String)]).unwrap();
        let validated = schema
            .validate(&body(json!({"known": "a", "extra": 42})))
            .unwrap();
        assert_eq!(validated["extra"], json!(42));
    }
}
