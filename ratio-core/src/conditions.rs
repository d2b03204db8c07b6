use crate::error::{EngineError, EngineResult};
use crate::reference::Reference;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

// ─── Condition data model ─────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupLogic {
    #[default]
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Exists,
    NotExists,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    StartsWith,
    EndsWith,
}

/// A single comparison. `param` may be a literal or a `REF:` string
/// resolved at evaluation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub param: Value,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Grouped clauses combined with `logic` (default AND). Groups nest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: GroupLogic,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

/// Either shape, distinguished by the presence of `param`/`operator`.
/// `Single` is tried first: a group has neither field, and every group
/// field is optional, so the group shape must stay the fallback.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Single(Condition),
    Group(ConditionGroup),
}

// ─── Operator application ─────────────────────────────────────

/// Native ordering of two resolved values. `None` when the types do not
/// order against each other.
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> EngineResult<bool> {
    match haystack {
        Value::String(s) => {
            let needle = match needle {
                Value::String(n) => n.clone(),
                other => other.to_string(),
            };
            Ok(s.contains(&needle))
        }
        Value::Array(items) => Ok(items.contains(needle)),
        Value::Object(map) => {
            let key = needle
                .as_str()
                .ok_or_else(|| EngineError::InvalidSchema("object membership needs a string key".into()))?;
            Ok(map.contains_key(key))
        }
        _ => Err(EngineError::InvalidSchema(format!(
            "contains is not defined for {haystack}"
        ))),
    }
}

fn as_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Apply one comparison operator. Errors indicate a type mismatch; the
/// evaluator treats those as a false clause rather than aborting the group.
pub(crate) fn apply_operator(
    actual: &Value,
    operator: ConditionOperator,
    expected: Option<&Value>,
) -> EngineResult<bool> {
    let expect = || {
        expected.ok_or_else(|| {
            EngineError::InvalidSchema(format!("operator {operator:?} requires a value"))
        })
    };

    match operator {
        ConditionOperator::Equals => Ok(actual == expect()?),
        ConditionOperator::NotEquals => Ok(actual != expect()?),
        ConditionOperator::Exists => Ok(!actual.is_null()),
        ConditionOperator::NotExists => Ok(actual.is_null()),
        ConditionOperator::GreaterThan => compare_values(actual, expect()?)
            .map(|ord| ord == Ordering::Greater)
            .ok_or_else(|| EngineError::InvalidSchema("values are not comparable".into())),
        ConditionOperator::LessThan => compare_values(actual, expect()?)
            .map(|ord| ord == Ordering::Less)
            .ok_or_else(|| EngineError::InvalidSchema("values are not comparable".into())),
        ConditionOperator::GreaterThanOrEqual => compare_values(actual, expect()?)
            .map(|ord| ord != Ordering::Less)
            .ok_or_else(|| EngineError::InvalidSchema("values are not comparable".into())),
        ConditionOperator::LessThanOrEqual => compare_values(actual, expect()?)
            .map(|ord| ord != Ordering::Greater)
            .ok_or_else(|| EngineError::InvalidSchema("values are not comparable".into())),
        ConditionOperator::Contains => contains(actual, expect()?),
        ConditionOperator::NotContains => contains(actual, expect()?).map(|b| !b),
        ConditionOperator::In => contains(expect()?, actual),
        ConditionOperator::NotIn => contains(expect()?, actual).map(|b| !b),
        ConditionOperator::StartsWith => Ok(as_display_string(actual)
            .starts_with(&as_display_string(expect()?))),
        ConditionOperator::EndsWith => {
            Ok(as_display_string(actual).ends_with(&as_display_string(expect()?)))
        }
    }
}

// ─── Evaluator ────────────────────────────────────────────────

/// Evaluates condition trees against a reference store. `REF:` params are
/// resolved through the store; a clause that fails to resolve or compare
/// is logged and counts as false without failing its group.
pub struct ConditionEvaluator<'a> {
    reference: &'a Reference,
    token: &'a str,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(reference: &'a Reference, token: &'a str) -> Self {
        Self { reference, token }
    }

    /// Top-level entry: a bare list of clauses combines with AND.
    pub async fn evaluate(&self, conditions: &[ConditionNode]) -> bool {
        self.evaluate_list(conditions, GroupLogic::And).await
    }

    fn evaluate_list<'b>(
        &'b self,
        conditions: &'b [ConditionNode],
        logic: GroupLogic,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'b>> {
        Box::pin(async move {
            if conditions.is_empty() {
                return true;
            }

            let mut results = Vec::with_capacity(conditions.len());
            for node in conditions {
                let result = match node {
                    ConditionNode::Group(group) => {
                        self.evaluate_list(&group.conditions, group.logic).await
                    }
                    ConditionNode::Single(condition) => self.evaluate_single(condition).await,
                };
                results.push(result);
            }

            match logic {
                GroupLogic::And => results.iter().all(|r| *r),
                GroupLogic::Or => results.iter().any(|r| *r),
            }
        })
    }

    async fn evaluate_single(&self, condition: &Condition) -> bool {
        let actual = match &condition.param {
            Value::String(s) if s.starts_with("REF:") => {
                match self.reference.resolve(s, Some(self.token)).await {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(reference = %s, error = %err, "condition param failed to resolve");
                        return false;
                    }
                }
            }
            other => other.clone(),
        };

        match apply_operator(&actual, condition.operator, condition.value.as_ref()) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "condition evaluation failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Reference;
    use crate::storage_memory::MemoryStorage;
    use crate::types::AttributeType;
    use serde_json::json;
    use std::sync::Arc;

    fn reference_with(values: &[(&str, &str, Value, AttributeType)]) -> Reference {
        let mut reference = Reference::new(Arc::new(MemoryStorage::new()));
        for (execution_id, key, value, type_name) in values {
            reference.add_response(execution_id, key, value.clone(), *type_name);
        }
        reference
    }

    fn single(param: Value, operator: ConditionOperator, value: Option<Value>) -> ConditionNode {
        ConditionNode::Single(Condition {
            param,
            operator,
            value,
        })
    }

    #[tokio::test]
    async fn test_empty_conditions_are_true() {
        let reference = reference_with(&[]);
        let evaluator = ConditionEvaluator::new(&reference, "tok");
        assert!(evaluator.evaluate(&[]).await);
    }

    #[tokio::test]
    async fn test_ref_param_resolution() {
        let reference = reference_with(&[("count_step", "n", json!(3), AttributeType::Number)]);
        let evaluator = ConditionEvaluator::new(&reference, "tok");

        let passing = single(
            json!("REF:count_step.n"),
            ConditionOperator::GreaterThan,
            Some(json!(0)),
        );
        assert!(evaluator.evaluate(&[passing]).await);

        let failing = single(
            json!("REF:count_step.n"),
            ConditionOperator::GreaterThan,
            Some(json!(10)),
        );
        assert!(!evaluator.evaluate(&[failing]).await);
    }

    #[tokio::test]
    async fn test_group_logic_or() {
        let reference = reference_with(&[]);
        let evaluator = ConditionEvaluator::new(&reference, "tok");

        let group: Vec<ConditionNode> = serde_json::from_value(json!([{
            "logic": "OR",
            "conditions": [
                {"param": "a", "operator": "equals", "value": "b"},
                {"param": 1, "operator": "less_than", "value": 2}
            ]
        }]))
        .unwrap();
        assert!(evaluator.evaluate(&group).await);

        let lowercase: Vec<ConditionNode> = serde_json::from_value(json!([{
            "logic": "or",
            "conditions": [
                {"param": "a", "operator": "equals", "value": "a"}
            ]
        }]))
        .unwrap();
        assert!(evaluator.evaluate(&lowercase).await);
    }

    #[tokio::test]
    async fn test_type_mismatch_fails_clause_not_group() {
        let reference = reference_with(&[]);
        let evaluator = ConditionEvaluator::new(&reference, "tok");

        // "text" > 5 is a mismatch -> clause false; OR sibling still wins.
        let group: Vec<ConditionNode> = serde_json::from_value(json!([{
            "logic": "OR",
            "conditions": [
                {"param": "text", "operator": "greater_than", "value": 5},
                {"param": true, "operator": "exists"}
            ]
        }]))
        .unwrap();
        assert!(evaluator.evaluate(&group).await);
    }

    #[tokio::test]
    async fn test_membership_and_string_operators() {
        let reference = reference_with(&[]);
        let evaluator = ConditionEvaluator::new(&reference, "tok");

        let cases: Vec<ConditionNode> = serde_json::from_value(json!([
            {"param": "needle", "operator": "in", "value": ["hay", "needle"]},
            {"param": ["a", "b"], "operator": "contains", "value": "a"},
            {"param": "prefix-rest", "operator": "starts_with", "value": "prefix"},
            {"param": "rest-suffix", "operator": "ends_with", "value": "suffix"},
            {"param": "abcdef", "operator": "not_contains", "value": "xyz"}
        ]))
        .unwrap();
        assert!(evaluator.evaluate(&cases).await);
    }

    #[tokio::test]
    async fn test_unknown_ref_is_false() {
        let reference = reference_with(&[]);
        let evaluator = ConditionEvaluator::new(&reference, "tok");
        let clause = single(
            json!("REF:never_ran.out"),
            ConditionOperator::Exists,
            None,
        );
        assert!(!evaluator.evaluate(&[clause]).await);
    }
}
