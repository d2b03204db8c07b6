use crate::conditions::ConditionNode;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use uuid::Uuid;

// ─── Well-known constants ─────────────────────────────────────

/// Sentinel parent id carried by root processes.
pub const SYSTEM_PARENT: &str = "SYSTEM";

/// Extension of tool IO bodies (`arguments.aio`, `response.aio`).
pub const AIO_EXT: &str = ".aio";

pub const TOOL_IO_FILE_TYPE: &str = "ratio::agent_io";
pub const DIRECTORY_FILE_TYPE: &str = "ratio::directory";
pub const PLAIN_FILE_TYPE: &str = "ratio::file";
pub const TOOL_DEFINITION_FILE_TYPE: &str = "ratio::tool";

/// Prefix of every per-process directory under a working directory.
pub const EXEC_DIR_PREFIX: &str = "agent_exec-";

// ─── Process ──────────────────────────────────────────────────

/// Runtime status of a process. Transitions are monotone:
/// `Running` → exactly one terminal state, never back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Skipped,
    Terminated,
    TimedOut,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Completed => "COMPLETED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Skipped => "SKIPPED",
            ProcessStatus::Terminated => "TERMINATED",
            ProcessStatus::TimedOut => "TIMED_OUT",
        }
    }
}

/// A runtime record of one execution. Composite runs produce a tree of
/// processes; children are fully owned by their parent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Process {
    pub process_id: String,
    /// `"SYSTEM"` for root processes.
    pub parent_process_id: String,
    pub process_owner: String,
    pub working_directory: String,
    /// The execution id this process implements within its parent's
    /// composite. Absent on roots.
    pub execution_id: Option<String>,
    pub execution_status: ProcessStatus,
    pub arguments_path: Option<String>,
    pub response_path: Option<String>,
    pub status_message: Option<String>,
    pub started_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
}

impl Process {
    /// Create a new root process in `Running` state.
    pub fn new(process_owner: &str, working_directory: &str) -> Self {
        Self {
            process_id: Uuid::now_v7().to_string(),
            parent_process_id: SYSTEM_PARENT.to_string(),
            process_owner: process_owner.to_string(),
            working_directory: working_directory.to_string(),
            execution_id: None,
            execution_status: ProcessStatus::Running,
            arguments_path: None,
            response_path: None,
            status_message: None,
            started_on: Utc::now(),
            ended_on: None,
        }
    }

    /// Create a child of this process for the given execution id.
    pub fn create_child(
        &self,
        execution_id: &str,
        process_owner: &str,
        working_directory: &str,
        execution_status: ProcessStatus,
    ) -> Self {
        Self {
            process_id: Uuid::now_v7().to_string(),
            parent_process_id: self.process_id.clone(),
            process_owner: process_owner.to_string(),
            working_directory: working_directory.to_string(),
            execution_id: Some(execution_id.to_string()),
            execution_status,
            arguments_path: None,
            response_path: None,
            status_message: None,
            started_on: Utc::now(),
            ended_on: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_process_id == SYSTEM_PARENT
    }
}

// ─── Attribute schema ─────────────────────────────────────────

/// Declared type of an argument or response attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    List,
    Object,
    File,
    Any,
}

impl AttributeType {
    /// The null value a skipped execution synthesizes for this type.
    pub fn null_value(&self) -> Value {
        match self {
            AttributeType::List => Value::Array(Vec::new()),
            AttributeType::Object => Value::Object(Map::new()),
            _ => Value::Null,
        }
    }

    /// Whether a runtime JSON value satisfies this declared type.
    /// `Any` matches everything; `File` is carried as a string path.
    pub fn matches_value(&self, value: &Value) -> bool {
        match self {
            AttributeType::Any => true,
            AttributeType::String | AttributeType::File => value.is_string(),
            AttributeType::Number => value.is_number(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::List => value.is_array(),
            AttributeType::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Number => "number",
            AttributeType::Boolean => "boolean",
            AttributeType::List => "list",
            AttributeType::Object => "object",
            AttributeType::File => "file",
            AttributeType::Any => "any",
        }
    }
}

/// One declared attribute of an argument or response schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub type_name: AttributeType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_pattern: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// When present, the attribute is only required while at least one
    /// clause evaluates true against the body being validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_conditions: Option<Vec<ConditionNode>>,
}

// ─── Tool definitions and instructions ────────────────────────

/// Spec of a parallel fan-out. The instruction is expanded at runtime to
/// one sibling per element of the resolved `iterate_over` list; sibling
/// *i* receives the element under the `item_argument` name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelSpec {
    /// A `REF:` string resolving to a list, or an inline list.
    pub iterate_over: Value,
    /// Argument name each sibling receives its element under.
    pub item_argument: String,
}

/// A transform block: named variables (values may contain `REF:` strings)
/// plus output-path → mapping-rule pairs evaluated by the transform DSL.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub transforms: Map<String, Value>,
}

/// One instruction of a composite definition, as authored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawInstruction {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_definition: Option<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_definition_path: Option<String>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_execution: Option<ParallelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_arguments: Option<TransformSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_responses: Option<TransformSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// A tool definition: leaf (has `system_event_endpoint`) or composite
/// (has `instructions`). Exactly one of the two is present.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(default)]
    pub arguments: Vec<AttributeDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Vec<RawInstruction>>,
    #[serde(default)]
    pub responses: Vec<AttributeDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_reference_map: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_event_endpoint: Option<String>,
    /// Where this definition was loaded from, when it came from storage.
    #[serde(skip)]
    pub original_file_path: Option<String>,
}

impl ToolDefinition {
    pub fn is_composite(&self) -> bool {
        self.system_event_endpoint.is_none()
    }

    /// Structural check: exactly one of endpoint / instructions.
    pub fn validate_shape(&self) -> EngineResult<()> {
        match (&self.instructions, &self.system_event_endpoint) {
            (None, None) => Err(EngineError::InvalidSchema(
                "tool definition must have either instructions or system_event_endpoint".into(),
            )),
            (Some(_), Some(_)) => Err(EngineError::InvalidSchema(
                "tool definition cannot have both instructions and system_event_endpoint".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// A loaded instruction: the authored fields plus its resolved definition.
#[derive(Clone, Debug)]
pub struct ToolInstruction {
    pub execution_id: String,
    pub definition: ToolDefinition,
    pub provided_arguments: Map<String, Value>,
    pub conditions: Vec<ConditionNode>,
    pub parallel_execution: Option<ParallelSpec>,
    pub transform_arguments: Option<TransformSpec>,
    pub transform_responses: Option<TransformSpec>,
    pub dependencies: Vec<String>,
}

impl ToolInstruction {
    /// Execution ids this instruction depends on: every `REF:<base>.`
    /// whose base is another execution id, found anywhere in the
    /// arguments, conditions, parallel spec, or transform blocks, plus
    /// the explicit `dependencies` list.
    pub fn dependency_ids(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self.dependencies.iter().cloned().collect();

        for value in self.provided_arguments.values() {
            collect_ref_bases(value, &mut deps);
        }

        if let Ok(conditions) = serde_json::to_value(&self.conditions) {
            collect_ref_bases(&conditions, &mut deps);
        }

        if let Some(parallel) = &self.parallel_execution {
            collect_ref_bases(&parallel.iterate_over, &mut deps);
        }

        for transform in [&self.transform_arguments, &self.transform_responses]
            .into_iter()
            .flatten()
        {
            for value in transform.variables.values() {
                collect_ref_bases(value, &mut deps);
            }
            for value in transform.transforms.values() {
                collect_ref_bases(value, &mut deps);
            }
        }

        deps
    }
}

/// Walk a JSON value collecting the `<base>` of every `REF:<base>.<key>`
/// string that names another execution (not `arguments`/`execution`/`self`).
pub fn collect_ref_bases(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(base) = execution_ref_base(s) {
                out.insert(base.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_ref_bases(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_ref_bases(item, out);
            }
        }
        _ => {}
    }
}

/// The `<base>` of a `REF:` string when it names an execution id.
pub fn execution_ref_base(s: &str) -> Option<&str> {
    let rest = s.strip_prefix("REF:")?;
    let base = rest.split('.').next()?;
    if base.is_empty() || matches!(base, "arguments" | "execution" | "self") {
        return None;
    }
    // A parallel sibling reference depends on the logical base node.
    Some(base.split('[').next().unwrap_or(base))
}

// ─── Execution id helpers ─────────────────────────────────────

fn execution_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

fn parallel_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)\[(\d+)\]$").expect("static regex"))
}

/// Whether an authored execution id is well-formed.
pub fn is_valid_execution_id(execution_id: &str) -> bool {
    execution_id_regex().is_match(execution_id)
}

/// Synthetic sibling id for index `i` of a parallel group.
pub fn parallel_sibling_id(base: &str, index: usize) -> String {
    format!("{base}[{index}]")
}

/// Split a synthetic sibling id into `(base, index)`. Returns `None` for
/// ordinary execution ids.
pub fn split_parallel_id(execution_id: &str) -> Option<(&str, usize)> {
    let caps = parallel_id_regex().captures(execution_id)?;
    let base = caps.get(1)?.as_str();
    let index = caps.get(2)?.as_str().parse().ok()?;
    Some((base, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_process_status_monotone_helpers() {
        assert!(!ProcessStatus::Running.is_terminal());
        for status in [
            ProcessStatus::Completed,
            ProcessStatus::Failed,
            ProcessStatus::Skipped,
            ProcessStatus::Terminated,
            ProcessStatus::TimedOut,
        ] {
            assert!(status.is_terminal());
        }
        assert_eq!(
            serde_json::to_value(ProcessStatus::TimedOut).unwrap(),
            json!("TIMED_OUT")
        );
    }

    #[test]
    fn test_create_child_links_parent() {
        let root = Process::new("admin", "/work");
        assert!(root.is_root());

        let child = root.create_child("step_one", "admin", "/work", ProcessStatus::Running);
        assert_eq!(child.parent_process_id, root.process_id);
        assert_eq!(child.execution_id.as_deref(), Some("step_one"));
        assert!(!child.is_root());
    }

    #[test]
    fn test_definition_shape_validation() {
        let neither = ToolDefinition::default();
        assert!(neither.validate_shape().is_err());

        let leaf = ToolDefinition {
            system_event_endpoint: Some("ratio::math".into()),
            ..Default::default()
        };
        assert!(leaf.validate_shape().is_ok());
        assert!(!leaf.is_composite());

        let composite = ToolDefinition {
            instructions: Some(vec![]),
            ..Default::default()
        };
        assert!(composite.validate_shape().is_ok());
        assert!(composite.is_composite());
    }

    #[test]
    fn test_dependency_scan_covers_all_blocks() {
        let instruction = ToolInstruction {
            execution_id: "final".into(),
            definition: ToolDefinition {
                system_event_endpoint: Some("ratio::concat".into()),
                ..Default::default()
            },
            provided_arguments: serde_json::from_value(json!({
                "left": "REF:step_a.out",
                "nested": {"deep": ["REF:step_b.out"]},
                "plain": "not a ref",
                "args": "REF:arguments.seed"
            }))
            .unwrap(),
            conditions: serde_json::from_value(json!([
                {"param": "REF:gate.allowed", "operator": "equals", "value": true}
            ]))
            .unwrap(),
            parallel_execution: Some(ParallelSpec {
                iterate_over: json!("REF:fanout.response"),
                item_argument: "item".into(),
            }),
            transform_arguments: Some(TransformSpec {
                variables: serde_json::from_value(json!({"rows": "REF:loader.rows"})).unwrap(),
                transforms: Map::new(),
            }),
            transform_responses: None,
            dependencies: vec!["explicit".into()],
        };

        let deps = instruction.dependency_ids();
        for expected in ["step_a", "step_b", "gate", "fanout", "loader", "explicit"] {
            assert!(deps.contains(expected), "missing {expected}");
        }
        assert!(!deps.contains("arguments"));
    }

    #[test]
    fn test_execution_id_validation() {
        assert!(is_valid_execution_id("step_one-2"));
        assert!(!is_valid_execution_id("bad id"));
        assert!(!is_valid_execution_id("dot.ted"));
        assert!(!is_valid_execution_id(""));
    }

    #[test]
    fn test_parallel_id_round_trip() {
        let id = parallel_sibling_id("fanout", 3);
        assert_eq!(id, "fanout[3]");
        assert_eq!(split_parallel_id(&id), Some(("fanout", 3)));
        assert_eq!(split_parallel_id("fanout"), None);
    }

    #[test]
    fn test_sibling_ref_depends_on_base() {
        assert_eq!(execution_ref_base("REF:fanout[2].out"), Some("fanout"));
        assert_eq!(execution_ref_base("REF:self.thing"), None);
        assert_eq!(execution_ref_base("no-ref"), None);
    }

    #[test]
    fn test_null_values_by_type() {
        assert_eq!(AttributeType::List.null_value(), json!([]));
        assert_eq!(AttributeType::Object.null_value(), json!({}));
        assert_eq!(AttributeType::String.null_value(), Value::Null);
    }
}
