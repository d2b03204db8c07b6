use crate::error::{EngineError, EngineResult};
use crate::storage::{
    self, DescribeFileRequest, GetFileVersionRequest, StorageClient,
};
use crate::types::{AttributeDef, AttributeType};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

// ─── Reference value types ────────────────────────────────────

/// The resolved type a stored value carries. `Any` never appears here:
/// it is inferred away when the value enters the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefType {
    String,
    Number,
    Boolean,
    List,
    Object,
    File,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::String => "string",
            RefType::Number => "number",
            RefType::Boolean => "boolean",
            RefType::List => "list",
            RefType::Object => "object",
            RefType::File => "file",
        }
    }
}

/// Infer a reference type from a runtime value
/// (bool < number < list < object < string precedence).
pub fn infer_type(value: &Value) -> RefType {
    match value {
        Value::Bool(_) => RefType::Boolean,
        Value::Number(_) => RefType::Number,
        Value::Array(_) => RefType::List,
        Value::Object(_) => RefType::Object,
        _ => RefType::String,
    }
}

/// Resolve a declared attribute type to the reference type a value should
/// be stored under. `Any` is inferred from the value.
pub fn ref_type_for(declared: AttributeType, value: &Value) -> RefType {
    match declared {
        AttributeType::String => RefType::String,
        AttributeType::Number => RefType::Number,
        AttributeType::Boolean => RefType::Boolean,
        AttributeType::List => RefType::List,
        AttributeType::Object => RefType::Object,
        AttributeType::File => RefType::File,
        AttributeType::Any => infer_type(value),
    }
}

/// A typed wrapper over an underlying value. File values hold only a
/// storage path; their content is materialized lazily at resolution time.
#[derive(Clone, Debug, PartialEq)]
pub struct RefValue {
    pub type_name: RefType,
    value: Value,
}

impl RefValue {
    pub fn new(type_name: RefType, value: Value) -> Self {
        Self { type_name, value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Apply an optional typed accessor and return the plain value.
    /// All accessors other than the documented ones fail.
    async fn referenced_value(
        &self,
        attribute: Option<&str>,
        token: Option<&str>,
        storage: &Arc<dyn StorageClient>,
    ) -> EngineResult<Value> {
        match self.type_name {
            RefType::String => self.scalar(attribute, "string", |v| match v {
                Value::String(_) => v.clone(),
                other => Value::String(other.to_string()),
            }),
            RefType::Boolean => self.scalar(attribute, "boolean", |v| match v {
                Value::Bool(_) => v.clone(),
                other => Value::Bool(truthy(other)),
            }),
            RefType::Number => {
                if attribute.is_some() {
                    return Err(EngineError::InvalidReference(
                        "number reference values do not support attributes".into(),
                    ));
                }
                number_value(&self.value)
            }
            RefType::List => self.list_value(attribute),
            RefType::Object => self.object_value(attribute),
            RefType::File => self.file_value(attribute, token, storage).await,
        }
    }

    fn scalar(
        &self,
        attribute: Option<&str>,
        type_label: &str,
        coerce: impl Fn(&Value) -> Value,
    ) -> EngineResult<Value> {
        if attribute.is_some() {
            return Err(EngineError::InvalidReference(format!(
                "{type_label} reference values do not support attributes"
            )));
        }
        if self.value.is_null() {
            return Ok(Value::Null);
        }
        Ok(coerce(&self.value))
    }

    fn list_value(&self, attribute: Option<&str>) -> EngineResult<Value> {
        let Some(attribute) = attribute else {
            return match &self.value {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => Ok(Value::Array(items.clone())),
                other => Err(EngineError::InvalidReference(format!(
                    "expected a list, found {other}"
                ))),
            };
        };

        let items = match &self.value {
            Value::Array(items) if !items.is_empty() => items,
            _ => {
                return Err(EngineError::InvalidReference(
                    "attribute access is only supported for non-empty list reference values".into(),
                ))
            }
        };

        match attribute {
            "length" => Ok(Value::Number(Number::from(items.len()))),
            "first" => Ok(items[0].clone()),
            "last" => Ok(items[items.len() - 1].clone()),
            index => {
                let index: usize = index.parse().map_err(|_| {
                    EngineError::InvalidReference(format!(
                        "unsupported list accessor '{index}'"
                    ))
                })?;
                items.get(index).cloned().ok_or_else(|| {
                    EngineError::InvalidReference(format!("index out of range: {index}"))
                })
            }
        }
    }

    fn object_value(&self, attribute: Option<&str>) -> EngineResult<Value> {
        match attribute {
            None => match &self.value {
                Value::Null => Ok(Value::Object(Map::new())),
                Value::Object(map) => Ok(Value::Object(map.clone())),
                other => Err(EngineError::InvalidReference(format!(
                    "expected an object, found {other}"
                ))),
            },
            Some(key) => match &self.value {
                Value::Object(map) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
                _ => Err(EngineError::InvalidReference(
                    "attribute access is only supported for non-empty object reference values"
                        .into(),
                )),
            },
        }
    }

    async fn file_value(
        &self,
        attribute: Option<&str>,
        token: Option<&str>,
        storage: &Arc<dyn StorageClient>,
    ) -> EngineResult<Value> {
        let path = self
            .value
            .as_str()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidReference(
                    "file reference value is empty, no path to fetch".into(),
                )
            })?;

        // Derived-path accessors need no storage round trip.
        match attribute {
            Some("file_name") => return Ok(Value::String(storage::file_name(path).to_string())),
            Some("path") => return Ok(Value::String(path.to_string())),
            Some("parent_directory") => {
                return Ok(Value::String(storage::parent_directory(path)))
            }
            _ => {}
        }

        let token = token.ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!(
                "token is required to dereference file: {path}"
            ))
        })?;

        match attribute {
            None => {
                let response = storage
                    .get_file_version(
                        token,
                        GetFileVersionRequest {
                            file_path: path.to_string(),
                            version_id: None,
                        },
                    )
                    .await?;

                if response.status_code != 200 {
                    return Err(EngineError::InvalidReference(format!(
                        "failed to get file {path}: {} - {}",
                        response.status_code,
                        response.message()
                    )));
                }

                Ok(response.data().cloned().unwrap_or(Value::Null))
            }
            Some(metadata_field) => {
                let response = storage
                    .describe_file(
                        token,
                        DescribeFileRequest {
                            file_path: path.to_string(),
                        },
                    )
                    .await?;

                if response.status_code != 200 {
                    return Err(EngineError::InvalidReference(format!(
                        "failed to describe file {path}: {} - {}",
                        response.status_code,
                        response.message()
                    )));
                }

                response.body.get(metadata_field).cloned().ok_or_else(|| {
                    EngineError::InvalidReference(format!(
                        "file {path} has no metadata field '{metadata_field}'"
                    ))
                })
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Normalize a number-typed value: integral numbers come back as ints,
/// everything else as a float. Numeric strings are parsed.
fn number_value(value: &Value) -> EngineResult<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => Ok(Value::Number(n.clone())),
        Value::String(s) => {
            if let Ok(int) = s.parse::<i64>() {
                return Ok(Value::Number(Number::from(int)));
            }
            let float: f64 = s.parse().map_err(|_| {
                EngineError::InvalidReference(format!("'{s}' is not a number"))
            })?;
            Number::from_f64(float)
                .map(Value::Number)
                .ok_or_else(|| EngineError::InvalidReference(format!("'{s}' is not a number")))
        }
        other => Err(EngineError::InvalidReference(format!(
            "expected a number, found {other}"
        ))),
    }
}

// ─── Reference store ──────────────────────────────────────────

/// Per-engine reference store: typed argument values plus the response
/// sets of completed executions. A response set is immutable once
/// written for the life of the engine.
pub struct Reference {
    storage: Arc<dyn StorageClient>,
    arguments: BTreeMap<String, RefValue>,
    responses: BTreeMap<String, BTreeMap<String, RefValue>>,
}

impl Reference {
    pub fn new(storage: Arc<dyn StorageClient>) -> Self {
        Self {
            storage,
            arguments: BTreeMap::new(),
            responses: BTreeMap::new(),
        }
    }

    /// Load arguments, wrapping each value in the type its schema
    /// declares. Undeclared arguments are inferred from their value.
    pub fn set_arguments(&mut self, arguments: &Map<String, Value>, schema: &[AttributeDef]) {
        self.arguments.clear();
        for (name, value) in arguments {
            let declared = schema
                .iter()
                .find(|attr| &attr.name == name)
                .map(|attr| attr.type_name)
                .unwrap_or(AttributeType::Any);
            let type_name = ref_type_for(declared, value);
            self.arguments
                .insert(name.clone(), RefValue::new(type_name, value.clone()));
        }
    }

    /// Record one response field of a completed execution.
    pub fn add_response(
        &mut self,
        execution_id: &str,
        response_key: &str,
        response_value: Value,
        response_type: AttributeType,
    ) {
        let type_name = ref_type_for(response_type, &response_value);
        self.responses
            .entry(execution_id.to_string())
            .or_default()
            .insert(
                response_key.to_string(),
                RefValue::new(type_name, response_value),
            );
    }

    pub fn has_response(&self, execution_id: &str) -> bool {
        self.responses.contains_key(execution_id)
    }

    /// Parse `REF:<base>.<key>[.<attr>]` into its parts.
    pub fn parse_ref(reference_string: &str) -> EngineResult<(String, String, Option<String>)> {
        let rest = reference_string.strip_prefix("REF:").ok_or_else(|| {
            EngineError::InvalidReference(format!("invalid REF string: {reference_string}"))
        })?;

        let mut parts = rest.splitn(3, '.');
        let base = parts.next().unwrap_or_default();
        let key = parts.next().unwrap_or_default();
        if base.is_empty() || key.is_empty() {
            return Err(EngineError::InvalidReference(format!(
                "invalid REF string: {reference_string}"
            )));
        }

        Ok((
            base.to_string(),
            key.to_string(),
            parts.next().map(str::to_string),
        ))
    }

    /// Resolve a `REF:` string to a plain value. The output never
    /// contains another reference. Missing arguments resolve to `Null`;
    /// missing execution responses are errors. File-typed values need
    /// the token to reach storage.
    pub async fn resolve(
        &self,
        reference_string: &str,
        token: Option<&str>,
    ) -> EngineResult<Value> {
        tracing::debug!(reference = %reference_string, "resolving reference");

        let (base, key, attribute) = Self::parse_ref(reference_string)?;

        let reference_obj = if base == "arguments" {
            match self.arguments.get(&key) {
                Some(obj) => obj,
                // Missing arguments resolve gracefully.
                None => return Ok(Value::Null),
            }
        } else {
            let responses = self.responses.get(&base).ok_or_else(|| {
                EngineError::InvalidReference(format!(
                    "execution id '{base}' not available for reference resolution"
                ))
            })?;
            responses.get(&key).ok_or_else(|| {
                EngineError::InvalidReference(format!(
                    "execution id '{base}' does not have key '{key}' for reference resolution"
                ))
            })?
        };

        // File-typed values demand the token themselves when they
        // actually reach storage; derived-path accessors never do.
        reference_obj
            .referenced_value(attribute.as_deref(), token, &self.storage)
            .await
    }

    /// Walk an arbitrary value, replacing every `REF:` string with its
    /// resolved value. Non-REF leaves pass through unchanged.
    pub fn resolve_value<'a>(
        &'a self,
        value: &'a Value,
        token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Value>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::String(s) if s.starts_with("REF:") => self.resolve(s, token).await,
                Value::Object(map) => {
                    let mut out = Map::with_capacity(map.len());
                    for (key, item) in map {
                        out.insert(key.clone(), self.resolve_value(item, token).await?);
                    }
                    Ok(Value::Object(out))
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_value(item, token).await?);
                    }
                    Ok(Value::Array(out))
                }
                other => Ok(other.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_memory::MemoryStorage;
    use serde_json::json;

    fn empty_reference() -> (Reference, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let reference = Reference::new(storage.clone());
        (reference, storage)
    }

    fn schema(entries: &[(&str, AttributeType)]) -> Vec<AttributeDef> {
        entries
            .iter()
            .map(|(name, type_name)| AttributeDef {
                name: name.to_string(),
                type_name: *type_name,
                required: false,
                description: None,
                regex_pattern: None,
                enum_values: None,
                default_value: None,
                required_conditions: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_argument_resolution_and_missing_is_null() {
        let (mut reference, _) = empty_reference();
        let args: Map<String, Value> =
            serde_json::from_value(json!({"greeting": "hello", "count": 2})).unwrap();
        reference.set_arguments(
            &args,
            &schema(&[
                ("greeting", AttributeType::String),
                ("count", AttributeType::Number),
            ]),
        );

        assert_eq!(
            reference.resolve("REF:arguments.greeting", None).await.unwrap(),
            json!("hello")
        );
        assert_eq!(
            reference.resolve("REF:arguments.count", None).await.unwrap(),
            json!(2)
        );
        assert_eq!(
            reference.resolve("REF:arguments.absent", None).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_missing_execution_response_is_error() {
        let (reference, _) = empty_reference();
        let err = reference
            .resolve("REF:never_ran.out", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn test_list_accessors() {
        let (mut reference, _) = empty_reference();
        reference.add_response("listing", "items", json!(["p", "q", "r"]), AttributeType::List);

        let resolve = |r: &'static str| {
            let reference = &reference;
            async move { reference.resolve(r, None).await }
        };

        assert_eq!(resolve("REF:listing.items").await.unwrap(), json!(["p", "q", "r"]));
        assert_eq!(resolve("REF:listing.items.length").await.unwrap(), json!(3));
        assert_eq!(resolve("REF:listing.items.first").await.unwrap(), json!("p"));
        assert_eq!(resolve("REF:listing.items.last").await.unwrap(), json!("r"));
        assert_eq!(resolve("REF:listing.items.1").await.unwrap(), json!("q"));
        assert!(resolve("REF:listing.items.9").await.is_err());
        assert!(resolve("REF:listing.items.shuffle").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_list_accessors_fail() {
        let (mut reference, _) = empty_reference();
        reference.add_response("listing", "items", json!([]), AttributeType::List);

        assert_eq!(
            reference.resolve("REF:listing.items", None).await.unwrap(),
            json!([])
        );
        for accessor in ["first", "last", "length", "0"] {
            let ref_string = format!("REF:listing.items.{accessor}");
            assert!(
                reference.resolve(&ref_string, None).await.is_err(),
                "{accessor} should fail on empty list"
            );
        }
    }

    #[tokio::test]
    async fn test_object_accessor() {
        let (mut reference, _) = empty_reference();
        reference.add_response(
            "shaper",
            "out",
            json!({"name": "ada", "nested": {"x": 1}}),
            AttributeType::Object,
        );

        assert_eq!(
            reference.resolve("REF:shaper.out.name", None).await.unwrap(),
            json!("ada")
        );
        assert_eq!(
            reference.resolve("REF:shaper.out.missing", None).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_number_normalization() {
        let (mut reference, _) = empty_reference();
        reference.add_response("calc", "int_ish", json!("42"), AttributeType::Number);
        reference.add_response("calc", "float_ish", json!("2.5"), AttributeType::Number);

        assert_eq!(reference.resolve("REF:calc.int_ish", None).await.unwrap(), json!(42));
        assert_eq!(
            reference.resolve("REF:calc.float_ish", None).await.unwrap(),
            json!(2.5)
        );
    }

    #[tokio::test]
    async fn test_scalar_attribute_rejected() {
        let (mut reference, _) = empty_reference();
        reference.add_response("step", "word", json!("hi"), AttributeType::String);
        assert!(reference.resolve("REF:step.word.upper", None).await.is_err());
    }

    #[tokio::test]
    async fn test_null_responses_resolve_to_null() {
        let (mut reference, _) = empty_reference();
        reference.add_response("skipped", "x", Value::Null, AttributeType::String);
        assert_eq!(
            reference.resolve("REF:skipped.x", None).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_file_derived_accessors_without_storage() {
        let (mut reference, _) = empty_reference();
        reference.add_response("writer", "report", json!("/a"), AttributeType::File);

        assert_eq!(
            reference
                .resolve("REF:writer.report.parent_directory", None)
                .await
                .unwrap(),
            json!("/")
        );
        assert_eq!(
            reference
                .resolve("REF:writer.report.file_name", None)
                .await
                .unwrap(),
            json!("a")
        );
        assert_eq!(
            reference.resolve("REF:writer.report.path", None).await.unwrap(),
            json!("/a")
        );
    }

    #[tokio::test]
    async fn test_file_content_fetch() {
        let (mut reference, storage) = empty_reference();
        storage.seed_file("/data/report.txt", "ratio::file", "body text").await;
        reference.add_response("writer", "report", json!("/data/report.txt"), AttributeType::File);

        assert_eq!(
            reference
                .resolve("REF:writer.report", Some("tok"))
                .await
                .unwrap(),
            json!("body text")
        );
        // Without a token the dereference is rejected.
        assert!(reference.resolve("REF:writer.report", None).await.is_err());
    }

    #[tokio::test]
    async fn test_nested_resolution_is_idempotent() {
        let (mut reference, _) = empty_reference();
        let args: Map<String, Value> = serde_json::from_value(json!({"word": "hi"})).unwrap();
        reference.set_arguments(&args, &schema(&[("word", AttributeType::String)]));

        let input = json!({
            "direct": "REF:arguments.word",
            "nested": [{"inner": "REF:arguments.word"}, "plain"],
            "untouched": 7
        });
        let resolved = reference.resolve_value(&input, None).await.unwrap();
        assert_eq!(
            resolved,
            json!({
                "direct": "hi",
                "nested": [{"inner": "hi"}, "plain"],
                "untouched": 7
            })
        );

        // resolve(resolve(x)) == resolve(x): no REF survives in the output.
        let again = reference.resolve_value(&resolved, None).await.unwrap();
        assert_eq!(again, resolved);
    }

    #[test]
    fn test_parse_ref_shapes() {
        assert_eq!(
            Reference::parse_ref("REF:arguments.input_file.path").unwrap(),
            (
                "arguments".to_string(),
                "input_file".to_string(),
                Some("path".to_string())
            )
        );
        assert!(Reference::parse_ref("arguments.input_file").is_err());
        assert!(Reference::parse_ref("REF:onlybase").is_err());
    }
}
