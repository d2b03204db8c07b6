//! The transform pipeline DSL applied by `transform_arguments` /
//! `transform_responses` blocks: a small parser producing an expression
//! tree, evaluated by an interpreter over a function registry. Rules are
//! data, never code; there is no general evaluation of untrusted input.

mod functions;
pub mod parser;

pub use parser::{parse_rule, Expr};

use crate::error::MappingError;
use crate::storage::StorageClient;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};

/// Evaluation context: the resolved variables in scope, plus the token
/// and storage handle the file-reading functions use. Identical storage
/// reads within one evaluation are cached.
pub struct TransformContext {
    pub variables: Map<String, Value>,
    pub token: String,
    pub storage: Arc<dyn StorageClient>,
    cache: Mutex<HashMap<String, Value>>,
}

impl TransformContext {
    pub fn new(variables: Map<String, Value>, token: &str, storage: Arc<dyn StorageClient>) -> Self {
        Self {
            variables,
            token: token.to_string(),
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str) -> Option<Value> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn cache_put(&self, key: &str, value: Value) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), value);
        }
    }
}

/// Evaluate every mapping rule of a transform block and assemble the
/// output object. Dotted output paths nest.
pub async fn map_object(
    ctx: &TransformContext,
    transforms: &Map<String, Value>,
) -> Result<Map<String, Value>, MappingError> {
    let mut result = Map::new();

    for (output_path, rule) in transforms {
        let rule_str = rule
            .as_str()
            .ok_or_else(|| MappingError::at("mapping rule must be a string", output_path))?;

        let expr = parse_rule(rule_str)
            .map_err(|err| MappingError::at(err.message, output_path))?;

        let value = eval(ctx, &expr, &ctx.variables)
            .await
            .map_err(|err| match err.path {
                Some(_) => err,
                None => MappingError::at(err.message, output_path),
            })?;

        set_nested_value(&mut result, output_path, value);
    }

    Ok(result)
}

/// Evaluate a single already-parsed rule against the context variables.
pub async fn evaluate(ctx: &TransformContext, expr: &Expr) -> Result<Value, MappingError> {
    eval(ctx, expr, &ctx.variables).await
}

fn eval<'a>(
    ctx: &'a TransformContext,
    expr: &'a Expr,
    scope: &'a Map<String, Value>,
) -> Pin<Box<dyn Future<Output = Result<Value, MappingError>> + Send + 'a>> {
    Box::pin(async move {
        match expr {
            Expr::StrLit(s) => Ok(Value::String(s.clone())),
            Expr::NumLit(n) => Ok(Value::Number(n.clone())),
            Expr::BoolLit(b) => Ok(Value::Bool(*b)),
            Expr::Array(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(eval(ctx, element, scope).await?);
                }
                Ok(Value::Array(out))
            }
            Expr::Object(pairs) => {
                let mut out = Map::with_capacity(pairs.len());
                for (key, value) in pairs {
                    out.insert(key.clone(), eval(ctx, value, scope).await?);
                }
                Ok(Value::Object(out))
            }
            Expr::Path(path) => {
                // Item paths stay literal; the collection functions
                // resolve them per element.
                if path.starts_with("item.") {
                    return Ok(Value::String(path.clone()));
                }
                resolve_path(scope, path)
            }
            Expr::Call { name, args, kwargs } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(eval(ctx, arg, scope).await?);
                }
                let mut kwarg_values = Map::with_capacity(kwargs.len());
                for (param, value) in kwargs {
                    kwarg_values.insert(param.clone(), eval(ctx, value, scope).await?);
                }
                functions::apply(ctx, name, arg_values, kwarg_values).await
            }
            Expr::Pipeline { initial, ops } => {
                let mut current = eval(ctx, initial, scope).await?;
                for (step, op) in ops.iter().enumerate() {
                    let mut step_scope = scope.clone();
                    step_scope.insert("current".to_string(), current);
                    current = eval(ctx, op, &step_scope).await.map_err(|err| {
                        MappingError::new(format!("pipeline step {step} failed: {}", err.message))
                    })?;
                }
                Ok(current)
            }
        }
    })
}

fn indexed_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)\[(\d+)\]$").expect("static regex"))
}

/// Walk a dotted path (with optional `name[index]` segments) through the
/// scope object.
fn resolve_path(scope: &Map<String, Value>, path: &str) -> Result<Value, MappingError> {
    let root = Value::Object(scope.clone());
    let mut current = &root;

    for part in path.split('.') {
        let (name, index) = match indexed_regex().captures(part) {
            Some(caps) => {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let index: usize = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or_default();
                (name, Some(index))
            }
            None => (part, None),
        };

        current = match current {
            Value::Object(map) => map
                .get(name)
                .ok_or_else(|| MappingError::new(format!("key '{name}' not found")))?,
            _ => return Err(MappingError::new(format!("key '{name}' not found"))),
        };

        if let Some(index) = index {
            let items = current
                .as_array()
                .ok_or_else(|| MappingError::new(format!("'{name}' is not an array")))?;
            current = items.get(index).ok_or_else(|| {
                MappingError::new(format!("index {index} out of bounds for array '{name}'"))
            })?;
        }
    }

    Ok(current.clone())
}

fn set_nested_value(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = target;

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_memory::MemoryStorage;
    use serde_json::json;

    fn context(variables: Value) -> TransformContext {
        TransformContext::new(
            serde_json::from_value(variables).unwrap(),
            "tok",
            Arc::new(MemoryStorage::new()),
        )
    }

    async fn run(ctx: &TransformContext, transforms: Value) -> Map<String, Value> {
        map_object(ctx, &serde_json::from_value(transforms).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_path_and_literal_rules() {
        let ctx = context(json!({"user": {"name": "ada"}, "rows": [{"n": 1}]}));
        let out = run(
            &ctx,
            json!({
                "who": "user.name",
                "first_n": "rows[0].n",
                "label": "'static'"
            }),
        )
        .await;
        assert_eq!(out["who"], json!("ada"));
        assert_eq!(out["first_n"], json!(1));
        assert_eq!(out["label"], json!("static"));
    }

    #[tokio::test]
    async fn test_nested_output_paths() {
        let ctx = context(json!({"total": 7}));
        let out = run(&ctx, json!({"summary.count": "total"})).await;
        assert_eq!(out["summary"]["count"], json!(7));
    }

    #[tokio::test]
    async fn test_function_rules() {
        let ctx = context(json!({"names": ["a", "b"], "rows": [{"n": 2}, {"n": 3}]}));
        let out = run(
            &ctx,
            json!({
                "joined": "join(names, '-')",
                "total": "sum(rows, \"item.n\")",
                "picked": "map(rows, \"item.n\")"
            }),
        )
        .await;
        assert_eq!(out["joined"], json!("a-b"));
        assert_eq!(out["total"], json!(5));
        assert_eq!(out["picked"], json!([2, 3]));
    }

    #[tokio::test]
    async fn test_pipeline_threads_current() {
        let ctx = context(json!({
            "rows": [{"n": 2, "keep": true}, {"n": 5, "keep": false}, {"n": 7, "keep": true}]
        }));
        let out = run(
            &ctx,
            json!({
                "kept_total": "pipeline(rows, [filter(current, \"item.n > 2\"), sum(current, \"item.n\")])"
            }),
        )
        .await;
        assert_eq!(out["kept_total"], json!(12));
    }

    #[tokio::test]
    async fn test_pipeline_step_errors_are_labelled() {
        let ctx = context(json!({"rows": [1]}));
        let err = map_object(
            &ctx,
            &serde_json::from_value(json!({
                "x": "pipeline(rows, [sum(current, \"item.n\")])"
            }))
            .unwrap(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("pipeline step 0"));
    }

    #[tokio::test]
    async fn test_create_object_kwargs_resolve_scope() {
        let ctx = context(json!({"who": "ada"}));
        let out = run(
            &ctx,
            json!({"obj": "create_object(name=who, fixed='x')"}),
        )
        .await;
        assert_eq!(out["obj"], json!({"name": "ada", "fixed": "x"}));
    }

    #[tokio::test]
    async fn test_storage_read_with_cache() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_file("/data/a.txt", "ratio::file", "alpha").await;

        let ctx = TransformContext::new(
            serde_json::from_value(json!({})).unwrap(),
            "tok",
            storage.clone(),
        );
        let out = run(
            &ctx,
            json!({
                "once": "read_file('/data/a.txt')",
                "twice": "read_file('/data/a.txt')"
            }),
        )
        .await;
        assert_eq!(out["once"], json!("alpha"));
        assert_eq!(out["twice"], json!("alpha"));
    }

    #[tokio::test]
    async fn test_unknown_key_reports_output_path() {
        let ctx = context(json!({}));
        let err = map_object(
            &ctx,
            &serde_json::from_value(json!({"out": "missing_var"})).unwrap(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("'out'"));
        assert!(err.to_string().contains("key 'missing_var' not found"));
    }

    #[tokio::test]
    async fn test_datetime_now_formats() {
        let ctx = context(json!({}));
        let out = run(&ctx, json!({"stamp": "datetime_now('unix')"})).await;
        assert!(out["stamp"].is_i64());

        let err = map_object(
            &ctx,
            &serde_json::from_value(json!({"stamp": "datetime_now('epoch')"})).unwrap(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("'iso' or 'unix'"));
    }
}
