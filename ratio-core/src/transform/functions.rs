use super::TransformContext;
use crate::error::MappingError;
use crate::storage::{
    DescribeFileVersionRequest, FindFileRequest, GetFileVersionRequest, ListFileVersionsRequest,
};
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Number, Value};
use std::cmp::Ordering;
use std::sync::OnceLock;

const ARRAY_ARG_ERROR: &str = "first argument must be an array";
const ITEM_PATH_ERROR: &str = "key path must be in the form 'item.<attr>'";

/// Cap on `read_files` fan-in.
const READ_FILES_LIMIT: usize = 5;

/// Cap on `list_files` results.
const LIST_FILES_LIMIT: usize = 50;

fn file_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/(.*[^/])?$").expect("static regex"))
}

/// Dispatch one registry function. Arguments arrive fully evaluated,
/// except item paths (`"item.<attr>"`), which stay literal strings.
pub(super) async fn apply(
    ctx: &TransformContext,
    name: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
) -> Result<Value, MappingError> {
    let call = Call { args, kwargs };
    match name {
        "datetime_now" => datetime_now(&call),
        "create_object" => Ok(Value::Object(call.kwargs.clone())),
        "get_object_property" => get_object_property(&call),
        "join" => join(&call),
        "json_parse" => json_parse(&call),
        "map" => map_array(&call),
        "sum" => sum(&call),
        "if" => if_fn(&call),
        "filter" => filter(&call),
        "group_by" => group_by(&call),
        "sort" => sort(&call),
        "unique" => unique(&call),
        "flatten" => flatten(&call),
        "list_files" => list_files(ctx, &call).await,
        "list_file_versions" => list_file_versions(ctx, &call).await,
        "describe_version" => describe_version(ctx, &call).await,
        "read_file" => read_file(ctx, &call).await,
        "read_files" => read_files(ctx, &call).await,
        other => Err(MappingError::new(format!("unknown function: {other}"))),
    }
}

struct Call {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Call {
    /// Positional-or-keyword argument lookup.
    fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    fn required(&self, index: usize, name: &str) -> Result<&Value, MappingError> {
        self.get(index, name)
            .ok_or_else(|| MappingError::new(format!("missing argument '{name}'")))
    }

    fn array(&self, index: usize, name: &str) -> Result<&Vec<Value>, MappingError> {
        let value = self.required(index, name)?;
        value.as_array().ok_or_else(|| {
            MappingError::new(format!("{ARRAY_ARG_ERROR}, got {}", type_label(value)))
        })
    }

    fn string(&self, index: usize, name: &str) -> Result<&str, MappingError> {
        let value = self.required(index, name)?;
        value
            .as_str()
            .ok_or_else(|| MappingError::new(format!("argument '{name}' must be a string")))
    }

    fn optional_string(&self, index: usize, name: &str) -> Result<Option<&str>, MappingError> {
        match self.get(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(MappingError::new(format!(
                "argument '{name}' must be a string"
            ))),
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

/// Strip the `item.` prefix from an item path.
fn item_attr(path: &str) -> Result<&str, MappingError> {
    path.strip_prefix("item.")
        .filter(|attr| !attr.is_empty())
        .ok_or_else(|| MappingError::new(ITEM_PATH_ERROR))
}

fn validated_file_path<'a>(path: &'a str) -> Result<&'a str, MappingError> {
    if !file_path_regex().is_match(path) {
        return Err(MappingError::new(format!("invalid file path format: {path}")));
    }
    Ok(path)
}

// ─── Pure functions ───────────────────────────────────────────

fn datetime_now(call: &Call) -> Result<Value, MappingError> {
    let format = call.optional_string(0, "format")?.unwrap_or("iso");
    match format {
        "iso" => Ok(json!(Utc::now().to_rfc3339())),
        "unix" => Ok(json!(Utc::now().timestamp())),
        _ => Err(MappingError::new("format must be 'iso' or 'unix'")),
    }
}

fn get_object_property(call: &Call) -> Result<Value, MappingError> {
    let obj = call.required(0, "obj")?;
    let property_path = call.string(1, "property_path")?;

    let mut current = obj;
    for part in property_path.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(part)
                .ok_or_else(|| MappingError::new(format!("property '{part}' not found")))?,
            Value::Array(items) => {
                let index: usize = part.parse().map_err(|_| {
                    MappingError::new(format!("property '{part}' not found"))
                })?;
                items
                    .get(index)
                    .ok_or_else(|| MappingError::new(format!("list index {index} out of range")))?
            }
            _ => return Err(MappingError::new(format!("property '{part}' not found"))),
        };
    }

    Ok(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let separator = call.required(1, "separator")?;

    // Arrays of objects with a `name` field join by name.
    let values: Vec<String> = if array
        .first()
        .map(|first| first.get("name").is_some())
        .unwrap_or(false)
    {
        array
            .iter()
            .map(|item| item.get("name").map(stringify).unwrap_or_else(|| stringify(item)))
            .collect()
    } else {
        array.iter().map(stringify).collect()
    };

    Ok(Value::String(values.join(&stringify(separator))))
}

fn json_parse(call: &Call) -> Result<Value, MappingError> {
    let raw = call.required(0, "json_string")?;
    let text = raw.as_str().ok_or_else(|| {
        MappingError::new(format!("json_parse requires a string, got {}", type_label(raw)))
    })?;
    serde_json::from_str(text.trim())
        .map_err(|err| MappingError::new(format!("invalid JSON string: {err}")))
}

fn map_array(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let template = call.required(1, "template")?;

    match template {
        Value::String(path) => {
            let attr = item_attr(path)?;
            let mut out = Vec::with_capacity(array.len());
            for item in array {
                let value = item.get(attr).ok_or_else(|| {
                    MappingError::new(format!("attribute '{attr}' not found in array item"))
                })?;
                out.push(value.clone());
            }
            Ok(Value::Array(out))
        }
        Value::Object(template) => {
            let mut out = Vec::with_capacity(array.len());
            for item in array {
                let mut shaped = Map::with_capacity(template.len());
                for (key, rule) in template {
                    let value = match rule.as_str().and_then(|s| s.strip_prefix("item.")) {
                        Some(attr) => item
                            .get(attr)
                            .ok_or_else(|| {
                                MappingError::new(format!(
                                    "attribute '{attr}' not found in array item"
                                ))
                            })?
                            .clone(),
                        // Static value.
                        None => rule.clone(),
                    };
                    shaped.insert(key.clone(), value);
                }
                out.push(Value::Object(shaped));
            }
            Ok(Value::Array(out))
        }
        other => Err(MappingError::new(format!(
            "template must be an object or an item path, got {}",
            type_label(other)
        ))),
    }
}

fn sum(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let attr = item_attr(call.string(1, "item_path")?)?;

    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut any_float = false;

    for item in array {
        let value = item.get(attr).ok_or_else(|| {
            MappingError::new(format!("attribute '{attr}' not found in array item"))
        })?;
        let number = value.as_f64().ok_or_else(|| {
            MappingError::new(format!("attribute '{attr}' is not a number"))
        })?;
        if value.is_i64() && !any_float {
            int_total += value.as_i64().unwrap_or_default();
        } else {
            any_float = true;
        }
        float_total += number;
    }

    if any_float {
        Ok(Number::from_f64(float_total)
            .map(Value::Number)
            .unwrap_or(Value::Null))
    } else {
        Ok(json!(int_total))
    }
}

fn truthy_condition(value: &Value) -> bool {
    match value {
        // String conditions came through unevaluated; only the obvious
        // falsy spellings count as false.
        Value::String(s) => !matches!(
            s.to_ascii_lowercase().as_str(),
            "false" | "" | "0" | "null" | "none"
        ),
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn if_fn(call: &Call) -> Result<Value, MappingError> {
    let condition = call.required(0, "condition")?;
    let true_value = call.required(1, "true_value")?;
    let false_value = call.required(2, "false_value")?;
    Ok(if truthy_condition(condition) {
        true_value.clone()
    } else {
        false_value.clone()
    })
}

fn filter(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let condition = call.string(1, "condition")?;

    let mut out = Vec::new();
    for item in array {
        let keep = ItemExpression::new(item).evaluate(condition).map_err(|err| {
            MappingError::new(format!(
                "error evaluating condition '{condition}' for item: {err}"
            ))
        })?;
        if keep {
            out.push(item.clone());
        }
    }
    Ok(Value::Array(out))
}

fn group_by(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let attr = item_attr(call.string(1, "key_path")?)?;

    let mut groups: Map<String, Value> = Map::new();
    for item in array {
        if !item.is_object() {
            return Err(MappingError::new("array items must be objects for grouping"));
        }
        let key = item.get(attr).ok_or_else(|| {
            MappingError::new(format!("attribute '{attr}' not found in array item"))
        })?;
        let group = groups
            .entry(stringify(key))
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(members) = group {
            members.push(item.clone());
        }
    }
    Ok(Value::Object(groups))
}

fn compare_for_sort(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn sort(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let key_path = call.optional_string(1, "key_path")?;
    let direction = call.optional_string(2, "direction")?.unwrap_or("asc");
    if !matches!(direction, "asc" | "desc") {
        return Err(MappingError::new("direction must be 'asc' or 'desc'"));
    }

    let mut sorted = array.clone();
    match key_path {
        None | Some("") => sorted.sort_by(compare_for_sort),
        Some(path) => {
            let attr = item_attr(path)?;
            for item in &sorted {
                if item.get(attr).is_none() {
                    return Err(MappingError::new(format!(
                        "attribute '{attr}' not found in array item"
                    )));
                }
            }
            sorted.sort_by(|a, b| {
                compare_for_sort(
                    a.get(attr).unwrap_or(&Value::Null),
                    b.get(attr).unwrap_or(&Value::Null),
                )
            });
        }
    }

    if direction == "desc" {
        sorted.reverse();
    }
    Ok(Value::Array(sorted))
}

fn unique(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let mut out: Vec<Value> = Vec::new();
    for item in array {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    Ok(Value::Array(out))
}

fn flatten(call: &Call) -> Result<Value, MappingError> {
    let array = call.array(0, "array")?;
    let mut out = Vec::new();
    for item in array {
        match item {
            Value::Array(nested) => out.extend(nested.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    Ok(Value::Array(out))
}

// ─── Storage-aware functions ──────────────────────────────────

fn glob_match(pattern: &str, name: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

async fn list_files(ctx: &TransformContext, call: &Call) -> Result<Value, MappingError> {
    let directory_path = validated_file_path(call.string(0, "directory_path")?)?;
    let pattern = call.optional_string(1, "pattern")?;
    let cache_key = format!("list_files:{directory_path}:{}", pattern.unwrap_or(""));

    if let Some(cached) = ctx.cached(&cache_key) {
        return Ok(cached);
    }

    let response = ctx
        .storage
        .find_file(
            &ctx.token,
            FindFileRequest {
                file_path: directory_path.to_string(),
                recursion_max_depth: Some(1),
            },
        )
        .await
        .map_err(|err| MappingError::new(format!("failed to list files: {err}")))?;

    if response.status_code == 404 {
        return Err(MappingError::new(format!("directory not found: {directory_path}")));
    }
    if response.status_code != 200 {
        return Err(MappingError::new(format!(
            "failed to list files in {directory_path}: {}",
            response.status_code
        )));
    }

    let entries = response
        .data()
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut paths: Vec<String> = entries
        .iter()
        .filter(|entry| !entry["is_directory"].as_bool().unwrap_or(false))
        .filter_map(|entry| entry["file_path"].as_str().map(str::to_string))
        .filter(|path| {
            pattern
                .map(|p| glob_match(p, crate::storage::file_name(path)))
                .unwrap_or(true)
        })
        .collect();

    if paths.len() > LIST_FILES_LIMIT {
        tracing::warn!(directory = %directory_path, "list_files result truncated to {LIST_FILES_LIMIT} files");
        paths.truncate(LIST_FILES_LIMIT);
    }

    let result = json!(paths);
    ctx.cache_put(&cache_key, result.clone());
    Ok(result)
}

async fn list_file_versions(ctx: &TransformContext, call: &Call) -> Result<Value, MappingError> {
    let file_path = validated_file_path(call.string(0, "file_path")?)?;
    let cache_key = format!("list_file_versions:{file_path}");

    if let Some(cached) = ctx.cached(&cache_key) {
        return Ok(cached);
    }

    let response = ctx
        .storage
        .list_file_versions(
            &ctx.token,
            ListFileVersionsRequest {
                file_path: file_path.to_string(),
            },
        )
        .await
        .map_err(|err| MappingError::new(format!("failed to list versions: {err}")))?;

    if response.status_code == 404 {
        return Err(MappingError::new(format!("file not found: {file_path}")));
    }
    if response.status_code != 200 {
        return Err(MappingError::new(format!(
            "failed to list versions for {file_path}: {}",
            response.status_code
        )));
    }

    let result = response.data().cloned().unwrap_or(json!([]));
    ctx.cache_put(&cache_key, result.clone());
    Ok(result)
}

async fn describe_version(ctx: &TransformContext, call: &Call) -> Result<Value, MappingError> {
    let file_path = validated_file_path(call.string(0, "file_path")?)?;
    let version_id = call.optional_string(1, "version_id")?;
    let cache_key = format!("describe_version:{file_path}:{}", version_id.unwrap_or("latest"));

    if let Some(cached) = ctx.cached(&cache_key) {
        return Ok(cached);
    }

    let response = ctx
        .storage
        .describe_file_version(
            &ctx.token,
            DescribeFileVersionRequest {
                file_path: file_path.to_string(),
                version_id: version_id.map(str::to_string),
            },
        )
        .await
        .map_err(|err| MappingError::new(format!("failed to describe version: {err}")))?;

    if response.status_code == 404 {
        return Err(MappingError::new(format!("file or version not found: {file_path}")));
    }
    if response.status_code != 200 {
        return Err(MappingError::new(format!(
            "failed to describe {file_path}: {}",
            response.status_code
        )));
    }

    let result = response.data().cloned().unwrap_or(json!({}));
    ctx.cache_put(&cache_key, result.clone());
    Ok(result)
}

async fn read_file(ctx: &TransformContext, call: &Call) -> Result<Value, MappingError> {
    let file_path = validated_file_path(call.string(0, "file_path")?)?;
    let version_id = call.optional_string(1, "version_id")?;
    read_file_inner(ctx, file_path, version_id).await
}

async fn read_file_inner(
    ctx: &TransformContext,
    file_path: &str,
    version_id: Option<&str>,
) -> Result<Value, MappingError> {
    let cache_key = format!("read_file:{file_path}:{}", version_id.unwrap_or("latest"));
    if let Some(cached) = ctx.cached(&cache_key) {
        return Ok(cached);
    }

    let response = ctx
        .storage
        .get_file_version(
            &ctx.token,
            GetFileVersionRequest {
                file_path: file_path.to_string(),
                version_id: version_id.map(str::to_string),
            },
        )
        .await
        .map_err(|err| MappingError::new(format!("failed to read file: {err}")))?;

    if response.status_code == 404 {
        return Err(MappingError::new(format!("file or version not found: {file_path}")));
    }
    if response.status_code != 200 {
        return Err(MappingError::new(format!(
            "failed to read {file_path}: {}",
            response.status_code
        )));
    }

    let result = response.data().cloned().unwrap_or(json!(""));
    ctx.cache_put(&cache_key, result.clone());
    Ok(result)
}

async fn read_files(ctx: &TransformContext, call: &Call) -> Result<Value, MappingError> {
    let file_paths = call.array(0, "file_paths")?;
    if file_paths.len() > READ_FILES_LIMIT {
        return Err(MappingError::new(format!(
            "read_files limited to {READ_FILES_LIMIT} files maximum"
        )));
    }

    let mut paths = Vec::with_capacity(file_paths.len());
    for entry in file_paths {
        let path = entry
            .as_str()
            .ok_or_else(|| MappingError::new("file_paths must be an array of strings"))?;
        paths.push(validated_file_path(path)?);
    }

    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        contents.push(read_file_inner(ctx, path, None).await?);
    }
    Ok(Value::Array(contents))
}

// ─── Filter expression evaluation ─────────────────────────────

/// Restricted boolean expression evaluator for `filter` conditions.
/// Supports `and`, `or`, `not`, the comparison set, `contains`, string
/// and numeric literals, and `item.<attr>` access. No general
/// evaluation of untrusted input.
struct ItemExpression<'a> {
    item: &'a Value,
}

impl<'a> ItemExpression<'a> {
    fn new(item: &'a Value) -> Self {
        Self { item }
    }

    fn evaluate(&self, expression: &str) -> Result<bool, MappingError> {
        let expr = expression.trim();

        if let Some((left, right)) = expr.split_once(" and ") {
            return Ok(self.evaluate(left)? && self.evaluate(right)?);
        }
        if let Some((left, right)) = expr.split_once(" or ") {
            return Ok(self.evaluate(left)? || self.evaluate(right)?);
        }
        if let Some(rest) = expr.strip_prefix("not ") {
            return Ok(!self.evaluate(rest)?);
        }

        for op in [">=", "<=", "==", "!=", ">", "<", "contains"] {
            let needle = format!(" {op} ");
            if let Some((left, right)) = expr.split_once(&needle) {
                let left = self.resolve(left.trim())?;
                let right = self.resolve(right.trim())?;
                return Ok(match op {
                    "==" => left == right,
                    "!=" => left != right,
                    ">" => matches!(compare(&left, &right), Some(Ordering::Greater)),
                    "<" => matches!(compare(&left, &right), Some(Ordering::Less)),
                    ">=" => !matches!(compare(&left, &right), Some(Ordering::Less) | None),
                    "<=" => !matches!(compare(&left, &right), Some(Ordering::Greater) | None),
                    "contains" => stringify(&left).contains(&stringify(&right)),
                    _ => unreachable!(),
                });
            }
        }

        Ok(truthy_condition(&self.resolve(expr)?))
    }

    fn resolve(&self, value_str: &str) -> Result<Value, MappingError> {
        let value_str = value_str.trim();

        if (value_str.starts_with('"') && value_str.ends_with('"') && value_str.len() >= 2)
            || (value_str.starts_with('\'') && value_str.ends_with('\'') && value_str.len() >= 2)
        {
            return Ok(Value::String(value_str[1..value_str.len() - 1].to_string()));
        }
        if let Ok(int) = value_str.parse::<i64>() {
            return Ok(json!(int));
        }
        if let Ok(float) = value_str.parse::<f64>() {
            return Ok(json!(float));
        }
        match value_str.to_ascii_lowercase().as_str() {
            "true" => return Ok(json!(true)),
            "false" => return Ok(json!(false)),
            _ => {}
        }

        if let Some(attr) = value_str.strip_prefix("item.") {
            return self
                .item
                .get(attr)
                .cloned()
                .ok_or_else(|| MappingError::new(format!("property '{attr}' not found in item")));
        }

        if let Some(found) = self.item.get(value_str) {
            return Ok(found.clone());
        }

        Ok(Value::String(value_str.to_string()))
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
