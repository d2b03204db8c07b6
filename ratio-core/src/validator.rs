use crate::types::{
    execution_ref_base, AttributeType, RawInstruction, ToolDefinition,
};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A finding produced by static definition validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFinding {
    pub execution_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.execution_id {
            Some(id) => write!(f, "{id}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Static validator for composite definitions: checks every `REF:` in
/// instruction arguments for type consistency against the declared
/// schemas, and rejects dependency cycles before any process exists.
///
/// Returns findings rather than failing, so it can back a
/// `validate_tool_definition` surface.
pub struct RefValidator<'a> {
    definition: &'a ToolDefinition,
    instructions: BTreeMap<&'a str, &'a RawInstruction>,
}

impl<'a> RefValidator<'a> {
    pub fn new(definition: &'a ToolDefinition) -> Self {
        let instructions = definition
            .instructions
            .iter()
            .flatten()
            .map(|instruction| (instruction.execution_id.as_str(), instruction))
            .collect();
        Self {
            definition,
            instructions,
        }
    }

    /// Run every check. An empty result means the definition passed.
    pub fn validate(&self) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        self.check_dependency_graph(&mut findings);
        for instruction in self.instructions.values() {
            self.check_instruction(instruction, &mut findings);
        }
        findings
    }

    fn check_dependency_graph(&self, findings: &mut Vec<ValidationFinding>) {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

        for (&execution_id, instruction) in &self.instructions {
            graph.add_node(execution_id);

            let mut deps: BTreeSet<String> = instruction.dependencies.iter().cloned().collect();
            for value in instruction.arguments.values() {
                crate::types::collect_ref_bases(value, &mut deps);
            }
            if let Ok(conditions) = serde_json::to_value(&instruction.conditions) {
                crate::types::collect_ref_bases(&conditions, &mut deps);
            }
            if let Some(parallel) = &instruction.parallel_execution {
                crate::types::collect_ref_bases(&parallel.iterate_over, &mut deps);
            }

            for dep in deps {
                match self.instructions.get_key_value(dep.as_str()) {
                    Some((&dep_id, _)) => {
                        graph.add_edge(dep_id, execution_id, ());
                    }
                    None => findings.push(ValidationFinding {
                        execution_id: Some(execution_id.to_string()),
                        message: format!("depends on unknown execution id '{dep}'"),
                    }),
                }
            }
        }

        if is_cyclic_directed(&graph) {
            findings.push(ValidationFinding {
                execution_id: None,
                message: "instruction dependency graph contains a cycle".to_string(),
            });
        }
    }

    fn check_instruction(&self, instruction: &RawInstruction, findings: &mut Vec<ValidationFinding>) {
        // Inline definitions are checkable; path-referenced ones are
        // loaded (and validated) at execution time.
        let Some(child_definition) = &instruction.tool_definition else {
            return;
        };

        for (arg_name, arg_value) in &instruction.arguments {
            let Some(declared) = child_definition
                .arguments
                .iter()
                .find(|attr| &attr.name == arg_name)
            else {
                findings.push(ValidationFinding {
                    execution_id: Some(instruction.execution_id.clone()),
                    message: format!("argument '{arg_name}' is not declared by the tool"),
                });
                continue;
            };

            for reference in collect_refs(arg_value) {
                match self.ref_output_type(&reference) {
                    Ok(Some(produced)) => {
                        if !types_compatible(produced, declared.type_name) {
                            findings.push(ValidationFinding {
                                execution_id: Some(instruction.execution_id.clone()),
                                message: format!(
                                    "type mismatch in REF '{reference}': expected {}, but would receive {}",
                                    declared.type_name.as_str(),
                                    produced.as_str()
                                ),
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(message) => findings.push(ValidationFinding {
                        execution_id: Some(instruction.execution_id.clone()),
                        message,
                    }),
                }
            }
        }
    }

    /// The type a `REF:` will resolve to, or `None` when it cannot be
    /// determined statically.
    fn ref_output_type(&self, reference: &str) -> Result<Option<AttributeType>, String> {
        let rest = reference
            .strip_prefix("REF:")
            .ok_or_else(|| format!("invalid REF string: {reference}"))?;
        let mut parts = rest.split('.');
        let base = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .ok_or_else(|| format!("invalid REF string: {reference}"))?;
        let accessor = parts.next();

        if base == "arguments" {
            let declared = self
                .definition
                .arguments
                .iter()
                .find(|attr| attr.name == key)
                .ok_or_else(|| format!("unknown argument: {key}"))?;
            return Ok(accessor_output(declared.type_name, accessor));
        }

        if base == "execution" || base == "self" {
            return Ok(None);
        }

        let logical_base = base.split('[').next().unwrap_or(base);
        let Some(producer) = self.instructions.get(logical_base) else {
            return Err(format!("unknown execution id: {logical_base}"));
        };

        // A parallel group aggregates into a list under `response`.
        if producer.parallel_execution.is_some() && execution_ref_base(reference) == Some(logical_base)
        {
            if base == logical_base && key == "response" {
                return Ok(accessor_output(AttributeType::List, accessor));
            }
        }

        let Some(child_definition) = &producer.tool_definition else {
            return Ok(None);
        };

        let declared = child_definition
            .responses
            .iter()
            .find(|attr| attr.name == key)
            .ok_or_else(|| format!("unknown response key: {key}"))?;

        Ok(accessor_output(declared.type_name, accessor))
    }
}

/// Output type of a typed accessor, or `None` where the element type is
/// not statically known.
fn accessor_output(base: AttributeType, accessor: Option<&str>) -> Option<AttributeType> {
    let Some(accessor) = accessor else {
        return Some(base);
    };

    match base {
        AttributeType::List => match accessor {
            "length" => Some(AttributeType::Number),
            // Element type is unknown without deeper schema knowledge.
            _ => None,
        },
        AttributeType::Object => None,
        AttributeType::File => match accessor {
            "metadata" => Some(AttributeType::Object),
            _ => Some(AttributeType::String),
        },
        // Scalars have no accessors; flagged at resolve time.
        _ => Some(base),
    }
}

fn types_compatible(produced: AttributeType, expected: AttributeType) -> bool {
    if produced == expected || expected == AttributeType::Any {
        return true;
    }
    matches!(
        (produced, expected),
        (AttributeType::String, AttributeType::File)
            | (AttributeType::File, AttributeType::String)
            | (AttributeType::Number, AttributeType::String)
    )
}

fn collect_refs(value: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    collect_refs_into(value, &mut refs);
    refs
}

fn collect_refs_into(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with("REF:") => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_refs_into(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_refs_into(item, out)),
        _ => {}
    }
}
