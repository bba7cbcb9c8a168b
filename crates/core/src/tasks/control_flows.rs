use crate::error::{TaskError, TaskResult};
use crate::registry::RegistryBuilder;
use crate::workflow::contract::value_to_text;
use crate::workflow::{NodeInput, NodeOutput, NodeTask};
use serde_json::Value;
use std::cmp::Ordering;

pub const CATEGORY: &str = "control_flows";

pub fn register(builder: &mut RegistryBuilder) {
    builder
        .category(CATEGORY)
        .local("empty", Empty)
        .local("conditional", Conditional)
        .local("json_process", JsonProcess);
}

/// Does nothing; used as a join point
pub struct Empty;

#[async_trait::async_trait]
impl NodeTask for Empty {
    async fn run(&self, _input: NodeInput) -> TaskResult<NodeOutput> {
        Ok(NodeOutput::new())
    }
}

/// Compares `left_field` with `right_field` and outputs `true_output` or `false_output`
pub struct Conditional;

enum Operand {
    Text(String),
    Number(f64),
}

impl Operand {
    fn parse(input: &NodeInput, field: &str, field_type: &str) -> TaskResult<Self> {
        let text = input.text_or(field, "");
        match field_type {
            "number" => text.trim().parse().map(Operand::Number).map_err(|_| {
                TaskError::permanent(format!("Field '{}' is not a number: {}", field, text))
            }),
            _ => Ok(Operand::Text(text)),
        }
    }

    fn compare(&self, other: &Operand) -> Option<Ordering> {
        match (self, other) {
            (Operand::Number(a), Operand::Number(b)) => a.partial_cmp(b),
            (Operand::Text(a), Operand::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Operand::Text(s) => s.clone(),
            Operand::Number(n) => n.to_string(),
        }
    }
}

/// Unknown operators evaluate to false
fn evaluate(operator: &str, left: &Operand, right: &Operand) -> bool {
    let ordering = left.compare(right);
    let (l, r) = (left.as_text(), right.as_text());

    match operator {
        "equal" => ordering == Some(Ordering::Equal),
        "not_equal" => ordering != Some(Ordering::Equal),
        "greater_than" => ordering == Some(Ordering::Greater),
        "less_than" => ordering == Some(Ordering::Less),
        "greater_than_or_equal" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        "less_than_or_equal" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        "include" => l.contains(&r),
        "not_include" => !l.contains(&r),
        "is_empty" => l.is_empty(),
        "is_not_empty" => !l.is_empty(),
        "starts_with" => l.starts_with(&r),
        "ends_with" => l.ends_with(&r),
        other => {
            tracing::warn!("Unsupported operator '{}', taking the false branch", other);
            false
        }
    }
}

#[async_trait::async_trait]
impl NodeTask for Conditional {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let field_type = input.text_or("field_type", "string");
        let left = Operand::parse(&input, "left_field", &field_type)?;
        let right = Operand::parse(&input, "right_field", &field_type)?;
        let operator = input.text("operator")?;

        let branch = if evaluate(&operator, &left, &right) {
            "true_output"
        } else {
            "false_output"
        };
        let output = input.get(branch).cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::single(output))
    }
}

/// Extracts values from a JSON document (`input`, object or JSON text)
pub struct JsonProcess;

#[async_trait::async_trait]
impl NodeTask for JsonProcess {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let document = match input.require("input")? {
            Value::String(text) => serde_json::from_str(text)
                .map_err(|e| TaskError::permanent(format!("Input is not valid JSON: {}", e)))?,
            other => other.clone(),
        };

        let output = match input.text_or("process_mode", "get_value").as_str() {
            "get_value" => {
                let key = input.text("key")?;
                lookup(&document, &key)
                    .or_else(|| input.get("default_value").cloned())
                    .unwrap_or(Value::Null)
            }
            "get_multiple_values" => {
                let keys = input.batch("keys")?;
                let values = keys
                    .items()
                    .iter()
                    .map(|key| lookup(&document, &value_to_text(key)).unwrap_or(Value::Null))
                    .collect();
                Value::Array(values)
            }
            "list_keys" => match &document {
                Value::Object(map) => map.keys().map(|k| Value::String(k.clone())).collect(),
                _ => return Err(TaskError::permanent("list_keys needs a JSON object")),
            },
            "list_values" => match document {
                Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                Value::Array(items) => Value::Array(items),
                _ => return Err(TaskError::permanent("list_values needs an object or array")),
            },
            other => {
                return Err(TaskError::permanent(format!(
                    "Unsupported process_mode '{}'",
                    other
                )))
            }
        };

        Ok(NodeOutput::single(output))
    }
}

/// Dotted-path lookup; numeric segments index into arrays
fn lookup(document: &Value, path: &str) -> Option<Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
