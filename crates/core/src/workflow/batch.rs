//! Scalar/collection normalization for fields that accept one value or many.
//!
//! A scalar input is processed as a one-element sequence. When exactly one
//! input element maps to exactly one output element, the output is unwrapped
//! back to a scalar.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    items: Vec<Value>,
}

impl Batch {
    /// Coerce a field value into a sequence. `null` becomes an empty batch.
    pub fn from_value(value: &Value) -> Self {
        let items = match value {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        Self { items }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Map each element, keeping the scalar/collection shape of the input.
    pub fn map<E>(&self, f: impl FnMut(&Value) -> Result<Value, E>) -> Result<Value, E> {
        let outputs = self.items.iter().map(f).collect::<Result<Vec<_>, E>>()?;
        Ok(self.collapse(outputs))
    }

    /// Shape `outputs` to mirror this batch
    pub fn collapse(&self, mut outputs: Vec<Value>) -> Value {
        if self.items.len() == 1 && outputs.len() == 1 {
            outputs.remove(0)
        } else {
            Value::Array(outputs)
        }
    }
}
