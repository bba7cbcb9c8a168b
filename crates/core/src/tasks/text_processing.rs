use crate::error::{TaskError, TaskResult};
use crate::registry::RegistryBuilder;
use crate::workflow::contract::value_to_text;
use crate::workflow::{NodeInput, NodeOutput, NodeTask};
use serde_json::{json, Value};

pub const CATEGORY: &str = "text_processing";

pub fn register(builder: &mut RegistryBuilder) {
    builder
        .category(CATEGORY)
        .local("template_compose", TemplateCompose)
        .local("text_in_out", TextInOut)
        .local("text_truncation", TextTruncation)
        .local("list_render", ListRender);
}

/// Substitutes `{{field}}` placeholders in `template` with the node's other fields
pub struct TemplateCompose;

#[async_trait::async_trait]
impl NodeTask for TemplateCompose {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let mut template = input.text("template")?;
        for (field, value) in &input.fields {
            if field == "template" || field == "output" {
                continue;
            }
            template = template.replace(&format!("{{{{{}}}}}", field), &value_to_text(value));
        }
        Ok(NodeOutput::single(json!(template)))
    }
}

/// Passes `text` through unchanged
pub struct TextInOut;

#[async_trait::async_trait]
impl NodeTask for TextInOut {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let text = input.get("text").cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::single(text))
    }
}

/// Cuts `text` (one string or many) to `truncate_length` characters
pub struct TextTruncation;

#[async_trait::async_trait]
impl NodeTask for TextTruncation {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let limit = input.u64_or("truncate_length", 2000)? as usize;
        let output = input.batch("text")?.map(|item| {
            let text = value_to_text(item);
            Ok::<_, TaskError>(json!(text.chars().take(limit).collect::<String>()))
        })?;
        Ok(NodeOutput::single(output))
    }
}

/// Renders `list` as newline-joined text or passes it through as a list
pub struct ListRender;

#[async_trait::async_trait]
impl NodeTask for ListRender {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let list = input.batch("list")?;
        let output = match input.text_or("output_type", "text").as_str() {
            "text" => json!(list
                .items()
                .iter()
                .map(value_to_text)
                .collect::<Vec<_>>()
                .join("\n")),
            "list" => Value::Array(list.items().to_vec()),
            other => {
                return Err(TaskError::permanent(format!(
                    "Unsupported output_type '{}'",
                    other
                )))
            }
        };
        Ok(NodeOutput::single(output))
    }
}
