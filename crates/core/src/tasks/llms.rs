use crate::collaborators::Collaborators;
use crate::error::TaskResult;
use crate::registry::RegistryBuilder;
use crate::workflow::{NodeInput, NodeOutput, NodeTask};
use serde_json::{json, Value};

pub const CATEGORY: &str = "llms";

pub fn register(builder: &mut RegistryBuilder, collaborators: &Collaborators) {
    builder.category(CATEGORY).retryable(
        "chat",
        Chat {
            collaborators: collaborators.clone(),
        },
    );
}

/// Sends `prompt` to the text generator and outputs the reply
pub struct Chat {
    collaborators: Collaborators,
}

#[async_trait::async_trait]
impl NodeTask for Chat {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let generator = self.collaborators.text_generator()?;
        let prompt = input.text("prompt")?;

        let mut options = serde_json::Map::new();
        for key in ["model", "temperature", "max_tokens"] {
            if let Some(value) = input.get(key).filter(|v| !v.is_null()) {
                options.insert(key.to_string(), value.clone());
            }
        }

        tracing::debug!("Node {} prompting text generator", input.node_id);
        let reply = generator
            .generate_text(&prompt, &Value::Object(options))
            .await?;
        Ok(NodeOutput::single(json!(reply)))
    }
}
