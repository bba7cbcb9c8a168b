use crate::collaborators::Collaborators;
use crate::error::TaskResult;
use crate::registry::RegistryBuilder;
use crate::types::ExternalId;
use crate::workflow::contract::value_to_text;
use crate::workflow::{NodeInput, NodeOutput, NodeTask};
use serde_json::json;

pub const CATEGORY: &str = "vector_db";

pub fn register(builder: &mut RegistryBuilder, collaborators: &Collaborators) {
    builder.category(CATEGORY).retryable(
        "add_data",
        AddData {
            collaborators: collaborators.clone(),
        },
    );
}

/// Embeds each chunk of `text` and upserts it into the `database` collection.
///
/// Point ids derive from the run, the node and the chunk index, so a retried
/// attempt overwrites the points of the failed one instead of duplicating them.
pub struct AddData {
    collaborators: Collaborators,
}

#[async_trait::async_trait]
impl NodeTask for AddData {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let embedder = self.collaborators.embedder()?;
        let index = self.collaborators.vector_index()?;

        let collection = input.text("database")?;
        let chunks = input.batch("text")?;
        let title = input.text_or("content_title", "");
        let object_id =
            ExternalId::derive(&[&input.run_id.to_string(), input.node_id.as_str(), "object"]);

        let mut point_ids = Vec::with_capacity(chunks.len());
        for (chunk_index, chunk) in chunks.items().iter().enumerate() {
            let text = value_to_text(chunk);
            let vector = embedder.embed(&text).await?;
            let point_id = input.external_id(chunk_index);
            let payload = json!({
                "object_id": object_id,
                "text": text,
                "title": title,
                "chunk_index": chunk_index,
                "chunk_count": chunks.len(),
            });

            index
                .upsert_vector(&collection, &point_id, vector, payload)
                .await?;
            point_ids.push(json!(point_id));
        }

        tracing::debug!(
            "Node {} stored {} points in {}",
            input.node_id,
            point_ids.len(),
            collection
        );

        Ok(NodeOutput::new()
            .with("object_id", json!(object_id))
            .with("point_ids", chunks.collapse(point_ids)))
    }
}
