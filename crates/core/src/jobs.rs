//! Auxiliary jobs that run outside any workflow graph.
//!
//! Both hand their result to later consumers through the result cache.

use crate::collaborators::Collaborators;
use crate::error::{TaskError, TaskResult};
use crate::registry::RegistryBuilder;
use crate::types::ExternalId;
use crate::workflow::JobTask;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const CATEGORY: &str = "background";

/// Longest conversation title kept, in characters
const TITLE_MAX_CHARS: usize = 40;

pub fn register(builder: &mut RegistryBuilder, collaborators: &Collaborators, ttl: Duration) {
    builder
        .category(CATEGORY)
        .job(
            "summarize_title",
            SummarizeTitle {
                collaborators: collaborators.clone(),
                ttl,
            },
        )
        .job(
            "upsert_point",
            UpsertPoint {
                collaborators: collaborators.clone(),
                ttl,
            },
        );
}

pub fn title_cache_key(message_id: &str) -> String {
    format!("conversation-title:{}", message_id)
}

pub fn point_progress_cache_key(collection: &str, object_id: &str) -> String {
    format!("vector-point-progress:{}:{}", collection, object_id)
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> TaskResult<T> {
    serde_json::from_value(args)
        .map_err(|e| TaskError::permanent(format!("Invalid job arguments: {}", e)))
}

#[derive(Debug, Deserialize)]
struct SummarizeTitleArgs {
    message_id: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Generates a short conversation title and caches it under the message id
pub struct SummarizeTitle {
    collaborators: Collaborators,
    ttl: Duration,
}

#[async_trait::async_trait]
impl JobTask for SummarizeTitle {
    async fn run(&self, args: Value) -> TaskResult<Value> {
        let args: SummarizeTitleArgs = parse_args(args)?;
        let generator = self.collaborators.text_generator()?;
        let cache = self.collaborators.cache()?;

        let transcript = args
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize the following conversation as a short title:\n\n{}",
            transcript
        );

        let title = generator.generate_text(&prompt, &json!({})).await?;
        let title: String = title.trim().chars().take(TITLE_MAX_CHARS).collect();

        cache.set(&title_cache_key(&args.message_id), json!(title), self.ttl)?;
        tracing::info!("Generated conversation title for message {}", args.message_id);
        Ok(json!(title))
    }
}

#[derive(Debug, Deserialize)]
struct UpsertPointArgs {
    collection: String,
    object_id: String,
    text: String,
    vector: Vec<f32>,
    chunk_index: usize,
    chunk_count: usize,
    #[serde(default)]
    extra_data: Value,
}

/// Writes one vector point and records upload progress for its object.
///
/// The point id derives from `(collection, object_id, chunk_index)`, so a
/// retried upload replaces the point it already wrote.
pub struct UpsertPoint {
    collaborators: Collaborators,
    ttl: Duration,
}

#[async_trait::async_trait]
impl JobTask for UpsertPoint {
    async fn run(&self, args: Value) -> TaskResult<Value> {
        let args: UpsertPointArgs = parse_args(args)?;
        let index = self.collaborators.vector_index()?;
        let cache = self.collaborators.cache()?;

        let point_id = ExternalId::derive(&[
            &args.collection,
            &args.object_id,
            &args.chunk_index.to_string(),
        ]);
        let payload = json!({
            "object_id": args.object_id,
            "text": args.text,
            "extra_data": args.extra_data,
        });

        index
            .upsert_vector(&args.collection, &point_id, args.vector, payload)
            .await?;

        cache.set(
            &point_progress_cache_key(&args.collection, &args.object_id),
            json!({
                "chunk_index": args.chunk_index,
                "chunk_count": args.chunk_count,
            }),
            self.ttl,
        )?;

        if args.chunk_index + 1 == args.chunk_count {
            tracing::info!(
                "All {} points of object {} stored in {}",
                args.chunk_count,
                args.object_id,
                args.collection
            );
        }

        Ok(json!(point_id))
    }
}
