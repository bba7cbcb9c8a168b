//! Narrow interfaces to external AI, vector and media services.
//!
//! The engine ships no implementations; the hosting process wires real
//! clients in through [`Collaborators`]. Handlers whose collaborator is
//! missing fail permanently.

use crate::cache::ResultCache;
use crate::error::{TaskError, TaskResult};
use crate::types::ExternalId;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text for a prompt. `options` carries model settings such as temperature.
    async fn generate_text(&self, prompt: &str, options: &Value) -> TaskResult<String>;
}

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> TaskResult<Vec<f32>>;
}

#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the point `id` in `collection`
    async fn upsert_vector(
        &self,
        collection: &str,
        id: &ExternalId,
        vector: Vec<f32>,
        payload: Value,
    ) -> TaskResult<()>;
}

#[async_trait::async_trait]
pub trait MediaTranscoder: Send + Sync {
    /// Convert `source` to `format`, returning the path of the result
    async fn transcode_media(&self, source: &Path, format: &str) -> TaskResult<PathBuf>;
}

/// External services available to handlers
#[derive(Clone, Default)]
pub struct Collaborators {
    pub text_generator: Option<Arc<dyn TextGenerator>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub vector_index: Option<Arc<dyn VectorIndex>>,
    pub media_transcoder: Option<Arc<dyn MediaTranscoder>>,
    pub cache: Option<Arc<dyn ResultCache>>,
}

fn missing(what: &str) -> TaskError {
    TaskError::permanent(format!("No {} configured", what))
}

impl Collaborators {
    pub fn text_generator(&self) -> TaskResult<&Arc<dyn TextGenerator>> {
        self.text_generator.as_ref().ok_or_else(|| missing("text generator"))
    }

    pub fn embedder(&self) -> TaskResult<&Arc<dyn Embedder>> {
        self.embedder.as_ref().ok_or_else(|| missing("embedder"))
    }

    pub fn vector_index(&self) -> TaskResult<&Arc<dyn VectorIndex>> {
        self.vector_index.as_ref().ok_or_else(|| missing("vector index"))
    }

    pub fn media_transcoder(&self) -> TaskResult<&Arc<dyn MediaTranscoder>> {
        self.media_transcoder
            .as_ref()
            .ok_or_else(|| missing("media transcoder"))
    }

    pub fn cache(&self) -> TaskResult<&Arc<dyn ResultCache>> {
        self.cache.as_ref().ok_or_else(|| missing("result cache"))
    }
}

/// In-memory collaborators for handler tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Echoes the prompt back, optionally failing the first `fail_times` calls
    #[derive(Default)]
    pub struct EchoGenerator {
        pub calls: Mutex<u32>,
        pub fail_times: u32,
    }

    #[async_trait::async_trait]
    impl TextGenerator for EchoGenerator {
        async fn generate_text(&self, prompt: &str, _options: &Value) -> TaskResult<String> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_times {
                return Err(TaskError::retry("rate limited"));
            }
            Ok(format!("re: {}", prompt))
        }
    }

    /// Embeds text as `[len, first byte]`
    pub struct LengthEmbedder;

    #[async_trait::async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> TaskResult<Vec<f32>> {
            let first = text.bytes().next().unwrap_or(0);
            Ok(vec![text.len() as f32, first as f32])
        }
    }

    #[derive(Default)]
    pub struct MemoryIndex {
        pub points: Mutex<HashMap<(String, ExternalId), (Vec<f32>, Value)>>,
    }

    impl MemoryIndex {
        pub fn len(&self) -> usize {
            self.points.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl VectorIndex for MemoryIndex {
        async fn upsert_vector(
            &self,
            collection: &str,
            id: &ExternalId,
            vector: Vec<f32>,
            payload: Value,
        ) -> TaskResult<()> {
            self.points
                .lock()
                .unwrap()
                .insert((collection.to_string(), id.clone()), (vector, payload));
            Ok(())
        }
    }

    /// Pretends to convert by swapping the extension
    pub struct RenamingTranscoder;

    #[async_trait::async_trait]
    impl MediaTranscoder for RenamingTranscoder {
        async fn transcode_media(&self, source: &Path, format: &str) -> TaskResult<PathBuf> {
            Ok(source.with_extension(format))
        }
    }
}
