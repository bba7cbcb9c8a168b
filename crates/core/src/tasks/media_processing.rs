use crate::collaborators::Collaborators;
use crate::error::TaskResult;
use crate::registry::RegistryBuilder;
use crate::workflow::contract::value_to_text;
use crate::workflow::{NodeInput, NodeOutput, NodeTask};
use serde_json::json;
use std::path::Path;

pub const CATEGORY: &str = "media_processing";

pub fn register(builder: &mut RegistryBuilder, collaborators: &Collaborators) {
    builder.category(CATEGORY).retryable(
        "transcode",
        Transcode {
            collaborators: collaborators.clone(),
        },
    );
}

/// Converts one media file or several to `format`
pub struct Transcode {
    collaborators: Collaborators,
}

#[async_trait::async_trait]
impl NodeTask for Transcode {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let transcoder = self.collaborators.media_transcoder()?;
        let format = input.text("format")?;
        let files = input.batch("files")?;

        let mut outputs = Vec::with_capacity(files.len());
        for file in files.items() {
            let source = value_to_text(file);
            let target = transcoder
                .transcode_media(Path::new(&source), &format)
                .await?;
            outputs.push(json!(target.to_string_lossy()));
        }

        Ok(NodeOutput::single(files.collapse(outputs)))
    }
}
