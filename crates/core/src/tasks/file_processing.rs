use crate::error::{TaskError, TaskResult};
use crate::registry::RegistryBuilder;
use crate::workflow::contract::value_to_text;
use crate::workflow::{NodeInput, NodeOutput, NodeTask};
use serde_json::json;
use std::io::ErrorKind;

pub const CATEGORY: &str = "file_processing";

pub fn register(builder: &mut RegistryBuilder) {
    builder.category(CATEGORY).local("file_loader", FileLoader);
}

/// Reads the text content of one file or of a list of files
pub struct FileLoader;

#[async_trait::async_trait]
impl NodeTask for FileLoader {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        let files = input.batch("files")?;
        let mut contents = Vec::with_capacity(files.len());

        for file in files.items() {
            let path = value_to_text(file);
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::InvalidData | ErrorKind::PermissionDenied => {
                    TaskError::permanent(format!("Cannot load {}: {}", path, e))
                }
                _ => TaskError::retry(format!("Failed to read {}: {}", path, e)),
            })?;
            contents.push(json!(content));
        }

        Ok(NodeOutput::single(files.collapse(contents)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::test_input;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scalar_and_collection_symmetry() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();

        let single = FileLoader
            .run(test_input(json!({"files": a.to_str().unwrap()})))
            .await
            .unwrap();
        assert_eq!(single.get("output"), Some(&json!("alpha")));

        let many = FileLoader
            .run(test_input(json!({"files": [a.to_str().unwrap(), b.to_str().unwrap()]})))
            .await
            .unwrap();
        assert_eq!(many.get("output"), Some(&json!(["alpha", "beta"])));
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.txt");

        let err = FileLoader
            .run(test_input(json!({"files": missing.to_str().unwrap()})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
