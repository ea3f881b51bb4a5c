use crate::error::Result;

/// Turns entity content into the opaque `Content` column and back.
pub trait ContentSerializer: Send + Sync {
    fn serialize(&self, content: &serde_json::Value) -> Result<String>;

    fn deserialize(&self, content: &str) -> Result<serde_json::Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl ContentSerializer for JsonSerializer {
    fn serialize(&self, content: &serde_json::Value) -> Result<String> {
        Ok(serde_json::to_string(content)?)
    }

    fn deserialize(&self, content: &str) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(content)?)
    }
}
