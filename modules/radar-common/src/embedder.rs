use anyhow::Result;
use async_trait::async_trait;

/// Backend that turns texts into fixed-width vectors with a single model.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Identifies the model. Cached vectors are only reused under the same version.
    fn model_version(&self) -> &str;

    /// Embed every text, in order. Implementations either return one vector per
    /// input or fail the whole call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
