use crate::core::config::RenderConfig;
use crate::services::voice::{VoiceLibrary, VoiceSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One line of a batch rendering request.
#[derive(Debug, Clone, Serialize)]
pub struct RenderItem {
    pub index: usize,
    pub text: String,
    pub instruct: String,
    pub speaker: String,
}

/// Outcome of any orchestration or batch rendering call: exactly which
/// indices succeeded, and which failed with a human-readable reason. One bad
/// item never turns into an opaque whole-batch failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResult {
    pub completed: Vec<usize>,
    pub failed: Vec<(usize, String)>,
}

impl GenerationResult {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.failed.is_empty()
    }
}

/// Deterministic location of a batch-rendered temp artifact.
pub fn batch_artifact_path(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("temp_batch_{}.wav", index))
}

/// The external text-to-speech capability. Constructed once and shared by
/// every caller; orchestrators receive it by reference instead of reaching
/// for process-global state.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Render one line, returning WAV bytes.
    async fn render(
        &self,
        text: &str,
        instruct: &str,
        speaker: &str,
        voices: &VoiceLibrary,
    ) -> Result<Vec<u8>>;

    /// Render a batch under one shared seed, writing `temp_batch_{index}.wav`
    /// into `work_dir` for every completed index.
    async fn render_batch(
        &self,
        items: &[RenderItem],
        voices: &VoiceLibrary,
        seed: i64,
        work_dir: &Path,
    ) -> Result<GenerationResult>;
}

pub fn create_render_engine(config: &RenderConfig) -> Arc<dyn RenderEngine> {
    Arc::new(HttpRenderEngine::new(&config.base_url))
}

/// Client for a rendering server. The batch contract is honored by driving
/// the single-item endpoint with the shared seed per item; an engine with a
/// native batch API can implement the trait directly instead.
pub struct HttpRenderEngine {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    text: &'a str,
    instruct: &'a str,
    speaker: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a VoiceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

impl HttpRenderEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn request_wav(&self, request: &RenderRequest<'_>) -> Result<Vec<u8>> {
        let url = format!("{}/render", self.base_url);
        let resp = self.client.post(&url).json(request).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("render server error ({}): {}", status, error_text));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl RenderEngine for HttpRenderEngine {
    async fn render(
        &self,
        text: &str,
        instruct: &str,
        speaker: &str,
        voices: &VoiceLibrary,
    ) -> Result<Vec<u8>> {
        let voice = voices.get(speaker);
        if voice.is_none() {
            warn!("no voice configured for '{}', server default applies", speaker);
        }
        self.request_wav(&RenderRequest {
            text,
            instruct,
            speaker,
            voice,
            seed: None,
        })
        .await
    }

    async fn render_batch(
        &self,
        items: &[RenderItem],
        voices: &VoiceLibrary,
        seed: i64,
        work_dir: &Path,
    ) -> Result<GenerationResult> {
        let mut result = GenerationResult::default();

        for item in items {
            let request = RenderRequest {
                text: &item.text,
                instruct: &item.instruct,
                speaker: &item.speaker,
                voice: voices.get(&item.speaker),
                seed: Some(seed),
            };
            match self.request_wav(&request).await {
                Ok(bytes) => {
                    let path = batch_artifact_path(work_dir, item.index);
                    match tokio::fs::write(&path, &bytes).await {
                        Ok(()) => result.completed.push(item.index),
                        Err(e) => result.failed.push((item.index, e.to_string())),
                    }
                }
                Err(e) => result.failed.push((item.index, e.to_string())),
            }
        }

        Ok(result)
    }
}
