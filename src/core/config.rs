use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_workspace")]
    pub workspace: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub script: ScriptConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RenderConfig {
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    #[serde(default = "default_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Shared seed for batched rendering. Unset means a fresh seed is drawn
    /// per run and logged.
    #[serde(default)]
    pub batch_seed: Option<i64>,
    /// Reorder batch indices so chunks with the same voice type land in the
    /// same engine call.
    #[serde(default)]
    pub group_by_voice: bool,
    #[serde(default)]
    pub use_batch_api: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScriptConfig {
    #[serde(default = "default_slice_chars")]
    pub slice_chars: usize,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_review_batch")]
    pub review_batch: usize,
    #[serde(default)]
    pub merge_narrators: bool,
}

fn default_workspace() -> String {
    "workspace".to_string()
}
fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_api_key() -> String {
    "local".to_string()
}
fn default_temperature() -> f32 {
    0.6
}
fn default_top_p() -> f32 {
    0.8
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_retry_count() -> u32 {
    2
}
fn default_engine_url() -> String {
    "http://127.0.0.1:7860".to_string()
}
fn default_workers() -> usize {
    2
}
fn default_batch_size() -> usize {
    4
}
fn default_slice_chars() -> usize {
    3000
}
fn default_chunk_chars() -> usize {
    500
}
fn default_review_batch() -> usize {
    25
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            parallel_workers: default_workers(),
            batch_size: default_batch_size(),
            batch_seed: None,
            group_by_voice: false,
            use_batch_api: false,
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            slice_chars: default_slice_chars(),
            chunk_chars: default_chunk_chars(),
            review_batch: default_review_batch(),
            merge_narrators: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(&self.workspace)
    }

    pub fn script_path(&self) -> PathBuf {
        self.workspace_dir().join("annotated_script.json")
    }

    pub fn voicelines_dir(&self) -> PathBuf {
        self.workspace_dir().join("voicelines")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(self.workspace_dir())?;
        fs::create_dir_all(self.voicelines_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let yaml = "llm:\n  model: test-model\n";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.workspace, "workspace");
        assert_eq!(config.llm.model, "test-model");
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(config.render.parallel_workers, 2);
        assert_eq!(config.render.batch_seed, None);
        assert!(!config.render.group_by_voice);
        assert_eq!(config.script.chunk_chars, 500);
        assert_eq!(config.script.slice_chars, 3000);
    }

    #[test]
    fn test_render_overrides() {
        let yaml = concat!(
            "llm:\n  model: m\n",
            "render:\n  batch_size: 8\n  batch_seed: 42\n  group_by_voice: true\n",
        );
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.render.batch_size, 8);
        assert_eq!(config.render.batch_seed, Some(42));
        assert!(config.render.group_by_voice);
    }
}
