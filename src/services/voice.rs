use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// How a speaker's voice is produced by the rendering engine. Validated once
/// at load time instead of at every use site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VoiceSpec {
    Preset {
        name: String,
        #[serde(default)]
        style: String,
    },
    Clone {
        ref_audio: String,
        ref_text: String,
    },
    #[serde(rename = "lora")]
    LoraAdapter { adapter_id: String },
    Design { description: String },
}

/// Speaker-to-voice mapping. Read-only to the pipeline; orchestration calls
/// reload it fresh so edits between runs take effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceLibrary {
    #[serde(flatten)]
    pub speakers: HashMap<String, VoiceSpec>,
}

impl VoiceLibrary {
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }
        let bytes = tokio::fs::read(path).await?;
        let library: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse voice library {}", path.display()))?;
        library.validate()?;
        Ok(library)
    }

    pub fn validate(&self) -> Result<()> {
        for (speaker, spec) in &self.speakers {
            match spec {
                VoiceSpec::Preset { name, .. } if name.trim().is_empty() => {
                    bail!("voice for '{}' has an empty preset name", speaker)
                }
                VoiceSpec::Clone { ref_audio, ref_text }
                    if ref_audio.trim().is_empty() || ref_text.trim().is_empty() =>
                {
                    bail!("clone voice for '{}' is missing ref_audio or ref_text", speaker)
                }
                VoiceSpec::LoraAdapter { adapter_id } if adapter_id.trim().is_empty() => {
                    bail!("lora voice for '{}' has an empty adapter id", speaker)
                }
                VoiceSpec::Design { description } if description.trim().is_empty() => {
                    bail!("design voice for '{}' has an empty description", speaker)
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn get(&self, speaker: &str) -> Option<&VoiceSpec> {
        self.speakers.get(speaker)
    }

    /// Key identifying which homogeneous rendering batch a speaker belongs
    /// to. Preset and unconfigured speakers share one pool; clone voices
    /// batch per speaker, lora voices per adapter, designed voices together.
    pub fn group_key(&self, speaker: &str) -> String {
        match self.speakers.get(speaker) {
            Some(VoiceSpec::Clone { .. }) => format!("clone:{}", speaker),
            Some(VoiceSpec::LoraAdapter { adapter_id }) => format!("lora:{}", adapter_id),
            Some(VoiceSpec::Design { .. }) => "design".to_string(),
            _ => "custom".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_parse() {
        let json = r#"{
            "NARRATOR": {"type": "preset", "name": "Ryan", "style": "measured"},
            "ALICE": {"type": "clone", "ref_audio": "refs/alice.wav", "ref_text": "Hi."},
            "BOB": {"type": "lora", "adapter_id": "bob_v2"},
            "GHOST": {"type": "design", "description": "A hollow, echoing whisper"}
        }"#;
        let library: VoiceLibrary = serde_json::from_str(json).unwrap();
        library.validate().unwrap();

        assert!(matches!(
            library.get("NARRATOR"),
            Some(VoiceSpec::Preset { name, .. }) if name == "Ryan"
        ));
        assert!(matches!(library.get("GHOST"), Some(VoiceSpec::Design { .. })));
    }

    #[test]
    fn test_validation_rejects_incomplete_clone() {
        let json = r#"{"ALICE": {"type": "clone", "ref_audio": "", "ref_text": "Hi."}}"#;
        let library: VoiceLibrary = serde_json::from_str(json).unwrap();
        assert!(library.validate().is_err());
    }

    #[test]
    fn test_group_keys() {
        let json = r#"{
            "N": {"type": "preset", "name": "Ryan"},
            "A": {"type": "clone", "ref_audio": "a.wav", "ref_text": "t"},
            "B": {"type": "lora", "adapter_id": "x"},
            "G": {"type": "design", "description": "d"}
        }"#;
        let library: VoiceLibrary = serde_json::from_str(json).unwrap();

        assert_eq!(library.group_key("N"), "custom");
        assert_eq!(library.group_key("A"), "clone:A");
        assert_eq!(library.group_key("B"), "lora:x");
        assert_eq!(library.group_key("G"), "design");
        assert_eq!(library.group_key("unknown"), "custom");
    }
}
