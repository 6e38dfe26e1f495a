use serde::{Deserialize, Serialize};

/// One speaker-tagged line as produced by the language model annotation pass.
/// Immutable once chunked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub instruct: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Generating,
    Done,
    Error,
}

/// A renderable unit of audiobook script: one speaker, one text span, one
/// style instruction, plus its rendering lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: usize,
    pub speaker: String,
    pub text: String,
    pub instruct: String,
    pub status: ChunkStatus,
    pub audio_path: Option<String>,
}

impl Chunk {
    fn pending(speaker: &str, text: &str, instruct: &str) -> Self {
        Self {
            id: 0,
            speaker: speaker.to_string(),
            text: text.to_string(),
            instruct: instruct.to_string(),
            status: ChunkStatus::Pending,
            audio_path: None,
        }
    }
}

/// Ids must stay a dense, zero-based, order-preserving sequence.
pub fn renumber(chunks: &mut [Chunk]) {
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.id = i;
    }
}

const STRUCTURAL_MAX_CHARS: usize = 80;

/// Titles, chapter headings and dedications: short text without terminal
/// punctuation. These must never be merged into surrounding narration.
pub fn is_structural_text(text: &str) -> bool {
    let stripped = text.trim();
    if stripped.is_empty() {
        return true;
    }
    stripped.chars().count() < STRUCTURAL_MAX_CHARS
        && !matches!(stripped.chars().next_back(), Some('.' | '!' | '?'))
}

/// Group consecutive entries sharing a speaker and instruct into chunks of up
/// to `max_chars`, never merging across structural text.
pub fn group_into_chunks(entries: &[ScriptEntry], max_chars: usize) -> Vec<Chunk> {
    let Some(first) = entries.first() else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    let mut cur_speaker = first.speaker.clone();
    let mut cur_text = first.text.clone();
    let mut cur_instruct = first.instruct.clone();

    for entry in &entries[1..] {
        let mergeable = entry.speaker == cur_speaker
            && entry.instruct == cur_instruct
            && !is_structural_text(&cur_text)
            && !is_structural_text(&entry.text);

        if mergeable {
            let combined = format!("{} {}", cur_text, entry.text);
            if combined.chars().count() <= max_chars {
                cur_text = combined;
            } else {
                chunks.push(Chunk::pending(&cur_speaker, &cur_text, &cur_instruct));
                cur_text = entry.text.clone();
                cur_instruct = entry.instruct.clone();
            }
        } else {
            chunks.push(Chunk::pending(&cur_speaker, &cur_text, &cur_instruct));
            cur_speaker = entry.speaker.clone();
            cur_text = entry.text.clone();
            cur_instruct = entry.instruct.clone();
        }
    }

    chunks.push(Chunk::pending(&cur_speaker, &cur_text, &cur_instruct));

    renumber(&mut chunks);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(speaker: &str, text: &str, instruct: &str) -> ScriptEntry {
        ScriptEntry {
            speaker: speaker.to_string(),
            text: text.to_string(),
            instruct: instruct.to_string(),
        }
    }

    #[test]
    fn test_structural_text_detection() {
        assert!(is_structural_text(""));
        assert!(is_structural_text("   "));
        assert!(is_structural_text("Chapter One"));
        assert!(is_structural_text("THE RED-HEADED LEAGUE"));
        assert!(!is_structural_text("It was a dark night."));
        assert!(!is_structural_text("Really?"));
        // Long prose without terminal punctuation is still narration.
        let long = "a ".repeat(60);
        assert!(!is_structural_text(&long));
    }

    #[test]
    fn test_merges_same_speaker_runs() {
        let entries = vec![
            entry("NARRATOR", "The first sentence of the story went on for a while.", ""),
            entry("NARRATOR", "Then another sentence followed it.", ""),
            entry("ALICE", "Hello there, who are you exactly?", "curious"),
        ];
        let chunks = group_into_chunks(&entries, 500);

        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].text,
            "The first sentence of the story went on for a while. Then another sentence followed it."
        );
        assert_eq!(chunks[1].speaker, "ALICE");
        assert_eq!(chunks[1].instruct, "curious");
    }

    #[test]
    fn test_never_merges_across_structural_boundary() {
        let entries = vec![
            entry("NARRATOR", "Chapter One", ""),
            entry("NARRATOR", "It began on a rainy Tuesday in the old harbor town.", ""),
            entry("NARRATOR", "Nobody noticed the ship at first.", ""),
        ];
        let chunks = group_into_chunks(&entries, 500);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Chapter One");
        assert!(chunks[1].text.starts_with("It began"));
    }

    #[test]
    fn test_instruct_change_splits() {
        let entries = vec![
            entry("ALICE", "I am fine, thank you very much indeed.", "calm"),
            entry("ALICE", "No, wait, something is wrong here!", "alarmed"),
        ];
        let chunks = group_into_chunks(&entries, 500);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_respects_max_chars() {
        let sentence = "This sentence is exactly some words long and it ends properly.";
        let entries = vec![
            entry("NARRATOR", sentence, ""),
            entry("NARRATOR", sentence, ""),
            entry("NARRATOR", sentence, ""),
        ];
        let chunks = group_into_chunks(&entries, 130);

        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 130);
        }
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_single_oversized_entry_stays_whole() {
        let long = format!("{}.", "word ".repeat(200).trim());
        let entries = vec![entry("NARRATOR", &long, "")];
        let chunks = group_into_chunks(&entries, 100);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, long);
    }

    #[test]
    fn test_ids_are_dense_and_pending() {
        let entries = vec![
            entry("A", "First line of dialogue, spoken clearly.", ""),
            entry("B", "Second line from someone else entirely.", ""),
            entry("A", "And back to the first speaker again.", ""),
        ];
        let chunks = group_into_chunks(&entries, 500);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, i);
            assert_eq!(chunk.status, ChunkStatus::Pending);
            assert!(chunk.audio_path.is_none());
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(group_into_chunks(&[], 500).is_empty());
    }
}
