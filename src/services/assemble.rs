use crate::services::script::Chunk;
use crate::utils::audio::{sanitize_filename, WavAudio};
use crate::utils::convert;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Gap between chronologically adjacent chunks from the same speaker.
pub const SAME_SPEAKER_PAUSE_MS: u64 = 250;
/// Longer gap on a speaker change.
pub const SPEAKER_CHANGE_PAUSE_MS: u64 = 500;

/// The very first chunk has no leading gap.
pub fn pause_before_ms(prev_speaker: Option<&str>, speaker: &str) -> u64 {
    match prev_speaker {
        None => 0,
        Some(prev) if prev == speaker => SAME_SPEAKER_PAUSE_MS,
        Some(_) => SPEAKER_CHANGE_PAUSE_MS,
    }
}

/// One rendered segment placed on the global timeline.
struct Placed {
    speaker: String,
    text: String,
    audio: WavAudio,
    start_ms: u64,
    duration_ms: u64,
}

/// Reconstructs listenable audio from independently rendered chunk files:
/// a single paced track, and a multi-track export bundle whose per-speaker
/// tracks line up on one shared timeline.
pub struct Assembler {
    workspace: PathBuf,
}

impl Assembler {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }

    /// Concatenate every rendered chunk in declared order with the pause
    /// rule, then encode. Returns the merged track path.
    pub async fn merge(&self, chunks: &[Chunk]) -> Result<PathBuf> {
        let loaded = self.load_rendered(chunks).await;
        if loaded.is_empty() {
            bail!("no rendered audio segments found");
        }

        let combined = combine_with_pauses(&loaded)?;

        let temp_wav = self.workspace.join("merged.tmp.wav");
        tokio::fs::write(&temp_wav, combined.to_bytes()).await?;
        let out = convert::encode_with_fallback(&temp_wav, &self.workspace, "audiobook").await?;
        let _ = tokio::fs::remove_file(&temp_wav).await;

        info!("merged {} segments into {}", loaded.len(), out.display());
        Ok(out)
    }

    /// Build the multi-track export bundle: one continuous equal-length WAV
    /// per speaker, a playlist file for synchronized import, and a label
    /// file with absolute segment times. Everything lands in one archive.
    pub async fn export_tracks(&self, chunks: &[Chunk]) -> Result<PathBuf> {
        let loaded = self.load_rendered(chunks).await;
        if loaded.is_empty() {
            bail!("no rendered audio segments found");
        }

        let (timeline, total_ms) = place_on_timeline(loaded)?;

        let mut speakers: Vec<String> = Vec::new();
        for placed in &timeline {
            if !speakers.contains(&placed.speaker) {
                speakers.push(placed.speaker.clone());
            }
        }

        let mut tracks: Vec<(String, WavAudio)> = Vec::new();
        for speaker in &speakers {
            let mut track = timeline[0].audio.empty_like();
            let mut write_pos = 0u64;
            for placed in timeline.iter().filter(|p| &p.speaker == speaker) {
                if placed.start_ms > write_pos {
                    track.push_silence(placed.start_ms - write_pos)?;
                }
                track.push(&placed.audio)?;
                write_pos = placed.start_ms + placed.duration_ms;
            }
            if total_ms > write_pos {
                track.push_silence(total_ms - write_pos)?;
            }
            tracks.push((speaker.clone(), track));
        }

        // Silence rounding is per-gap; equalize the last few bytes so every
        // track decodes to the same length.
        let max_len = tracks.iter().map(|(_, t)| t.data.len()).max().unwrap_or(0);
        for (_, track) in &mut tracks {
            track.data.resize(max_len, 0);
        }

        let mut playlist = String::new();
        for speaker in &speakers {
            playlist.push_str(&format!("file \"{}.wav\"\n", sanitize_filename(speaker)));
        }

        let mut labels = String::new();
        for placed in &timeline {
            let start = placed.start_ms as f64 / 1000.0;
            let end = (placed.start_ms + placed.duration_ms) as f64 / 1000.0;
            let preview: String = placed.text.chars().take(80).collect();
            labels.push_str(&format!(
                "{:.6}\t{:.6}\t[{}] {}\n",
                start, end, placed.speaker, preview
            ));
        }

        let bundle_path = self.workspace.join("tracks_export.zip");
        let file = std::fs::File::create(&bundle_path)
            .with_context(|| format!("failed to create {}", bundle_path.display()))?;
        let mut archive = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        archive.start_file("project.lof", options)?;
        archive.write_all(playlist.as_bytes())?;
        archive.start_file("labels.txt", options)?;
        archive.write_all(labels.as_bytes())?;
        for (speaker, track) in &tracks {
            archive.start_file(format!("{}.wav", sanitize_filename(speaker)), options)?;
            archive.write_all(&track.to_bytes())?;
        }
        archive.finish()?;

        info!(
            "exported {} tracks ({} segments) to {}",
            tracks.len(),
            timeline.len(),
            bundle_path.display()
        );
        Ok(bundle_path)
    }

    /// Load the audio of every chunk that has a valid, existing file,
    /// decoding non-WAV containers through the conversion utility. Chunks
    /// without usable audio are skipped, not fatal.
    async fn load_rendered(&self, chunks: &[Chunk]) -> Vec<(Chunk, WavAudio)> {
        let mut loaded = Vec::new();
        for chunk in chunks {
            let Some(rel) = &chunk.audio_path else { continue };
            let full = self.workspace.join(rel);
            match tokio::fs::try_exists(&full).await {
                Ok(true) => {}
                _ => {
                    warn!("audio file missing for chunk {}: {}", chunk.id, rel);
                    continue;
                }
            }
            let bytes = match convert::decode_to_wav(&full).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("skipping chunk {}: {}", chunk.id, e);
                    continue;
                }
            };
            match WavAudio::parse(&bytes) {
                Ok(audio) => loaded.push((chunk.clone(), audio)),
                Err(e) => warn!("skipping chunk {}: {}", chunk.id, e),
            }
        }
        loaded
    }
}

/// Concatenate segments with the pause rule interleaved.
fn combine_with_pauses(segments: &[(Chunk, WavAudio)]) -> Result<WavAudio> {
    let Some((_, first)) = segments.first() else {
        bail!("nothing to combine");
    };
    let mut combined = first.empty_like();
    let mut prev_speaker: Option<&str> = None;
    for (chunk, audio) in segments {
        let gap = pause_before_ms(prev_speaker, &chunk.speaker);
        if gap > 0 {
            combined.push_silence(gap)?;
        }
        combined
            .push(audio)
            .with_context(|| format!("segment {} has an incompatible format", chunk.id))?;
        prev_speaker = Some(&chunk.speaker);
    }
    Ok(combined)
}

/// Walk segments in order, accumulating a cursor with the pause rule. Yields
/// each segment's absolute start and the total timeline length.
fn place_on_timeline(segments: Vec<(Chunk, WavAudio)>) -> Result<(Vec<Placed>, u64)> {
    let mut timeline = Vec::with_capacity(segments.len());
    let mut cursor_ms = 0u64;
    let mut prev_speaker: Option<String> = None;

    for (chunk, audio) in segments {
        cursor_ms += pause_before_ms(prev_speaker.as_deref(), &chunk.speaker);
        let duration_ms = audio.duration_ms()?;
        timeline.push(Placed {
            speaker: chunk.speaker.clone(),
            text: chunk.text,
            audio,
            start_ms: cursor_ms,
            duration_ms,
        });
        cursor_ms += duration_ms;
        prev_speaker = Some(chunk.speaker);
    }

    Ok((timeline, cursor_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::script::ChunkStatus;
    use crate::utils::audio::dummy_wav;
    use std::io::Read;

    fn chunk(id: usize, speaker: &str, text: &str, audio_path: Option<&str>) -> Chunk {
        Chunk {
            id,
            speaker: speaker.to_string(),
            text: text.to_string(),
            instruct: String::new(),
            status: if audio_path.is_some() {
                ChunkStatus::Done
            } else {
                ChunkStatus::Pending
            },
            audio_path: audio_path.map(str::to_string),
        }
    }

    fn wav(ms: u64) -> WavAudio {
        WavAudio::parse(&dummy_wav(ms, 24000)).unwrap()
    }

    #[test]
    fn test_pause_rule() {
        assert_eq!(pause_before_ms(None, "A"), 0);
        assert_eq!(pause_before_ms(Some("A"), "A"), SAME_SPEAKER_PAUSE_MS);
        assert_eq!(pause_before_ms(Some("A"), "B"), SPEAKER_CHANGE_PAUSE_MS);
    }

    #[test]
    fn test_combine_inserts_pauses() {
        let segments = vec![
            (chunk(0, "A", "x", None), wav(1000)),
            (chunk(1, "A", "y", None), wav(1000)),
            (chunk(2, "B", "z", None), wav(1000)),
        ];
        let combined = combine_with_pauses(&segments).unwrap();
        assert_eq!(combined.duration_ms().unwrap(), 1000 + 250 + 1000 + 500 + 1000);
    }

    #[test]
    fn test_timeline_start_offsets() {
        let segments = vec![
            (chunk(0, "A", "x", None), wav(1000)),
            (chunk(1, "A", "y", None), wav(1000)),
            (chunk(2, "B", "z", None), wav(1000)),
        ];
        let (timeline, total) = place_on_timeline(segments).unwrap();

        assert_eq!(timeline[0].start_ms, 0);
        assert_eq!(timeline[1].start_ms, 1250);
        assert_eq!(timeline[2].start_ms, 2750);
        assert_eq!(total, 3750);
    }

    #[tokio::test]
    async fn test_merge_skips_missing_audio() -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("a.wav"), dummy_wav(500, 24000)).await?;

        let chunks = vec![
            chunk(0, "A", "has audio", Some("a.wav")),
            chunk(1, "B", "audio never rendered", None),
            chunk(2, "B", "file vanished", Some("gone.wav")),
        ];

        let assembler = Assembler::new(dir.path());
        let out = assembler.merge(&chunks).await?;
        assert!(out.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_with_nothing_rendered_fails() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Assembler::new(dir.path());
        let chunks = vec![chunk(0, "A", "nothing here", None)];
        assert!(assembler.merge(&chunks).await.is_err());
    }

    #[tokio::test]
    async fn test_export_bundle_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("a0.wav"), dummy_wav(1000, 24000)).await?;
        tokio::fs::write(dir.path().join("b0.wav"), dummy_wav(500, 24000)).await?;
        tokio::fs::write(dir.path().join("a1.wav"), dummy_wav(700, 24000)).await?;

        let chunks = vec![
            chunk(0, "ALICE", "Alice speaks first.", Some("a0.wav")),
            chunk(1, "BOB", "Bob replies.", Some("b0.wav")),
            chunk(2, "ALICE", "Alice again.", Some("a1.wav")),
        ];

        let assembler = Assembler::new(dir.path());
        let bundle = assembler.export_tracks(&chunks).await?;

        let file = std::fs::File::open(&bundle)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let mut playlist = String::new();
        archive.by_name("project.lof")?.read_to_string(&mut playlist)?;
        assert_eq!(playlist, "file \"alice.wav\"\nfile \"bob.wav\"\n");

        let mut labels = String::new();
        archive.by_name("labels.txt")?.read_to_string(&mut labels)?;
        let lines: Vec<&str> = labels.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0.000000\t1.000000\t[ALICE]"));
        // Bob starts after Alice's 1000ms plus a speaker-change pause.
        assert!(lines[1].starts_with("1.500000\t2.000000\t[BOB]"));
        // Alice resumes after another speaker-change pause.
        assert!(lines[2].starts_with("2.500000\t3.200000\t[ALICE]"));

        // Both tracks decode to the same total length.
        let mut alice_bytes = Vec::new();
        archive.by_name("alice.wav")?.read_to_end(&mut alice_bytes)?;
        let mut bob_bytes = Vec::new();
        archive.by_name("bob.wav")?.read_to_end(&mut bob_bytes)?;
        let alice = WavAudio::parse(&alice_bytes)?;
        let bob = WavAudio::parse(&bob_bytes)?;
        assert_eq!(alice.data.len(), bob.data.len());
        assert_eq!(alice.duration_ms()?, 3200);
        Ok(())
    }
}
