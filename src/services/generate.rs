use crate::core::retry::TEMP_CLEANUP_RETRY;
use crate::services::engine::{batch_artifact_path, GenerationResult, RenderEngine, RenderItem};
use crate::services::script::{Chunk, ChunkStatus};
use crate::services::store::ChunkStore;
use crate::services::voice::VoiceLibrary;
use crate::utils::audio::{sanitize_filename, WavAudio};
use crate::utils::convert;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Rendered WAV artifacts below a bare header's size mean the engine
/// produced no audio at all.
const MIN_WAV_BYTES: u64 = 128;

/// Drives single, parallel, and batched rendering against the injected
/// engine handle, and owns all post-render artifact handling. All chunk
/// state changes go through the store's atomic operations.
pub struct Orchestrator {
    store: Arc<ChunkStore>,
    engine: Arc<dyn RenderEngine>,
    workspace: PathBuf,
    voices_path: PathBuf,
    voicelines_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(store: Arc<ChunkStore>, engine: Arc<dyn RenderEngine>, workspace: &Path) -> Self {
        Self {
            store,
            engine,
            workspace: workspace.to_path_buf(),
            voices_path: workspace.join("voices.json"),
            voicelines_dir: workspace.join("voicelines"),
        }
    }

    /// Render one chunk through the full sequence: mark generating, render,
    /// validate, convert with fallback, record the audio path, clean up.
    /// Returns the stored audio path. Any failure marks the chunk `Error`.
    pub async fn render_chunk(&self, index: usize) -> Result<String> {
        let chunks = self.store.load().await?;
        let chunk = chunks
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("invalid chunk index {}", index))?;
        if chunk.text.trim().is_empty() {
            bail!("chunk {} has no text to render", index);
        }

        self.store.set_status(index, ChunkStatus::Generating).await?;

        match self.render_to_artifact(index, &chunk).await {
            Ok(audio_path) => {
                self.store.mark_done(index, &audio_path).await?;
                Ok(audio_path)
            }
            Err(e) => {
                if let Err(mark_err) = self.store.mark_error(index).await {
                    warn!("failed to flag chunk {} as errored: {}", index, mark_err);
                }
                Err(e)
            }
        }
    }

    /// Render many chunks on a bounded worker pool, each worker running the
    /// full single-chunk sequence with its own index-named temp file.
    pub async fn render_parallel(&self, indices: &[usize], workers: usize) -> Result<GenerationResult> {
        let chunks = self.store.load().await?;
        let indices = filter_renderable(indices, &chunks);
        let mut result = GenerationResult::default();
        if indices.is_empty() {
            return Ok(result);
        }

        let workers = workers.max(1);
        info!("rendering {} chunks with {} workers", indices.len(), workers);

        let pb = ProgressBar::new(indices.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        let outcomes: Vec<(usize, Result<String>)> = futures_util::stream::iter(indices)
            .map(|index| {
                let pb = pb.clone();
                async move {
                    let outcome = self.render_chunk(index).await;
                    pb.inc(1);
                    (index, outcome)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;
        pb.finish_and_clear();

        for (index, outcome) in outcomes {
            match outcome {
                Ok(_) => result.completed.push(index),
                Err(e) => result.failed.push((index, e.to_string())),
            }
        }

        info!(
            "parallel generation complete: {} succeeded, {} failed",
            result.completed.len(),
            result.failed.len()
        );
        Ok(result)
    }

    /// Render many chunks through the engine's batch API, one in-flight call
    /// per fixed-size batch, all sharing a single seed. Results are flushed
    /// to the store before the next batch starts, so an interrupted run
    /// leaves a consistent prefix that is safe to re-run.
    pub async fn render_batch(
        &self,
        indices: &[usize],
        seed: Option<i64>,
        batch_size: usize,
        group_by_voice: bool,
    ) -> Result<GenerationResult> {
        let mut result = GenerationResult::default();
        let chunks = self.store.load().await?;
        let mut indices = filter_renderable(indices, &chunks);
        if indices.is_empty() {
            return Ok(result);
        }

        // Fresh view of the voice library for this orchestration call.
        let voices = VoiceLibrary::load(&self.voices_path).await?;

        let seed = match seed {
            Some(seed) => seed,
            None => {
                let drawn = rand::rng().random_range(0..i64::MAX);
                info!("no batch seed configured, drew {}", drawn);
                drawn
            }
        };

        let known: Vec<usize> = indices.iter().copied().filter(|&i| i < chunks.len()).collect();
        self.store
            .set_status_many(&known, ChunkStatus::Generating)
            .await?;

        // Contiguous same-voice runs let the engine form larger homogeneous
        // batches instead of fragmenting every call across voice types.
        if group_by_voice {
            indices = group_indices_by_voice(&indices, &chunks, &voices);
        }

        let batch_size = batch_size.max(1);
        let batches: Vec<&[usize]> = indices.chunks(batch_size).collect();
        info!(
            "processing {} batches of up to {} chunks (seed={}, group_by_voice={})",
            batches.len(),
            batch_size,
            seed,
            group_by_voice
        );

        for (batch_num, batch) in batches.iter().enumerate() {
            let mut items = Vec::new();
            for &index in *batch {
                match chunks.get(index) {
                    Some(chunk) => items.push(RenderItem {
                        index,
                        text: chunk.text.clone(),
                        instruct: chunk.instruct.clone(),
                        speaker: chunk.speaker.clone(),
                    }),
                    None => result
                        .failed
                        .push((index, format!("invalid chunk index {}", index))),
                }
            }
            if items.is_empty() {
                continue;
            }

            let report = match self
                .engine
                .render_batch(&items, &voices, seed, &self.workspace)
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    // The whole call failed (engine unreachable); every chunk
                    // in this batch fails, later batches still get their try.
                    for item in &items {
                        self.flag_error(item.index).await;
                        result.failed.push((item.index, e.to_string()));
                    }
                    continue;
                }
            };

            for index in report.completed {
                let Some(chunk) = chunks.get(index) else {
                    result
                        .failed
                        .push((index, "completed index out of range".to_string()));
                    continue;
                };
                let temp_path = batch_artifact_path(&self.workspace, index);
                match self.finish_artifact(index, &chunk.speaker, &temp_path).await {
                    Ok(audio_path) => {
                        self.store.mark_done(index, &audio_path).await?;
                        result.completed.push(index);
                    }
                    Err(e) => {
                        self.flag_error(index).await;
                        result.failed.push((index, e.to_string()));
                    }
                }
            }

            for (index, reason) in report.failed {
                if index < chunks.len() {
                    self.flag_error(index).await;
                }
                result.failed.push((index, reason));
            }

            info!(
                "batch {}/{} flushed: {} done, {} failed so far",
                batch_num + 1,
                batches.len(),
                result.completed.len(),
                result.failed.len()
            );
        }

        Ok(result)
    }

    async fn render_to_artifact(&self, index: usize, chunk: &Chunk) -> Result<String> {
        // Fresh view of the voice library for this orchestration call.
        let voices = VoiceLibrary::load(&self.voices_path).await?;

        let wav = self
            .engine
            .render(&chunk.text, &chunk.instruct, &chunk.speaker, &voices)
            .await?;

        let temp_path = self.workspace.join(format!("temp_chunk_{}.wav", index));
        tokio::fs::write(&temp_path, &wav).await?;

        self.finish_artifact(index, &chunk.speaker, &temp_path).await
    }

    /// Shared post-render sequence: validate the temp artifact, convert it
    /// into the voicelines directory with lossless fallback, delete the temp
    /// file (retried, the encoder may still hold it briefly). Returns the
    /// workspace-relative audio path.
    async fn finish_artifact(&self, index: usize, speaker: &str, temp_path: &Path) -> Result<String> {
        if !tokio::fs::try_exists(temp_path).await? {
            bail!("rendered audio file does not exist");
        }
        let size = tokio::fs::metadata(temp_path).await?.len();
        if size < MIN_WAV_BYTES {
            bail!("rendered audio file is empty ({} bytes)", size);
        }
        let bytes = tokio::fs::read(temp_path).await?;
        let parsed = WavAudio::parse(&bytes).context("rendered audio is not valid wav")?;
        if parsed.duration_ms()? == 0 {
            bail!("rendered audio has zero duration");
        }

        tokio::fs::create_dir_all(&self.voicelines_dir).await?;
        let base = format!("line_{:04}_{}", index + 1, sanitize_filename(speaker));
        let out_path = convert::encode_with_fallback(temp_path, &self.voicelines_dir, &base).await?;

        let cleanup = TEMP_CLEANUP_RETRY
            .run(|| async move { tokio::fs::remove_file(temp_path).await.map_err(Into::into) })
            .await;
        if cleanup.is_err() {
            warn!("could not delete temp file {}", temp_path.display());
        }

        let rel = out_path.strip_prefix(&self.workspace).unwrap_or(&out_path);
        Ok(rel.to_string_lossy().replace('\\', "/"))
    }

    async fn flag_error(&self, index: usize) {
        if let Err(e) = self.store.mark_error(index).await {
            warn!("failed to flag chunk {} as errored: {}", index, e);
        }
    }
}

/// Drop empty-text chunks; out-of-range indices stay in and surface as
/// per-index failures rather than being silently swallowed.
fn filter_renderable(indices: &[usize], chunks: &[Chunk]) -> Vec<usize> {
    indices
        .iter()
        .copied()
        .filter(|&i| chunks.get(i).is_none_or(|c| !c.text.trim().is_empty()))
        .collect()
}

/// Reorder indices so runs sharing a voice-type grouping key become
/// contiguous, preserving original order within each group.
fn group_indices_by_voice(indices: &[usize], chunks: &[Chunk], voices: &VoiceLibrary) -> Vec<usize> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

    for &index in indices {
        let key = match chunks.get(index) {
            Some(chunk) => voices.group_key(&chunk.speaker),
            None => "custom".to_string(),
        };
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(index);
    }

    let mut reordered = Vec::with_capacity(indices.len());
    for key in order {
        let group = &groups[&key];
        info!("voice group '{}': {} chunks", key, group.len());
        reordered.extend(group.iter().copied());
    }
    reordered
}
