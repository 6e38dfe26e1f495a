use crate::core::retry::FILE_REPLACE_RETRY;
use crate::services::script::{group_into_chunks, renumber, Chunk, ChunkStatus, ScriptEntry};
use anyhow::{bail, Context, Result};
use log::warn;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Durable record of the chunk list. The persisted file is the single source
/// of truth; every mutation is one critical section covering the whole
/// read-modify-write-persist sequence, so concurrent callers can never lose
/// each other's updates. No raw load+mutate+save is exposed.
pub struct ChunkStore {
    chunks_path: PathBuf,
    script_path: PathBuf,
    max_chunk_chars: usize,
    lock: Mutex<()>,
}

/// Content patch for a single chunk. Any present field resets the chunk to
/// `Pending`; the stale audio path is kept until a regeneration replaces it.
#[derive(Debug, Clone, Default)]
pub struct ChunkEdit {
    pub speaker: Option<String>,
    pub text: Option<String>,
    pub instruct: Option<String>,
}

impl ChunkStore {
    pub fn new(workspace: &Path, max_chunk_chars: usize) -> Self {
        Self {
            chunks_path: workspace.join("chunks.json"),
            script_path: workspace.join("annotated_script.json"),
            max_chunk_chars,
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<Vec<Chunk>> {
        let _guard = self.lock.lock().await;
        self.load_locked().await
    }

    pub async fn save_all(&self, chunks: &[Chunk]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.persist(chunks).await
    }

    pub async fn set_status(&self, id: usize, status: ChunkStatus) -> Result<Chunk> {
        self.mutate(move |chunks| {
            let chunk = chunk_mut(chunks, id)?;
            chunk.status = status;
            Ok(chunk.clone())
        })
        .await
    }

    /// Bulk status flip used when a whole batch moves to `Generating`.
    /// Unknown ids are ignored so one bad index cannot block the rest.
    pub async fn set_status_many(&self, ids: &[usize], status: ChunkStatus) -> Result<()> {
        let ids = ids.to_vec();
        self.mutate(move |chunks| {
            for id in ids {
                if let Some(chunk) = chunks.get_mut(id) {
                    chunk.status = status;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_done(&self, id: usize, audio_path: &str) -> Result<Chunk> {
        let audio_path = audio_path.to_string();
        self.mutate(move |chunks| {
            let chunk = chunk_mut(chunks, id)?;
            chunk.status = ChunkStatus::Done;
            chunk.audio_path = Some(audio_path);
            Ok(chunk.clone())
        })
        .await
    }

    pub async fn mark_error(&self, id: usize) -> Result<Chunk> {
        self.set_status(id, ChunkStatus::Error).await
    }

    pub async fn apply_edit(&self, id: usize, edit: ChunkEdit) -> Result<Chunk> {
        self.mutate(move |chunks| {
            let chunk = chunk_mut(chunks, id)?;
            let mut touched = false;
            if let Some(speaker) = edit.speaker {
                chunk.speaker = speaker;
                touched = true;
            }
            if let Some(text) = edit.text {
                chunk.text = text;
                touched = true;
            }
            if let Some(instruct) = edit.instruct {
                chunk.instruct = instruct;
                touched = true;
            }
            if touched {
                chunk.status = ChunkStatus::Pending;
            }
            Ok(chunk.clone())
        })
        .await
    }

    /// Insert an empty chunk right after `id`, copying the neighbor's
    /// speaker. Returns the renumbered list.
    pub async fn insert_after(&self, id: usize) -> Result<Vec<Chunk>> {
        self.mutate(move |chunks| {
            let source = chunks
                .get(id)
                .with_context(|| format!("invalid chunk index {}", id))?;
            let new_chunk = Chunk {
                id: id + 1,
                speaker: source.speaker.clone(),
                text: String::new(),
                instruct: String::new(),
                status: ChunkStatus::Pending,
                audio_path: None,
            };
            chunks.insert(id + 1, new_chunk);
            renumber(chunks);
            Ok(chunks.clone())
        })
        .await
    }

    /// Remove a chunk. Refused when it is the last one so the list stays
    /// non-empty. Returns the removed chunk and the renumbered list.
    pub async fn delete(&self, id: usize) -> Result<(Chunk, Vec<Chunk>)> {
        self.mutate(move |chunks| {
            if id >= chunks.len() {
                bail!("invalid chunk index {}", id);
            }
            if chunks.len() <= 1 {
                bail!("cannot delete the last remaining chunk");
            }
            let deleted = chunks.remove(id);
            renumber(chunks);
            Ok((deleted, chunks.clone()))
        })
        .await
    }

    /// Re-insert a previously deleted chunk (undo). The index is clamped
    /// into range. Returns the renumbered list.
    pub async fn restore(&self, at_index: usize, chunk: Chunk) -> Result<Vec<Chunk>> {
        self.mutate(move |chunks| {
            let at = at_index.min(chunks.len());
            chunks.insert(at, chunk);
            renumber(chunks);
            Ok(chunks.clone())
        })
        .await
    }

    async fn mutate<T>(&self, op: impl FnOnce(&mut Vec<Chunk>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut chunks = self.load_locked().await?;
        let out = op(&mut chunks)?;
        self.persist(&chunks).await?;
        Ok(out)
    }

    async fn load_locked(&self) -> Result<Vec<Chunk>> {
        if tokio::fs::try_exists(&self.chunks_path).await? {
            let bytes = tokio::fs::read(&self.chunks_path).await?;
            match serde_json::from_slice::<Vec<Chunk>>(&bytes) {
                Ok(chunks) => return Ok(chunks),
                Err(e) => {
                    warn!("chunk list is corrupted ({}), rebuilding from script", e);
                    tokio::fs::remove_file(&self.chunks_path).await?;
                }
            }
        }

        if tokio::fs::try_exists(&self.script_path).await? {
            let bytes = tokio::fs::read(&self.script_path).await?;
            let entries: Vec<ScriptEntry> = serde_json::from_slice(&bytes)
                .context("annotated script is not a valid entry array")?;
            let chunks = group_into_chunks(&entries, self.max_chunk_chars);
            self.persist(&chunks).await?;
            return Ok(chunks);
        }

        Ok(Vec::new())
    }

    async fn persist(&self, chunks: &[Chunk]) -> Result<()> {
        let tmp = self.chunks_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(chunks)?;
        tokio::fs::write(&tmp, content).await?;

        let tmp = &tmp;
        let target = &self.chunks_path;
        FILE_REPLACE_RETRY
            .run(|| async move { tokio::fs::rename(tmp, target).await.map_err(Into::into) })
            .await
            .with_context(|| format!("failed to replace {}", target.display()))
    }
}

fn chunk_mut(chunks: &mut [Chunk], id: usize) -> Result<&mut Chunk> {
    let len = chunks.len();
    chunks
        .get_mut(id)
        .with_context(|| format!("invalid chunk index {} (have {})", id, len))
}
