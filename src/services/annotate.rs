use crate::services::llm::{CompletionClient, SamplingParams};
use crate::services::recovery;
use crate::services::re;
use crate::services::script::ScriptEntry;
use anyhow::{bail, Result};
use log::{info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an audiobook script annotator. You convert prose into a spoken-word \
script. You reply with a single JSON array and nothing else: no markdown \
fences, no commentary, no reasoning. Each element is an object with exactly \
three string fields: \"speaker\" (character name in CAPS, or NARRATOR), \
\"text\" (the words to be spoken, verbatim from the source), and \"instruct\" \
(a short delivery direction such as \"weary\", \"urgent whisper\", or empty). \
Attribute dialogue to the character who speaks it and everything else to \
NARRATOR. Never paraphrase, summarize, or drop source text.";

pub const DEFAULT_USER_PROMPT: &str = "\
{context}\n\nAnnotate the following passage into the JSON array format:\n\n{chunk}";

const REVIEW_SYSTEM_PROMPT: &str = "\
You are an audiobook script editor. You receive a JSON array of script \
entries ({\"speaker\", \"text\", \"instruct\"}) and return the corrected array \
in the same format, nothing else. Fix misattributed speakers, split entries \
that mix narration with dialogue, and tighten delivery directions. Keep the \
source wording: never drop or rewrite the spoken text itself.";

const REVIEW_USER_PROMPT: &str = "\
{context}\n\nReview and correct this batch of script entries:\n\n{batch}";

/// Corrections that drop more than this share of the original words are
/// rejected outright.
pub const TEXT_LOSS_THRESHOLD: f64 = 0.95;

const NARRATOR_MERGE_MAX_CHARS: usize = 800;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReviewStats {
    pub text_changed: usize,
    pub speaker_changed: usize,
    pub instruct_changed: usize,
    pub batches_rejected: usize,
    pub narrator_merges: usize,
}

/// Turns raw book text into an annotated entry list by driving the
/// completion capability slice by slice, and optionally runs a guarded
/// correction pass over the result.
pub struct ScriptWriter<'a> {
    llm: &'a dyn CompletionClient,
    params: SamplingParams,
    max_retries: u32,
}

impl<'a> ScriptWriter<'a> {
    pub fn new(llm: &'a dyn CompletionClient, params: SamplingParams, max_retries: u32) -> Self {
        Self {
            llm,
            params,
            max_retries,
        }
    }

    pub async fn annotate(&self, book_text: &str, slice_chars: usize) -> Result<Vec<ScriptEntry>> {
        let text = fix_mojibake(book_text);
        let slices = split_source_text(&text, slice_chars);
        let total = slices.len();
        info!("annotating {} slices ({} chars)", total, text.chars().count());

        let mut entries: Vec<ScriptEntry> = Vec::new();
        for (i, slice) in slices.iter().enumerate() {
            let context = build_context(i + 1, total, &entries);
            let prompt = DEFAULT_USER_PROMPT
                .replace("{context}", &context)
                .replace("{chunk}", slice);

            let mut recovered = None;
            for attempt in 0..=self.max_retries {
                match self
                    .llm
                    .complete(DEFAULT_SYSTEM_PROMPT, &prompt, self.params)
                    .await
                {
                    Ok(raw) => {
                        if let Some(found) = recovery::recover(&raw) {
                            recovered = Some(found);
                            break;
                        }
                        warn!(
                            "slice {}/{}: nothing recoverable in completion (attempt {})",
                            i + 1,
                            total,
                            attempt + 1
                        );
                    }
                    Err(e) => warn!(
                        "slice {}/{}: completion call failed (attempt {}): {}",
                        i + 1,
                        total,
                        attempt + 1,
                        e
                    ),
                }
            }

            match recovered {
                Some(mut found) => {
                    info!("slice {}/{}: {} entries", i + 1, total, found.len());
                    entries.append(&mut found);
                }
                None => warn!("slice {}/{}: gave up, no usable entries", i + 1, total),
            }
        }

        if entries.is_empty() {
            bail!("no script entries could be generated");
        }
        Ok(entries)
    }

    /// Batched correction pass. A batch whose correction cannot be recovered,
    /// or would lose too many of the original words, keeps its original
    /// entries; the rejection is counted, never silently applied.
    pub async fn review(
        &self,
        entries: &[ScriptEntry],
        batch_size: usize,
        merge_narrators: bool,
    ) -> Result<(Vec<ScriptEntry>, ReviewStats)> {
        let mut corrected_all = Vec::with_capacity(entries.len());
        let mut stats = ReviewStats::default();
        let batches: Vec<&[ScriptEntry]> = entries.chunks(batch_size.max(1)).collect();

        for (i, batch) in batches.iter().enumerate() {
            match self.review_batch(batch, i + 1, batches.len()).await {
                Some(corrected) if passes_text_loss_guard(batch, &corrected) => {
                    tally(&mut stats, batch, &corrected);
                    corrected_all.extend(corrected);
                }
                Some(_) => {
                    warn!(
                        "batch {}/{}: correction dropped too much text, keeping original",
                        i + 1,
                        batches.len()
                    );
                    stats.batches_rejected += 1;
                    corrected_all.extend_from_slice(batch);
                }
                None => {
                    warn!(
                        "batch {}/{}: no usable correction, keeping original",
                        i + 1,
                        batches.len()
                    );
                    stats.batches_rejected += 1;
                    corrected_all.extend_from_slice(batch);
                }
            }
        }

        if merge_narrators {
            let before = corrected_all.len();
            let (merged, merges) = merge_narrator_runs(corrected_all, NARRATOR_MERGE_MAX_CHARS);
            corrected_all = merged;
            stats.narrator_merges = merges;
            if merges > 0 {
                info!(
                    "merged {} narrator runs ({} -> {} entries)",
                    merges,
                    before,
                    corrected_all.len()
                );
            }
        }

        Ok((corrected_all, stats))
    }

    async fn review_batch(
        &self,
        batch: &[ScriptEntry],
        batch_num: usize,
        total: usize,
    ) -> Option<Vec<ScriptEntry>> {
        let batch_json = serde_json::to_string_pretty(batch).ok()?;
        let context = format!("Batch {} of {}.", batch_num, total);
        let prompt = REVIEW_USER_PROMPT
            .replace("{context}", &context)
            .replace("{batch}", &batch_json);

        for attempt in 0..=self.max_retries {
            match self
                .llm
                .complete(REVIEW_SYSTEM_PROMPT, &prompt, self.params)
                .await
            {
                Ok(raw) => {
                    if let Some(entries) = recovery::recover(&raw) {
                        return Some(entries);
                    }
                }
                Err(e) => warn!(
                    "review batch {}: completion failed (attempt {}): {}",
                    batch_num,
                    attempt + 1,
                    e
                ),
            }
        }
        None
    }
}

fn build_context(slice_num: usize, total: usize, previous: &[ScriptEntry]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if slice_num == 1 {
        parts.push("(Beginning of text)".to_string());
    } else if slice_num == total {
        parts.push("(End of text)".to_string());
    } else {
        parts.push(format!("(Part {} of {})", slice_num, total));
    }

    if !previous.is_empty() {
        let mut speakers: Vec<&str> = previous
            .iter()
            .map(|e| e.speaker.as_str())
            .filter(|s| !s.is_empty() && *s != "NARRATOR")
            .collect();
        speakers.sort_unstable();
        speakers.dedup();
        if !speakers.is_empty() {
            parts.push(format!("Characters in this book: {}", speakers.join(", ")));
        }

        parts.push("\nPrevious section ended with:".to_string());
        for entry in previous.iter().rev().take(3).rev() {
            if let Ok(line) = serde_json::to_string(entry) {
                parts.push(line);
            }
        }
    }

    parts.join("\n")
}

/// Split book text into completion-sized slices at paragraph boundaries,
/// falling back to sentence boundaries for oversized paragraphs.
pub fn split_source_text(text: &str, max_size: usize) -> Vec<String> {
    let mut slices = Vec::new();
    let mut current = String::new();

    for para in re!(r"\n\s*\n").split(text) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if current.chars().count() + para.chars().count() + 2 > max_size {
            if !current.is_empty() {
                slices.push(std::mem::take(&mut current));
            }

            if para.chars().count() > max_size {
                for sentence in split_sentences(para) {
                    if current.chars().count() + sentence.chars().count() + 1 > max_size {
                        if !current.is_empty() {
                            slices.push(std::mem::take(&mut current));
                        }
                        current = sentence;
                    } else if current.is_empty() {
                        current = sentence;
                    } else {
                        current.push(' ');
                        current.push_str(&sentence);
                    }
                }
            } else {
                current = para.to_string();
            }
        } else if current.is_empty() {
            current = para.to_string();
        } else {
            current.push_str("\n\n");
            current.push_str(para);
        }
    }

    if !current.trim().is_empty() {
        slices.push(current);
    }
    slices
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|n| n.is_whitespace()) {
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Repair common CP1252-as-UTF8 artifacts that otherwise end up spoken.
pub fn fix_mojibake(text: &str) -> String {
    const REPLACEMENTS: &[(&str, &str)] = &[
        ("â€™", "\u{2019}"),
        ("â€˜", "\u{2018}"),
        ("â€œ", "\u{201c}"),
        ("â€\u{9d}", "\u{201d}"),
        ("â€\u{201d}", "\u{2014}"),
        ("â€\u{201c}", "\u{2013}"),
        ("â€¦", "\u{2026}"),
    ];
    let mut out = text.to_string();
    for (bad, good) in REPLACEMENTS {
        if out.contains(bad) {
            out = out.replace(bad, good);
        }
    }
    out
}

fn normalized_word_count(entries: &[ScriptEntry]) -> usize {
    entries
        .iter()
        .flat_map(|e| e.text.split_whitespace())
        .filter(|w| w.chars().any(|c| c.is_alphanumeric()))
        .count()
}

/// True when the corrected entries keep at least `TEXT_LOSS_THRESHOLD` of
/// the original word count.
pub fn passes_text_loss_guard(original: &[ScriptEntry], corrected: &[ScriptEntry]) -> bool {
    let original_words = normalized_word_count(original);
    if original_words == 0 {
        return true;
    }
    let corrected_words = normalized_word_count(corrected);
    corrected_words as f64 / original_words as f64 >= TEXT_LOSS_THRESHOLD
}

fn tally(stats: &mut ReviewStats, original: &[ScriptEntry], corrected: &[ScriptEntry]) {
    for (orig, corr) in original.iter().zip(corrected.iter()) {
        if orig.text != corr.text {
            stats.text_changed += 1;
        }
        if orig.speaker != corr.speaker {
            stats.speaker_changed += 1;
        }
        if orig.instruct != corr.instruct {
            stats.instruct_changed += 1;
        }
    }
}

/// Chapter headings and short all-caps titles mark section breaks that
/// narrator merging must never cross.
fn is_section_break(text: &str) -> bool {
    let stripped = text.trim();
    if re!(r"(?i)^chapter\b").is_match(stripped) {
        return true;
    }
    stripped == stripped.to_uppercase() && stripped.chars().count() < 80 && stripped.is_ascii()
}

/// Merge consecutive NARRATOR entries sharing an instruct value, capped so
/// the merged text stays renderable.
pub fn merge_narrator_runs(entries: Vec<ScriptEntry>, max_chars: usize) -> (Vec<ScriptEntry>, usize) {
    let mut merged: Vec<ScriptEntry> = Vec::with_capacity(entries.len());
    let mut merges = 0;
    let mut iter = entries.into_iter().peekable();

    while let Some(entry) = iter.next() {
        if entry.speaker != "NARRATOR" || is_section_break(&entry.text) {
            merged.push(entry);
            continue;
        }

        let mut combined = entry;
        while let Some(next) = iter.peek() {
            if next.speaker != "NARRATOR"
                || next.instruct != combined.instruct
                || is_section_break(&next.text)
            {
                break;
            }
            let candidate_len = combined.text.chars().count() + 1 + next.text.chars().count();
            if candidate_len > max_chars {
                break;
            }
            combined.text.push(' ');
            combined.text.push_str(&next.text);
            merges += 1;
            iter.next();
        }
        merged.push(combined);
    }

    (merged, merges)
}
