use crate::services::re;
use crate::services::script::ScriptEntry;
use log::{debug, warn};

/// Recover a well-formed entry array from a raw, possibly truncated or
/// decorated model completion. Strategies are layered and applied in order;
/// `None` means every one of them came up empty.
///
/// This is a pure function: no side effects beyond diagnostic logging.
pub fn recover(raw: &str) -> Option<Vec<ScriptEntry>> {
    let text = strip_reasoning(raw);
    let text = extract_fenced_block(&text);

    if let Some(candidate) = extract_array_span(&text) {
        let candidate = escape_control_chars(&candidate);
        if let Some(entries) = parse_with_repairs(&candidate) {
            return Some(entries);
        }
        debug!("array candidate resisted every repair, falling back to field salvage");
    }

    let entries = salvage_entries(raw);
    if entries.is_empty() {
        warn!("no script entries recoverable from completion ({} chars)", raw.len());
        None
    } else {
        debug!("field-level salvage recovered {} entries", entries.len());
        Some(entries)
    }
}

/// Remove model "reasoning" segments so they are never mistaken for payload.
/// Handles both closed pairs and tags left unclosed at end of text.
fn strip_reasoning(text: &str) -> String {
    let mut out = text.to_string();
    for re in [
        re!(r"(?s)<think>.*?</think>"),
        re!(r"(?s)<thinking>.*?</thinking>"),
        re!(r"(?s)<reflection>.*?</reflection>"),
        re!(r"(?s)<reasoning>.*?</reasoning>"),
        re!(r"(?s)<think>.*$"),
        re!(r"(?s)<thinking>.*$"),
    ] {
        out = re.replace_all(&out, "").into_owned();
    }
    out
}

/// Prefer the content of the first fenced code block when one is present.
fn extract_fenced_block(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    match re!(r"```(?:json)?\s*([\s\S]*?)```").captures(text) {
        Some(caps) => caps[1].trim().to_string(),
        None => text.to_string(),
    }
}

/// Scan from the first `[` with a depth counter, ignoring brackets inside
/// quoted strings (one-character escape lookahead, so `\"` does not toggle).
/// With no closing bracket in sight, truncate at the last complete `},` and
/// close the array manually.
fn extract_array_span(text: &str) -> Option<String> {
    let start = text.find('[')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' => escape_next = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }

    match text.rfind("},") {
        Some(pos) if pos > start => Some(format!("{}]", &text[start..pos + 1])),
        _ => None,
    }
}

/// Literal newlines, tabs and carriage returns inside string literals are a
/// common completion artifact and break strict parsing.
fn escape_control_chars(text: &str) -> String {
    re!(r#""[^"\\]*(?:\\.[^"\\]*)*""#)
        .replace_all(text, |caps: &regex::Captures| {
            caps[0]
                .replace('\n', "\\n")
                .replace('\r', "\\r")
                .replace('\t', "\\t")
        })
        .into_owned()
}

fn parse_entries(text: &str) -> Option<Vec<ScriptEntry>> {
    serde_json::from_str::<Vec<ScriptEntry>>(text)
        .ok()
        .filter(|entries| !entries.is_empty())
}

/// Strict parse first, then repair heuristics in sequence, accepting the
/// first that yields a non-empty array.
fn parse_with_repairs(candidate: &str) -> Option<Vec<ScriptEntry>> {
    if let Some(entries) = parse_entries(candidate) {
        return Some(entries);
    }

    // Missing commas between adjacent objects.
    let fixed = re!(r"\}\s*\{")
        .replace_all(candidate, "},\n{")
        .into_owned();
    if let Some(entries) = parse_entries(&fixed) {
        return Some(entries);
    }

    // Trailing commas before the closing bracket.
    let fixed = re!(r",\s*\]").replace_all(&fixed, "]").into_owned();
    if let Some(entries) = parse_entries(&fixed) {
        return Some(entries);
    }

    // Extract every well-shaped object and parse each one independently,
    // discarding the unparsable.
    let shape = re!(
        r#"(?s)\{\s*"speaker"\s*:\s*"[^"]*"\s*,\s*"text"\s*:\s*"(?:[^"\\]|\\.)*"\s*,\s*"instruct"\s*:\s*"(?:[^"\\]|\\.)*"\s*\}"#
    );
    let entries: Vec<ScriptEntry> = shape
        .find_iter(candidate)
        .filter_map(|m| serde_json::from_str(m.as_str()).ok())
        .collect();
    if !entries.is_empty() {
        return Some(entries);
    }

    // Truncate at the last complete object and close the array.
    if let Some(pos) = candidate.rfind("},") {
        let mut truncated = format!("{}]", &candidate[..pos + 1]);
        if !truncated.trim_start().starts_with('[') {
            truncated.insert(0, '[');
        }
        if let Some(entries) = parse_entries(&truncated) {
            return Some(entries);
        }
    }

    None
}

/// Last resort: permissive field-level match across the whole raw text,
/// unescaping quotes and newlines per match.
fn salvage_entries(text: &str) -> Vec<ScriptEntry> {
    re!(
        r#"(?s)\{\s*"speaker"\s*:\s*"([^"]*)"\s*,\s*"text"\s*:\s*"((?:[^"\\]|\\.)*)"\s*,\s*"instruct"\s*:\s*"((?:[^"\\]|\\.)*)"\s*\}"#
    )
    .captures_iter(text)
    .map(|caps| ScriptEntry {
        speaker: caps[1].to_string(),
        text: unescape(&caps[2]),
        instruct: unescape(&caps[3]),
    })
    .collect()
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\n", "\n")
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
    fn test_clean_array_passes_through() {
        let raw = r#"[{"speaker": "NARRATOR", "text": "It rained.", "instruct": "somber"}]"#;
        let entries = recover(raw).unwrap();
        assert_eq!(entries, vec![entry("NARRATOR", "It rained.", "somber")]);
    }

    #[test]
    fn test_array_embedded_in_noise_with_nested_brackets() {
        let raw = concat!(
            "Sure! Here is the annotated script you asked for:\n",
            r#"[{"speaker": "ALICE", "text": "He whispered [almost inaudibly] hello.", "instruct": "soft"}]"#,
            "\nLet me know if you need changes []"
        );
        let entries = recover(raw).unwrap();
        assert_eq!(
            entries,
            vec![entry("ALICE", "He whispered [almost inaudibly] hello.", "soft")]
        );
    }

    #[test]
    fn test_reasoning_tags_are_stripped() {
        let raw = concat!(
            "<think>I should output [fake array] here</think>\n",
            r#"[{"speaker": "BOB", "text": "Fine.", "instruct": ""}]"#
        );
        let entries = recover(raw).unwrap();
        assert_eq!(entries, vec![entry("BOB", "Fine.", "")]);
    }

    #[test]
    fn test_unclosed_reasoning_tag_drops_tail() {
        let raw = concat!(
            r#"[{"speaker": "BOB", "text": "Fine.", "instruct": ""}]"#,
            "\n<think>now I keep rambling [[[ forever"
        );
        let entries = recover(raw).unwrap();
        assert_eq!(entries, vec![entry("BOB", "Fine.", "")]);
    }

    #[test]
    fn test_fenced_block_is_preferred() {
        let raw = concat!(
            "Some preamble mentioning [brackets].\n",
            "```json\n",
            r#"[{"speaker": "EVE", "text": "Done.", "instruct": "flat"}]"#,
            "\n```\nTrailing chatter."
        );
        let entries = recover(raw).unwrap();
        assert_eq!(entries, vec![entry("EVE", "Done.", "flat")]);
    }

    #[test]
    fn test_truncated_completion_is_salvaged() {
        let raw = concat!(
            r#"[{"speaker": "A", "text": "Complete line.", "instruct": "x"},"#,
            r#" {"speaker": "B", "text": "Cut off mid"#
        );
        let entries = recover(raw).unwrap();
        assert_eq!(entries, vec![entry("A", "Complete line.", "x")]);
    }

    #[test]
    fn test_missing_comma_between_objects() {
        let raw = concat!(
            r#"[{"speaker": "A", "text": "One.", "instruct": ""}"#,
            r#"{"speaker": "B", "text": "Two.", "instruct": ""}]"#
        );
        let entries = recover(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].speaker, "B");
    }

    #[test]
    fn test_trailing_comma() {
        let raw = r#"[{"speaker": "A", "text": "One.", "instruct": ""},]"#;
        let entries = recover(raw).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_raw_newline_inside_string() {
        let raw = "[{\"speaker\": \"A\", \"text\": \"line one\nline two\", \"instruct\": \"\"}]";
        let entries = recover(raw).unwrap();
        assert_eq!(entries[0].text, "line one\nline two");
    }

    #[test]
    fn test_field_salvage_without_array_syntax() {
        let raw = concat!(
            "Entry one: {\"speaker\": \"A\", \"text\": \"Said \\\"hi\\\".\", \"instruct\": \"warm\"} ",
            "and entry two: {\"speaker\": \"B\", \"text\": \"Bye.\", \"instruct\": \"\"} done."
        );
        let entries = recover(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "Said \"hi\".");
    }

    #[test]
    fn test_garbage_returns_none() {
        assert!(recover("I could not process this request.").is_none());
        assert!(recover("").is_none());
        assert!(recover("[]").is_none());
    }

    #[test]
    fn test_missing_instruct_defaults_empty() {
        let raw = r#"[{"speaker": "A", "text": "No instruct here."}]"#;
        let entries = recover(raw).unwrap();
        assert_eq!(entries[0].instruct, "");
    }
}
