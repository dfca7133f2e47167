//! Text preparation: reasoning-output cleaning, speech prep, sentence splitting.
//!
//! Pure functions, no I/O.

use regex::Regex;
use std::sync::LazyLock;

// Compiled once on first use.

// Reasoning-output artifacts
static RE_THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());
static RE_THINK_UNTERMINATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*$").unwrap());
static RE_MONOLOGUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:as an? (?:ai|language model|assistant|co-?host)|i need to respond|let me (?:think|see|respond|come up)|okay,? so i'm trying to figure out|hmm,? let's break this down|my role is)[^.!?]*[.!?]\s*",
    )
    .unwrap()
});
static RE_ROLE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:assistant|ai|co-?host|bot|system)\s*:\s*").unwrap()
});
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>\n]+>").unwrap());
static RE_MULTI_QUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""{2,}"#).unwrap());

// Markdown and chat artifacts that should not be read aloud
static RE_FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static RE_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static RE_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static RE_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static RE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*").unwrap());
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static RE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static RE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s]*[-*]\s+").unwrap());
static RE_EMOTE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":[A-Za-z0-9_]+:").unwrap());
static RE_MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// Strip structural artifacts a reasoning backend may emit, leaving only
/// the user-facing reply.
///
/// Removes `<think>` blocks (an unterminated one swallows the rest of the
/// output), stock monologue sentences, role labels, leftover tags, doubled
/// quotes, a dangling leading quote, and cut-off trailing punctuation.
pub fn clean_response(raw: &str) -> String {
    let mut c = RE_THINK_BLOCK.replace_all(raw, "").into_owned();
    c = RE_THINK_UNTERMINATED.replace(&c, "").into_owned();
    c = RE_ROLE_LABEL.replace_all(&c, "").into_owned();
    c = RE_MONOLOGUE.replace_all(&c, "").into_owned();
    c = RE_TAG.replace_all(&c, "").into_owned();
    c = RE_MULTI_QUOTE.replace_all(&c, "\"").into_owned();
    c = collapse_whitespace(&c);

    if c.starts_with('"') && c.matches('"').count() == 1 {
        c.remove(0);
        c = c.trim_start().to_string();
    }

    if c.ends_with("...") || c.ends_with('…') || c.ends_with(',') {
        c = c
            .trim_end_matches(|ch: char| matches!(ch, '.' | ',' | '…') || ch.is_whitespace())
            .to_string();
    }

    c
}

/// Turn a reply into text that reads naturally when spoken: markdown is
/// flattened, URLs and `:emote:` tokens are dropped.
pub fn prepare_for_speech(text: &str) -> String {
    let mut c = RE_FENCED_CODE.replace_all(text, " ").into_owned();
    c = RE_INLINE_CODE.replace_all(&c, "$1").into_owned();
    c = RE_BOLD.replace_all(&c, "$1").into_owned();
    c = RE_ITALIC.replace_all(&c, "$1").into_owned();
    c = RE_HEADING.replace_all(&c, "").into_owned();
    c = RE_LINK.replace_all(&c, "$1").into_owned();
    c = RE_URL.replace_all(&c, "").into_owned();
    c = RE_BULLET.replace_all(&c, "").into_owned();
    c = RE_EMOTE_TOKEN.replace_all(&c, "").into_owned();
    c = RE_MULTI_SPACE.replace_all(&c, " ").into_owned();
    c.trim().to_string()
}

/// Whether `text` contains anything a voice backend could say.
pub fn is_speakable(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

/// Whitespace-collapsed, trimmed form used for audio cache keys.
pub fn normalize_for_cache(text: &str) -> String {
    collapse_whitespace(text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Default maximum chunk length for [`split_text`].
pub const DEFAULT_MAX_CHUNK_LEN: usize = 200;

/// Split text into chunks of roughly `max_len` bytes.
///
/// Prefers sentence boundaries (`. `), then word boundaries, then hard-splits
/// on a char boundary. Trailing fragments shorter than 2 bytes are discarded.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut result = Vec::new();
    let mut remaining = text;

    while remaining.len() > max_len {
        let window = &remaining[..floor_char_boundary(remaining, max_len)];

        let split_at = match window.rfind(". ") {
            Some(pos) if pos >= max_len / 2 => pos + 1,
            _ => word_boundary_or_hard(remaining, window, max_len),
        };

        let chunk = remaining[..split_at].trim_end();
        if !chunk.is_empty() {
            result.push(chunk.to_string());
        }
        remaining = remaining[split_at..].trim_start();
    }

    if remaining.len() >= 2 {
        result.push(remaining.to_string());
    }

    result
}

/// Split text into sentences at sentence-ending punctuation (`.`, `!`, `?`,
/// including runs like `?!` or `...`) followed by whitespace, or at paragraph
/// breaks. Returns non-empty, trimmed strings in original order.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut start = 0;
    let mut i = 0;

    while i < len {
        if bytes[i] == b'\n' && i + 1 < len && bytes[i + 1] == b'\n' {
            push_trimmed(&mut sentences, &text[start..i]);
            while i < len && bytes[i] == b'\n' {
                i += 1;
            }
            start = i;
            continue;
        }

        if is_terminal(bytes[i]) {
            let mut end = i + 1;
            while end < len && is_terminal(bytes[end]) {
                end += 1;
            }
            if end < len && bytes[end].is_ascii_whitespace() {
                push_trimmed(&mut sentences, &text[start..end]);
                start = end;
            }
            i = end;
            continue;
        }

        i += 1;
    }

    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

/// Sentences of `text`, with any sentence longer than `max_len` sub-split.
/// These are the units the synthesizer sends to the voice backend.
pub fn speech_units(text: &str, max_len: usize) -> Vec<String> {
    let mut units = Vec::new();
    for sentence in split_sentences(text) {
        if sentence.len() <= max_len {
            units.push(sentence);
        } else {
            units.extend(split_text(&sentence, max_len));
        }
    }
    units
}

fn is_terminal(b: u8) -> bool {
    matches!(b, b'.' | b'!' | b'?')
}

fn push_trimmed(out: &mut Vec<String>, chunk: &str) {
    let chunk = chunk.trim();
    if !chunk.is_empty() {
        out.push(chunk.to_string());
    }
}

/// Largest char boundary at or below `index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Find a word boundary, or fall back to a hard split.
fn word_boundary_or_hard(remaining: &str, window: &str, max_len: usize) -> usize {
    if let Some(pos) = window.rfind(' ') {
        if pos >= max_len / 3 {
            return pos;
        }
    }
    // Always make progress, even if the first char is wider than max_len.
    let first = remaining.chars().next().map_or(1, char::len_utf8);
    window.len().max(first)
}
