//! Splits document text into token-bounded segments.
//!
//! Paragraphs are kept whole when they fit. Larger paragraphs fall back to sentences,
//! and sentences to words. Pieces are then packed greedily up to the token limit.
//! A single word longer than the limit becomes its own segment.

use crate::tokens::count_tokens;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub content: String,
    pub token_count: usize,
}

pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<Segment> {
    let max_tokens = max_tokens.max(1);
    let mut segments = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs(text) {
        for (i, piece) in pieces(&paragraph, max_tokens).into_iter().enumerate() {
            if current.is_empty() {
                current = piece;
                continue;
            }
            let separator = if i == 0 { "\n\n" } else { " " };
            let candidate = format!("{current}{separator}{piece}");
            if count_tokens(&candidate) <= max_tokens {
                current = candidate;
            } else {
                push_segment(&mut segments, std::mem::replace(&mut current, piece));
            }
        }
    }

    if !current.is_empty() {
        push_segment(&mut segments, current);
    }
    segments
}

fn push_segment(segments: &mut Vec<Segment>, content: String) {
    let token_count = count_tokens(&content);
    segments.push(Segment {
        index: segments.len(),
        content,
        token_count,
    });
}

/// Non-blank line runs, with trailing whitespace trimmed from each line.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !lines.is_empty() {
                out.push(lines.join("\n"));
                lines.clear();
            }
        } else {
            lines.push(line.trim_end());
        }
    }
    if !lines.is_empty() {
        out.push(lines.join("\n"));
    }
    out
}

fn pieces(paragraph: &str, max_tokens: usize) -> Vec<String> {
    let paragraph = paragraph.trim();
    if count_tokens(paragraph) <= max_tokens {
        return vec![paragraph.to_string()];
    }

    let mut out = Vec::new();
    for sentence in paragraph
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if count_tokens(sentence) <= max_tokens {
            out.push(sentence.to_string());
        } else {
            pack_words(sentence, max_tokens, &mut out);
        }
    }
    out
}

fn pack_words(sentence: &str, max_tokens: usize, out: &mut Vec<String>) {
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        let candidate = format!("{current} {word}");
        if count_tokens(&candidate) <= max_tokens {
            current = candidate;
        } else {
            out.push(std::mem::replace(&mut current, word.to_string()));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
}
