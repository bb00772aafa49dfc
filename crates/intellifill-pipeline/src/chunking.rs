//! Splitting extracted text into overlapping chunks
//!
//! Text is cut at paragraph breaks first, then at sentence ends, and only
//! as a last resort inside a sentence. The resulting segments are packed
//! greedily into chunks of at most `max_chars`; each chunk after the first
//! starts with up to `overlap_chars` of the previous chunk's tail.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::OnceLock;

use intellifill_persist::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 1500,
            overlap_chars: 200,
        }
    }
}

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid paragraph pattern"))
}

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[.!?]+["')\]]*\s+"#).expect("valid sentence pattern"))
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let max_chars = config.max_chars.max(1);
        Self {
            config: ChunkerConfig {
                max_chars,
                overlap_chars: config.overlap_chars.min(max_chars / 2),
            },
        }
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let segments = self.segments(text);
        let mut chunks = Vec::new();
        let mut current: Option<Range<usize>> = None;

        for seg in segments {
            current = match current {
                None => Some(seg),
                Some(range) if char_len(&text[range.start..seg.end]) <= self.config.max_chars => {
                    Some(range.start..seg.end)
                }
                Some(range) => {
                    let next_start = self.overlap_start(text, &range).min(seg.start);
                    push_chunk(text, &range, &mut chunks);
                    Some(next_start..seg.end)
                }
            };
        }
        if let Some(range) = current {
            push_chunk(text, &range, &mut chunks);
        }
        chunks
    }

    /// Byte ranges no longer than `max_chars`, in document order
    fn segments(&self, text: &str) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        for para in split_keep_ranges(text, 0..text.len(), paragraph_break()) {
            if char_len(&text[para.clone()]) <= self.config.max_chars {
                out.push(para);
                continue;
            }
            for sentence in split_keep_ranges(text, para, sentence_end()) {
                if char_len(&text[sentence.clone()]) <= self.config.max_chars {
                    out.push(sentence);
                } else {
                    out.extend(hard_split(text, sentence, self.config.max_chars));
                }
            }
        }
        out
    }

    /// Start of the overlap carried from `range` into the next chunk,
    /// moved forward to a word boundary
    fn overlap_start(&self, text: &str, range: &Range<usize>) -> usize {
        if self.config.overlap_chars == 0 {
            return range.end;
        }
        let tail = &text[range.clone()];
        let Some((offset, _)) = tail.char_indices().rev().nth(self.config.overlap_chars - 1) else {
            return range.start;
        };
        let start = range.start + offset;
        match text[start..range.end].find(char::is_whitespace) {
            Some(ws) => {
                let after = start + ws;
                let skip = text[after..range.end]
                    .find(|c: char| !c.is_whitespace())
                    .unwrap_or(range.end - after);
                after + skip
            }
            None => start,
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Pieces of `range` between matches of `sep`, trimmed, with the separator
/// attached to the preceding piece; empty pieces are dropped
fn split_keep_ranges(text: &str, range: Range<usize>, sep: &Regex) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut out = Vec::new();
    let mut last = 0;
    for m in sep.find_iter(slice) {
        push_trimmed(text, range.start + last..range.start + m.end(), &mut out);
        last = m.end();
    }
    push_trimmed(text, range.start + last..range.end, &mut out);
    out
}

fn push_trimmed(text: &str, range: Range<usize>, out: &mut Vec<Range<usize>>) {
    let piece = &text[range.clone()];
    let lead = piece.len() - piece.trim_start().len();
    let trail = piece.len() - piece.trim_end().len();
    if lead + trail < piece.len() {
        out.push(range.start + lead..range.end - trail);
    }
}

/// Split an oversized range at whitespace where possible, else at `max` chars
fn hard_split(text: &str, range: Range<usize>, max: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let rest = &text[start..range.end];
        let limit = rest
            .char_indices()
            .nth(max)
            .map_or(rest.len(), |(offset, _)| offset);
        let cut = if limit == rest.len() {
            limit
        } else {
            rest[..limit]
                .rfind(char::is_whitespace)
                .filter(|&ws| ws > 0)
                .unwrap_or(limit)
        };
        push_trimmed(text, start..start + cut, &mut out);
        start += cut;
    }
    out
}

fn push_chunk(text: &str, range: &Range<usize>, chunks: &mut Vec<Chunk>) {
    let content = text[range.clone()].trim();
    if content.is_empty() {
        return;
    }
    let char_start = char_len(&text[..range.start]);
    let char_end = char_start + char_len(&text[range.clone()]);
    chunks.push(Chunk::new(chunks.len() as u32, content, char_start, char_end));
}
