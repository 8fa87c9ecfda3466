//! Semantic chunking of long inputs before embedding and storage.
//!
//! Boundaries are preferred in order: blank-line paragraphs, sentence
//! endings, clause separators, then a plain word window as a last resort.
//! Consecutive chunks overlap by a configurable number of sentences so
//! context carries across boundaries.

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use serde::Serialize;

/// Chunking thresholds, in estimated tokens.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Hard cap per chunk.
    pub max_tokens: usize,
    /// Paragraphs at or below this size are emitted whole.
    pub target_tokens: usize,
    /// Sentences repeated at the start of the next chunk.
    pub overlap_sentences: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 384,
            target_tokens: 256,
            overlap_sentences: 1,
        }
    }
}

/// A semantically coherent piece of the source document.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub text: String,
    /// Byte range of this chunk in the source text.
    pub start: usize,
    pub end: usize,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub has_prev: bool,
    pub has_next: bool,
    pub doc_title: Option<String>,
    pub doc_source: Option<String>,
}

/// Tokens are estimated from the word count; roughly 0.75 words per token
/// for English prose.
pub fn estimate_tokens(text: &str) -> usize {
    (text.split_whitespace().count() as f64 / 0.75) as usize
}

pub struct SemanticChunker {
    config: ChunkerConfig,
    target_words: usize,
    max_words: usize,
}

/// A contiguous byte span of the source.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

impl SemanticChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let target_words = (config.target_tokens as f64 * 0.75) as usize;
        let max_words = (config.max_tokens as f64 * 0.75) as usize;
        Self {
            config,
            target_words: target_words.max(1),
            max_words: max_words.max(1),
        }
    }

    /// Chunk `text`, returning spans of the original (no metadata attached).
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut spans = Vec::new();
        for paragraph in paragraphs(text) {
            self.chunk_paragraph(text, paragraph, &mut spans);
        }

        spans
            .into_iter()
            .map(|span| Chunk {
                text: text[span.start..span.end].to_string(),
                start: span.start,
                end: span.end,
                chunk_index: 0,
                total_chunks: 0,
                has_prev: false,
                has_next: false,
                doc_title: None,
                doc_source: None,
            })
            .collect()
    }

    /// Chunk with document-level metadata and neighbour flags filled in.
    pub fn chunk_with_context(
        &self,
        text: &str,
        doc_title: Option<&str>,
        doc_source: Option<&str>,
    ) -> Vec<Chunk> {
        let mut chunks = self.chunk(text);
        let total = chunks.len();
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.chunk_index = i;
            chunk.total_chunks = total;
            chunk.has_prev = i > 0;
            chunk.has_next = i + 1 < total;
            chunk.doc_title = doc_title.map(str::to_string);
            chunk.doc_source = doc_source.map(str::to_string);
        }
        chunks
    }

    fn chunk_paragraph(&self, text: &str, paragraph: Span, out: &mut Vec<Span>) {
        let body = &text[paragraph.start..paragraph.end];
        if estimate_tokens(body) <= self.config.target_tokens {
            out.push(paragraph);
            return;
        }

        let sentences = sentence_spans(text, paragraph);
        if sentences.len() == 1 {
            self.chunk_long_sentence(text, sentences[0], out);
            return;
        }
        self.group_units(text, &sentences, out);
    }

    /// Greedily group units (sentences or clauses) until the next one would
    /// exceed the word cap, then start a new group that repeats the last
    /// `overlap_sentences` units.
    fn group_units(&self, text: &str, units: &[Span], out: &mut Vec<Span>) {
        let word_count =
            |span: &Span| -> usize { text[span.start..span.end].split_whitespace().count() };

        let mut group_start = 0usize;
        let mut words = 0usize;
        let mut i = 0usize;
        while i < units.len() {
            let unit_words = word_count(&units[i]);
            if words + unit_words > self.max_words && i > group_start {
                out.push(Span {
                    start: units[group_start].start,
                    end: units[i - 1].end,
                });
                let overlap_from = i.saturating_sub(self.config.overlap_sentences);
                group_start = overlap_from.max(group_start + 1);
                words = (group_start..i).map(|j| word_count(&units[j])).sum();
            } else {
                words += unit_words;
                i += 1;
            }
        }
        if group_start < units.len() {
            out.push(Span {
                start: units[group_start].start,
                end: units[units.len() - 1].end,
            });
        }
    }

    /// A single over-long sentence: split at clause boundaries, falling back
    /// to a word window.
    fn chunk_long_sentence(&self, text: &str, sentence: Span, out: &mut Vec<Span>) {
        let clauses = clause_spans(text, sentence);
        if clauses.len() > 1 {
            self.group_units(text, &clauses, out);
            return;
        }

        let words = word_spans(text, sentence);
        let mut start = 0usize;
        while start < words.len() {
            let end = (start + self.target_words).min(words.len());
            out.push(Span {
                start: words[start].start,
                end: words[end - 1].end,
            });
            start = end;
        }
    }
}

/// Paragraph spans: maximal runs of non-blank lines.
fn paragraphs(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut current: Option<Span> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if let Some(span) = current.take() {
                spans.push(span);
            }
            continue;
        }
        // Trim the line's own leading/trailing whitespace out of the span.
        let leading = line.len() - line.trim_start().len();
        let content_start = line_start + leading;
        let content_end = content_start + trimmed.len();
        current = Some(match current {
            Some(span) => Span {
                start: span.start,
                end: content_end,
            },
            None => Span {
                start: content_start,
                end: content_end,
            },
        });
    }
    if let Some(span) = current {
        spans.push(span);
    }
    spans
}

/// Sentence spans inside a paragraph. A boundary is `.`, `?` or `!` followed
/// by whitespace and an opening character (capital letter, quote, or
/// parenthesis).
fn sentence_spans(text: &str, paragraph: Span) -> Vec<Span> {
    let body = &text[paragraph.start..paragraph.end];
    let mut boundaries = Vec::new();

    let chars: Vec<(usize, char)> = body.char_indices().collect();
    for window in 0..chars.len() {
        let (_, c) = chars[window];
        if !matches!(c, '.' | '?' | '!') {
            continue;
        }
        // Scan past any run of closing punctuation to the whitespace.
        let mut j = window + 1;
        let mut saw_space = false;
        while j < chars.len() && chars[j].1.is_whitespace() {
            saw_space = true;
            j += 1;
        }
        if !saw_space || j >= chars.len() {
            continue;
        }
        let next = chars[j].1;
        if next.is_uppercase() || matches!(next, '"' | '\'' | '(') {
            boundaries.push((chars[window].0 + c.len_utf8(), chars[j].0));
        }
    }

    split_at_boundaries(text, paragraph, &boundaries)
}

/// Clause spans: split after `,` or `;` followed by whitespace.
fn clause_spans(text: &str, sentence: Span) -> Vec<Span> {
    let body = &text[sentence.start..sentence.end];
    let mut boundaries = Vec::new();

    let chars: Vec<(usize, char)> = body.char_indices().collect();
    for window in 0..chars.len() {
        let (offset, c) = chars[window];
        if !matches!(c, ',' | ';') {
            continue;
        }
        let mut j = window + 1;
        let mut saw_space = false;
        while j < chars.len() && chars[j].1.is_whitespace() {
            saw_space = true;
            j += 1;
        }
        if saw_space && j < chars.len() {
            boundaries.push((offset + c.len_utf8(), chars[j].0));
        }
    }

    split_at_boundaries(text, sentence, &boundaries)
}

/// Cut a span at `(end_of_left, start_of_right)` boundary pairs (offsets
/// relative to the span body).
fn split_at_boundaries(text: &str, span: Span, boundaries: &[(usize, usize)]) -> Vec<Span> {
    if boundaries.is_empty() {
        return vec![span];
    }
    let mut spans = Vec::with_capacity(boundaries.len() + 1);
    let mut start = span.start;
    for &(left_end, right_start) in boundaries {
        spans.push(Span {
            start,
            end: span.start + left_end,
        });
        start = span.start + right_start;
    }
    spans.push(Span {
        start,
        end: span.end,
    });
    spans.retain(|s| !text[s.start..s.end].trim().is_empty());
    spans
}

/// Word spans within a span.
fn word_spans(text: &str, span: Span) -> Vec<Span> {
    let body = &text[span.start..span.end];
    let mut words = Vec::new();
    let mut word_start: Option<usize> = None;
    for (offset, c) in body.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                words.push(Span {
                    start: span.start + start,
                    end: span.start + offset,
                });
            }
        } else if word_start.is_none() {
            word_start = Some(offset);
        }
    }
    if let Some(start) = word_start {
        words.push(Span {
            start: span.start + start,
            end: span.end,
        });
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> SemanticChunker {
        SemanticChunker::new(ChunkerConfig::default())
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunker().chunk("").is_empty());
        assert!(chunker().chunk("   \n\n  ").is_empty());
    }

    #[test]
    fn short_paragraphs_are_emitted_whole() {
        let text = "First paragraph here.\n\nSecond paragraph here.";
        let chunks = chunker().chunk(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "First paragraph here.");
        assert_eq!(chunks[1].text, "Second paragraph here.");
    }

    #[test]
    fn chunk_ranges_map_back_into_the_source() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta.";
        for chunk in chunker().chunk(text) {
            assert_eq!(&text[chunk.start..chunk.end], chunk.text);
        }
    }

    #[test]
    fn long_paragraph_splits_at_sentence_boundaries() {
        let sentence = "This sentence has exactly eight words in it. ";
        let text = sentence.repeat(60);
        let chunker = SemanticChunker::new(ChunkerConfig {
            max_tokens: 100,
            target_tokens: 70,
            overlap_sentences: 0,
        });
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(estimate_tokens(&chunk.text) <= 100);
            // Every chunk ends on a sentence boundary.
            assert!(chunk.text.trim_end().ends_with('.'));
        }
    }

    #[test]
    fn consecutive_chunks_overlap_by_one_sentence() {
        let text = (1..=40)
            .map(|i| format!("Sentence number {i} is right here with padding words."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunker = SemanticChunker::new(ChunkerConfig {
            max_tokens: 60,
            target_tokens: 40,
            overlap_sentences: 1,
        });
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            // The second chunk starts before the first ends.
            assert!(pair[1].start < pair[0].end);
        }
    }

    #[test]
    fn single_long_sentence_splits_at_clauses() {
        let clause = "this clause keeps going with several words";
        let text = std::iter::repeat(clause)
            .take(40)
            .collect::<Vec<_>>()
            .join(", ");
        let chunker = SemanticChunker::new(ChunkerConfig {
            max_tokens: 60,
            target_tokens: 40,
            overlap_sentences: 0,
        });
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn pathological_unbroken_sentence_falls_back_to_word_window() {
        let text = "word ".repeat(600);
        let chunker = SemanticChunker::new(ChunkerConfig {
            max_tokens: 100,
            target_tokens: 70,
            overlap_sentences: 0,
        });
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.split_whitespace().count() <= 70 * 3 / 4 + 1);
        }
    }

    #[test]
    fn abbreviation_mid_sentence_is_not_a_boundary() {
        // Lowercase continuation after the period keeps the sentence whole.
        let text = "The file lives in src/lib.rs of the repo. Another sentence follows here.";
        let spans = sentence_spans(
            text,
            Span {
                start: 0,
                end: text.len(),
            },
        );
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn context_metadata_is_attached() {
        let text = "One paragraph.\n\nAnother paragraph.";
        let chunks = chunker().chunk_with_context(text, Some("Title"), Some("unit-test"));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 2);
        assert!(!chunks[0].has_prev);
        assert!(chunks[0].has_next);
        assert!(chunks[1].has_prev);
        assert!(!chunks[1].has_next);
        assert_eq!(chunks[1].doc_title.as_deref(), Some("Title"));
        assert_eq!(chunks[1].doc_source.as_deref(), Some("unit-test"));
    }

    #[test]
    fn token_estimate_uses_word_ratio() {
        // 30 words / 0.75 = 40 estimated tokens.
        let text = "word ".repeat(30);
        assert_eq!(estimate_tokens(&text), 40);
    }
}
