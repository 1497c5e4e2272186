//! Deterministic text chunker.
//!
//! Splits document text into bounded fragments for embedding. Splitting
//! prefers paragraph boundaries (`\n\n`); paragraphs that exceed the target
//! window are split on sentence boundaries, and pathological sentences are
//! hard-cut on character boundaries. Adjacent chunks share a small overlap
//! so context survives the cut.
//!
//! Identical input yields identical output across processes — no RNG, no
//! clock, no allocation-order dependence.

use crate::config::ChunkingConfig;

/// Split `text` into ordered chunk strings.
///
/// Short texts (anything at or under the target window) produce exactly one
/// chunk. Indices are implicit: the position in the returned vector is the
/// chunk index. Chunks may exceed the target by at most the overlap seed
/// plus a separator.
pub fn chunk_text(text: &str, cfg: &ChunkingConfig) -> Vec<String> {
    let target = cfg.target_chars.max(1);
    let trimmed = text.trim();

    if trimmed.chars().count() <= target {
        return vec![trimmed.to_string()];
    }

    let mut builder = Builder::new(target, cfg.overlap_chars);

    for para in trimmed.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if para.chars().count() > target {
            for piece in split_oversized(para, target) {
                builder.append(&piece);
            }
        } else {
            builder.append(para);
        }
    }

    let mut chunks = builder.finish();
    if chunks.is_empty() {
        chunks.push(trimmed.to_string());
    }
    chunks
}

/// Accumulates pieces into chunks, carrying an overlap seed between them.
/// The seed alone never forms a chunk, so a chunk can reach
/// `target + overlap + 2` characters at most.
struct Builder {
    target: usize,
    overlap: usize,
    buf: String,
    /// Pieces appended since the last flush; the overlap seed doesn't count.
    pieces_in_buf: usize,
    chunks: Vec<String>,
}

impl Builder {
    fn new(target: usize, overlap: usize) -> Self {
        Self {
            target,
            overlap,
            buf: String::new(),
            pieces_in_buf: 0,
            chunks: Vec::new(),
        }
    }

    fn append(&mut self, piece: &str) {
        let sep = if self.buf.is_empty() { 0 } else { 2 };
        let would_be = self.buf.chars().count() + sep + piece.chars().count();
        if self.pieces_in_buf > 0 && would_be > self.target {
            self.flush();
        }
        if !self.buf.is_empty() {
            self.buf.push_str("\n\n");
        }
        self.buf.push_str(piece);
        self.pieces_in_buf += 1;
    }

    fn flush(&mut self) {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            self.pieces_in_buf = 0;
            return;
        }
        let chunk = std::mem::take(&mut self.buf);
        self.buf = overlap_tail(&chunk, self.overlap);
        self.pieces_in_buf = 0;
        self.chunks.push(chunk);
    }

    fn finish(mut self) -> Vec<String> {
        if self.pieces_in_buf > 0 {
            let chunk = std::mem::take(&mut self.buf);
            self.chunks.push(chunk);
        }
        self.chunks
    }
}

/// Last `overlap` characters of `text`, advanced to the next word start so
/// the seed never begins mid-word. Empty when overlap is disabled.
fn overlap_tail(text: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= overlap {
        return String::new();
    }
    let skip = total - overlap;
    let tail: String = text.chars().skip(skip).collect();
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start().to_string(),
        None => tail,
    }
}

/// Break an oversized paragraph into sentence runs no longer than `target`,
/// hard-cutting any single sentence that still exceeds the window.
fn split_oversized(para: &str, target: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut run = String::new();

    for sentence in split_sentences(para) {
        if sentence.chars().count() > target {
            if !run.trim().is_empty() {
                pieces.push(std::mem::take(&mut run).trim().to_string());
            }
            pieces.extend(hard_cut(&sentence, target));
            continue;
        }

        if !run.is_empty() && run.chars().count() + 1 + sentence.chars().count() > target {
            pieces.push(std::mem::take(&mut run).trim().to_string());
        }
        if !run.is_empty() {
            run.push(' ');
        }
        run.push_str(&sentence);
    }

    if !run.trim().is_empty() {
        pieces.push(run.trim().to_string());
    }

    pieces
}

/// Sentence segmentation: terminator (`.`, `!`, `?`) followed by whitespace,
/// or a bare newline. Keeps the terminator with its sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current = String::new();
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|n| n.is_whitespace()) {
            sentences.push(current.trim().to_string());
            current = String::new();
        }
    }

    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }

    sentences
}

/// Cut a single overlong sentence at character boundaries, preferring the
/// last space before the window edge.
fn hard_cut(text: &str, target: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + target).min(chars.len());
        let cut = if end < chars.len() {
            chars[start..end]
                .iter()
                .rposition(|c| *c == ' ')
                .map(|p| start + p + 1)
                .unwrap_or(end)
        } else {
            end
        };
        let piece: String = chars[start..cut].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        start = cut;
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(target: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_chars: target,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", &cfg(1600, 200));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "Hello, world!");
    }

    #[test]
    fn empty_text_single_chunk() {
        let chunks = chunk_text("", &cfg(1600, 200));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "");
    }

    #[test]
    fn paragraphs_grouped_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, &cfg(1600, 0));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("First paragraph."));
        assert!(chunks[0].contains("Third paragraph."));
    }

    #[test]
    fn paragraphs_split_when_exceeding_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text(text, &cfg(30, 0));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "This is paragraph one.");
        assert_eq!(chunks[2], "This is paragraph three.");
    }

    #[test]
    fn oversized_paragraph_sentence_split() {
        let text =
            "Alpha is the first sentence. Beta follows it closely. Gamma wraps the paragraph up.";
        let chunks = chunk_text(text, &cfg(40, 0));
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.chars().count() <= 40, "chunk too long: {:?}", c);
        }
    }

    #[test]
    fn pathological_sentence_hard_cut() {
        let text = "x".repeat(500);
        let chunks = chunk_text(&text, &cfg(100, 0));
        assert_eq!(chunks.len(), 5);
        for c in &chunks {
            assert!(c.chars().count() <= 100);
        }
    }

    #[test]
    fn hard_cut_prefers_space_boundary() {
        let words = vec!["word"; 60].join(" ");
        let chunks = chunk_text(&words, &cfg(50, 0));
        for c in &chunks {
            assert!(!c.starts_with(' '));
            assert!(!c.ends_with(' '));
            assert!(c.chars().count() <= 50);
        }
    }

    #[test]
    fn overlap_carries_tail_forward() {
        let para_a = "alpha ".repeat(40);
        let para_b = "beta ".repeat(40);
        let text = format!("{}\n\n{}", para_a.trim(), para_b.trim());
        let chunks = chunk_text(&text, &cfg(250, 40));
        assert_eq!(chunks.len(), 2);
        assert!(
            chunks[1].starts_with("alpha"),
            "expected overlap seed at the start of the second chunk"
        );
        assert!(chunks[1].contains("beta"));
    }

    #[test]
    fn seed_alone_never_becomes_a_chunk() {
        let text = "héllö wörld ".repeat(300);
        let chunks = chunk_text(&text, &cfg(100, 20));
        assert!(chunks.len() > 1);
        for c in &chunks {
            let n = c.chars().count();
            assert!(n <= 100 + 20 + 2, "chunk too long: {}", n);
            assert!(n > 20, "seed flushed alone: {:?}", c);
        }
    }

    #[test]
    fn deterministic() {
        let text = "Alpha.\n\nBeta.\n\nGamma.\n\nDelta is much longer than the others and keeps going for a while to force a split.";
        let a = chunk_text(text, &cfg(60, 10));
        let b = chunk_text(text, &cfg(60, 10));
        assert_eq!(a, b);
    }
}
