//! Sentence-boundary chunking with a word-level overlap tail.
//!
//! Sentences accumulate into a chunk until the next one would push it past the
//! character budget. Each new chunk is seeded with the last
//! `chunk_size_chars / 10` words of the previous chunk so facts spanning a
//! boundary stay retrievable from either side.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub content: String,
    pub word_count: u32,
    pub char_count: u32,
    pub quality_score: f64,
}

impl ChunkDraft {
    fn from_content(content: String) -> Self {
        let word_count = u32::try_from(content.split_whitespace().count()).unwrap_or(u32::MAX);
        let char_count = u32::try_from(content.chars().count()).unwrap_or(u32::MAX);
        let quality_score = quality_score(&content);
        Self { content, word_count, char_count, quality_score }
    }
}

pub fn chunk_text(text: &str, chunk_size_chars: usize) -> Vec<ChunkDraft> {
    let budget = chunk_size_chars.max(1);
    let overlap_words = budget / 10;

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut has_new_content = false;

    for piece in split_sentences(text).into_iter().flat_map(|s| split_oversized(&s, budget)) {
        let candidate_len = char_len(&current) + usize::from(!current.is_empty()) + char_len(&piece);
        if has_new_content && candidate_len > budget {
            let tail = overlap_tail(&current, overlap_words);
            chunks.push(ChunkDraft::from_content(std::mem::take(&mut current)));
            current = tail;
            has_new_content = false;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&piece);
        has_new_content = true;
    }

    if has_new_content {
        chunks.push(ChunkDraft::from_content(current));
    }

    chunks
}

/// Splits on `.`, `!`, `?` followed by whitespace, and on blank lines.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\n' && matches!(chars.peek(), Some('\n')) {
            push_sentence(&mut sentences, &mut current);
            continue;
        }

        current.push(ch);
        let terminal = matches!(ch, '.' | '!' | '?');
        let at_boundary = chars.peek().map(|next| next.is_whitespace()).unwrap_or(true);
        if terminal && at_boundary {
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);

    sentences
}

/// Heuristic content quality in `[0, 1]`: mostly-alphabetic, reasonably long
/// text scores high; symbol soup and fragments score low.
pub fn quality_score(content: &str) -> f64 {
    let words = content.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }

    let visible: Vec<char> = content.chars().filter(|ch| !ch.is_whitespace()).collect();
    let alphabetic = visible.iter().filter(|ch| ch.is_alphabetic()).count();
    let alpha_ratio = alphabetic as f64 / visible.len().max(1) as f64;
    let length_factor = (words as f64 / 20.0).min(1.0);

    let score = 0.7 * alpha_ratio + 0.3 * length_factor;
    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let normalized = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        sentences.push(normalized);
    }
    current.clear();
}

fn split_oversized(sentence: &str, budget: usize) -> Vec<String> {
    if char_len(sentence) <= budget {
        return vec![sentence.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if !current.is_empty() && char_len(&current) + 1 + char_len(word) > budget {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn overlap_tail(chunk: &str, overlap_words: usize) -> String {
    let mut tail: Vec<&str> = chunk.split_whitespace().rev().take(overlap_words).collect();
    tail.reverse();
    tail.join(" ")
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

#[cfg(test)]
mod tests {
    use super::{chunk_text, quality_score, split_sentences};

    #[test]
    fn sentences_split_on_terminal_punctuation_and_blank_lines() {
        let sentences = split_sentences("Hello there. How are you?\n\nFine thanks! v1.2 works");
        assert_eq!(
            sentences,
            vec!["Hello there.", "How are you?", "Fine thanks!", "v1.2 works"]
        );
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("One sentence. Two sentences.", 1_000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "One sentence. Two sentences.");
        assert_eq!(chunks[0].word_count, 4);
    }

    #[test]
    fn chunks_respect_budget_and_carry_overlap() {
        let text = "Alpha beta gamma delta epsilon. Zeta eta theta iota kappa. \
                    Lambda mu nu xi omicron. Pi rho sigma tau upsilon.";
        let chunks = chunk_text(text, 70);

        assert!(chunks.len() >= 2, "expected multiple chunks, got {chunks:?}");
        let first: Vec<&str> = chunks[0].content.split_whitespace().collect();
        let second: Vec<&str> = chunks[1].content.split_whitespace().collect();
        assert_eq!(&second[..7], &first[first.len() - 7..]);
        assert_eq!(second[7], "Lambda");
    }

    #[test]
    fn overlap_is_a_tenth_of_the_budget_in_words() {
        let text: String =
            (0..40).map(|n| format!("Word{n} alpha beta gamma delta. ")).collect();
        let chunks = chunk_text(&text, 200);

        assert!(chunks.len() >= 3, "expected several chunks, got {}", chunks.len());
        for pair in chunks.windows(2) {
            let previous: Vec<&str> = pair[0].content.split_whitespace().collect();
            let next: Vec<&str> = pair[1].content.split_whitespace().collect();
            assert!(previous.len() >= 20);
            assert_eq!(&next[..20], &previous[previous.len() - 20..]);
            assert!(next.len() > 20, "every chunk must add new sentences after the overlap");
        }
    }

    #[test]
    fn oversized_sentence_is_split_on_words() {
        let sentence = "word ".repeat(50);
        let chunks = chunk_text(&sentence, 40);
        assert!(chunks.len() > 1);
        // 4 overlap words ("word word word word") plus a separator ride on top of the budget.
        assert!(chunks.iter().all(|chunk| chunk.char_count <= 40 + 20));
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunk_text("   \n\n  ", 100).is_empty());
    }

    #[test]
    fn quality_prefers_prose_over_symbols() {
        let prose = quality_score("Our refund policy allows returns within thirty days of purchase.");
        let noise = quality_score("$$ ## 12 34 ** //");
        assert!(prose > noise);
        assert_eq!(quality_score(""), 0.0);
    }
}
