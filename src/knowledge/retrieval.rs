//! Keyword retrieval over knowledge chunks
//!
//! Deterministic scoring, no embeddings: word-boundary token matches,
//! a bonus for the full query phrase, and a bonus for chunks that look
//! like headings or labeled sections.

/// Bonus when the full query phrase appears verbatim in a chunk.
const PHRASE_BONUS: u32 = 5;

/// Bonus for heading-like chunks (`#` prefix or trailing `:`).
const HEADING_BONUS: u32 = 1;

/// Minimum token length kept after query tokenization.
const MIN_TOKEN_LEN: usize = 2;

#[derive(Debug, Clone)]
struct ScoredChunk {
    index: usize,
    score: u32,
}

/// Rank all chunks against a query and return the top `k` chunk texts,
/// highest score first, ties broken by ascending chunk index.
pub fn relevant_chunks(query: &str, chunks: &[String], k: usize) -> Vec<String> {
    let query_lower = query.trim().to_lowercase();
    let tokens: Vec<&str> = query_lower
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .collect();
    if tokens.is_empty() && query_lower.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<ScoredChunk> = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| ScoredChunk { index, score: score_chunk(&query_lower, &tokens, chunk) })
        .filter(|s| s.score > 0)
        .collect();

    scored.sort_by(|a, b| b.score.cmp(&a.score).then(a.index.cmp(&b.index)));
    scored.truncate(k);
    scored.into_iter().map(|s| chunks[s.index].clone()).collect()
}

fn score_chunk(query_lower: &str, tokens: &[&str], chunk: &str) -> u32 {
    let chunk_lower = chunk.to_lowercase();

    let mut score: u32 = tokens
        .iter()
        .map(|token| word_boundary_matches(&chunk_lower, token))
        .sum();

    if !query_lower.is_empty() && chunk_lower.contains(query_lower) {
        score += PHRASE_BONUS;
    }

    let trimmed = chunk.trim();
    if trimmed.starts_with('#') || trimmed.ends_with(':') {
        score += HEADING_BONUS;
    }

    score
}

/// Occurrences of `token` in `text` delimited by non-alphanumeric
/// characters on both sides.
fn word_boundary_matches(text: &str, token: &str) -> u32 {
    let mut count = 0;
    for (pos, _) in text.match_indices(token) {
        let before_ok = text[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = text[pos + token.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_word_boundary_matches() {
        assert_eq!(word_boundary_matches("the price of pricing", "price"), 1);
        assert_eq!(word_boundary_matches("price, price. price", "price"), 3);
        assert_eq!(word_boundary_matches("unpriced", "price"), 0);
        assert_eq!(word_boundary_matches("price", "price"), 1);
    }

    #[test]
    fn test_phrase_beats_scattered_tokens() {
        // The verbatim-phrase chunk sits at a later index, so winning
        // requires outranking, not the tiebreak.
        let chunks = chunks(&[
            "Our pricing page lists every plan. WhatsApp support is included.",
            "WhatsApp pricing for bulk messaging: 500 rupees per thousand.",
        ]);
        let top = relevant_chunks("whatsapp pricing", &chunks, 3);
        assert_eq!(top.len(), 2);
        assert!(top[0].starts_with("WhatsApp pricing for bulk"));
    }

    #[test]
    fn test_two_tokens_beat_one() {
        let chunks = chunks(&[
            "WhatsApp support hours are nine to five.",
            "Bulk messaging pricing and WhatsApp rates are listed below.",
        ]);
        let top = relevant_chunks("whatsapp pricing", &chunks, 3);
        assert!(top[0].starts_with("Bulk messaging pricing"));
    }

    #[test]
    fn test_zero_score_excluded() {
        let chunks = chunks(&["completely unrelated text", "another filler paragraph"]);
        assert!(relevant_chunks("refund policy", &chunks, 3).is_empty());
    }

    #[test]
    fn test_tie_broken_by_index() {
        let chunks = chunks(&["refund terms apply", "refund terms apply"]);
        let top = relevant_chunks("refund", &chunks, 2);
        assert_eq!(top, vec!["refund terms apply".to_string(); 2]);
    }

    #[test]
    fn test_heading_bonus() {
        let chunks = chunks(&["plans overview text with plans", "# Plans"]);
        let scored_plain = score_chunk("plans", &["plans"], &chunks[0]);
        let scored_heading = score_chunk("plans", &["plans"], &chunks[1]);
        assert_eq!(scored_plain, 2 + PHRASE_BONUS);
        assert_eq!(scored_heading, 1 + PHRASE_BONUS + HEADING_BONUS);
    }

    #[test]
    fn test_short_tokens_discarded() {
        // Single-character tokens are dropped; only "me" survives.
        let chunks = chunks(&["call me maybe"]);
        let top = relevant_chunks("a me", &chunks, 1);
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_top_k_limit() {
        let chunks = chunks(&["price a", "price b", "price c", "price d"]);
        assert_eq!(relevant_chunks("price", &chunks, 3).len(), 3);
    }
}
