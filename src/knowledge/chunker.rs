//! Overlapping text chunker for knowledge documents
//!
//! Documents are split into greedy windows of roughly a thousand
//! characters with a couple hundred characters of overlap, so a fact
//! straddling a window edge still appears whole in one chunk. Window
//! ends snap to the last sentence or paragraph break when one exists
//! past the window midpoint.

/// Target window size in characters.
pub const CHUNK_SIZE: usize = 1000;

/// Overlap carried into the next window.
pub const CHUNK_OVERLAP: usize = 200;

/// Split text into overlapping chunks. Terminates for any non-empty
/// input and any `size >= 1`; the next window start always advances.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let chars: Vec<char> = text.chars().collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + size).min(chars.len());
        let end = if hard_end < chars.len() {
            snap_to_boundary(&chars, start, hard_end).unwrap_or(hard_end)
        } else {
            hard_end
        };

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = (end.saturating_sub(overlap)).max(start + 1);
    }

    chunks
}

/// Last `.` or `\n\n` inside the window, accepted only past the window
/// midpoint. Returns the exclusive end index after the boundary.
fn snap_to_boundary(chars: &[char], start: usize, hard_end: usize) -> Option<usize> {
    let midpoint = start + (hard_end - start) / 2;
    for i in (midpoint..hard_end).rev() {
        if chars[i] == '.' {
            return Some(i + 1);
        }
        if chars[i] == '\n' && i + 1 < hard_end && chars[i + 1] == '\n' {
            return Some(i + 2);
        }
    }
    None
}
