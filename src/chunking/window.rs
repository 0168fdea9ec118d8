//! Fixed-size sliding window over the characters of a text.
//!
//! Window `i` covers chars `[i * step, i * step + size)` where
//! `step = size - overlap`. The first window that reaches the end of the
//! text is the last one; it may be shorter and is never padded. Offsets
//! count chars, never bytes, so a window can't split a UTF-8 sequence.

use crate::error::{RagError, Result};

/// Reject chunk parameters that can't produce a forward-moving window.
pub fn validate(size: usize, overlap: usize) -> Result<()> {
    if size == 0 {
        return Err(RagError::config("chunk size must be greater than 0"));
    }
    if overlap >= size {
        return Err(RagError::config(format!(
            "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
        )));
    }
    Ok(())
}

/// Split `text` into overlapping windows of `size` chars.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
    Ok(char_windows(text, size, overlap)?
        .into_iter()
        .map(|(start, end)| slice_chars(text, start, end).to_string())
        .collect())
}

/// Char-offset `(start, end)` pairs of each window.
pub fn char_windows(text: &str, size: usize, overlap: usize) -> Result<Vec<(usize, usize)>> {
    validate(size, overlap)?;

    let len = text.chars().count();
    let step = size - overlap;
    let mut windows = Vec::with_capacity(expected_chunk_count(len, size, overlap));

    let mut start = 0;
    while start < len {
        let end = (start + size).min(len);
        windows.push((start, end));
        if end == len {
            break;
        }
        start += step;
    }

    Ok(windows)
}

/// Number of windows produced for a text of `len` chars:
/// `ceil((len - overlap) / (size - overlap))`, or 1 when the text fits in a
/// single window, or 0 for empty text.
pub fn expected_chunk_count(len: usize, size: usize, overlap: usize) -> usize {
    if len == 0 || size == 0 || overlap >= size {
        return 0;
    }
    if len <= size {
        return 1;
    }
    let step = size - overlap;
    (len - overlap).div_ceil(step)
}

/// Borrow the chars `[start, end)` of `text`.
fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    let mut indices = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
    let from = indices.nth(start).unwrap_or(text.len());
    let to = if end > start {
        indices.nth(end - start - 1).unwrap_or(text.len())
    } else {
        from
    };
    &text[from..to]
}

/// Rebuild the source text from windows produced with the given overlap.
pub fn reassemble(chunks: &[String], overlap: usize) -> String {
    let mut out = String::new();
    for (i, c) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(c);
        } else {
            out.extend(c.chars().skip(overlap));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_brown_fox() {
        let chunks = chunk("The quick brown fox jumps.", 10, 3).unwrap();
        assert_eq!(
            chunks,
            vec!["The quick ", "ck brown f", "n fox jump", "umps."]
        );
    }

    #[test]
    fn test_rejects_overlap_ge_size() {
        assert!(matches!(chunk("abc", 5, 5), Err(RagError::Config(_))));
        assert!(matches!(chunk("abc", 5, 9), Err(RagError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_size() {
        assert!(matches!(chunk("abc", 0, 0), Err(RagError::Config(_))));
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk("", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk("tiny", 10, 3).unwrap();
        assert_eq!(chunks, vec!["tiny"]);
    }

    #[test]
    fn test_no_window_contained_in_previous() {
        // 17 chars, step 7: windows 0..10 and 7..17 already cover everything
        let chunks = chunk("abcdefghijklmnopq", 10, 3).unwrap();
        assert_eq!(chunks, vec!["abcdefghij", "hijklmnopq"]);
        assert_eq!(expected_chunk_count(17, 10, 3), 2);
    }

    #[test]
    fn test_final_chunk_not_padded() {
        let chunks = chunk("abcdefghijk", 4, 0).unwrap();
        assert_eq!(chunks, vec!["abcd", "efgh", "ijk"]);
    }

    #[test]
    fn test_count_matches_formula_and_reassembles() {
        let text: String = (0..437).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        for (size, overlap) in [(10, 0), (10, 3), (50, 49), (7, 2), (500, 100), (1, 0)] {
            let chunks = chunk(&text, size, overlap).unwrap();
            assert_eq!(
                chunks.len(),
                expected_chunk_count(text.len(), size, overlap),
                "size={size} overlap={overlap}"
            );
            assert_eq!(reassemble(&chunks, overlap), text, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn test_multibyte_chars_never_split() {
        let text = "héllo wörld ✨ ünïcode 🌍 text";
        let chunks = chunk(text, 5, 2).unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
        assert_eq!(reassemble(&chunks, 2), text);
    }

    #[test]
    fn test_deterministic() {
        let text = "Same input, same output, every single time.";
        assert_eq!(chunk(text, 8, 3).unwrap(), chunk(text, 8, 3).unwrap());
    }
}
