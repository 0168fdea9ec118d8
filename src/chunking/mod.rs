//! Document chunking: fixed-size overlapping char windows.

pub mod window;

pub use window::{chunk, expected_chunk_count, validate};

use crate::error::Result;

/// Output of the chunking process.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutput {
    /// Position within the document, starting at 0.
    pub ordinal: usize,
    pub content: String,
    /// Char offset of the first char in the source text.
    pub start: usize,
    /// Char offset one past the last char.
    pub end: usize,
}

/// Chunk a document's text and attach ordinals and char offsets.
pub fn chunk_document(text: &str, size: usize, overlap: usize) -> Result<Vec<ChunkOutput>> {
    let windows = window::char_windows(text, size, overlap)?;
    let chars: Vec<char> = text.chars().collect();

    Ok(windows
        .into_iter()
        .enumerate()
        .map(|(ordinal, (start, end))| ChunkOutput {
            ordinal,
            content: chars[start..end].iter().collect(),
            start,
            end,
        })
        .collect())
}
