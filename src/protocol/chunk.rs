//! Splitting oversized text payloads across frames
//!
//! Banner and Close bodies are bounded by the frame size, so longer text is
//! carried as a run of Banner frames with the remainder in a final frame.
//! Splits always land on char boundaries, so reassembling the chunks in
//! order reproduces the original text byte for byte.

/// Which message carries a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Banner,
    Close,
}

/// Longest prefix of `text` spanning at most `max` bytes of whole chars
fn prefix(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Split `text` into Banner chunks ending in one Close.
///
/// Banners carry up to `banner_capacity` bytes each while more than
/// `close_capacity` bytes remain; the Close carries the rest. Empty text
/// still yields one (empty) Close chunk. A chunk never splits a char, so a
/// Banner may run a few bytes short of capacity around multi-byte chars.
pub fn chunks_with_close(
    text: &str,
    banner_capacity: usize,
    close_capacity: usize,
) -> Vec<(ChunkKind, &str)> {
    debug_assert!(banner_capacity >= 4, "banner capacity below max char width");

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > close_capacity {
        let piece = prefix(rest, banner_capacity);
        chunks.push((ChunkKind::Banner, piece));
        rest = &rest[piece.len()..];
    }
    chunks.push((ChunkKind::Close, rest));
    chunks
}

/// Split `text` into Banner chunks of at most `banner_capacity` bytes.
///
/// Empty text still yields one (empty) chunk.
pub fn chunks_banners(text: &str, banner_capacity: usize) -> Vec<&str> {
    debug_assert!(banner_capacity >= 4, "banner capacity below max char width");

    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        let piece = prefix(rest, banner_capacity);
        chunks.push(piece);
        rest = &rest[piece.len()..];
        if rest.is_empty() {
            return chunks;
        }
    }
}
