pub const DEFAULT_WINDOW: usize = 500;
pub const DEFAULT_OVERLAP: usize = 50;

/// Splits text into word windows of `window` words that overlap by
/// `overlap` words. Whitespace-only input yields no chunks. An overlap at
/// or above the window size is clamped so the cursor always advances.
pub fn chunk_text(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || window == 0 {
        return Vec::new();
    }

    let step = window.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + window).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("just a few words", 500, 50);
        assert_eq!(chunks, vec!["just a few words"]);
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = numbered_words(120);
        let chunks = chunk_text(&text, 100, 10);
        assert_eq!(chunks.len(), 2);

        let first: Vec<&str> = chunks[0].split_whitespace().collect();
        let second: Vec<&str> = chunks[1].split_whitespace().collect();
        assert_eq!(first.len(), 100);
        assert_eq!(second.first(), Some(&"w90"));
        assert_eq!(second.last(), Some(&"w119"));
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(chunk_text("   \n\t  ", 500, 50).is_empty());
    }

    #[test]
    fn overlap_at_window_size_still_advances() {
        let chunks = chunk_text(&numbered_words(10), 4, 4);
        assert!(chunks.len() <= 10);
        assert_eq!(chunks[0], "w0 w1 w2 w3");
        assert_eq!(chunks[1], "w1 w2 w3 w4");
    }
}
