use std::collections::VecDeque;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Recursive character splitter: tries paragraph, line, then word boundaries, and only
/// cuts inside a word when a single word exceeds `chunk_size`. Lengths are in chars.
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let remaining = separators.get(position + 1..).unwrap_or(&[]);

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(start, c)| &text[start..start + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();
        for split in splits {
            if char_len(split) < self.chunk_size {
                fitting.push(split);
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge_splits(&fitting, separator));
                fitting.clear();
            }
            if remaining.is_empty() {
                chunks.push(split.to_string());
            } else {
                chunks.extend(self.split_recursive(split, remaining));
            }
        }
        if !fitting.is_empty() {
            chunks.extend(self.merge_splits(&fitting, separator));
        }

        chunks
    }

    fn merge_splits(&self, splits: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for split in splits {
            let len = char_len(split);
            let joined_len = |current: &VecDeque<&str>| {
                if current.is_empty() {
                    0
                } else {
                    separator_len
                }
            };

            if total + len + joined_len(&current) > self.chunk_size {
                if !current.is_empty() {
                    push_joined(&mut docs, &current, separator);
                    while total > self.chunk_overlap
                        || (total + len + joined_len(&current) > self.chunk_size && total > 0)
                    {
                        let Some(first) = current.pop_front() else {
                            break;
                        };
                        let sep = if current.is_empty() { 0 } else { separator_len };
                        total = total.saturating_sub(char_len(first) + sep);
                    }
                }
            }

            total += len + joined_len(&current);
            current.push_back(split);
        }

        push_joined(&mut docs, &current, separator);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, parts: &VecDeque<&str>, separator: &str) {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let splitter = TextSplitter::new(1000, 200);
        assert_eq!(splitter.split_text("  hello world  "), vec!["hello world"]);
        assert!(splitter.split_text("   ").is_empty());
    }

    #[test]
    fn words_merge_with_overlap() {
        let splitter = TextSplitter::new(15, 5);
        let chunks = splitter.split_text("one two three four five six seven eight nine ten");
        assert_eq!(
            chunks,
            vec![
                "one two three",
                "three four five",
                "five six seven",
                "seven eight",
                "eight nine ten"
            ]
        );
    }

    #[test]
    fn paragraphs_are_preferred_boundaries() {
        let splitter = TextSplitter::new(30, 0);
        let chunks = splitter.split_text("first paragraph here\n\nsecond paragraph here");
        assert_eq!(chunks, vec!["first paragraph here", "second paragraph here"]);
    }

    #[test]
    fn oversized_words_are_cut_by_characters() {
        let splitter = TextSplitter::new(10, 2);
        let word = "x".repeat(25);
        let chunks = splitter.split_text(&format!("{word} tail"));
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
        assert_eq!(chunks.last().map(String::as_str), Some("tail"));
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let splitter = TextSplitter::new(4, 0);
        let chunks = splitter.split_text("ééééééé");
        assert_eq!(chunks, vec!["éééé", "ééé"]);
    }
}
