//! Sentence segmentation and chunk grouping.
//!
//! The sentence indices produced here are shared between playback and UI
//! highlighting, so segmentation must stay deterministic: the same text always
//! yields the same sentence list.

/// A group of whole sentences sent to the backend in one synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Indices into the sentence list this chunk covers. Contiguous and
    /// strictly increasing.
    pub sentence_indices: Vec<usize>,
}

fn is_sentence_terminator(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '…' | '。' | '？' | '！')
}

/// Split text on sentence terminators (Latin and CJK), keeping the terminator
/// with the preceding sentence. Sentences are trimmed; empty ones are dropped.
/// Text without any terminator comes back as a single sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if is_sentence_terminator(ch) {
            push_trimmed(&mut sentences, &mut current);
        }
    }
    push_trimmed(&mut sentences, &mut current);

    if sentences.is_empty() && !text.trim().is_empty() {
        sentences.push(text.trim().to_string());
    }
    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

fn is_emoji(ch: char) -> bool {
    matches!(ch,
        '\u{2190}'..='\u{21FF}'     // arrows
        | '\u{2600}'..='\u{27BF}'   // misc symbols, dingbats
        | '\u{2B00}'..='\u{2BFF}'
        | '\u{FE0F}'                // variation selector
        | '\u{200D}'                // zero-width joiner
        | '\u{E000}'..='\u{F8FF}'   // private use
        | '\u{1F000}'..='\u{1FAFF}' // pictographs, emoticons, transport
    )
}

/// Strip markup asterisks and emoji from an AI reply before synthesis. The
/// backend reads these out loud otherwise.
pub fn clean_reply(text: &str) -> String {
    text.chars()
        .filter(|&ch| ch != '*' && !is_emoji(ch))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Pack consecutive sentences into chunks of at most `limit` characters,
/// skipping everything before `start_index` (mid-message resume). A single
/// sentence longer than the limit still becomes its own chunk; nothing is
/// dropped or truncated here.
pub fn group_chunks(sentences: &[String], limit: usize, start_index: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current_text = String::new();
    let mut current_indices = Vec::new();
    let mut current_chars = 0usize;

    for (idx, sentence) in sentences.iter().enumerate().skip(start_index) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let sentence_chars = sentence.chars().count();

        // The joining space counts against the limit too; the chunk text is
        // what actually goes to the backend.
        let joined_chars = if current_indices.is_empty() {
            sentence_chars
        } else {
            current_chars + 1 + sentence_chars
        };
        if joined_chars > limit && !current_indices.is_empty() {
            chunks.push(Chunk {
                text: std::mem::take(&mut current_text),
                sentence_indices: std::mem::take(&mut current_indices),
            });
            current_chars = sentence_chars;
        } else {
            current_chars = joined_chars;
        }

        if !current_text.is_empty() {
            current_text.push(' ');
        }
        current_text.push_str(sentence);
        current_indices.push(idx);
    }

    if !current_indices.is_empty() {
        chunks.push(Chunk {
            text: current_text,
            sentence_indices: current_indices,
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(sentences: &[&str]) -> Vec<String> {
        sentences.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_input_yields_no_sentences() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   \n ").is_empty());
    }

    #[test]
    fn splits_on_latin_terminators_keeping_them() {
        let sentences = split_sentences("Hello there. How are you? I am fine!");
        assert_eq!(sentences, owned(&["Hello there.", "How are you?", "I am fine!"]));
    }

    #[test]
    fn splits_on_cjk_terminators() {
        let sentences = split_sentences("こんにちは。元気ですか？はい！");
        assert_eq!(sentences, owned(&["こんにちは。", "元気ですか？", "はい！"]));
    }

    #[test]
    fn text_without_boundary_is_one_sentence() {
        let sentences = split_sentences("  no terminator here  ");
        assert_eq!(sentences, owned(&["no terminator here"]));
    }

    #[test]
    fn trailing_text_after_last_terminator_is_kept() {
        let sentences = split_sentences("Done. trailing bit");
        assert_eq!(sentences, owned(&["Done.", "trailing bit"]));
    }

    #[test]
    fn clean_reply_strips_asterisks_and_emoji() {
        assert_eq!(clean_reply("*waves* Hello! 😊"), "waves Hello!");
        // CJK terminators must survive cleaning, segmentation depends on them.
        assert_eq!(clean_reply("はい。"), "はい。");
    }

    #[test]
    fn grouping_respects_limit_with_exact_boundaries() {
        // Each sentence alone exceeds the combining room under limit 15, so
        // every sentence becomes its own chunk.
        let sentences = split_sentences("Hello there. How are you? I am fine!");
        let chunks = group_chunks(&sentences, 15, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "Hello there.");
        assert_eq!(chunks[1].text, "How are you?");
        assert_eq!(chunks[2].text, "I am fine!");
        assert_eq!(chunks[0].sentence_indices, vec![0]);
        assert_eq!(chunks[1].sentence_indices, vec![1]);
        assert_eq!(chunks[2].sentence_indices, vec![2]);
    }

    #[test]
    fn grouping_packs_sentences_under_the_limit() {
        let sentences = owned(&["One.", "Two.", "Three."]);
        let chunks = group_chunks(&sentences, 100, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "One. Two. Three.");
        assert_eq!(chunks[0].sentence_indices, vec![0, 1, 2]);
    }

    #[test]
    fn chunk_text_never_exceeds_limit_once_joiners_count() {
        let sentences = owned(&["a.", "a.", "a.", "a."]);
        let chunks = group_chunks(&sentences, 8, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "a. a. a.");
        assert_eq!(chunks[1].text, "a.");
        for chunk in &chunks {
            assert!(
                chunk.text.chars().count() <= 8,
                "chunk {:?} exceeds the limit",
                chunk.text
            );
        }
    }

    #[test]
    fn single_overlong_sentence_becomes_its_own_chunk() {
        let sentences = owned(&["Short.", "This sentence is far longer than the limit allows."]);
        let chunks = group_chunks(&sentences, 10, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].sentence_indices, vec![1]);
        assert!(chunks[1].text.chars().count() > 10);
    }

    #[test]
    fn every_sentence_from_start_index_is_covered_exactly_once() {
        let sentences = owned(&["A.", "B.", "C.", "D.", "E."]);
        for start in 0..sentences.len() {
            let chunks = group_chunks(&sentences, 5, start);
            let covered: Vec<usize> = chunks
                .iter()
                .flat_map(|c| c.sentence_indices.iter().copied())
                .collect();
            let expected: Vec<usize> = (start..sentences.len()).collect();
            assert_eq!(covered, expected, "start={start}");
        }
    }

    #[test]
    fn grouping_skips_sentences_before_start_index() {
        let sentences = owned(&["One.", "Two.", "Three."]);
        let chunks = group_chunks(&sentences, 100, 2);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Three.");
        assert_eq!(chunks[0].sentence_indices, vec![2]);
    }

    #[test]
    fn chunk_indices_are_contiguous_and_increasing() {
        let sentences: Vec<String> = (0..12).map(|i| format!("Sentence number {i}.")).collect();
        let chunks = group_chunks(&sentences, 45, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            for pair in chunk.sentence_indices.windows(2) {
                assert_eq!(pair[1], pair[0] + 1);
            }
        }
    }
}
