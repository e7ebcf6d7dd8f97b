//! Free-text tokenizer shared by indexing and querying

use std::collections::{BTreeSet, HashSet};

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "if", "in", "into", "is", "it", "its", "itself", "just", "me",
    "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once", "only",
    "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she", "should", "so",
    "some", "such", "than", "that", "the", "their", "theirs", "them", "themselves", "then",
    "there", "these", "they", "this", "those", "through", "to", "too", "under", "until", "up",
    "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom", "why",
    "will", "with", "would", "you", "your", "yours", "yourself", "yourselves",
];

/// Minimum token length in characters
const MIN_TOKEN_CHARS: usize = 2;

#[derive(Debug, Clone)]
pub struct Tokenizer {
    stop_words: HashSet<String>,
}

impl Tokenizer {
    pub fn new<I, S>(extra_stop_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stop_words: HashSet<String> = STOP_WORDS.iter().map(|w| (*w).to_string()).collect();
        stop_words.extend(
            extra_stop_words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase()),
        );
        Self { stop_words }
    }

    /// Lowercase, strip punctuation, drop stop words and short tokens
    pub fn tokenize(&self, text: &str) -> BTreeSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
            .filter(|t| !self.stop_words.contains(*t))
            .map(str::to_string)
            .collect()
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(&word.to_lowercase())
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(t: &Tokenizer, s: &str) -> Vec<String> {
        t.tokenize(s).into_iter().collect()
    }

    #[test]
    fn test_lowercase_and_punctuation() {
        let t = Tokenizer::default();
        assert_eq!(
            tokens(&t, "Debugging the Parser, again!"),
            vec!["debugging", "parser"]
        );
        assert_eq!(tokens(&t, "rust-lang/cargo"), vec!["cargo", "lang", "rust"]);
    }

    #[test]
    fn test_short_tokens_and_stop_words_dropped() {
        let t = Tokenizer::default();
        assert!(t.tokenize("a I of to x").is_empty());
        assert_eq!(tokens(&t, "go to db"), vec!["db", "go"]);
    }

    #[test]
    fn test_extra_stop_words() {
        let t = Tokenizer::new(["Session", "notes"]);
        assert_eq!(tokens(&t, "session notes: kernel"), vec!["kernel"]);
        assert!(t.is_stop_word("SESSION"));
    }

    #[test]
    fn test_unicode_letters_kept() {
        let t = Tokenizer::default();
        assert_eq!(tokens(&t, "Café réunion"), vec!["café", "réunion"]);
    }
}
