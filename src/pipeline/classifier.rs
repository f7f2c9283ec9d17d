//! Sentiment classification.
//!
//! `SentimentClassifier` is the seam: anything that maps text to a score in
//! `[1.0, 5.0]` deterministically can be plugged into the worker.
//! `KeywordClassifier` is the rule-based default: it starts at neutral and
//! moves one point per distinct positive or negative word.

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE};

/// Maps free text to a score in `[1.0, 5.0]`.
///
/// Implementations must be pure: same input, same score, no side effects.
pub trait SentimentClassifier: Send + Sync {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    fn classify(&self, text: &str) -> f64;
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "friendly", "polite", "clean", "safe", "fast", "easy",
    "love", "best", "happy",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad",
    "terrible",
    "horrible",
    "rude",
    "unprofessional",
    "dirty",
    "unsafe",
    "slow",
    "hard",
    "hate",
    "worst",
    "sad",
    "angry",
    "late",
    "dangerous",
];

/// Vocabulary-based classifier.
pub struct KeywordClassifier {
    positive: HashSet<String>,
    negative: HashSet<String>,
    punctuation: Regex,
}

impl KeywordClassifier {
    /// Classifier with the built-in vocabularies.
    pub fn default_vocabulary() -> Self {
        Self::with_vocabulary(POSITIVE_WORDS.iter().copied(), NEGATIVE_WORDS.iter().copied())
    }

    /// Classifier with custom vocabularies. Words are matched lowercase.
    pub fn with_vocabulary<'a>(
        positive: impl IntoIterator<Item = &'a str>,
        negative: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            positive: positive.into_iter().map(str::to_lowercase).collect(),
            negative: negative.into_iter().map(str::to_lowercase).collect(),
            // ASCII punctuation is deleted, not replaced, so "don't" -> "dont".
            punctuation: Regex::new(r"[[:punct:]]").expect("static regex"),
        }
    }

    /// Lowercased, punctuation-stripped, deduplicated words.
    fn tokenize(&self, text: &str) -> HashSet<String> {
        let lowered = text.to_lowercase();
        let stripped = self.punctuation.replace_all(&lowered, "");
        stripped.split_whitespace().map(str::to_string).collect()
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::default_vocabulary()
    }
}

impl SentimentClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    fn classify(&self, text: &str) -> f64 {
        if text.is_empty() {
            return NEUTRAL_SCORE;
        }

        let words = self.tokenize(text);
        let positive_hits = words.iter().filter(|w| self.positive.contains(*w)).count();
        let negative_hits = words.iter().filter(|w| self.negative.contains(*w)).count();

        let raw = NEUTRAL_SCORE + positive_hits as f64 - negative_hits as f64;
        let score = raw.clamp(MIN_SCORE, MAX_SCORE);

        debug!(positive_hits, negative_hits, score, "Classified feedback text");
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> KeywordClassifier {
        KeywordClassifier::default_vocabulary()
    }

    #[test]
    fn empty_text_is_neutral() {
        assert_eq!(classifier().classify(""), 3.0);
    }

    #[test]
    fn whitespace_only_is_neutral() {
        assert_eq!(classifier().classify("   \n"), 3.0);
    }

    #[test]
    fn two_positive_hits() {
        assert_eq!(classifier().classify("great friendly driver"), 5.0);
    }

    #[test]
    fn two_negative_hits() {
        assert_eq!(classifier().classify("rude and late"), 1.0);
    }

    #[test]
    fn clamps_at_bounds() {
        let c = classifier();
        assert_eq!(c.classify("great friendly polite clean safe"), 5.0);
        assert_eq!(c.classify("rude late dirty slow angry"), 1.0);
    }

    #[test]
    fn repeated_words_count_once() {
        assert_eq!(classifier().classify("great great great"), 4.0);
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        assert_eq!(classifier().classify("GREAT!!! Really... Friendly."), 5.0);
    }

    #[test]
    fn mixed_feedback_cancels_out() {
        assert_eq!(classifier().classify("friendly but late"), 3.0);
    }

    #[test]
    fn punctuation_inside_words_is_deleted() {
        // "un-safe" collapses to "unsafe", a negative word.
        assert_eq!(classifier().classify("un-safe"), 2.0);
    }

    #[test]
    fn deterministic() {
        let c = classifier();
        let text = "fast and clean but the app was slow";
        assert_eq!(c.classify(text), c.classify(text));
    }

    #[test]
    fn custom_vocabulary() {
        let c = KeywordClassifier::with_vocabulary(["Smooth"], ["bumpy"]);
        assert_eq!(c.classify("smooth ride"), 4.0);
        assert_eq!(c.classify("bumpy ride"), 2.0);
        assert_eq!(c.classify("great ride"), 3.0);
    }
}
