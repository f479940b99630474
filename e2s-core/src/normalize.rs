//! Canonical text for comparison and fingerprinting.
//!
//! Two strings that differ only by case, surrounding or repeated whitespace,
//! or punctuation normalize to the same value, so cosmetic edits in the
//! source roster never show up as changes.

use std::collections::BTreeSet;

/// Separator between fingerprint fields. Always stripped by [`Normalizer`].
pub const FIELD_DELIMITER: char = '|';

/// Text normalizer with a configurable punctuation set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalizer {
    /// Explicit characters to strip. `None` strips everything that is not
    /// alphanumeric, whitespace or `_`.
    punctuation: Option<BTreeSet<char>>,
}

impl Normalizer {
    /// Normalizer that strips an explicit punctuation set.
    pub fn with_punctuation(chars: &str) -> Self {
        Self {
            punctuation: Some(chars.chars().collect()),
        }
    }

    fn is_stripped(&self, c: char) -> bool {
        if c == FIELD_DELIMITER {
            return true;
        }
        match &self.punctuation {
            Some(set) => set.contains(&c),
            None => !(c.is_alphanumeric() || c.is_whitespace() || c == '_'),
        }
    }

    /// Lower-case, strip punctuation, trim and collapse whitespace.
    ///
    /// Total: never fails, empty input yields an empty string.
    pub fn normalize(&self, text: &str) -> String {
        let stripped: String = text
            .chars()
            .filter(|c| !self.is_stripped(*c))
            .flat_map(char::to_lowercase)
            .collect();
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// [`normalize`](Self::normalize) over an optional value.
    pub fn normalize_opt(&self, text: Option<&str>) -> String {
        text.map(|t| self.normalize(t)).unwrap_or_default()
    }
}

/// Digits-only rule for phone-like fields. No case folding applies.
pub fn normalize_phone(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_normalizer_folds_case_whitespace_and_punctuation() {
        let n = Normalizer::default();
        assert_eq!(n.normalize("  Acme   Store, Inc. "), "acme store inc");
        assert_eq!(n.normalize("ACME\tSTORE\nINC"), "acme store inc");
        assert_eq!(n.normalize("snake_case"), "snake_case");
    }

    #[test]
    fn empty_and_absent_input_yield_empty() {
        let n = Normalizer::default();
        assert_eq!(n.normalize(""), "");
        assert_eq!(n.normalize("  ... "), "");
        assert_eq!(n.normalize_opt(None), "");
    }

    #[test]
    fn explicit_punctuation_set_keeps_other_symbols() {
        let n = Normalizer::with_punctuation(".,");
        assert_eq!(n.normalize("A&B, Co."), "a&b co");
    }

    #[test]
    fn delimiter_is_always_stripped() {
        let n = Normalizer::with_punctuation("");
        assert_eq!(n.normalize("a|b"), "ab");
    }

    #[test]
    fn phone_keeps_digits_only() {
        assert_eq!(normalize_phone("(512) 555-0100 x7"), "51255501007");
        assert_eq!(normalize_phone("n/a"), "");
    }
}
