//! Target languages offered by the demo and their model codes.

use thiserror::Error;

/// `(code, display name)` in display order.
pub const LANGUAGES: [(&str, &str); 6] = [
    ("eng", "English"),
    ("fra", "French"),
    ("deu", "German"),
    ("ita", "Italian"),
    ("cmn", "Mandarin Chinese"),
    ("spa", "Spanish"),
];

pub const DEFAULT_TARGET_LANGUAGE: &str = "French";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown target language: {0:?}")]
pub struct UnknownLanguage(pub String);

/// Fixed bidirectional mapping between display names and codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageTable;

impl LanguageTable {
    pub fn code_for(&self, name: &str) -> Result<&'static str, UnknownLanguage> {
        LANGUAGES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(code, _)| *code)
            .ok_or_else(|| UnknownLanguage(name.to_string()))
    }

    pub fn name_for(&self, code: &str) -> Result<&'static str, UnknownLanguage> {
        LANGUAGES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .ok_or_else(|| UnknownLanguage(code.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        LANGUAGES.iter().map(|(_, name)| *name)
    }

    pub fn codes(&self) -> impl Iterator<Item = &'static str> {
        LANGUAGES.iter().map(|(code, _)| *code)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn mapping_is_a_bijection() {
        let t = LanguageTable;
        let names: HashSet<_> = t.names().collect();
        let codes: HashSet<_> = t.codes().collect();
        assert_eq!(names.len(), 6);
        assert_eq!(codes.len(), 6);

        for name in t.names() {
            let code = t.code_for(name).expect("code");
            assert_eq!(t.name_for(code).expect("name"), name);
        }
        for code in t.codes() {
            let name = t.name_for(code).expect("name");
            assert_eq!(t.code_for(name).expect("code"), code);
        }
    }

    #[test]
    fn offers_the_demo_languages_in_order() {
        let names: Vec<_> = LanguageTable.names().collect();
        assert_eq!(
            names,
            ["English", "French", "German", "Italian", "Mandarin Chinese", "Spanish"]
        );
        assert!(names.contains(&DEFAULT_TARGET_LANGUAGE));
    }

    #[test]
    fn unknown_name_is_a_lookup_error() {
        assert_eq!(
            LanguageTable.code_for("Klingon"),
            Err(UnknownLanguage("Klingon".to_string()))
        );
        // Codes are not accepted where names are expected.
        assert!(LanguageTable.code_for("fra").is_err());
    }
}
