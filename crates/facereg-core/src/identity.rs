//! Subject names derived from image keys.
//!
//! Dataset files are named `<Subject>_<n>.<ext>`, and the cloaking tool
//! writes variants as `<Subject>_cloaked.<ext>` or
//! `<Subject>_cloaked_<level>.<ext>`. All of these group under `<Subject>`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const UNKNOWN_SUBJECT: &str = "unknown";

static CLOAKED_SUFFIX: OnceLock<Regex> = OnceLock::new();
static NUMERIC_SUFFIX: OnceLock<Regex> = OnceLock::new();

fn cloaked_suffix() -> &'static Regex {
    CLOAKED_SUFFIX.get_or_init(|| {
        Regex::new(r"(?i)^(?P<subject>.+?)_cloaked(?:_(?:low|mid|high|\d+))?$")
            .expect("static regex")
    })
}

fn numeric_suffix() -> &'static Regex {
    NUMERIC_SUFFIX.get_or_init(|| Regex::new(r"^(?P<subject>.+)_\d+$").expect("static regex"))
}

/// Caller-supplied override: files whose name contains `pattern`
/// (case-insensitive) belong to `subject_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameHint {
    pub subject_name: String,
    pub pattern: String,
}

impl NameHint {
    pub fn new(subject_name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            subject_name: subject_name.into(),
            pattern: pattern.into(),
        }
    }

    pub fn matches(&self, image_key: &str) -> bool {
        !self.pattern.is_empty()
            && file_name(image_key)
                .to_lowercase()
                .contains(&self.pattern.to_lowercase())
    }
}

/// Resolve the subject for an image.
///
/// A non-blank `explicit` name wins. Otherwise the name comes from the file
/// stem of `image_key` with a cloaking suffix and then a trailing `_<digits>`
/// group removed.
pub fn resolve_subject(image_key: &str, explicit: Option<&str>) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let stem = file_stem(file_name(image_key));
    if stem.is_empty() {
        return UNKNOWN_SUBJECT.to_string();
    }

    let uncloaked = cloaked_suffix()
        .captures(stem)
        .and_then(|c| c.name("subject"))
        .map_or(stem, |m| m.as_str());

    numeric_suffix()
        .captures(uncloaked)
        .and_then(|c| c.name("subject"))
        .map_or(uncloaked, |m| m.as_str())
        .to_string()
}

/// Like [`resolve_subject`], but the first matching hint overrides
/// the filename-derived name.
pub fn resolve_with_hints(image_key: &str, hints: &[NameHint]) -> String {
    let hinted = hints
        .iter()
        .find(|h| h.matches(image_key))
        .map(|h| h.subject_name.as_str());
    resolve_subject(image_key, hinted)
}

/// Last path component; keys may carry `/` or `\` separators.
fn file_name(key: &str) -> &str {
    key.rsplit(['/', '\\']).next().unwrap_or(key)
}

/// Strip the extension. A leading dot is part of the name, not an extension.
fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_name_wins() {
        assert_eq!(resolve_subject("A_1.jpg", Some("Alice")), "Alice");
        assert_eq!(resolve_subject("A_1.jpg", Some("  Alice  ")), "Alice");
    }

    #[test]
    fn test_blank_explicit_name_falls_back() {
        assert_eq!(resolve_subject("A_1.jpg", Some("")), "A");
        assert_eq!(resolve_subject("A_1.jpg", Some("   ")), "A");
    }

    #[test]
    fn test_numeric_suffix_stripped() {
        assert_eq!(resolve_subject("A_1.jpg", None), "A");
        assert_eq!(resolve_subject("John_Doe_12.png", None), "John_Doe");
        assert_eq!(resolve_subject("Bella_Ramsey_1700000000.jpg", None), "Bella_Ramsey");
    }

    #[test]
    fn test_only_last_digit_group_stripped() {
        assert_eq!(resolve_subject("Agent_007_3.jpg", None), "Agent_007");
    }

    #[test]
    fn test_no_digit_group_keeps_stem() {
        assert_eq!(resolve_subject("Ronaldo2.jpg", None), "Ronaldo2");
        assert_eq!(resolve_subject("selena_gomez.jpeg", None), "selena_gomez");
        assert_eq!(resolve_subject("A_1b.jpg", None), "A_1b");
    }

    #[test]
    fn test_cloaked_level_suffix_stripped() {
        assert_eq!(resolve_subject("Yara_cloaked_mid.jpg", None), "Yara");
        assert_eq!(resolve_subject("Yara_cloaked_high.png", None), "Yara");
        assert_eq!(resolve_subject("Yara_cloaked_low.jpeg", None), "Yara");
        assert_eq!(resolve_subject("Yara_cloaked_3.jpg", None), "Yara");
        assert_eq!(resolve_subject("Yara_CLOAKED_MID.jpg", None), "Yara");
    }

    #[test]
    fn test_bare_cloaked_suffix_stripped() {
        assert_eq!(resolve_subject("Yara_cloaked.png", None), "Yara");
    }

    #[test]
    fn test_cloaked_variant_of_numbered_image() {
        assert_eq!(resolve_subject("Selena_Gomez_4_cloaked_mid.jpg", None), "Selena_Gomez");
    }

    #[test]
    fn test_unknown_cloak_level_is_kept() {
        assert_eq!(resolve_subject("Yara_cloaked_ultra.jpg", None), "Yara_cloaked_ultra");
    }

    #[test]
    fn test_subject_cannot_be_empty_before_suffix() {
        assert_eq!(resolve_subject("_1.jpg", None), "_1");
        assert_eq!(resolve_subject("_cloaked.jpg", None), "_cloaked");
    }

    #[test]
    fn test_digits_only_and_no_extension() {
        assert_eq!(resolve_subject("123.jpg", None), "123");
        assert_eq!(resolve_subject("A_1", None), "A");
        assert_eq!(resolve_subject("archive.tar.gz", None), "archive.tar");
    }

    #[test]
    fn test_dotfiles_and_empty() {
        assert_eq!(resolve_subject(".hidden", None), ".hidden");
        assert_eq!(resolve_subject("", None), UNKNOWN_SUBJECT);
        assert_eq!(resolve_subject("dir/", None), UNKNOWN_SUBJECT);
    }

    #[test]
    fn test_directory_components_ignored() {
        assert_eq!(resolve_subject("people/A_1.jpg", None), "A");
        assert_eq!(resolve_subject(r"people\B_2.jpg", None), "B");
        assert_eq!(resolve_subject("x_9/A.jpg", None), "A");
    }

    #[test]
    fn test_deterministic() {
        for key in ["A_1.jpg", "Yara_cloaked_mid.jpg", "x/y/Z_3.png", ""] {
            assert_eq!(resolve_subject(key, None), resolve_subject(key, None));
        }
    }

    #[test]
    fn test_hints_first_match_wins() {
        let hints = vec![
            NameHint::new("Selena_Gomez_Cloaked", "_cloaked_mid"),
            NameHint::new("Selena_Gomez_Raw", "selenagomez"),
        ];
        assert_eq!(
            resolve_with_hints("selenagomez1_cloaked_mid.jpg", &hints),
            "Selena_Gomez_Cloaked"
        );
        assert_eq!(resolve_with_hints("SelenaGomez3.jpg", &hints), "Selena_Gomez_Raw");
        assert_eq!(resolve_with_hints("Yara_1.jpg", &hints), "Yara");
    }

    #[test]
    fn test_hint_matches_file_name_not_directory() {
        let hint = NameHint::new("X", "people");
        assert!(!hint.matches("people/A_1.jpg"));
        assert!(!NameHint::new("X", "").matches("A_1.jpg"));
    }
}
