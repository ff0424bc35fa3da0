//! Template placeholder cleanup applied to document text before chunking.
//!
//! HR templates often ship with unfilled placeholders such as
//! `[Company Name]` or `[insert job title]`. Left in place they pollute
//! both indexes and leak into answers, so they are rewritten to neutral
//! phrases. Matching is ASCII case-insensitive.

use std::collections::BTreeMap;

/// Replacement for any `[insert ...]` placeholder without a specific rule.
pub const GENERIC_INSERT: &str = "the appropriate details";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitizer {
    /// `(placeholder, replacement)`, longest placeholder first.
    rules: Vec<(String, String)>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        for (from, to) in [
            ("[insert name and job title]", "HR Representative"),
            ("[insert job title]", "HR Representative"),
            ("[the Company]", "the company"),
            ("[Company Name]", "the company"),
            ("[Employee]", "employee"),
            ("[INSERT LOGO HERE]", ""),
        ] {
            rules.insert(from.to_string(), to.to_string());
        }
        Self::new(rules)
    }
}

impl Sanitizer {
    pub fn new(rules: BTreeMap<String, String>) -> Self {
        let mut rules: Vec<(String, String)> = rules
            .into_iter()
            .filter(|(from, _)| !from.is_empty())
            .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(&b.0)));
        Self { rules }
    }

    /// Default rules extended (and overridden) by `extra`.
    pub fn with_overrides(extra: &BTreeMap<String, String>) -> Self {
        let mut rules: BTreeMap<String, String> = Self::default().rules.into_iter().collect();
        for (k, v) in extra {
            rules.insert(k.clone(), v.clone());
        }
        Self::new(rules)
    }

    /// Stable description of the rule set, folded into index config signatures.
    pub fn signature(&self) -> String {
        self.rules
            .iter()
            .map(|(from, to)| format!("{}={}", from, to))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (from, to) in &self.rules {
            out = replace_ascii_ci(&out, from, to);
        }
        replace_generic_inserts(&out)
    }
}

/// Replace every ASCII case-insensitive occurrence of `needle`.
fn replace_ascii_ci(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_hay = haystack.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();

    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (pos, _) in lower_hay.match_indices(&lower_needle) {
        out.push_str(&haystack[last..pos]);
        out.push_str(replacement);
        last = pos + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

/// Replace `[ insert ... ]` placeholders with [`GENERIC_INSERT`].
fn replace_generic_inserts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let body = after.trim_start();
        let is_insert = body
            .get(..6)
            .map(|w| w.eq_ignore_ascii_case("insert"))
            .unwrap_or(false);

        match (is_insert, after.find(']')) {
            (true, Some(close)) => {
                out.push_str(&rest[..open]);
                out.push_str(GENERIC_INSERT);
                rest = &after[close + 1..];
            }
            _ => {
                out.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_rules_before_generic() {
        let s = Sanitizer::default();
        assert_eq!(
            s.apply("Signed, [Insert name and job title] of [COMPANY NAME]."),
            "Signed, HR Representative of the company."
        );
    }

    #[test]
    fn test_generic_insert() {
        let s = Sanitizer::default();
        assert_eq!(
            s.apply("Email [ insert HR mailbox ] for help."),
            "Email the appropriate details for help."
        );
    }

    #[test]
    fn test_unrelated_brackets_untouched() {
        let s = Sanitizer::default();
        assert_eq!(s.apply("See [Appendix A] and [in]"), "See [Appendix A] and [in]");
        assert_eq!(s.apply("Unclosed [insert here"), "Unclosed [insert here");
    }

    #[test]
    fn test_overrides() {
        let mut extra = BTreeMap::new();
        extra.insert("[Company Name]".to_string(), "Acme".to_string());
        let s = Sanitizer::with_overrides(&extra);
        assert_eq!(s.apply("Welcome to [company name]!"), "Welcome to Acme!");
        assert_ne!(s.signature(), Sanitizer::default().signature());
    }

    #[test]
    fn test_non_ascii_text_preserved() {
        let s = Sanitizer::default();
        assert_eq!(s.apply("Café [Employee] — ok"), "Café employee — ok");
    }
}
