//! Exclusion rules for directory scans.
//!
//! Rules are matched on two surfaces: against a subdirectory's full path
//! and base name when it is discovered, and against a directory's direct
//! non-directory children once its enumeration is complete (the *late
//! exclude*). A rule belongs to exactly one surface.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// How a rule pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternSyntax {
    /// Shell-style wildcards: `*` and `?`.
    Wildcard,
    /// A full regular expression.
    Regex,
    /// Verbatim string equality.
    FixedString,
}

/// A single exclusion rule.
#[derive(Debug, Clone)]
pub struct ExcludeRule {
    raw: String,
    syntax: PatternSyntax,
    regex: Regex,
    use_full_path: bool,
    check_any_file_child: bool,
}

impl ExcludeRule {
    /// Compile a rule. Matches against the base name by default.
    pub fn new(pattern: &str, syntax: PatternSyntax) -> Result<Self, ScanError> {
        let expr = match syntax {
            PatternSyntax::Wildcard => wildcard_to_regex(pattern),
            PatternSyntax::Regex => format!("^(?:{pattern})$"),
            PatternSyntax::FixedString => format!("^{}$", regex::escape(pattern)),
        };
        let regex = Regex::new(&expr).map_err(|e| ScanError::Config {
            message: format!("Bad exclude pattern \"{pattern}\": {e}"),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            syntax,
            regex,
            use_full_path: false,
            check_any_file_child: false,
        })
    }

    /// Match against the full path instead of the base name.
    pub fn with_full_path(mut self, use_full_path: bool) -> Self {
        self.use_full_path = use_full_path;
        self
    }

    /// Move this rule to the direct-file-children surface.
    pub fn with_check_any_file_child(mut self, check: bool) -> Self {
        self.check_any_file_child = check;
        self
    }

    /// The original pattern text.
    pub fn pattern(&self) -> &str {
        &self.raw
    }

    /// The pattern syntax.
    pub fn syntax(&self) -> PatternSyntax {
        self.syntax
    }

    /// Check if this rule belongs to the direct-file-children surface.
    pub fn checks_any_file_child(&self) -> bool {
        self.check_any_file_child
    }

    /// Match a directory against this rule.
    pub fn matches(&self, full_path: &str, name: &str) -> bool {
        let subject = if self.use_full_path { full_path } else { name };
        self.regex.is_match(subject)
    }

    fn matches_name(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Translate a wildcard pattern into an anchored regular expression.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => {
                if regex_syntax_char(c) {
                    expr.push('\\');
                }
                expr.push(c);
            }
        }
    }
    expr.push('$');
    expr
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

/// An ordered, read-only set of exclusion rules.
///
/// Injected into the job queue at construction; there is no global rule
/// registry.
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
    rules: Vec<ExcludeRule>,
}

impl ExcludeRules {
    /// Create a rule set.
    pub fn new(rules: Vec<ExcludeRule>) -> Self {
        Self { rules }
    }

    /// Check if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Discovery-time surface: does any rule match this directory?
    ///
    /// Rules on the direct-file-children surface are skipped here.
    pub fn match_path(&self, full_path: &str, name: &str) -> bool {
        self.rules
            .iter()
            .filter(|r| !r.check_any_file_child)
            .any(|r| r.matches(full_path, name))
    }

    /// Late-exclude surface: does any file-children rule match any of
    /// the direct non-directory child names?
    pub fn match_direct_children(&self, child_names: &[&str]) -> bool {
        self.rules
            .iter()
            .filter(|r| r.check_any_file_child)
            .any(|r| child_names.iter().any(|name| r.matches_name(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_translation() {
        let rule = ExcludeRule::new("*.bak", PatternSyntax::Wildcard).unwrap();
        assert!(rule.matches("/t/old.bak", "old.bak"));
        assert!(!rule.matches("/t/old.bakx", "old.bakx"));
        assert!(!rule.matches("/t/bak", "bak"));
    }

    #[test]
    fn test_wildcard_escapes_regex_chars() {
        let rule = ExcludeRule::new("a+b", PatternSyntax::Wildcard).unwrap();
        assert!(rule.matches("", "a+b"));
        assert!(!rule.matches("", "aab"));
    }

    #[test]
    fn test_fixed_string_is_exact() {
        let rule = ExcludeRule::new(".snapshot", PatternSyntax::FixedString).unwrap();
        assert!(rule.matches("/t/.snapshot", ".snapshot"));
        assert!(!rule.matches("/t/.snapshots", ".snapshots"));
    }

    #[test]
    fn test_full_path_surface() {
        let rule = ExcludeRule::new("/var/cache/*", PatternSyntax::Wildcard)
            .unwrap()
            .with_full_path(true);
        assert!(rule.matches("/var/cache/apt", "apt"));
        assert!(!rule.matches("/home/cache/apt", "apt"));
    }

    #[test]
    fn test_bad_regex_is_rejected() {
        assert!(ExcludeRule::new("(", PatternSyntax::Regex).is_err());
    }

    #[test]
    fn test_surfaces_are_disjoint() {
        let dir_rule = ExcludeRule::new("node_modules", PatternSyntax::FixedString).unwrap();
        let child_rule = ExcludeRule::new("*.nomedia", PatternSyntax::Wildcard)
            .unwrap()
            .with_check_any_file_child(true);
        let rules = ExcludeRules::new(vec![dir_rule, child_rule]);

        assert!(rules.match_path("/t/node_modules", "node_modules"));
        // The file-child rule must not fire on the discovery surface.
        assert!(!rules.match_path("/t/x.nomedia", "x.nomedia"));

        assert!(rules.match_direct_children(&["photo.jpg", "x.nomedia"]));
        assert!(!rules.match_direct_children(&["photo.jpg"]));
        // The directory rule must not fire on the children surface.
        assert!(!rules.match_direct_children(&["node_modules"]));
    }
}
