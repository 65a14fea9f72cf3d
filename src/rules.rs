//! Relabel rule compilation and application
//!
//! A rule has the form `oldKey[=oldValue]:newKey[=newValue]`. The old side
//! may carry a single `*` wildcard that captures the rest of the matched key
//! or value; the new side may reuse the capture through its own `*`
//! placeholder. Rules are compiled once at startup and shared read-only for
//! the life of the process.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

const OLD_PAIR_WILDCARDS: &str = "the old key=value pair may contain no more than a single *";
const NEW_WITHOUT_OLD: &str =
    "a wildcard cannot appear in the new label without appearing in the old one";

/// Errors produced while compiling raw `--relabel` rules.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("at least one --relabel rule must be specified")]
    EmptyRuleSet,

    #[error("invalid --relabel rule {rule:?}: rules must be in the form old/label=value:new/label=newvalue")]
    MalformedRule { rule: String },

    #[error("invalid --relabel rule {rule:?}: {reason}")]
    InvalidWildcardPlacement { rule: String, reason: &'static str },

    #[error("invalid --relabel rule {rule:?}: the new pattern is matched by the old one and would be rewritten on every reconciliation pass")]
    RecursiveRule { rule: String },

    #[error("invalid --relabel rule {rule:?}: {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// A single compiled relabel rule.
///
/// The old key and value compile to anchored patterns; literal fragments are
/// escaped, so only the `*` wildcard carries pattern meaning. The new key
/// and value stay as templates with an optional `*` placeholder.
#[derive(Debug, Clone)]
struct Rule {
    old_key: Regex,
    old_value: Regex,
    new_key: String,
    new_value: String,
}

impl Rule {
    fn parse(raw: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedRule {
            rule: raw.to_string(),
        };

        let halves: Vec<&str> = raw.split(':').collect();
        if halves.len() != 2 {
            return Err(malformed());
        }
        let (old_key, old_value) = split_pair(halves[0]).ok_or_else(malformed)?;
        let (new_key, new_value) = split_pair(halves[1]).ok_or_else(malformed)?;

        let old_wildcards =
            old_key.matches('*').count() + old_value.matches('*').count();
        if old_wildcards > 1 {
            return Err(ParseError::InvalidWildcardPlacement {
                rule: raw.to_string(),
                reason: OLD_PAIR_WILDCARDS,
            });
        }
        if (new_key.contains('*') || new_value.contains('*')) && old_wildcards == 0 {
            return Err(ParseError::InvalidWildcardPlacement {
                rule: raw.to_string(),
                reason: NEW_WITHOUT_OLD,
            });
        }

        let compile = |side: &str| {
            compile_pattern(side).map_err(|source| ParseError::Pattern {
                rule: raw.to_string(),
                source,
            })
        };
        let old_key_pattern = compile(old_key)?;
        let old_value_pattern = compile(old_value)?;

        // Best-effort self-matching check: a rule whose output the rule
        // itself would match again never converges. Only literal containment
        // is inspected, not fixed points of composed rule sets.
        let recursive = |pattern: &Regex, old: &str, new: &str| {
            old.contains('*') && new.contains('*') && old != new && pattern.is_match(new)
        };
        if recursive(&old_key_pattern, old_key, new_key)
            || recursive(&old_value_pattern, old_value, new_value)
        {
            return Err(ParseError::RecursiveRule {
                rule: raw.to_string(),
            });
        }

        Ok(Self {
            old_key: old_key_pattern,
            old_value: old_value_pattern,
            new_key: new_key.to_string(),
            new_value: new_value.to_string(),
        })
    }

    /// Returns the `newKey -> newValue` write this rule produces for the
    /// given label, or `None` when the rule does not fire.
    fn fire(&self, key: &str, value: &str) -> Option<(String, String)> {
        let key_match = self.old_key.captures(key)?;
        let value_match = self.old_value.captures(value)?;
        // At most one of the two patterns carries a capturing group.
        let capture = key_match.get(1).or_else(|| value_match.get(1));
        match capture {
            Some(text) => Some((
                self.new_key.replacen('*', text.as_str(), 1),
                self.new_value.replacen('*', text.as_str(), 1),
            )),
            None => Some((self.new_key.clone(), self.new_value.clone())),
        }
    }
}

/// An ordered, immutable set of compiled relabel rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compiles raw rule strings into a rule set.
    pub fn parse<I, S>(rules: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for raw in rules {
            parsed.push(Rule::parse(raw.as_ref())?);
        }
        if parsed.is_empty() {
            return Err(ParseError::EmptyRuleSet);
        }
        debug!(rules = ?parsed, "Parsed relabel rules");
        Ok(Self { rules: parsed })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the rule set to a label set, returning the map of label
    /// writes that should exist.
    ///
    /// Labels are visited in key order and rules in declaration order; when
    /// several firings target the same output key, the last one wins.
    pub fn apply_to(&self, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut replacements = BTreeMap::new();
        for (key, value) in labels {
            for rule in &self.rules {
                if let Some((new_key, new_value)) = rule.fire(key, value) {
                    replacements.insert(new_key, new_value);
                }
            }
        }
        replacements
    }
}

/// Splits one side of a rule into its key and value parts. The value
/// defaults to the empty string; more than one `=` is malformed.
fn split_pair(side: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = side.split('=').collect();
    match parts.len() {
        1 => Some((parts[0], "")),
        2 => Some((parts[0], parts[1])),
        _ => None,
    }
}

/// Compiles one old-side pattern: anchored, literal fragments escaped, a
/// single `*` becoming the capturing group.
fn compile_pattern(side: &str) -> Result<Regex, regex::Error> {
    let pattern = match side.find('*') {
        Some(at) => format!(
            "^{}(.*){}$",
            regex::escape(&side[..at]),
            regex::escape(&side[at + 1..])
        ),
        None => format!("^{}$", regex::escape(side)),
    };
    Regex::new(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parse_simple() {
        let rules = RuleSet::parse(["abc=def:uvw=xyz"]).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules[0].old_key.as_str(), "^abc$");
        assert_eq!(rules.rules[0].old_value.as_str(), "^def$");
        assert_eq!(rules.rules[0].new_key, "uvw");
        assert_eq!(rules.rules[0].new_value, "xyz");
    }

    #[test]
    fn test_parse_key_wildcard() {
        let rules = RuleSet::parse(["abc*=def:uvw*=xyz"]).unwrap();
        assert_eq!(rules.rules[0].old_key.as_str(), "^abc(.*)$");
        assert_eq!(rules.rules[0].old_value.as_str(), "^def$");
        assert_eq!(rules.rules[0].new_key, "uvw*");
        assert_eq!(rules.rules[0].new_value, "xyz");
    }

    #[test]
    fn test_parse_value_wildcard() {
        let rules = RuleSet::parse(["abc=def*:uvw=xyz*"]).unwrap();
        assert_eq!(rules.rules[0].old_key.as_str(), "^abc$");
        assert_eq!(rules.rules[0].old_value.as_str(), "^def(.*)$");
        assert_eq!(rules.rules[0].new_key, "uvw");
        assert_eq!(rules.rules[0].new_value, "xyz*");
    }

    #[test]
    fn test_parse_old_key_new_value_wildcard() {
        let rules = RuleSet::parse(["abc*=def:uvw=xyz*"]).unwrap();
        assert_eq!(rules.rules[0].old_key.as_str(), "^abc(.*)$");
        assert_eq!(rules.rules[0].new_key, "uvw");
        assert_eq!(rules.rules[0].new_value, "xyz*");
    }

    #[test]
    fn test_parse_old_value_new_key_wildcard() {
        let rules = RuleSet::parse(["abc=def*:uvw*=xyz"]).unwrap();
        assert_eq!(rules.rules[0].old_value.as_str(), "^def(.*)$");
        assert_eq!(rules.rules[0].new_key, "uvw*");
        assert_eq!(rules.rules[0].new_value, "xyz");
    }

    #[test]
    fn test_parse_value_defaults_to_empty() {
        let rules = RuleSet::parse(["abc:uvw"]).unwrap();
        assert_eq!(rules.rules[0].old_value.as_str(), "^$");
        assert_eq!(
            rules.apply_to(&labels(&[("abc", "")])),
            labels(&[("uvw", "")])
        );
        assert!(rules.apply_to(&labels(&[("abc", "x")])).is_empty());
    }

    #[test]
    fn test_parse_empty_fails() {
        let err = RuleSet::parse(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, ParseError::EmptyRuleSet));
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn test_parse_multiple_colons_fails() {
        let err = RuleSet::parse(["abc=def:uvw=xyz:extra"]).unwrap_err();
        assert!(matches!(err, ParseError::MalformedRule { .. }));
        assert!(err.to_string().contains("old/label=value:new/label=newvalue"));
        assert!(err.to_string().contains("abc=def:uvw=xyz:extra"));
    }

    #[test]
    fn test_parse_multiple_equals_fails() {
        let err = RuleSet::parse(["abc=def=ghi:uvw=xyz"]).unwrap_err();
        assert!(matches!(err, ParseError::MalformedRule { .. }));
    }

    #[test]
    fn test_parse_wildcard_in_both_old_sides_fails() {
        let err = RuleSet::parse(["abc*=def*:uvw=xyz"]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidWildcardPlacement { .. }));
        assert!(err.to_string().contains("no more than a single"));
    }

    #[test]
    fn test_parse_two_wildcards_in_one_side_fails() {
        let err = RuleSet::parse(["a*b*=def:uvw=xyz"]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidWildcardPlacement { .. }));
    }

    #[test]
    fn test_parse_new_key_wildcard_without_old_fails() {
        let err = RuleSet::parse(["abc=def:uvw*=xyz"]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidWildcardPlacement { .. }));
        assert!(err
            .to_string()
            .contains("cannot appear in the new label without appearing in the old one"));
    }

    #[test]
    fn test_parse_new_value_wildcard_without_old_fails() {
        let err = RuleSet::parse(["abc=def:uvw=xyz*"]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidWildcardPlacement { .. }));
    }

    #[test]
    fn test_parse_self_matching_key_pattern_fails() {
        // Output keys abcd<x> are matched by ^abc(.*)$ again, so every
        // reconciliation pass would produce yet another key.
        let err = RuleSet::parse(["abc*=123:abcd*=123"]).unwrap_err();
        assert!(matches!(err, ParseError::RecursiveRule { .. }));
    }

    #[test]
    fn test_parse_self_matching_value_pattern_fails() {
        let err = RuleSet::parse(["abc=1*:abc=12*"]).unwrap_err();
        assert!(matches!(err, ParseError::RecursiveRule { .. }));
    }

    #[test]
    fn test_parse_identical_wildcard_patterns_allowed() {
        // Rewriting a key onto itself converges after one pass.
        assert!(RuleSet::parse(["abc*=def:abc*=xyz"]).is_ok());
    }

    #[test]
    fn test_parse_disjoint_wildcard_patterns_allowed() {
        assert!(RuleSet::parse(["abc*=def:uvw*=xyz"]).is_ok());
    }

    #[test]
    fn test_apply_literal_match() {
        let rules = RuleSet::parse(["abc=def:uvw=xyz"]).unwrap();
        assert_eq!(
            rules.apply_to(&labels(&[("abc", "def")])),
            labels(&[("uvw", "xyz")])
        );
        assert!(rules.apply_to(&labels(&[("abc", "other")])).is_empty());
    }

    #[test]
    fn test_apply_key_wildcard_round_trip() {
        let rules = RuleSet::parse(["node/*=true:zone/*=true"]).unwrap();
        assert_eq!(
            rules.apply_to(&labels(&[("node/east", "true")])),
            labels(&[("zone/east", "true")])
        );
    }

    #[test]
    fn test_apply_value_capture_into_key() {
        let rules = RuleSet::parse(["abc=*:def*=x"]).unwrap();
        assert_eq!(
            rules.apply_to(&labels(&[("abc", "123")])),
            labels(&[("def123", "x")])
        );
    }

    #[test]
    fn test_apply_capture_substitutes_both_templates() {
        let rules = RuleSet::parse(["abc*=def:new*=val*"]).unwrap();
        assert_eq!(
            rules.apply_to(&labels(&[("abcX", "def")])),
            labels(&[("newX", "valX")])
        );
    }

    #[test]
    fn test_apply_multiple_rules() {
        let rules = RuleSet::parse(["abc=*:def=*", "uvw=xyz:uvw=ABC"]).unwrap();
        assert_eq!(
            rules.apply_to(&labels(&[("abc", "123"), ("uvw", "xyz")])),
            labels(&[("def", "123"), ("uvw", "ABC")])
        );
    }

    #[test]
    fn test_apply_later_rule_wins_on_same_output_key() {
        let rules = RuleSet::parse(["abc=def:out=first", "abc=def:out=second"]).unwrap();
        assert_eq!(
            rules.apply_to(&labels(&[("abc", "def")])),
            labels(&[("out", "second")])
        );
    }

    #[test]
    fn test_apply_literals_are_not_pattern_syntax() {
        let rules = RuleSet::parse(["a.c=def:uvw=xyz"]).unwrap();
        assert!(rules.apply_to(&labels(&[("axc", "def")])).is_empty());
        assert_eq!(
            rules.apply_to(&labels(&[("a.c", "def")])),
            labels(&[("uvw", "xyz")])
        );
    }

    #[test]
    fn test_apply_unmatched_labels_contribute_nothing() {
        let rules = RuleSet::parse(["abc=def:uvw=xyz"]).unwrap();
        assert!(rules
            .apply_to(&labels(&[("other", "label"), ("second", "one")]))
            .is_empty());
    }
}
