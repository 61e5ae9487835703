//! Free-text classification against positive/negative pattern sets.
//!
//! A [`PatternSet`] matches when any positive pattern matches and no negative
//! pattern does. Negatives exist because users hedge: "yes, but let's double
//! check first" contains an approval word and still is not an approval.
//!
//! A [`Classifier`] is an ordered list of labelled sets; the first set that
//! matches wins. All patterns are compiled case-insensitively from config.

use regex::{Regex, RegexBuilder};

use crate::config::PatternSetConfig;
use crate::error::{CoordError, Result};

#[derive(Debug, Clone)]
pub struct PatternSet {
    name: String,
    positive: Vec<Regex>,
    negative: Vec<Regex>,
}

impl PatternSet {
    pub fn compile(name: &str, config: &PatternSetConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            positive: compile_all(name, &config.positive)?,
            negative: compile_all(name, &config.negative)?,
        })
    }

    /// A set with positives only, used for plain pattern lists such as
    /// allowlists and test-command detection.
    pub fn from_patterns(name: &str, patterns: &[String]) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            positive: compile_all(name, patterns)?,
            negative: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.positive.is_empty()
    }

    pub fn is_vetoed(&self, text: &str) -> bool {
        self.negative.iter().any(|re| re.is_match(text))
    }

    pub fn matches(&self, text: &str) -> bool {
        !self.is_vetoed(text) && self.positive.iter().any(|re| re.is_match(text))
    }
}

fn compile_all(set: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| CoordError::InvalidPattern {
                    set: set.to_string(),
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

/// Ordered, labelled pattern sets. Earlier rules take priority.
#[derive(Debug, Clone)]
pub struct Classifier<L> {
    rules: Vec<(L, PatternSet)>,
}

impl<L: Copy> Default for Classifier<L> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<L: Copy> Classifier<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, label: L, set: PatternSet) -> Self {
        self.rules.push((label, set));
        self
    }

    /// Returns the label of the first set that matches.
    pub fn classify(&self, text: &str) -> Option<L> {
        self.rules
            .iter()
            .find(|(_, set)| set.matches(text))
            .map(|(label, _)| *label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn set(positive: &[&str], negative: &[&str]) -> PatternSetConfig {
        PatternSetConfig {
            positive: positive.iter().map(|s| s.to_string()).collect(),
            negative: negative.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_negative_vetoes_positive() {
        let config = KernelConfig::default();
        let approval =
            PatternSet::compile("plan_approved", &config.orchestration.plan_approved).unwrap();

        assert!(approval.matches("yes, proceed"));
        assert!(approval.matches("Approve the plan"));
        assert!(approval.matches("LGTM"));
        assert!(!approval.matches("yes, but let's double check first"));
        assert!(!approval.matches("should we proceed?"));
        assert!(!approval.matches("not yet, revise step 2"));
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let set = PatternSet::compile("test", &set(&[r"\bdeploy\b"], &[])).unwrap();
        assert!(set.matches("DEPLOY now"));
    }

    #[test]
    fn test_empty_set_never_matches() {
        let set = PatternSet::compile("empty", &PatternSetConfig::default()).unwrap();
        assert!(set.is_empty());
        assert!(!set.matches("anything"));
    }

    #[test]
    fn test_invalid_pattern_names_the_set() {
        let err = PatternSet::compile("broken", &set(&["(unclosed"], &[])).unwrap_err();
        match err {
            CoordError::InvalidPattern { set, pattern, .. } => {
                assert_eq!(set, "broken");
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum Label {
            Cancel,
            Go,
        }

        let classifier = Classifier::new()
            .rule(
                Label::Cancel,
                PatternSet::compile("cancel", &set(&[r"\bstop\b"], &[])).unwrap(),
            )
            .rule(
                Label::Go,
                PatternSet::compile("go", &set(&[r"\bgo\b"], &[])).unwrap(),
            );

        assert_eq!(classifier.classify("go go go"), Some(Label::Go));
        assert_eq!(classifier.classify("stop, don't go"), Some(Label::Cancel));
        assert_eq!(classifier.classify("hmm"), None);
    }

    #[test]
    fn test_vetoed_rule_falls_through_to_next() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum Label {
            Strong,
            Weak,
        }

        let classifier = Classifier::new()
            .rule(
                Label::Strong,
                PatternSet::compile("strong", &set(&[r"ship"], &[r"later"])).unwrap(),
            )
            .rule(
                Label::Weak,
                PatternSet::compile("weak", &set(&[r"ship"], &[])).unwrap(),
            );

        assert_eq!(classifier.classify("ship it"), Some(Label::Strong));
        assert_eq!(classifier.classify("ship it later"), Some(Label::Weak));
    }
}
