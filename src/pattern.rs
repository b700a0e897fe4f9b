//! Pattern matching: pure line-level decision logic.
//!
//! A `PatternRule` is a compiled predicate plus modifiers (case-insensitivity,
//! invert-match, exclude list, max-match cap). Rules are grouped into a
//! `RuleSet` per channel, which also implements dual success/error mode with
//! a configurable tie-break. All patterns are compiled once at startup;
//! compilation failure is a configuration error surfaced before launch.

use regex::RegexBuilder;
use serde::Deserialize;

/// Result of evaluating a single line against a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Line does not qualify as a match.
    None,
    /// Line qualifies as a match.
    Match,
    /// Line matched an exclude expression; never a match, regardless of
    /// the primary pattern.
    Excluded,
}

/// Which rule of a dual-pattern set produced the hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleHit {
    Success,
    Error,
}

/// Tie-break policy when a line matches both the success and error rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Success suppresses error for that line (documented default).
    #[default]
    Success,
    /// Error wins over success for that line.
    Error,
}

/// Matching backend, selected once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Full regular expressions via the `regex` crate.
    #[default]
    Regex,
    /// Plain substring search.
    Literal,
}

/// Errors produced while compiling patterns.
#[derive(Debug)]
pub enum PatternError {
    /// The pattern expression failed to compile.
    Invalid { pattern: String, message: String },
    /// No primary pattern was configured but one is required.
    Missing,
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternError::Invalid { pattern, message } => {
                write!(f, "invalid pattern {pattern:?}: {message}")
            }
            PatternError::Missing => write!(f, "no pattern configured"),
        }
    }
}

impl std::error::Error for PatternError {}

/// A compiled line predicate.
///
/// One implementation per backend; selection happens at startup, never
/// per line.
pub trait Matcher: Send + Sync {
    fn is_match(&self, line: &str) -> bool;
}

struct RegexMatcher(regex::Regex);

impl Matcher for RegexMatcher {
    fn is_match(&self, line: &str) -> bool {
        self.0.is_match(line)
    }
}

struct LiteralMatcher {
    needle: String,
    case_insensitive: bool,
}

impl Matcher for LiteralMatcher {
    fn is_match(&self, line: &str) -> bool {
        if self.case_insensitive {
            line.to_lowercase().contains(&self.needle)
        } else {
            line.contains(&self.needle)
        }
    }
}

impl BackendKind {
    /// Compile a pattern expression for this backend.
    pub fn compile(
        self,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<Box<dyn Matcher>, PatternError> {
        match self {
            BackendKind::Regex => {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|e| PatternError::Invalid {
                        pattern: pattern.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(Box::new(RegexMatcher(re)))
            }
            BackendKind::Literal => Ok(Box::new(LiteralMatcher {
                needle: if case_insensitive {
                    pattern.to_lowercase()
                } else {
                    pattern.to_string()
                },
                case_insensitive,
            })),
        }
    }
}

/// Declarative rule settings, before compilation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub pattern: Option<String>,
    pub case_insensitive: bool,
    pub invert: bool,
    pub exclude: Vec<String>,
    pub max_matches: Option<u32>,
}

/// A compiled matching predicate plus its modifiers.
pub struct PatternRule {
    matcher: Box<dyn Matcher>,
    excludes: Vec<Box<dyn Matcher>>,
    invert: bool,
    max_matches: Option<u32>,
    matches_seen: u32,
}

impl PatternRule {
    /// Compile a rule. Fails fast on any invalid expression.
    pub fn compile(cfg: &RuleConfig, backend: BackendKind) -> Result<Self, PatternError> {
        let pattern = cfg.pattern.as_deref().ok_or(PatternError::Missing)?;
        let matcher = backend.compile(pattern, cfg.case_insensitive)?;
        let excludes = cfg
            .exclude
            .iter()
            .map(|p| backend.compile(p, cfg.case_insensitive))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            matcher,
            excludes,
            invert: cfg.invert,
            max_matches: cfg.max_matches,
            matches_seen: 0,
        })
    }

    /// Pure evaluation: exclusion first, then the (possibly inverted)
    /// primary pattern. Does not consume the max-match budget.
    pub fn evaluate(&self, line: &str) -> Verdict {
        if self.excludes.iter().any(|m| m.is_match(line)) {
            return Verdict::Excluded;
        }
        let hit = self.matcher.is_match(line) != self.invert;
        if hit {
            Verdict::Match
        } else {
            Verdict::None
        }
    }

    /// Stateful evaluation: like `evaluate`, but once `max_matches` matches
    /// have been observed the rule stops signaling new matches for the
    /// remainder of the run.
    pub fn observe(&mut self, line: &str) -> Verdict {
        match self.evaluate(line) {
            Verdict::Match => {
                if let Some(cap) = self.max_matches {
                    if self.matches_seen >= cap {
                        return Verdict::None;
                    }
                }
                self.matches_seen += 1;
                Verdict::Match
            }
            other => other,
        }
    }

    #[cfg(test)]
    fn matches_seen(&self) -> u32 {
        self.matches_seen
    }
}

/// The rule(s) evaluated against every line of one channel.
///
/// Single-pattern mode has only a `success` rule. Dual-pattern mode adds an
/// independent `error` rule; both are evaluated against every line, with
/// `tie_break` deciding a same-line collision.
pub struct RuleSet {
    success: PatternRule,
    error: Option<PatternRule>,
    tie_break: TieBreak,
}

impl RuleSet {
    pub fn new(success: PatternRule, error: Option<PatternRule>, tie_break: TieBreak) -> Self {
        Self {
            success,
            error,
            tie_break,
        }
    }

    /// Evaluate one line against the full set. Returns the hit to report,
    /// if any.
    pub fn observe(&mut self, line: &str) -> Option<RuleHit> {
        let success = self.success.observe(line) == Verdict::Match;
        let error = self
            .error
            .as_mut()
            .map(|r| r.observe(line) == Verdict::Match)
            .unwrap_or(false);
        match (success, error) {
            (true, true) => Some(match self.tie_break {
                TieBreak::Success => RuleHit::Success,
                TieBreak::Error => RuleHit::Error,
            }),
            (true, false) => Some(RuleHit::Success),
            (false, true) => Some(RuleHit::Error),
            (false, false) => None,
        }
    }
}

/// One compiled `RuleSet` per monitored channel. Channels may carry
/// distinct rules; a channel's rule state is only ever touched by the
/// coordinator, in that channel's delivery order.
pub struct RuleBook {
    sets: Vec<(crate::channel::ChannelId, RuleSet)>,
}

impl RuleBook {
    pub fn new(sets: Vec<(crate::channel::ChannelId, RuleSet)>) -> Self {
        Self { sets }
    }

    pub fn push(&mut self, channel: crate::channel::ChannelId, set: RuleSet) {
        self.sets.push((channel, set));
    }

    /// Evaluate a line against its channel's rules. Lines from channels
    /// without a rule set never match.
    pub fn observe(&mut self, channel: crate::channel::ChannelId, line: &str) -> Option<RuleHit> {
        let (_, set) = self.sets.iter_mut().find(|(id, _)| *id == channel)?;
        set.observe(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;

    fn rule(pattern: &str) -> PatternRule {
        PatternRule::compile(
            &RuleConfig {
                pattern: Some(pattern.to_string()),
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap()
    }

    #[test]
    fn test_basic_match() {
        let r = rule("ERROR");
        assert_eq!(r.evaluate("ERROR: bad"), Verdict::Match);
        assert_eq!(r.evaluate("all good"), Verdict::None);
    }

    #[test]
    fn test_invalid_pattern_fails_fast() {
        let Err(err) = PatternRule::compile(
            &RuleConfig {
                pattern: Some("([unclosed".to_string()),
                ..Default::default()
            },
            BackendKind::Regex,
        ) else {
            panic!("expected compile failure")
        };
        assert!(matches!(err, PatternError::Invalid { .. }));
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_missing_pattern() {
        let Err(err) = PatternRule::compile(&RuleConfig::default(), BackendKind::Regex) else {
            panic!("expected compile failure")
        };
        assert!(matches!(err, PatternError::Missing));
    }

    #[test]
    fn test_invalid_exclude_fails_fast() {
        let Err(err) = PatternRule::compile(
            &RuleConfig {
                pattern: Some("ok".to_string()),
                exclude: vec!["(bad".to_string()],
                ..Default::default()
            },
            BackendKind::Regex,
        ) else {
            panic!("expected compile failure")
        };
        assert!(matches!(err, PatternError::Invalid { .. }));
    }

    #[test]
    fn test_case_insensitive_regex() {
        let r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("error".to_string()),
                case_insensitive: true,
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap();
        assert_eq!(r.evaluate("ERROR: bad"), Verdict::Match);
        assert_eq!(r.evaluate("Error in module"), Verdict::Match);
    }

    #[test]
    fn test_literal_backend() {
        let r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("a+b".to_string()),
                ..Default::default()
            },
            BackendKind::Literal,
        )
        .unwrap();
        // Literal mode: "+" is not a quantifier
        assert_eq!(r.evaluate("a+b=c"), Verdict::Match);
        assert_eq!(r.evaluate("aab"), Verdict::None);
    }

    #[test]
    fn test_literal_backend_case_insensitive() {
        let r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("Warning".to_string()),
                case_insensitive: true,
                ..Default::default()
            },
            BackendKind::Literal,
        )
        .unwrap();
        assert_eq!(r.evaluate("WARNING: disk full"), Verdict::Match);
    }

    #[test]
    fn test_exclude_beats_primary_match() {
        let r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("ERROR".to_string()),
                exclude: vec!["ERROR: ignorable".to_string()],
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap();
        assert_eq!(r.evaluate("ERROR: fatal"), Verdict::Match);
        assert_eq!(r.evaluate("ERROR: ignorable noise"), Verdict::Excluded);
    }

    #[test]
    fn test_exclude_applies_even_with_invert() {
        let r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("READY".to_string()),
                invert: true,
                exclude: vec!["^#".to_string()],
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap();
        // Comment lines are excluded even though they also lack READY
        assert_eq!(r.evaluate("# comment"), Verdict::Excluded);
        assert_eq!(r.evaluate("still starting"), Verdict::Match);
        assert_eq!(r.evaluate("READY"), Verdict::None);
    }

    #[test]
    fn test_invert_match_reports_absence() {
        let r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("READY".to_string()),
                invert: true,
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap();
        assert_eq!(r.evaluate("server READY on :8080"), Verdict::None);
        assert_eq!(r.evaluate("booting"), Verdict::Match);
    }

    #[test]
    fn test_max_matches_caps_signaling() {
        let mut r = PatternRule::compile(
            &RuleConfig {
                pattern: Some("WARN".to_string()),
                max_matches: Some(2),
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap();
        assert_eq!(r.observe("WARN 1"), Verdict::Match);
        assert_eq!(r.observe("WARN 2"), Verdict::Match);
        // Budget exhausted: no longer signals
        assert_eq!(r.observe("WARN 3"), Verdict::None);
        assert_eq!(r.matches_seen(), 2);
    }

    #[test]
    fn test_max_matches_none_is_unlimited() {
        let mut r = rule("x");
        for i in 0..100 {
            assert_eq!(r.observe("x"), Verdict::Match, "iteration {i}");
        }
    }

    #[test]
    fn test_ruleset_single_mode() {
        let mut set = RuleSet::new(rule("ERROR"), None, TieBreak::Success);
        assert_eq!(set.observe("fine"), None);
        assert_eq!(set.observe("ERROR: bad"), Some(RuleHit::Success));
    }

    #[test]
    fn test_dual_mode_independent_rules() {
        let mut set = RuleSet::new(rule("PASSED"), Some(rule("FAILED")), TieBreak::Success);
        assert_eq!(set.observe("running"), None);
        assert_eq!(set.observe("test FAILED"), Some(RuleHit::Error));
        assert_eq!(set.observe("test PASSED"), Some(RuleHit::Success));
    }

    #[test]
    fn test_dual_mode_tie_break_success_wins() {
        let mut set = RuleSet::new(rule("DONE"), Some(rule("error")), TieBreak::Success);
        // Line matches both rules; success suppresses error
        assert_eq!(set.observe("DONE with 0 error(s)"), Some(RuleHit::Success));
    }

    #[test]
    fn test_dual_mode_tie_break_error_configured() {
        let mut set = RuleSet::new(rule("DONE"), Some(rule("error")), TieBreak::Error);
        assert_eq!(set.observe("DONE with 1 error"), Some(RuleHit::Error));
    }

    #[test]
    fn test_rulebook_routes_by_channel() {
        let mut book = RuleBook::new(vec![
            (ChannelId::STDOUT, RuleSet::new(rule("OUT"), None, TieBreak::Success)),
            (ChannelId::STDERR, RuleSet::new(rule("ERR"), None, TieBreak::Success)),
        ]);
        assert_eq!(book.observe(ChannelId::STDOUT, "ERR here"), None);
        assert_eq!(
            book.observe(ChannelId::STDERR, "ERR here"),
            Some(RuleHit::Success)
        );
        // Unknown channel never matches
        assert_eq!(book.observe(ChannelId(7), "OUT"), None);
    }

    #[test]
    fn test_dual_mode_error_rule_exhausts_independently() {
        let error = PatternRule::compile(
            &RuleConfig {
                pattern: Some("flaky".to_string()),
                max_matches: Some(1),
                ..Default::default()
            },
            BackendKind::Regex,
        )
        .unwrap();
        let mut set = RuleSet::new(rule("PASSED"), Some(error), TieBreak::Success);
        assert_eq!(set.observe("flaky warning"), Some(RuleHit::Error));
        // Error rule capped; success rule unaffected
        assert_eq!(set.observe("flaky warning"), None);
        assert_eq!(set.observe("PASSED"), Some(RuleHit::Success));
    }
}
