//! Task analysis: complexity classification and domain tagging.
//!
//! [`analyze`] is pure and deterministic — the same text and context always
//! produce the same result. The complexity score combines action-verb
//! presence, conjunction count, explicit multiplicity markers (`and then`,
//! numbered lists), text length, and breadth of detected domains:
//!
//! ```text
//! score = 2·|action verbs| + |conjunctions| + |markers|
//!       + length bonus (≥12 words +1, ≥24 words +2)
//!       + (|domains| − 1)
//!
//! ≤ 2 → simple      3–5 → medium      ≥ 6 → complex
//! ```

use std::collections::BTreeMap;

use crate::taskweave::task::{Complexity, Domain};

/// Published action-verb set. Each distinct verb found contributes 2 points.
pub const ACTION_VERBS: [&str; 20] = [
    "build",
    "deploy",
    "integrate",
    "refactor",
    "migrate",
    "design",
    "implement",
    "configure",
    "provision",
    "test",
    "analyze",
    "optimize",
    "document",
    "create",
    "automate",
    "benchmark",
    "harden",
    "audit",
    "train",
    "debug",
];

const DEVELOPMENT_KEYWORDS: [&str; 16] = [
    "api", "code", "implement", "build", "backend", "frontend", "endpoint", "function", "library",
    "bug", "refactor", "app", "application", "rest", "service", "feature",
];

const DEVOPS_KEYWORDS: [&str; 13] = [
    "deploy", "deployment", "aws", "docker", "kubernetes", "ci", "cd", "infrastructure",
    "provision", "cloud", "terraform", "rollout", "cluster",
];

const DATA_KEYWORDS: [&str; 9] = [
    "data", "dataset", "etl", "sql", "database", "analytics", "warehouse", "schema", "query",
];

const RESEARCH_KEYWORDS: [&str; 7] = [
    "research", "investigate", "survey", "study", "compare", "evaluate", "literature",
];

const DESIGN_KEYWORDS: [&str; 7] = [
    "design", "ui", "ux", "wireframe", "mockup", "layout", "prototype",
];

const TESTING_KEYWORDS: [&str; 7] = [
    "test", "tests", "testing", "qa", "coverage", "regression", "verify",
];

const SECURITY_KEYWORDS: [&str; 7] = [
    "security", "vulnerability", "encrypt", "penetration", "exploit", "secure", "threat",
];

/// Result of analyzing a task string.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub complexity: Complexity,
    /// Domains in order of first appearance in the text.
    pub domains: Vec<Domain>,
    pub requires_decomposition: bool,
    /// The raw complexity score, useful for logging and tests.
    pub score: u32,
}

/// Classify a task string. The context mapping may carry a `domain` hint
/// that is prepended to the detected domains.
pub fn analyze(text: &str, context: &BTreeMap<String, String>) -> Analysis {
    let tokens = tokenize(text);
    let lower = text.to_lowercase();

    let verb_hits = ACTION_VERBS
        .iter()
        .filter(|v| tokens.iter().any(|t| t == *v))
        .count() as u32;

    let conjunctions = count_occurrences(&lower, " and ") + count_occurrences(&lower, " or ");
    let markers = count_occurrences(&lower, "and then") + numbered_items(text);

    let word_count = text.split_whitespace().count();
    let length_bonus = if word_count >= 24 {
        2
    } else if word_count >= 12 {
        1
    } else {
        0
    };

    let mut domains = detect_domains(&tokens);
    if let Some(hint) = context.get("domain").and_then(|d| Domain::parse(d)) {
        domains.retain(|d| *d != hint);
        domains.insert(0, hint);
    }
    if domains.is_empty() {
        domains.push(Domain::Other);
    }
    let domain_bonus = (domains.len() as u32).saturating_sub(1);

    let score = 2 * verb_hits + conjunctions + markers + length_bonus + domain_bonus;
    let complexity = match score {
        0..=2 => Complexity::Simple,
        3..=5 => Complexity::Medium,
        _ => Complexity::Complex,
    };

    Analysis {
        complexity,
        domains,
        requires_decomposition: complexity != Complexity::Simple,
        score,
    }
}

/// Lowercased word tokens with surrounding punctuation stripped.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn count_occurrences(haystack: &str, needle: &str) -> u32 {
    let mut count = 0;
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        count += 1;
        from += pos + needle.len();
    }
    count
}

/// Count lines that look like numbered list items (`1.` / `2)`).
fn numbered_items(text: &str) -> u32 {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return false;
            }
            matches!(trimmed[digits.len()..].chars().next(), Some('.') | Some(')'))
        })
        .count() as u32
}

/// Keyword classifier over the closed domain vocabulary, ordered by first
/// keyword position in the token stream.
fn detect_domains(tokens: &[String]) -> Vec<Domain> {
    let tables: [(Domain, &[&str]); 7] = [
        (Domain::Development, &DEVELOPMENT_KEYWORDS),
        (Domain::Devops, &DEVOPS_KEYWORDS),
        (Domain::Data, &DATA_KEYWORDS),
        (Domain::Research, &RESEARCH_KEYWORDS),
        (Domain::Design, &DESIGN_KEYWORDS),
        (Domain::Testing, &TESTING_KEYWORDS),
        (Domain::Security, &SECURITY_KEYWORDS),
    ];

    let mut hits: Vec<(usize, Domain)> = Vec::new();
    for (domain, keywords) in tables.iter() {
        let first = tokens
            .iter()
            .position(|t| keywords.iter().any(|k| k == t));
        if let Some(pos) = first {
            hits.push((pos, *domain));
        }
    }
    hits.sort_by_key(|(pos, _)| *pos);
    hits.into_iter().map(|(_, d)| d).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_context() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_trivial_task_is_simple() {
        let a = analyze("say hi", &no_context());
        assert_eq!(a.complexity, Complexity::Simple);
        assert!(!a.requires_decomposition);
        assert_eq!(a.domains, vec![Domain::Other]);
    }

    #[test]
    fn test_multi_domain_build_and_deploy_is_complex() {
        let a = analyze(
            "Build a REST API with authentication and deploy it to AWS",
            &no_context(),
        );
        assert_eq!(a.complexity, Complexity::Complex);
        assert_eq!(a.domains, vec![Domain::Development, Domain::Devops]);
    }

    #[test]
    fn test_sequence_markers_drive_complexity() {
        let a = analyze("A and then B and then C and then D and then E", &no_context());
        assert_eq!(a.complexity, Complexity::Complex);
    }

    #[test]
    fn test_single_verb_stays_simple() {
        let a = analyze("debug the flaky login", &no_context());
        assert_eq!(a.complexity, Complexity::Simple);
    }

    #[test]
    fn test_deterministic() {
        let text = "Refactor the parser and add more tests";
        let a = analyze(text, &no_context());
        let b = analyze(text, &no_context());
        assert_eq!(a.score, b.score);
        assert_eq!(a.complexity, b.complexity);
        assert_eq!(a.domains, b.domains);
    }

    #[test]
    fn test_domain_hint_from_context() {
        let mut ctx = BTreeMap::new();
        ctx.insert("domain".to_string(), "security".to_string());
        let a = analyze("review the release notes", &ctx);
        assert_eq!(a.domains[0], Domain::Security);
    }

    #[test]
    fn test_numbered_list_counts_as_markers() {
        let text = "Release checklist:\n1. tag the build\n2. push the image\n3. announce";
        let a = analyze(text, &no_context());
        assert!(a.score >= 3, "score was {}", a.score);
    }
}
