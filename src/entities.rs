//! Heuristic entity extraction over decrypted chunk text.
//!
//! Pattern based, no model: reference numbers (`#42`), dates (`March 1`,
//! `2024-03-01`), email addresses and runs of capitalized words.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Reference,
    Date,
    Email,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub text: String,
    pub count: usize,
}

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|October|November|December|\
                      Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec";

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#\d+\b").expect("valid reference regex"))
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"\b(?:(?:{MONTHS})\.?\s+\d{{1,2}}(?:st|nd|rd|th)?(?:,?\s+\d{{4}})?|\d{{4}}-\d{{2}}-\d{{2}})\b"
        ))
        .expect("valid date regex")
    })
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid email regex")
    })
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("valid name regex")
    })
}

/// Capitalized words that are never names on their own.
fn non_name_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        let mut words: HashSet<&'static str> = MONTHS.split('|').collect();
        words.extend([
            "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
            "The", "This", "That", "These", "Those", "A", "An", "And", "But", "Or", "If",
            "It", "We", "I", "You", "He", "She", "They", "Our", "Your", "Please", "Hi",
            "Hello", "Dear", "Thanks", "Regards", "Invoice", "Payment", "Due", "Re", "Fwd",
        ]);
        words
    })
}

/// Drop leading and trailing non-name words from a capitalized run.
fn trim_name(candidate: &str) -> Option<String> {
    let stop = non_name_words();
    let words: Vec<&str> = candidate.split_whitespace().collect();
    let start = words.iter().position(|w| !stop.contains(w))?;
    let end = words.iter().rposition(|w| !stop.contains(w))?;
    Some(words[start..=end].join(" "))
}

/// Extract entities from `texts`, merged and counted across all of them.
/// Sorted by count (descending), then kind, then text.
pub fn extract_entities<S: AsRef<str>>(texts: &[S]) -> Vec<Entity> {
    let mut counts: BTreeMap<(EntityKind, String), usize> = BTreeMap::new();

    for text in texts {
        let text = text.as_ref();
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        for (kind, re) in [
            (EntityKind::Email, email_regex()),
            (EntityKind::Date, date_regex()),
            (EntityKind::Reference, reference_regex()),
        ] {
            for m in re.find_iter(text) {
                claimed.push((m.start(), m.end()));
                *counts.entry((kind, m.as_str().to_string())).or_default() += 1;
            }
        }

        for m in name_regex().find_iter(text) {
            let overlaps = claimed.iter().any(|&(s, e)| m.start() < e && s < m.end());
            if overlaps {
                continue;
            }
            if let Some(name) = trim_name(m.as_str()) {
                *counts.entry((EntityKind::Name, name)).or_default() += 1;
            }
        }
    }

    let mut entities: Vec<Entity> = counts
        .into_iter()
        .map(|((kind, text), count)| Entity { kind, text, count })
        .collect();
    entities.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.kind.cmp(&b.kind))
            .then_with(|| a.text.cmp(&b.text))
    });
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(entities: &[Entity], kind: EntityKind) -> Vec<&str> {
        entities
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text.as_str())
            .collect()
    }

    #[test]
    fn invoice_sentence() {
        let entities = extract_entities(&["invoice #42 due March 1"]);
        assert_eq!(find(&entities, EntityKind::Reference), vec!["#42"]);
        assert_eq!(find(&entities, EntityKind::Date), vec!["March 1"]);
        assert!(find(&entities, EntityKind::Name).is_empty());
    }

    #[test]
    fn names_and_emails() {
        let entities = extract_entities(&[
            "Please forward to Maria Lopez at maria.lopez@example.com.",
            "The contract with Maria Lopez renews 2025-01-31.",
        ]);
        assert_eq!(find(&entities, EntityKind::Email), vec!["maria.lopez@example.com"]);
        assert_eq!(find(&entities, EntityKind::Date), vec!["2025-01-31"]);
        let names = find(&entities, EntityKind::Name);
        assert_eq!(names, vec!["Maria Lopez"]);
        assert_eq!(entities[0].text, "Maria Lopez");
        assert_eq!(entities[0].count, 2);
    }

    #[test]
    fn stopwords_are_trimmed_from_names() {
        assert_eq!(trim_name("Dear Acme Corp").as_deref(), Some("Acme Corp"));
        assert_eq!(trim_name("The"), None);
    }

    #[test]
    fn empty_input() {
        assert!(extract_entities::<&str>(&[]).is_empty());
    }
}
