//! Table-driven change classification.
//!
//! Every proposed change to a protected value is classified as `Stricter`
//! (applied immediately), `Lenient` (applied after a mandatory delay) or
//! `Forbidden` (rejected unconditionally). The per-field direction table is
//! ordinary configuration, not code, so the ambiguous directions in the
//! original shell variants are reviewable in one place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Policy verdict for a single change, ordered by dominance:
/// `Forbidden > Lenient > Stricter`. A session's verdict is the maximum
/// over all its changes, so one lenient tweak hidden among stricter ones
/// still triggers the delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Stricter,
    Lenient,
    Forbidden,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Stricter => "stricter",
            Classification::Lenient => "lenient",
            Classification::Forbidden => "forbidden",
        };
        f.write_str(s)
    }
}

/// A field value extracted from a protected file under its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Number(i64),
    Text(String),
    Set(BTreeSet<String>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Set(set) => write!(f, "{{{} entries}}", set.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Lower,
    Higher,
}

/// Per-field classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// Numeric field: moving in `stricter` direction is Stricter, the
    /// opposite is Lenient unless it matches `forbidden`.
    Numeric {
        stricter: Direction,
        #[serde(default)]
        forbidden: Option<Direction>,
    },
    /// Set-valued field: additions are Stricter, removals Lenient.
    Set,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    #[serde(flatten)]
    pub rule: RuleKind,
}

/// One proposed change, produced by diffing a working copy against the
/// canonical content and consumed immediately by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub field: String,
    pub old_value: Option<FieldValue>,
    pub new_value: Option<FieldValue>,
    pub classification: Classification,
}

/// The classification table. Pure: no I/O, no clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    pub rules: Vec<FieldRule>,
}

impl PolicyTable {
    pub fn rule_for(&self, field: &str) -> Option<&RuleKind> {
        self.rules.iter().find(|r| r.field == field).map(|r| &r.rule)
    }

    /// Classify a single field change. Fields without a rule default to
    /// `Lenient`: an unreviewed change still gets the reconsideration delay
    /// but is never silently forbidden.
    pub fn classify(
        &self,
        field: &str,
        old: Option<&FieldValue>,
        new: Option<&FieldValue>,
    ) -> Classification {
        match self.rule_for(field) {
            Some(RuleKind::Numeric { stricter, forbidden }) => {
                classify_numeric(old, new, *stricter, *forbidden)
            }
            Some(RuleKind::Set) => classify_set(old, new),
            None => Classification::Lenient,
        }
    }

    /// Build classified `ChangeRequest`s for a diff and return them together
    /// with the session verdict (most permissive classification wins).
    pub fn classify_all(
        &self,
        diff: Vec<(String, Option<FieldValue>, Option<FieldValue>)>,
    ) -> (Vec<ChangeRequest>, Option<Classification>) {
        let mut requests = Vec::with_capacity(diff.len());
        let mut verdict: Option<Classification> = None;
        for (field, old, new) in diff {
            let classification = self.classify(&field, old.as_ref(), new.as_ref());
            verdict = Some(match verdict {
                Some(v) => v.max(classification),
                None => classification,
            });
            requests.push(ChangeRequest {
                field,
                old_value: old,
                new_value: new,
                classification,
            });
        }
        (requests, verdict)
    }
}

fn classify_numeric(
    old: Option<&FieldValue>,
    new: Option<&FieldValue>,
    stricter: Direction,
    forbidden: Option<Direction>,
) -> Classification {
    let (old_n, new_n) = match (old, new) {
        (Some(FieldValue::Number(a)), Some(FieldValue::Number(b))) => (*a, *b),
        // Field appeared, vanished, or stopped parsing as a number: not a
        // comparable move, so it gets the delay.
        _ => return Classification::Lenient,
    };
    if new_n == old_n {
        return Classification::Stricter;
    }
    let direction = if new_n > old_n {
        Direction::Higher
    } else {
        Direction::Lower
    };
    if forbidden == Some(direction) {
        Classification::Forbidden
    } else if direction == stricter {
        Classification::Stricter
    } else {
        Classification::Lenient
    }
}

fn classify_set(old: Option<&FieldValue>, new: Option<&FieldValue>) -> Classification {
    let empty = BTreeSet::new();
    let old_set = match old {
        Some(FieldValue::Set(s)) => s,
        None => &empty,
        _ => return Classification::Lenient,
    };
    let new_set = match new {
        Some(FieldValue::Set(s)) => s,
        None => &empty,
        _ => return Classification::Lenient,
    };
    let removed = old_set.difference(new_set).count();
    // Removals dominate: a mixed add+remove diff still takes the delay.
    if removed > 0 {
        Classification::Lenient
    } else {
        Classification::Stricter
    }
}
