//! File schemas for protected files.
//!
//! A schema turns raw file content into a map of named fields so the policy
//! table can classify a diff. Two schemas exist: `KeyValue` for the
//! shutdown-schedule config (KEY=VALUE lines) and `Hosts` for the hosts
//! blocklist (the set of domains pointed at a sink address).

use crate::policy::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    KeyValue,
    Hosts,
}

/// Hosts entries for these names are baseline system plumbing, not policy.
const HOSTS_BASELINE_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
];

const SINK_ADDRESSES: &[&str] = &["0.0.0.0", "127.0.0.1", "::1", "::"];

/// Field name the hosts schema exposes for the blocklist.
pub const BLOCKED_DOMAINS_FIELD: &str = "blocked_domains";
/// Field name for non-blocklist hosts lines (mappings to real addresses).
pub const STATIC_ENTRIES_FIELD: &str = "static_entries";

pub fn parse_fields(format: FileFormat, content: &str) -> BTreeMap<String, FieldValue> {
    match format {
        FileFormat::KeyValue => parse_key_value(content),
        FileFormat::Hosts => parse_hosts(content),
    }
}

fn parse_key_value(content: &str) -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();
        let parsed = match value.parse::<i64>() {
            Ok(n) => FieldValue::Number(n),
            Err(_) => FieldValue::Text(value.to_string()),
        };
        fields.insert(key, parsed);
    }
    fields
}

fn parse_hosts(content: &str) -> BTreeMap<String, FieldValue> {
    let mut blocked = BTreeSet::new();
    let mut static_entries = BTreeSet::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(addr) = tokens.next() else { continue };
        let is_sink = SINK_ADDRESSES.contains(&addr);
        for name in tokens {
            if HOSTS_BASELINE_NAMES.contains(&name) {
                continue;
            }
            if is_sink {
                blocked.insert(name.to_string());
            } else {
                static_entries.insert(format!("{addr} {name}"));
            }
        }
    }
    let mut fields = BTreeMap::new();
    fields.insert(BLOCKED_DOMAINS_FIELD.to_string(), FieldValue::Set(blocked));
    fields.insert(
        STATIC_ENTRIES_FIELD.to_string(),
        FieldValue::Set(static_entries),
    );
    fields
}

/// Diff two field maps into `(field, old, new)` triples for the classifier.
/// Unchanged fields are omitted.
pub fn diff_fields(
    old: &BTreeMap<String, FieldValue>,
    new: &BTreeMap<String, FieldValue>,
) -> Vec<(String, Option<FieldValue>, Option<FieldValue>)> {
    let mut keys: BTreeSet<&String> = old.keys().collect();
    keys.extend(new.keys());

    let mut changes = Vec::new();
    for key in keys {
        let old_v = old.get(key);
        let new_v = new.get(key);
        if old_v != new_v {
            changes.push((key.clone(), old_v.cloned(), new_v.cloned()));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_parses_numbers_and_text() {
        let fields = parse_fields(
            FileFormat::KeyValue,
            "# comment\nSHUTDOWN_HOUR=22\nMODE = strict\n\nbroken line\n",
        );
        assert_eq!(fields.get("SHUTDOWN_HOUR"), Some(&FieldValue::Number(22)));
        assert_eq!(
            fields.get("MODE"),
            Some(&FieldValue::Text("strict".into()))
        );
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn hosts_splits_blocklist_from_static_entries() {
        let content = "\
127.0.0.1 localhost
0.0.0.0 ads.example.com tracker.example.net
127.0.0.1 junk.example.org # comment
192.168.1.10 nas.lan
";
        let fields = parse_fields(FileFormat::Hosts, content);
        let FieldValue::Set(blocked) = &fields[BLOCKED_DOMAINS_FIELD] else {
            panic!("blocked_domains should be a set");
        };
        assert!(blocked.contains("ads.example.com"));
        assert!(blocked.contains("tracker.example.net"));
        assert!(blocked.contains("junk.example.org"));
        assert!(!blocked.contains("localhost"));

        let FieldValue::Set(static_entries) = &fields[STATIC_ENTRIES_FIELD] else {
            panic!("static_entries should be a set");
        };
        assert!(static_entries.contains("192.168.1.10 nas.lan"));
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let old = parse_fields(FileFormat::KeyValue, "A=1\nB=2\n");
        let new = parse_fields(FileFormat::KeyValue, "A=0\nB=2\nC=9\n");
        let diff = diff_fields(&old, &new);
        assert_eq!(diff.len(), 2);
        let a = diff.iter().find(|(f, _, _)| f == "A").unwrap();
        assert_eq!(a.1, Some(FieldValue::Number(1)));
        assert_eq!(a.2, Some(FieldValue::Number(0)));
        let c = diff.iter().find(|(f, _, _)| f == "C").unwrap();
        assert_eq!(c.1, None);
        assert_eq!(c.2, Some(FieldValue::Number(9)));
    }

    #[test]
    fn identical_content_diffs_empty() {
        let old = parse_fields(FileFormat::Hosts, "0.0.0.0 a.com\n");
        let new = parse_fields(FileFormat::Hosts, "0.0.0.0 a.com # same\n");
        assert!(diff_fields(&old, &new).is_empty());
    }
}
