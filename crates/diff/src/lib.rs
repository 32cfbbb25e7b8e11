//! kwatch diff: structural, line-oriented diffs between two versions of an object.
//!
//! Both sides are serialized to canonical YAML (every mapping key-sorted) and
//! compared line by line. Identical inputs yield no lines at all.

#![forbid(unsafe_code)]

use std::fmt;

use kwatch_core::{ResourceRecord, VolatilityMask};
use serde::Serialize;
use serde_json::Value as Json;
use serde_yaml::{Mapping, Value as Yaml};
use similar::{ChangeTag, TextDiff};
use thiserror::Error;

pub mod external;

/// Context lines kept around each change, as in `git diff`.
pub const CONTEXT_LINES: usize = 3;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("serializing object for diff")]
    Serialization(#[source] serde_json::Error),
    #[error("rendering canonical yaml")]
    Yaml(#[source] serde_yaml::Error),
    #[error("writing diff scratch file")]
    Scratch(#[source] std::io::Error),
    #[error("running diff tool {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("diff tool {program} exited with {status}: {stderr}")]
    ToolFailed { program: String, status: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKind {
    Context,
    Added,
    Removed,
}

impl LineKind {
    pub fn prefix(self) -> char {
        match self {
            LineKind::Context => ' ',
            LineKind::Added => '+',
            LineKind::Removed => '-',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: LineKind,
    pub text: String,
}

impl DiffLine {
    pub fn is_change(&self) -> bool {
        self.kind != LineKind::Context
    }
}

impl fmt::Display for DiffLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.text)
    }
}

fn sorted(v: &Json) -> Yaml {
    match v {
        Json::Null => Yaml::Null,
        Json::Bool(b) => Yaml::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Yaml::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                Yaml::Number(u.into())
            } else {
                Yaml::Number(n.as_f64().unwrap_or_default().into())
            }
        }
        Json::String(s) => Yaml::String(s.clone()),
        Json::Array(items) => Yaml::Sequence(items.iter().map(sorted).collect()),
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            let mut out = Mapping::with_capacity(keys.len());
            for k in keys {
                out.insert(Yaml::String(k.clone()), sorted(&map[k]));
            }
            Yaml::Mapping(out)
        }
    }
}

/// Serialize any value to YAML with every mapping key-sorted.
pub fn canonical_yaml<T: Serialize + ?Sized>(value: &T) -> Result<String, DiffError> {
    let json = serde_json::to_value(value).map_err(DiffError::Serialization)?;
    serde_yaml::to_string(&sorted(&json)).map_err(DiffError::Yaml)
}

/// Line diff between two texts with [`CONTEXT_LINES`] of context per hunk.
pub fn diff_text(old: &str, new: &str) -> Vec<DiffLine> {
    if old == new {
        return Vec::new();
    }
    let diff = TextDiff::from_lines(old, new);
    let mut out = Vec::new();
    for group in diff.grouped_ops(CONTEXT_LINES) {
        for op in &group {
            for change in diff.iter_changes(op) {
                let kind = match change.tag() {
                    ChangeTag::Equal => LineKind::Context,
                    ChangeTag::Delete => LineKind::Removed,
                    ChangeTag::Insert => LineKind::Added,
                };
                let text = change.value().trim_end_matches(['\n', '\r']).to_string();
                out.push(DiffLine { kind, text });
            }
        }
    }
    out
}

/// Diff two serializable values through their canonical YAML.
pub fn diff_values<T: Serialize + ?Sized>(old: &T, new: &T) -> Result<Vec<DiffLine>, DiffError> {
    let a = canonical_yaml(old)?;
    let b = canonical_yaml(new)?;
    Ok(diff_text(&a, &b))
}

/// Diff the full documents of two records.
pub fn diff(old: &ResourceRecord, new: &ResourceRecord) -> Result<Vec<DiffLine>, DiffError> {
    diff_values(&old.document(), &new.document())
}

/// Diff two records after removing `mask` from both, keeping the revision line.
pub fn diff_masked(
    old: &ResourceRecord,
    new: &ResourceRecord,
    mask: &VolatilityMask,
) -> Result<Vec<DiffLine>, DiffError> {
    let mut a = old.document();
    let mut b = new.document();
    mask.apply(&mut a);
    mask.apply(&mut b);
    diff_values(&a, &b)
}

/// Render lines with their `+`/`-`/` ` prefixes, one per line.
pub fn render(lines: &[DiffLine]) -> String {
    let mut s = String::new();
    for l in lines {
        s.push_str(&l.to_string());
        s.push('\n');
    }
    s
}
