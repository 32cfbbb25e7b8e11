//! Field paths and per-kind volatility masks.
//!
//! A path is dotted (`status.replicas`); keys that contain dots are written in
//! brackets with quotes: `metadata.annotations["deployment.kubernetes.io/revision"]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldPathError {
    #[error("empty field path")]
    Empty,
    #[error("empty segment at byte {0} in field path")]
    EmptySegment(usize),
    #[error("unterminated bracket segment in field path {0:?}")]
    Unterminated(String),
    #[error("unexpected character {found:?} at byte {at} in field path")]
    Unexpected { found: char, at: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: SmallVec<[String; 4]>,
}

impl FieldPath {
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }

    /// Remove the addressed field from `doc`. Returns whether something was removed.
    pub fn remove_from(&self, doc: &mut Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else { return false };
        let mut cur = doc;
        for seg in parents {
            match cur.get_mut(seg.as_str()) {
                Some(next) => cur = next,
                None => return false,
            }
        }
        cur.as_object_mut().map(|m| m.remove(last.as_str()).is_some()).unwrap_or(false)
    }

    pub fn parse(s: &str) -> Result<Self, FieldPathError> {
        if s.trim().is_empty() {
            return Err(FieldPathError::Empty);
        }
        let bytes = s.as_bytes();
        let mut segments = SmallVec::new();
        let mut i = 0;
        let mut expect_segment = true;
        while i < bytes.len() {
            match bytes[i] {
                b'[' => {
                    let quote = match bytes.get(i + 1) {
                        Some(q @ (b'"' | b'\'')) => *q,
                        _ => return Err(FieldPathError::Unterminated(s.to_string())),
                    };
                    let start = i + 2;
                    let end = s[start..]
                        .find(quote as char)
                        .map(|off| start + off)
                        .ok_or_else(|| FieldPathError::Unterminated(s.to_string()))?;
                    if bytes.get(end + 1) != Some(&b']') {
                        return Err(FieldPathError::Unterminated(s.to_string()));
                    }
                    if end == start {
                        return Err(FieldPathError::EmptySegment(i));
                    }
                    segments.push(s[start..end].to_string());
                    i = end + 2;
                    expect_segment = false;
                }
                b'.' => {
                    if expect_segment {
                        return Err(FieldPathError::EmptySegment(i));
                    }
                    i += 1;
                    expect_segment = true;
                }
                _ => {
                    if !expect_segment {
                        let found = s[i..].chars().next().unwrap_or('?');
                        return Err(FieldPathError::Unexpected { found, at: i });
                    }
                    let end = s[i..].find(['.', '[']).map(|off| i + off).unwrap_or(s.len());
                    segments.push(s[i..end].to_string());
                    i = end;
                    expect_segment = false;
                }
            }
        }
        if expect_segment {
            return Err(FieldPathError::EmptySegment(s.len()));
        }
        Ok(Self { segments })
    }
}

impl FromStr for FieldPath {
    type Err = FieldPathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = FieldPathError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&s)
    }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> Self {
        p.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, seg) in self.segments.iter().enumerate() {
            if seg.contains('.') || seg.contains('[') {
                write!(f, "[\"{}\"]", seg)?;
            } else {
                if idx > 0 {
                    f.write_str(".")?;
                }
                f.write_str(seg)?;
            }
        }
        Ok(())
    }
}

/// Set of field paths ignored when deciding whether an update is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolatilityMask {
    paths: Vec<FieldPath>,
}

impl VolatilityMask {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mask covering the whole `status` subsection.
    pub fn status_only() -> Self {
        Self { paths: vec![FieldPath { segments: SmallVec::from_iter(["status".to_string()]) }] }
    }

    pub fn from_paths<I, S>(paths: I) -> Result<Self, FieldPathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mask = Self::empty();
        for p in paths {
            mask.insert(FieldPath::parse(p.as_ref())?);
        }
        Ok(mask)
    }

    pub fn insert(&mut self, path: FieldPath) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn paths(&self) -> &[FieldPath] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Strip every masked path from `doc`; absent paths are skipped.
    pub fn apply(&self, doc: &mut Value) {
        for p in &self.paths {
            p.remove_from(doc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_bracketed_segments() {
        let p = FieldPath::parse(r#"metadata.annotations["deployment.kubernetes.io/revision"]"#).unwrap();
        let segs: Vec<_> = p.segments().collect();
        assert_eq!(segs, ["metadata", "annotations", "deployment.kubernetes.io/revision"]);
        assert_eq!(FieldPath::parse(&p.to_string()).unwrap(), p);

        let q = FieldPath::parse("status.replicas").unwrap();
        assert_eq!(q.to_string(), "status.replicas");
    }

    #[test]
    fn rejects_bad_paths() {
        assert_eq!(FieldPath::parse("").unwrap_err(), FieldPathError::Empty);
        assert!(matches!(FieldPath::parse("a..b"), Err(FieldPathError::EmptySegment(_))));
        assert!(matches!(FieldPath::parse("a."), Err(FieldPathError::EmptySegment(_))));
        assert!(matches!(FieldPath::parse(r#"a["b"#), Err(FieldPathError::Unterminated(_))));
        assert!(matches!(FieldPath::parse(r#"a["b"]c"#), Err(FieldPathError::Unexpected { .. })));
    }

    #[test]
    fn mask_removes_present_paths_only() {
        let mut doc = json!({
            "metadata": { "annotations": { "deployment.kubernetes.io/revision": "2", "keep": "x" } },
            "spec": { "replicas": 3 },
            "status": { "replicas": 1 }
        });
        let mask = VolatilityMask::from_paths([
            "status",
            r#"metadata.annotations["deployment.kubernetes.io/revision"]"#,
            "spec.paused",
        ])
        .unwrap();
        mask.apply(&mut doc);
        assert_eq!(
            doc,
            json!({ "metadata": { "annotations": { "keep": "x" } }, "spec": { "replicas": 3 } })
        );
    }

    #[test]
    fn mask_deserializes_from_strings() {
        let mask: VolatilityMask = serde_json::from_value(json!(["status", "spec.replicas"])).unwrap();
        assert_eq!(mask.paths().len(), 2);
        assert!(serde_json::from_value::<VolatilityMask>(json!(["a..b"])).is_err());
    }
}
