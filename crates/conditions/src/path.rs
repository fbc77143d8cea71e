//! Typed field paths: `status.conditions[0].type`, `subsets[*].addresses`,
//! `metadata.annotations["deployment.kubernetes.io/revision"]`.
//!
//! Paths are parsed once when a catalog is built; a typo is a load-time error,
//! never a silently unmet rule.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;

use crate::CatalogError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Field(String),
    Index(usize),
    /// Every element of a list.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: SmallVec<[Segment; 6]>,
}

fn is_key_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

impl FieldPath {
    pub fn parse(input: &str) -> Result<Self, CatalogError> {
        let bad = |reason: &str| CatalogError::BadPath { path: input.to_string(), reason: reason.to_string() };
        let s = input.strip_prefix('.').unwrap_or(input);
        if s.is_empty() {
            return Err(bad("empty path"));
        }
        let bytes = s.as_bytes();
        let mut segments: SmallVec<[Segment; 6]> = SmallVec::new();
        let mut i = 0;
        loop {
            let start = i;
            while i < bytes.len() && is_key_char(bytes[i]) {
                i += 1;
            }
            if i == start {
                if segments.is_empty() && bytes.get(i) == Some(&b'[') {
                    return Err(bad("path must start with a field name"));
                }
                return Err(bad("empty segment"));
            }
            segments.push(Segment::Field(s[start..i].to_string()));
            while i < bytes.len() && bytes[i] == b'[' {
                i += 1;
                if bytes.get(i) == Some(&b'"') {
                    let rest = &s[i + 1..];
                    let close = rest.find('"').ok_or_else(|| bad("unterminated quoted key"))?;
                    let key = &rest[..close];
                    if key.is_empty() {
                        return Err(bad("empty quoted key"));
                    }
                    segments.push(Segment::Field(key.to_string()));
                    i += close + 2;
                } else if bytes.get(i) == Some(&b'*') {
                    segments.push(Segment::Any);
                    i += 1;
                } else {
                    let d0 = i;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    if i == d0 {
                        return Err(bad("index must be digits, '*' or a quoted key"));
                    }
                    let idx = s[d0..i].parse::<usize>().map_err(|_| bad("index out of range"))?;
                    segments.push(Segment::Index(idx));
                }
                if bytes.get(i) != Some(&b']') {
                    return Err(bad("missing ']'"));
                }
                i += 1;
            }
            match bytes.get(i) {
                None => break,
                Some(b'.') if i + 1 < bytes.len() => i += 1,
                Some(b'.') => return Err(bad("trailing '.'")),
                Some(_) => return Err(bad("unexpected character")),
            }
        }
        Ok(Self { raw: input.strip_prefix('.').unwrap_or(input).to_string(), segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All values the path reaches; a wildcard fans out.
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut cur: Vec<&'a Value> = vec![root];
        for seg in self.segments.iter() {
            let mut next = Vec::with_capacity(cur.len());
            for v in cur {
                match seg {
                    Segment::Field(k) => {
                        if let Some(x) = v.get(k.as_str()) {
                            next.push(x);
                        }
                    }
                    Segment::Index(n) => {
                        if let Some(x) = v.as_array().and_then(|a| a.get(*n)) {
                            next.push(x);
                        }
                    }
                    Segment::Any => {
                        if let Some(a) = v.as_array() {
                            next.extend(a.iter());
                        }
                    }
                }
            }
            if next.is_empty() {
                return next;
            }
            cur = next;
        }
        cur.retain(|v| !v.is_null());
        cur
    }

    pub fn first<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.select(root).into_iter().next()
    }

    /// Check the path against an OpenAPI v3 schema. Opaque nodes (no declared
    /// properties, preserve-unknown-fields, open additionalProperties) accept anything below.
    pub fn validate(&self, schema: &Value) -> Result<(), String> {
        let mut node = schema;
        for seg in self.segments.iter() {
            if node.get("x-kubernetes-preserve-unknown-fields").and_then(Value::as_bool) == Some(true) {
                return Ok(());
            }
            match seg {
                Segment::Field(k) => {
                    if let Some(p) = node.get("properties").and_then(|p| p.get(k.as_str())) {
                        node = p;
                    } else if let Some(ap) = node.get("additionalProperties") {
                        match ap {
                            Value::Object(_) => node = ap,
                            Value::Bool(false) => return Err(k.clone()),
                            _ => return Ok(()),
                        }
                    } else if node.get("properties").is_some() {
                        return Err(k.clone());
                    } else {
                        return Ok(());
                    }
                }
                Segment::Index(_) | Segment::Any => match node.get("items") {
                    Some(items) => node = items,
                    None if node.get("type").and_then(Value::as_str) == Some("array") => return Ok(()),
                    None if node.get("type").is_some() => return Err("[]".to_string()),
                    None => return Ok(()),
                },
            }
        }
        Ok(())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FieldPath::parse(&s).map_err(serde::de::Error::custom)
    }
}
