use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::as_graph::ASN;

/// Observation key: one announcement seen by one collector peer.
pub type ObservationKey = (String, String);

/// A routing-state entry as the routing-data service returns it and as the raw store keeps it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPathRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_id")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Occurrences folded into this record by the dedup pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl RawPathRecord {
    pub fn new(target: &str, source_id: &str, path: &[ASN]) -> Self {
        RawPathRecord {
            target_prefix: Some(target.to_string()),
            source_id: Some(source_id.to_string()),
            path: Some(path.iter().map(|&a| Value::from(a)).collect()),
            count: None,
        }
    }

    pub fn key(&self) -> Option<ObservationKey> {
        match (self.target_prefix.as_deref(), self.source_id.as_deref()) {
            (Some(t), Some(s)) if !t.is_empty() && !s.is_empty() => {
                Some((t.to_string(), s.to_string()))
            }
            _ => None,
        }
    }

    /// Cleans the record into a [`PathRecord`], or `None` if it is not a valid observation.
    pub fn clean(&self) -> Option<PathRecord> {
        let (target, source_id) = self.key()?;
        let path = clean_path(self.path.as_deref().unwrap_or(&[]));
        if path.len() < 2 {
            return None;
        }
        Some(PathRecord { target, source_id, path })
    }
}

// Collector ids arrive as strings from the service; older stores hold bare numbers.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A validated observation: target block, collector id and a cleaned AS path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub target: String,
    pub source_id: String,
    pub path: Vec<ASN>,
}

impl PathRecord {
    pub fn new(target: &str, source_id: &str, path: Vec<ASN>) -> Self {
        PathRecord {
            target: target.to_string(),
            source_id: source_id.to_string(),
            path: collapse_prepends(path),
        }
    }

    pub fn key(&self) -> ObservationKey {
        (self.target.clone(), self.source_id.clone())
    }

    pub fn origin(&self) -> Option<ASN> {
        self.path.last().copied()
    }

    pub fn is_valid(&self) -> bool {
        !self.target.is_empty() && !self.source_id.is_empty() && self.path.len() >= 2
    }
}

/// Parses one path element. Only plain decimal numbers are hops.
pub fn parse_hop(value: &Value) -> Option<ASN> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| ASN::try_from(v).ok()),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse::<ASN>().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Drops non-numeric tokens and collapses consecutive repeats (AS prepending).
pub fn clean_path(raw: &[Value]) -> Vec<ASN> {
    let mut path: Vec<ASN> = Vec::with_capacity(raw.len());
    for hop in raw.iter().filter_map(parse_hop) {
        if path.last() != Some(&hop) {
            path.push(hop);
        }
    }
    path
}

pub fn collapse_prepends(mut path: Vec<ASN>) -> Vec<ASN> {
    path.dedup();
    path
}
