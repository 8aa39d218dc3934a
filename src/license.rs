use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::as_graph::ASN;
use crate::fetch::ripestat::parse_asn;
use crate::shared::StoreError;
use crate::store::read_json;

/// Networks holding an international gateway license, keyed by ASN.
///
/// Keys starting with `_` carry file metadata and are skipped, as are keys that
/// do not parse as an ASN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LicenseRegistry {
    entries: BTreeMap<ASN, Value>,
}

impl LicenseRegistry {
    pub fn new() -> Self {
        LicenseRegistry::default()
    }

    /// Loads the registry. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            warn!(path = %path.display(), "license registry not found, no networks will be marked licensed");
            return Ok(LicenseRegistry::new());
        }
        let value: Value = read_json(path)?;
        let registry = LicenseRegistry::from_value(&value);
        info!("Loaded {} licensed ASNs", registry.len());
        Ok(registry)
    }

    pub fn from_value(value: &Value) -> Self {
        let mut entries = BTreeMap::new();
        if let Value::Object(map) = value {
            for (key, meta) in map {
                if key.starts_with('_') {
                    continue;
                }
                match parse_asn(&Value::String(key.clone())) {
                    Some(asn) => {
                        entries.insert(asn, meta.clone());
                    }
                    None => warn!(key = %key, "skipping license entry with invalid ASN"),
                }
            }
        } else {
            warn!("license registry is not a JSON object");
        }
        LicenseRegistry { entries }
    }

    pub fn from_asns<I: IntoIterator<Item = ASN>>(asns: I) -> Self {
        LicenseRegistry {
            entries: asns.into_iter().map(|a| (a, Value::Null)).collect(),
        }
    }

    pub fn contains(&self, asn: ASN) -> bool {
        self.entries.contains_key(&asn)
    }

    pub fn metadata(&self, asn: ASN) -> Option<&Value> {
        self.entries.get(&asn)
    }

    pub fn asns(&self) -> impl Iterator<Item = ASN> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
