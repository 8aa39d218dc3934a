use std::collections::HashSet;

use crate::as_graph::ASN;
use crate::shared::{is_country_code, INVALID_REGIONS, WELL_KNOWN_COUNTRIES};

/// Pulls a country from the `NAME-CC` suffix of the holder's first token.
///
/// `"GRAMEENPHONE-AS-BD Grameenphone Ltd."` yields `BD`; region codes such as
/// `AP` are rejected.
pub fn country_from_holder(holder: &str) -> Option<String> {
    let first = holder.split_whitespace().next()?;
    if !first.contains('-') {
        return None;
    }
    let suffix = first.rsplit('-').next()?.to_ascii_uppercase();
    is_country_code(&suffix).then_some(suffix)
}

/// Country of registration for one network. Empty when it cannot be determined.
pub fn infer_country(asn: ASN, holder: &str, country_set: &HashSet<ASN>, home: &str) -> String {
    if country_set.contains(&asn) {
        return home.to_string();
    }
    country_from_holder(holder).unwrap_or_default()
}

/// Applies the well-known table, but only where nothing usable was found.
pub fn apply_override(asn: ASN, country: &str) -> Option<&'static str> {
    let known = WELL_KNOWN_COUNTRIES.get(&asn)?;
    if country.is_empty() || INVALID_REGIONS.contains(country) {
        Some(known)
    } else {
        None
    }
}
