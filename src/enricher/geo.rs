use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::as_graph::GeoLocation;

/// Sample prefixes kept per location.
const SAMPLE_PREFIXES: usize = 3;

/// Where a network's announced address space is physically located.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoSummary {
    pub dominant_country: String,
    pub breakdown: Vec<GeoLocation>,
    pub home_percentage: f64,
}

impl GeoSummary {
    /// Used when the service returned nothing located.
    pub fn home(home: &str) -> Self {
        GeoSummary {
            dominant_country: home.to_string(),
            breakdown: Vec::new(),
            home_percentage: 100.0,
        }
    }

    pub fn is_abroad(&self, home: &str) -> bool {
        self.dominant_country != home
    }
}

/// Picks the dominant location.
///
/// More than `threshold` of the covered space at home keeps the network at
/// home; otherwise the foreign country with the largest share wins.
pub fn summarize(locations: &[GeoLocation], home: &str, threshold: f64) -> GeoSummary {
    let mut total = 0.0;
    let mut home_pct = 0.0;
    let mut foreign: HashMap<&str, f64> = HashMap::new();
    let mut breakdown = Vec::with_capacity(locations.len());

    for loc in locations.iter().filter(|l| !l.country.is_empty()) {
        total += loc.percentage;
        if loc.country == home {
            home_pct += loc.percentage;
        } else {
            *foreign.entry(loc.country.as_str()).or_insert(0.0) += loc.percentage;
        }
        breakdown.push(GeoLocation {
            country: loc.country.clone(),
            city: loc.city.clone(),
            percentage: loc.percentage,
            prefixes: loc.prefixes.iter().take(SAMPLE_PREFIXES).cloned().collect(),
        });
    }

    if total <= 0.0 {
        return GeoSummary::home(home);
    }

    let dominant = if home_pct / total > threshold {
        home.to_string()
    } else {
        foreign
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(cc, _)| cc.to_string())
            .unwrap_or_else(|| home.to_string())
    };

    breakdown.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));

    GeoSummary {
        dominant_country: dominant,
        breakdown,
        home_percentage: (home_pct * 100.0).round() / 100.0,
    }
}
