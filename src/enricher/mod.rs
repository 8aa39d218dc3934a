pub mod country;
pub mod geo;
pub mod peering;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::analyzer::Analysis;
use crate::as_graph::ASN;
use crate::fetch::peeringdb::PeeringNetwork;
use crate::fetch::{PeeringDbClient, Progress, RipeStatClient, Waves};
use crate::shared::StoreError;
use crate::store::{read_json, write_json_atomic};

pub use country::{apply_override, country_from_holder, infer_country};
pub use geo::{summarize, GeoSummary};
pub use peering::{locate, PeeringLocation, PeeringSource};

/// Everything known about one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsnInfo {
    #[serde(default, deserialize_with = "lenient_asn")]
    pub asn: ASN,
    pub name: String,
    #[serde(default)]
    pub holder: String,
    #[serde(default)]
    pub announced: bool,
    /// `None` means the lookup never succeeded and is retried next run;
    /// `Some("")` means it succeeded without revealing a country.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peering: Option<PeeringLocation>,
}

impl AsnInfo {
    pub fn new(asn: ASN) -> Self {
        AsnInfo {
            asn,
            name: format!("AS{}", asn),
            holder: String::new(),
            announced: false,
            country: None,
            geo: None,
            peering: None,
        }
    }

    pub fn country(&self) -> &str {
        self.country.as_deref().unwrap_or("")
    }
}

fn lenient_asn<'de, D>(deserializer: D) -> Result<ASN, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64().and_then(|v| ASN::try_from(v).ok()).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Per-ASN metadata, persisted as a JSON object keyed by decimal ASN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AsnTable {
    entries: BTreeMap<ASN, AsnInfo>,
}

impl AsnTable {
    pub fn new() -> Self {
        AsnTable::default()
    }

    /// Loads a saved table. A missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(AsnTable::new());
        }
        let mut table: AsnTable = read_json(path)?;
        for (asn, info) in table.entries.iter_mut() {
            info.asn = *asn;
        }
        info!("Loaded {} cached ASN entries", table.len());
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, asn: ASN) -> Option<&AsnInfo> {
        self.entries.get(&asn)
    }

    pub fn entry(&mut self, asn: ASN) -> &mut AsnInfo {
        self.entries.entry(asn).or_insert_with(|| AsnInfo::new(asn))
    }

    pub fn insert(&mut self, info: AsnInfo) {
        self.entries.insert(info.asn, info);
    }

    pub fn iter(&self) -> impl Iterator<Item = &AsnInfo> {
        self.entries.values()
    }

    pub fn country_of(&self, asn: ASN) -> &str {
        self.entries.get(&asn).map_or("", |i| i.country())
    }

    /// Networks whose country is still unresolved.
    pub fn needs_country(&self, asn: ASN) -> bool {
        self.entries.get(&asn).map_or(true, |i| i.country.is_none())
    }

    pub fn geo_dominant(&self, asn: ASN) -> Option<&str> {
        self.entries
            .get(&asn)
            .and_then(|i| i.geo.as_ref())
            .map(|g| g.dominant_country.as_str())
    }
}

/// Failure and success counts across the enrichment phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    pub overviews_fetched: usize,
    pub overview_failures: usize,
    pub geo_fetched: usize,
    pub geo_failures: usize,
    pub peering_resolved: usize,
    pub peering_failures: usize,
}

impl EnrichmentReport {
    pub fn failures(&self) -> usize {
        self.overview_failures + self.geo_failures + self.peering_failures
    }
}

/// Resolves country, geolocation and peering location for the networks in the graph.
pub struct MetadataEnricher<'a> {
    ripestat: &'a RipeStatClient,
    peeringdb: Option<&'a PeeringDbClient>,
    country_set: &'a HashSet<ASN>,
    home: String,
    geo_threshold: f64,
    overview_waves: Waves,
    geo_waves: Waves,
    max_upstreams: usize,
}

impl<'a> MetadataEnricher<'a> {
    pub fn new(ripestat: &'a RipeStatClient, country_set: &'a HashSet<ASN>, home: &str) -> Self {
        MetadataEnricher {
            ripestat,
            peeringdb: None,
            country_set,
            home: home.to_ascii_uppercase(),
            geo_threshold: 0.8,
            overview_waves: Waves::new(20),
            geo_waves: Waves::new(10),
            max_upstreams: 3,
        }
    }

    pub fn with_peeringdb(mut self, client: &'a PeeringDbClient) -> Self {
        self.peeringdb = Some(client);
        self
    }

    pub fn with_geo_threshold(mut self, threshold: f64) -> Self {
        self.geo_threshold = threshold;
        self
    }

    pub fn with_overview_waves(mut self, waves: Waves) -> Self {
        self.overview_waves = waves;
        self
    }

    pub fn with_geo_waves(mut self, waves: Waves) -> Self {
        self.geo_waves = waves;
        self
    }

    pub fn with_max_upstreams(mut self, max: usize) -> Self {
        self.max_upstreams = max;
        self
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    /// Fetches overviews for networks without a resolved country, then applies
    /// home membership and the well-known table.
    pub fn resolve_countries(&self, table: &mut AsnTable, asns: &[ASN], report: &mut EnrichmentReport) {
        let mut need: Vec<ASN> = asns
            .iter()
            .copied()
            .filter(|&a| table.needs_country(a))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        need.sort_unstable();

        if need.is_empty() {
            info!("All ASN info already cached");
        } else {
            info!(
                "Fetching ASN info for {} ASNs ({} parallel)",
                need.len(),
                self.overview_waves.size
            );
            let progress = Progress::new("ASN overviews", need.len()).with_report_every(100);
            let outcome = self
                .overview_waves
                .collect(need.clone(), &progress, |_, asn| self.ripestat.as_overview(asn));
            progress.finish();

            for (asn, result) in need.iter().copied().zip(outcome.results) {
                let info = table.entry(asn);
                match result {
                    Some(overview) => {
                        let holder = overview.holder.unwrap_or_default();
                        info.name = if holder.is_empty() { format!("AS{}", asn) } else { holder.clone() };
                        info.country = Some(infer_country(asn, &holder, self.country_set, &self.home));
                        info.holder = holder;
                        info.announced = overview.announced;
                        report.overviews_fetched += 1;
                    }
                    None => report.overview_failures += 1,
                }
            }
        }

        for asn in asns {
            let info = table.entry(*asn);
            let Some(current) = info.country.as_deref() else {
                continue;
            };
            if self.country_set.contains(asn) {
                info.country = Some(self.home.clone());
            } else if let Some(known) = apply_override(*asn, current) {
                info.country = Some(known.to_string());
            }
        }

        let with_country = asns.iter().filter(|&&a| !table.country_of(a).is_empty()).count();
        info!("ASNs with country: {}/{}", with_country, asns.len());
    }

    /// Geolocates the candidates' announced space. A failed lookup stores nothing,
    /// so the network is not treated as offshore.
    pub fn resolve_geolocation(&self, table: &mut AsnTable, candidates: &[ASN], report: &mut EnrichmentReport) {
        if candidates.is_empty() {
            return;
        }
        info!(
            "Fetching geolocation for {} ASNs ({} parallel)",
            candidates.len(),
            self.geo_waves.size
        );
        let progress = Progress::new("geolocation", candidates.len()).with_report_every(10);
        let outcome = self.geo_waves.collect(candidates.to_vec(), &progress, |_, asn| {
            self.ripestat
                .geolocation(asn)
                .map(|locs| summarize(&locs, &self.home, self.geo_threshold))
        });
        progress.finish();

        let mut abroad = 0;
        for (&asn, result) in candidates.iter().zip(outcome.results) {
            let info = table.entry(asn);
            match result {
                Some(summary) => {
                    if summary.is_abroad(&self.home) {
                        abroad += 1;
                        let locs: Vec<String> = summary
                            .breakdown
                            .iter()
                            .map(|b| format!("{}({:.0}%)", b.country, b.percentage))
                            .collect();
                        info!("AS{}: {}", asn, locs.join(", "));
                    }
                    info.geo = Some(summary);
                    report.geo_fetched += 1;
                }
                None => {
                    info.geo = None;
                    report.geo_failures += 1;
                }
            }
        }
        info!(
            "Geolocation complete: {} checked, {} with infrastructure abroad",
            candidates.len(),
            abroad
        );
    }

    /// Triangulates the peering country of each offshore network. Every other
    /// entry loses its stored peering location.
    pub fn resolve_peering(
        &self,
        table: &mut AsnTable,
        offshore: &[ASN],
        analysis: &Analysis,
        report: &mut EnrichmentReport,
    ) {
        let targets: HashSet<ASN> = offshore.iter().copied().collect();
        for info in table.entries.values_mut() {
            if !targets.contains(&info.asn) {
                info.peering = None;
            }
        }
        if offshore.is_empty() {
            return;
        }
        info!("Locating peering for {} offshore ASNs", offshore.len());

        let upstreams: HashMap<ASN, Vec<ASN>> = offshore
            .iter()
            .map(|&asn| {
                let mut ups = analysis.upstreams_of(asn);
                ups.truncate(self.max_upstreams);
                (asn, ups)
            })
            .collect();

        let mut networks: HashMap<ASN, PeeringNetwork> = HashMap::new();
        let mut exchanges: HashMap<u32, String> = HashMap::new();
        let mut directory_failed = false;
        let mut exchanges_failed = false;
        if let Some(client) = self.peeringdb {
            let mut query: Vec<ASN> = offshore.to_vec();
            query.extend(upstreams.values().flatten().copied());

            match client.networks(&query) {
                Ok(found) => networks = found,
                Err(e) => {
                    warn!(error = %e, "peering directory lookup failed");
                    directory_failed = true;
                }
            }
            let ix_ids: Vec<u32> = networks
                .values()
                .flat_map(|n| n.exchanges.iter().map(|p| p.ix_id))
                .collect();
            if !ix_ids.is_empty() {
                match client.exchange_countries(&ix_ids) {
                    Ok(found) => exchanges = found,
                    Err(e) => {
                        warn!(error = %e, "exchange lookup failed");
                        exchanges_failed = true;
                    }
                }
            }
        }

        for &asn in offshore {
            let own = networks.get(&asn);
            let ups: Vec<&PeeringNetwork> = upstreams
                .get(&asn)
                .into_iter()
                .flatten()
                .filter_map(|u| networks.get(u))
                .collect();
            // Lost exchange evidence only matters where a port was listed.
            let missing_exchanges = exchanges_failed
                && own
                    .into_iter()
                    .chain(ups.iter().copied())
                    .any(|n| !n.exchanges.is_empty());
            let location = locate(&self.home, own, &ups, &exchanges, table.geo_dominant(asn));

            if directory_failed || missing_exchanges {
                report.peering_failures += 1;
            } else if location.is_some() {
                report.peering_resolved += 1;
            }
            match &location {
                Some(loc) => {
                    let shown = if loc.details.is_empty() {
                        "no details".to_string()
                    } else {
                        loc.details.iter().take(2).cloned().collect::<Vec<_>>().join(", ")
                    };
                    info!("AS{}: peers in {} ({}) [source: {}]", asn, loc.country, shown, loc.source.as_str());
                }
                None => info!("AS{}: no peering location found", asn),
            }
            table.entry(asn).peering = location;
        }
    }
}
