use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::as_graph::ASN;
use crate::path_record::{ObservationKey, PathRecord, RawPathRecord};

pub type EdgeKey = (ASN, ASN);

/// Aggregate counters produced by one pass over the path records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub outside_counts: HashMap<ASN, u64>,
    pub gateway_counts: HashMap<ASN, u64>,
    /// Domestic originators, including gateways that originate their own space.
    pub local_counts: HashMap<ASN, u64>,
    pub international_edges: HashMap<EdgeKey, u64>,
    pub domestic_edges: HashMap<EdgeKey, u64>,
    /// Foreign networks seen directly next to each in-country network.
    pub upstreams: BTreeMap<ASN, BTreeSet<ASN>>,
    pub valid_observations: u64,
    pub invalid_records: u64,
    pub duplicates: u64,
    /// Distinct adjacent pairs with at least one in-country side.
    pub adjacencies: usize,
}

impl Analysis {
    pub fn upstreams_of(&self, asn: ASN) -> Vec<ASN> {
        self.upstreams
            .get(&asn)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn log_summary(&self) {
        info!(
            "Valid observations: {} ({} invalid, {} duplicates)",
            self.valid_observations, self.invalid_records, self.duplicates
        );
        info!(
            "Outside ASNs: {}, gateway ASNs: {}, local originators: {}",
            self.outside_counts.len(),
            self.gateway_counts.len(),
            self.local_counts.len()
        );
        info!(
            "International edges: {}, domestic edges: {}",
            self.international_edges.len(),
            self.domestic_edges.len()
        );
        info!(
            "Adjacencies tracked: {}, in-country ASNs with foreign neighbors: {}",
            self.adjacencies,
            self.upstreams.len()
        );
    }
}

/// Locates the border crossing on each path and accumulates the counters.
pub struct PathAnalyzer<'a> {
    country: &'a HashSet<ASN>,
    seen: HashSet<ObservationKey>,
    adjacency: HashSet<EdgeKey>,
    analysis: Analysis,
    processed: u64,
}

impl<'a> PathAnalyzer<'a> {
    pub fn new(country: &'a HashSet<ASN>) -> Self {
        PathAnalyzer {
            country,
            seen: HashSet::new(),
            adjacency: HashSet::new(),
            analysis: Analysis::default(),
            processed: 0,
        }
    }

    fn in_country(&self, asn: ASN) -> bool {
        self.country.contains(&asn)
    }

    /// Cleans and observes a record from the store. Returns whether it was counted.
    pub fn observe_raw(&mut self, record: &RawPathRecord) -> bool {
        self.processed += 1;
        if self.processed % 50_000 == 0 {
            debug!("Processed {} records", self.processed);
        }
        match record.clean() {
            Some(path_record) => self.observe_clean(path_record),
            None => {
                self.analysis.invalid_records += 1;
                false
            }
        }
    }

    /// Observes one record. Returns `false` for invalid records and repeated keys.
    pub fn observe(&mut self, record: &PathRecord) -> bool {
        if !record.is_valid() {
            self.analysis.invalid_records += 1;
            return false;
        }
        self.observe_clean(record.clone())
    }

    fn observe_clean(&mut self, record: PathRecord) -> bool {
        let PathRecord { target, source_id, path } = record;
        if !self.seen.insert((target, source_id)) {
            self.analysis.duplicates += 1;
            return false;
        }
        self.analysis.valid_observations += 1;
        self.walk(&path);
        true
    }

    fn walk(&mut self, path: &[ASN]) {
        // Index of the last foreign hop before the in-country tail.
        let border = path.iter().rposition(|&asn| !self.in_country(asn));

        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let (a_in, b_in) = (self.in_country(a), self.in_country(b));
            if !(a_in || b_in) {
                continue;
            }
            if self.adjacency.insert((a, b)) {
                if b_in && !a_in {
                    self.analysis.upstreams.entry(b).or_default().insert(a);
                }
                if a_in && !b_in {
                    self.analysis.upstreams.entry(a).or_default().insert(b);
                }
            }
        }

        let (outside, gateway) = match border {
            Some(i) if i + 1 < path.len() => (path[i], path[i + 1]),
            _ => return,
        };
        let origin = path[path.len() - 1];

        let a = &mut self.analysis;
        *a.outside_counts.entry(outside).or_insert(0) += 1;
        *a.gateway_counts.entry(gateway).or_insert(0) += 1;
        *a.international_edges.entry((outside, gateway)).or_insert(0) += 1;

        if origin == gateway {
            *a.local_counts.entry(origin).or_insert(0) += 1;
        } else if self.country.contains(&origin) {
            *a.local_counts.entry(origin).or_insert(0) += 1;
            *a.domestic_edges.entry((origin, gateway)).or_insert(0) += 1;
        }
    }

    pub fn finish(mut self) -> Analysis {
        self.analysis.adjacencies = self.adjacency.len();
        self.analysis
    }
}

/// Runs the analyzer over a sequential record stream.
pub fn analyze_stream<I>(country: &HashSet<ASN>, records: I) -> Analysis
where
    I: IntoIterator<Item = RawPathRecord>,
{
    let mut analyzer = PathAnalyzer::new(country);
    for record in records {
        analyzer.observe_raw(&record);
    }
    let analysis = analyzer.finish();
    analysis.log_summary();
    analysis
}
