use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::info;

use crate::analyzer::{Analysis, EdgeKey};
use crate::as_graph::{ASGraph, Edge, AS, ASN};
use crate::enricher::{apply_override, AsnTable};
use crate::license::LicenseRegistry;
use crate::shared::{EdgeClass, Role};

pub const DEFAULT_TOP_INTERNATIONAL: usize = 1000;
pub const DEFAULT_TOP_DOMESTIC: usize = 2000;

/// The heaviest edges of each class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeSelection {
    pub international: Vec<Edge>,
    pub domestic: Vec<Edge>,
}

fn top_edges(counts: &HashMap<EdgeKey, u64>, k: usize, class: EdgeClass) -> Vec<Edge> {
    let mut edges: Vec<(&EdgeKey, &u64)> = counts.iter().collect();
    // Count descending, then (source, target) ascending for reproducible cuts.
    edges.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    edges
        .into_iter()
        .take(k)
        .map(|(&(source, target), &count)| Edge {
            source,
            target,
            count,
            class,
        })
        .collect()
}

impl EdgeSelection {
    pub fn top_k(analysis: &Analysis, top_international: usize, top_domestic: usize) -> Self {
        EdgeSelection {
            international: top_edges(
                &analysis.international_edges,
                top_international,
                EdgeClass::International,
            ),
            domestic: top_edges(&analysis.domestic_edges, top_domestic, EdgeClass::Domestic),
        }
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.international.iter().chain(self.domestic.iter())
    }

    /// Tentative gateways: every network that is the target of a selected edge.
    pub fn gateways(&self) -> BTreeSet<ASN> {
        self.edges().map(|e| e.target).collect()
    }

    pub fn domestic_targets(&self) -> HashSet<ASN> {
        self.domestic.iter().map(|e| e.target).collect()
    }

    /// In-country gateways without a license. Their address space is worth geolocating.
    pub fn geo_candidates(&self, country_set: &HashSet<ASN>, licenses: &LicenseRegistry) -> Vec<ASN> {
        self.gateways()
            .into_iter()
            .filter(|asn| country_set.contains(asn) && !licenses.contains(*asn))
            .collect()
    }
}

/// The facts a gateway's role is decided from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewaySignals {
    pub licensed: bool,
    /// Registered at home but its address space is located abroad.
    pub offshore: bool,
    pub has_domestic_customers: bool,
}

impl GatewaySignals {
    pub fn gather(
        asn: ASN,
        table: &AsnTable,
        licenses: &LicenseRegistry,
        country_set: &HashSet<ASN>,
        domestic_targets: &HashSet<ASN>,
        home: &str,
    ) -> Self {
        let abroad = table.geo_dominant(asn).map_or(false, |cc| cc != home);
        GatewaySignals {
            licensed: licenses.contains(asn),
            offshore: country_set.contains(&asn) && abroad,
            has_domestic_customers: domestic_targets.contains(&asn),
        }
    }
}

fn licensed(s: &GatewaySignals) -> bool {
    s.licensed
}

fn offshore_with_customers(s: &GatewaySignals) -> bool {
    s.offshore && s.has_domestic_customers
}

fn offshore(s: &GatewaySignals) -> bool {
    s.offshore
}

fn has_customers(s: &GatewaySignals) -> bool {
    s.has_domestic_customers
}

fn otherwise(_: &GatewaySignals) -> bool {
    true
}

/// First matching rule wins.
pub const GATEWAY_RULES: [(fn(&GatewaySignals) -> bool, Role); 5] = [
    (licensed, Role::LicensedGateway),
    (offshore_with_customers, Role::OffshoreGateway),
    (offshore, Role::OffshoreEnterprise),
    (has_customers, Role::DetectedGateway),
    (otherwise, Role::LocalCompany),
];

pub fn classify_gateway(signals: &GatewaySignals) -> Role {
    GATEWAY_RULES
        .iter()
        .find(|(applies, _)| applies(signals))
        .map_or(Role::LocalCompany, |(_, role)| *role)
}

/// Networks the classifier would call offshore, given the current metadata.
pub fn offshore_asns(
    selection: &EdgeSelection,
    table: &AsnTable,
    licenses: &LicenseRegistry,
    country_set: &HashSet<ASN>,
    home: &str,
) -> Vec<ASN> {
    let domestic_targets = selection.domestic_targets();
    selection
        .gateways()
        .into_iter()
        .filter(|&asn| {
            let s = GatewaySignals::gather(asn, table, licenses, country_set, &domestic_targets, home);
            !s.licensed && s.offshore
        })
        .collect()
}

/// Assembles the final graph from the selected edges and the metadata.
pub struct GraphBuilder<'a> {
    analysis: &'a Analysis,
    table: &'a AsnTable,
    licenses: &'a LicenseRegistry,
    country_set: &'a HashSet<ASN>,
    home: String,
    top_international: usize,
    top_domestic: usize,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        analysis: &'a Analysis,
        table: &'a AsnTable,
        licenses: &'a LicenseRegistry,
        country_set: &'a HashSet<ASN>,
        home: &str,
    ) -> Self {
        GraphBuilder {
            analysis,
            table,
            licenses,
            country_set,
            home: home.to_ascii_uppercase(),
            top_international: DEFAULT_TOP_INTERNATIONAL,
            top_domestic: DEFAULT_TOP_DOMESTIC,
        }
    }

    pub fn with_top_k(mut self, international: usize, domestic: usize) -> Self {
        self.top_international = international;
        self.top_domestic = domestic;
        self
    }

    pub fn selection(&self) -> EdgeSelection {
        EdgeSelection::top_k(self.analysis, self.top_international, self.top_domestic)
    }

    fn node(&self, asn: ASN, role: Role) -> AS {
        let mut node = AS::new(asn, role);
        node.licensed = self.licenses.contains(asn);
        if let Some(info) = self.table.get(asn) {
            node.name = info.name.clone();
            node.description = info.holder.clone();
            node.country = info.country().to_string();
            node.announced = info.announced;
            if let Some(geo) = &info.geo {
                node.geo_country = geo.dominant_country.clone();
                node.geo_breakdown = geo.breakdown.clone();
            }
            if let Some(peering) = info.peering.as_ref().filter(|_| role.is_offshore()) {
                node.peering_country = peering.country.clone();
                node.peering_details = peering.details.clone();
                node.peering_source = peering.source.as_str().to_string();
            }
        }
        if node.country.is_empty() {
            if self.country_set.contains(&asn) {
                node.country = self.home.clone();
            } else if let Some(known) = apply_override(asn, "") {
                node.country = known.to_string();
            }
        }
        node
    }

    pub fn build(&self) -> ASGraph {
        let selection = self.selection();
        let gateways = selection.gateways();
        let domestic_targets = selection.domestic_targets();

        let role_of = |asn: ASN, class: EdgeClass| -> Role {
            if gateways.contains(&asn) {
                let signals = GatewaySignals::gather(
                    asn,
                    self.table,
                    self.licenses,
                    self.country_set,
                    &domestic_targets,
                    &self.home,
                );
                classify_gateway(&signals)
            } else {
                match class {
                    EdgeClass::International => Role::Outside,
                    EdgeClass::Domestic => Role::LocalCompany,
                }
            }
        };

        let mut graph = ASGraph::new();
        for edge in selection.edges() {
            for asn in [edge.source, edge.target] {
                if !graph.contains(&asn) {
                    graph.insert(self.node(asn, role_of(asn, edge.class)));
                }
            }
        }
        graph.edges = selection.edges().cloned().collect();

        graph.assign_traffic();
        graph.assign_rankings();
        graph.compute_stats(self.analysis.valid_observations);

        let s = &graph.stats;
        info!(
            "Graph: {} outside, {} licensed, {} detected, {} offshore gateways, {} offshore enterprises, {} local",
            s.total_outside,
            s.total_licensed_gateway,
            s.total_detected_gateway,
            s.total_offshore_gateway,
            s.total_offshore_enterprise,
            s.total_local_company
        );
        info!(
            "Edges: {} international, {} domestic",
            s.total_intl_edges, s.total_domestic_edges
        );
        graph
    }
}
