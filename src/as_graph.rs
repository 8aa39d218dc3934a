use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::shared::{EdgeClass, Role};

pub type ASN = u32;

/// One located slice of a network's announced address space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    #[serde(default)]
    pub city: String,
    pub percentage: f64,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AS {
    pub asn: ASN,
    #[serde(rename = "type")]
    pub role: Role,
    pub licensed: bool,
    pub name: String,
    pub description: String,
    pub country: String,
    pub announced: bool,
    pub geo_country: String,
    pub geo_breakdown: Vec<GeoLocation>,
    pub peering_country: String,
    pub peering_details: Vec<String>,
    pub peering_source: String,
    pub traffic: u64,
    pub rank: usize,
    pub percentage: f64,
}

impl AS {
    pub fn new(asn: ASN, role: Role) -> Self {
        AS {
            asn,
            role,
            licensed: false,
            name: format!("AS{}", asn),
            description: String::new(),
            country: String::new(),
            announced: false,
            geo_country: String::new(),
            geo_breakdown: Vec::new(),
            peering_country: String::new(),
            peering_details: Vec::new(),
            peering_source: String::new(),
            traffic: 0,
            rank: 0,
            percentage: 0.0,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self.role,
            Role::LicensedGateway
                | Role::DetectedGateway
                | Role::OffshoreGateway
                | Role::OffshoreEnterprise
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: ASN,
    pub target: ASN,
    pub count: u64,
    #[serde(rename = "type")]
    pub class: EdgeClass,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_outside: usize,
    pub total_licensed_gateway: usize,
    pub total_detected_gateway: usize,
    pub total_offshore_enterprise: usize,
    pub total_offshore_gateway: usize,
    pub total_local_company: usize,
    pub total_edges: usize,
    pub total_intl_edges: usize,
    pub total_domestic_edges: usize,
    pub total_traffic: u64,
    pub valid_observations: u64,
}

impl GraphStats {
    pub fn count_for(&self, role: Role) -> usize {
        match role {
            Role::Outside => self.total_outside,
            Role::LicensedGateway => self.total_licensed_gateway,
            Role::DetectedGateway => self.total_detected_gateway,
            Role::OffshoreEnterprise => self.total_offshore_enterprise,
            Role::OffshoreGateway => self.total_offshore_gateway,
            Role::LocalCompany => self.total_local_company,
        }
    }

    fn count_mut(&mut self, role: Role) -> &mut usize {
        match role {
            Role::Outside => &mut self.total_outside,
            Role::LicensedGateway => &mut self.total_licensed_gateway,
            Role::DetectedGateway => &mut self.total_detected_gateway,
            Role::OffshoreEnterprise => &mut self.total_offshore_enterprise,
            Role::OffshoreGateway => &mut self.total_offshore_gateway,
            Role::LocalCompany => &mut self.total_local_company,
        }
    }
}

/// The finished border graph. Nodes keep the order in which they were first reached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ASGraph {
    pub nodes: Vec<AS>,
    pub edges: Vec<Edge>,
    pub stats: GraphStats,
    #[serde(skip)]
    index: HashMap<ASN, usize>,
}

impl ASGraph {
    pub fn new() -> Self {
        ASGraph::default()
    }

    pub fn get(&self, asn: &ASN) -> Option<&AS> {
        self.index.get(asn).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, asn: &ASN) -> Option<&mut AS> {
        match self.index.get(asn) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    pub fn contains(&self, asn: &ASN) -> bool {
        self.index.contains_key(asn)
    }

    /// Inserts a node unless one with the same ASN already exists.
    pub fn insert(&mut self, as_obj: AS) {
        if self.index.contains_key(&as_obj.asn) {
            return;
        }
        self.index.insert(as_obj.asn, self.nodes.len());
        self.nodes.push(as_obj);
    }

    pub fn iter(&self) -> impl Iterator<Item = &AS> {
        self.nodes.iter()
    }

    pub fn nodes_with_role(&self, role: Role) -> impl Iterator<Item = &AS> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn edges_of_class(&self, class: EdgeClass) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.class == class)
    }

    /// Rebuilds the ASN index after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.asn, i))
            .collect();
    }

    /// Sum of selected international edge counts, never below one.
    pub fn total_international_traffic(&self) -> u64 {
        self.edges_of_class(EdgeClass::International)
            .map(|e| e.count)
            .sum::<u64>()
            .max(1)
    }

    /// Adds every edge's count to both of its endpoints.
    pub fn assign_traffic(&mut self) {
        for node in self.nodes.iter_mut() {
            node.traffic = 0;
        }
        let edges = std::mem::take(&mut self.edges);
        for edge in &edges {
            if let Some(src) = self.get_mut(&edge.source) {
                src.traffic += edge.count;
            }
            if let Some(tgt) = self.get_mut(&edge.target) {
                tgt.traffic += edge.count;
            }
        }
        self.edges = edges;
    }

    /// Ranks each role group by traffic and expresses traffic as a share of all
    /// international traffic, so percentages compare across roles.
    pub fn assign_rankings(&mut self) {
        let total = self.total_international_traffic() as f64;
        for role in Role::ALL {
            let mut members: Vec<usize> = (0..self.nodes.len())
                .filter(|&i| self.nodes[i].role == role)
                .collect();
            members.sort_by(|&a, &b| {
                self.nodes[b]
                    .traffic
                    .cmp(&self.nodes[a].traffic)
                    .then(self.nodes[a].asn.cmp(&self.nodes[b].asn))
            });
            for (rank, i) in members.into_iter().enumerate() {
                let node = &mut self.nodes[i];
                node.rank = rank + 1;
                node.percentage = node.traffic as f64 / total * 100.0;
            }
        }
    }

    pub fn compute_stats(&mut self, valid_observations: u64) {
        let mut stats = GraphStats::default();
        for node in &self.nodes {
            *stats.count_mut(node.role) += 1;
        }
        stats.total_edges = self.edges.len();
        stats.total_intl_edges = self.edges_of_class(EdgeClass::International).count();
        stats.total_domestic_edges = self.edges_of_class(EdgeClass::Domestic).count();
        stats.total_traffic = self.total_international_traffic();
        stats.valid_observations = valid_observations;
        self.stats = stats;
    }
}
