mod common;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::tempdir;

use bordergraph::store::RecordStream;
use bordergraph::fetch::{HttpRequest, HttpResponse};
use bordergraph::{FetchError, Pipeline, PipelineConfig, PipelineError, RawPathRecord};

use common::{bgp_state, ok, overview, resource, status, FakeTransport};

fn routes() -> Value {
    bgp_state(&[
        ("10.0.0.0/24", "rrc00", &[174u32, 100, 200][..]),
        ("10.0.0.0/24", "rrc01", &[3356, 100, 300][..]),
        ("10.0.1.0/24", "rrc00", &[6939, 300][..]),
        ("10.0.1.0/24", "rrc01", &[1299, 1299, 300][..]),
        // same observation key as the first record
        ("10.0.0.0/24", "rrc00", &[174, 100, 200][..]),
    ])
}

/// Answers like the live services. `geo_300` is where AS300's address space is located.
fn respond(req: &HttpRequest, geo_300: &str) -> Result<HttpResponse, FetchError> {
    let url = req.url.as_str();
    if url.contains("country-resource-list") {
        return ok(json!({ "resources": {
            "asn": ["100", "200", "300"],
            "ipv4": ["10.0.0.0/24", "10.0.1.0/24"],
            "ipv6": []
        }}));
    }
    if url.contains("bgp-state") {
        return ok(routes());
    }
    if url.contains("as-overview") {
        return ok(overview(&format!("EXAMPLE-{}-US Example", resource(req))));
    }
    if url.contains("maxmind") {
        let country = if resource(req) == "AS300" { geo_300 } else { "BD" };
        return ok(json!({ "located_resources": [{ "locations": [
            { "country": country, "city": "", "covered_percentage": 90.0, "resources": ["10.0.1.0/24"] },
            { "country": "BD", "city": "Dhaka", "covered_percentage": 10.0, "resources": [] }
        ]}]}));
    }
    if url.ends_with("/net") {
        return ok(json!([
            { "asn": 6939, "netfac_set": [{ "name": "Equinix SG1", "city": "Singapore", "country": "SG" }] },
            { "asn": 1299, "netfac_set": [{ "name": "Digital Realty SIN", "city": "Singapore", "country": "SG" }] }
        ]));
    }
    status(404)
}

fn service() -> FakeTransport {
    FakeTransport::new(|req, _| respond(req, "SG"))
}

fn config(dir: &Path) -> PipelineConfig {
    let license = dir.join("licenses.json");
    std::fs::write(&license, json!({ "_source": "test", "100": { "name": "Licensed Gateway Ltd" } }).to_string()).unwrap();
    PipelineConfig::default()
        .with_data_dir(dir)
        .with_license_file(license)
        .with_requests_per_second(10_000.0)
        .with_peering_requests_per_second(10_000.0)
        .with_retry_timing(0.0, 0.0)
}

fn read(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn node<'a>(graph: &'a Value, asn: u64) -> &'a Value {
    graph["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["asn"] == asn)
        .unwrap()
}

#[test]
fn test_full_run() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(service());
    let pipeline = Pipeline::new(config(dir.path())).with_transport(transport.clone());

    let summary = pipeline.run().unwrap();

    assert_eq!(summary.country_asns, 3);
    assert_eq!(summary.prefixes, 2);
    assert_eq!(summary.routes.unwrap().records, 5);
    assert_eq!(summary.valid_observations, 4);
    assert_eq!(summary.duplicate_observations, 1);
    assert_eq!(summary.failed_units(), 0);
    assert_eq!(summary.outputs.len(), 3);

    let graph = read(&dir.path().join("viz_data.json"));
    assert_eq!(node(&graph, 100)["type"], "licensed-gateway");
    assert_eq!(node(&graph, 100)["licensed"], true);
    assert_eq!(node(&graph, 200)["type"], "local-company");
    assert_eq!(node(&graph, 300)["type"], "offshore-enterprise");
    assert_eq!(node(&graph, 300)["geo_country"], "SG");
    assert_eq!(node(&graph, 300)["peering_country"], "SG");
    assert_eq!(node(&graph, 300)["peering_source"], "peeringdb-upstream");
    assert_eq!(node(&graph, 174)["type"], "outside");
    assert_eq!(node(&graph, 174)["country"], "US");
    assert_eq!(graph["stats"]["total_intl_edges"], 4);
    assert_eq!(graph["stats"]["total_domestic_edges"], 2);
    assert_eq!(graph["stats"]["valid_observations"], 4);

    let metadata = read(&dir.path().join("metadata.json"));
    assert_eq!(metadata["country"], "BD");
    assert_eq!(metadata["schema_version"], 3);
    assert_eq!(metadata["model"], "license-aware");
    assert!(metadata["last_updated"].as_str().unwrap().contains('T'));

    let table = read(&dir.path().join("asn_names.json"));
    assert_eq!(table["300"]["country"], "BD");
    assert_eq!(table["300"]["geo"]["dominant_country"], "SG");

    // only the unlicensed in-country gateway is geolocated
    assert_eq!(transport.calls_to("maxmind"), 1);
    assert!(dir.path().join("bgp_routes_raw.jsonl").exists());
    assert!(!dir.path().join("bgp_routes_raw.jsonl.partial").exists());
}

#[test]
fn test_second_run_uses_cached_metadata() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    Pipeline::new(cfg.clone()).with_transport(Arc::new(service())).run().unwrap();

    let transport = Arc::new(service());
    Pipeline::new(cfg.with_reprocess(true))
        .with_transport(transport.clone())
        .run()
        .unwrap();

    assert_eq!(transport.calls_to("as-overview"), 0);
    assert_eq!(transport.calls_to("bgp-state"), 0);
}

#[test]
fn test_dedup_pass_annotates_counts() {
    let dir = tempdir().unwrap();
    let summary = Pipeline::new(config(dir.path()).with_dedup(true))
        .with_transport(Arc::new(service()))
        .run()
        .unwrap();

    let dedup = summary.dedup.unwrap();
    assert_eq!(dedup.records_read, 5);
    assert_eq!(dedup.duplicates, 1);

    let records: Vec<RawPathRecord> = RecordStream::open(&dir.path().join("bgp_routes_raw.jsonl"))
        .unwrap()
        .collect();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].count, Some(2));
    assert_eq!(summary.valid_observations, 4);
}

#[test]
fn test_unresolvable_country_is_fatal() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new(|_, _| status(404)));
    let result = Pipeline::new(config(dir.path())).with_transport(transport).run();

    match result {
        Err(PipelineError::Setup { country, .. }) => assert_eq!(country, "BD"),
        Err(other) => panic!("expected setup failure, got {}", other),
        Ok(_) => panic!("expected setup failure"),
    }
    assert!(!dir.path().join("viz_data.json").exists());
}

#[test]
fn test_interrupted_run_writes_no_graph() {
    let dir = tempdir().unwrap();
    let flag = Arc::new(AtomicBool::new(true));
    let result = Pipeline::new(config(dir.path()))
        .with_transport(Arc::new(service()))
        .with_interrupt(flag)
        .run();

    assert!(matches!(result, Err(PipelineError::Interrupted)));
    assert!(!dir.path().join("viz_data.json").exists());
    assert!(!dir.path().join("metadata.json").exists());
}

#[test]
fn test_reprocess_requires_store() {
    let dir = tempdir().unwrap();
    let result = Pipeline::new(config(dir.path()).with_reprocess(true))
        .with_transport(Arc::new(service()))
        .run();
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_failed_overview_keeps_well_known_country() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new(|req, _| {
        if req.url.contains("as-overview") {
            return status(404);
        }
        respond(req, "SG")
    }));
    let summary = Pipeline::new(config(dir.path()))
        .with_transport(transport)
        .run()
        .unwrap();
    assert_eq!(summary.enrichment.overview_failures, 7);

    let graph = read(&dir.path().join("viz_data.json"));
    assert_eq!(node(&graph, 174)["country"], "US");
    assert_eq!(node(&graph, 1299)["country"], "SE");
    assert_eq!(node(&graph, 3356)["country"], "US");
    assert_eq!(node(&graph, 300)["country"], "BD");

    // unresolved entries stay marked for the next run
    let table = read(&dir.path().join("asn_names.json"));
    assert!(table["174"].get("country").is_none());
}

#[test]
fn test_peering_dropped_once_network_is_back_home() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    Pipeline::new(cfg.clone()).with_transport(Arc::new(service())).run().unwrap();
    let first = read(&dir.path().join("viz_data.json"));
    assert_eq!(node(&first, 300)["type"], "offshore-enterprise");
    assert_eq!(node(&first, 300)["peering_country"], "SG");

    let moved_home = Arc::new(FakeTransport::new(|req, _| respond(req, "BD")));
    Pipeline::new(cfg.with_reprocess(true))
        .with_transport(moved_home)
        .run()
        .unwrap();

    let second = read(&dir.path().join("viz_data.json"));
    assert_eq!(node(&second, 300)["type"], "local-company");
    assert_eq!(node(&second, 300)["geo_country"], "BD");
    assert_eq!(node(&second, 300)["peering_country"], "");
    assert_eq!(node(&second, 300)["peering_source"], "");

    let table = read(&dir.path().join("asn_names.json"));
    assert!(table["300"].get("peering").is_none());
}
