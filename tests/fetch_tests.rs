mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use bordergraph::fetch::{
    chunk_prefixes, with_retry, HttpResponse, PeeringDbClient, Progress, RetryPolicy, RipeStatClient, Waves,
};
use bordergraph::{ErrorClass, FetchError, RateLimiter};

use common::{bgp_state, ok, resource, status, FakeTransport};

fn fast_limiter() -> RateLimiter {
    RateLimiter::new(10_000.0)
}

fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries)
        .with_initial_backoff(Duration::ZERO)
        .with_rate_limit_fallback(Duration::from_millis(30))
}

fn client(transport: Arc<FakeTransport>) -> RipeStatClient {
    RipeStatClient::new(transport, Arc::new(fast_limiter()))
        .with_routes_policy(fast_policy(3))
        .with_overview_policy(fast_policy(2))
        .with_geo_policy(fast_policy(2))
}

#[test]
fn test_retry_recovers_from_transient_errors() {
    let calls = AtomicUsize::new(0);
    let result = with_retry(&fast_policy(3), &fast_limiter(), "unit", FetchError::classify, || {
        match calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(FetchError::Transport("reset".to_string())),
            1 => Err(FetchError::Status(503)),
            _ => Ok(7),
        }
    });
    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_retry_stops_on_permanent_error() {
    let calls = AtomicUsize::new(0);
    let result: Result<(), _> = with_retry(&fast_policy(3), &fast_limiter(), "unit", FetchError::classify, || {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Status(404))
    });
    assert!(matches!(result, Err(FetchError::Status(404))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_retry_budget_is_bounded() {
    let calls = AtomicUsize::new(0);
    let result: Result<(), _> = with_retry(&fast_policy(2), &fast_limiter(), "unit", FetchError::classify, || {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Status(500))
    });
    match result {
        Err(FetchError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, FetchError::Status(500)));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_retry_honors_retry_after() {
    let calls = AtomicUsize::new(0);
    let start = Instant::now();
    let result = with_retry(&fast_policy(1), &fast_limiter(), "unit", FetchError::classify, || {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(FetchError::RateLimited {
                retry_after: Some(Duration::from_millis(120)),
            })
        } else {
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(120));
}

#[test]
fn test_retry_uses_fallback_without_retry_after() {
    let calls = AtomicUsize::new(0);
    let start = Instant::now();
    let result = with_retry(&fast_policy(1), &fast_limiter(), "unit", FetchError::classify, || {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(FetchError::RateLimited { retry_after: None })
        } else {
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_custom_classifier() {
    // Treat every error as permanent
    let calls = AtomicUsize::new(0);
    let result: Result<(), _> = with_retry(&fast_policy(3), &fast_limiter(), "unit", |_| ErrorClass::Permanent, || {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Transport("down".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_retry_respects_interrupt() {
    let flag = Arc::new(AtomicBool::new(true));
    let policy = fast_policy(3).with_interrupt(flag);
    let result: Result<(), _> = with_retry(&policy, &fast_limiter(), "unit", FetchError::classify, || Ok(()));
    assert!(matches!(result, Err(FetchError::Interrupted)));
}

#[test]
fn test_interrupt_cuts_rate_limit_wait_short() {
    let flag = Arc::new(AtomicBool::new(false));
    let policy = RetryPolicy::new(3)
        .with_rate_limit_fallback(Duration::from_secs(60))
        .with_interrupt(Arc::clone(&flag));
    let calls = AtomicUsize::new(0);
    let start = Instant::now();

    let result: Result<(), _> = with_retry(&policy, &fast_limiter(), "unit", FetchError::classify, || {
        calls.fetch_add(1, Ordering::SeqCst);
        flag.store(true, Ordering::SeqCst);
        Err(FetchError::RateLimited { retry_after: None })
    });

    assert!(matches!(result, Err(FetchError::Interrupted)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_backoff_doubles() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff_for(0), Duration::from_secs(2));
    assert_eq!(policy.backoff_for(1), Duration::from_secs(4));
    assert_eq!(policy.backoff_for(2), Duration::from_secs(8));
}

#[test]
fn test_error_classification() {
    assert_eq!(FetchError::RateLimited { retry_after: None }.classify(), ErrorClass::RateLimited);
    assert_eq!(FetchError::Transport("timeout".into()).classify(), ErrorClass::Transient);
    assert_eq!(FetchError::Status(502).classify(), ErrorClass::Transient);
    assert_eq!(FetchError::Status(400).classify(), ErrorClass::Permanent);
    assert_eq!(FetchError::Decode("eof".into()).classify(), ErrorClass::Permanent);
    assert_eq!(FetchError::ServiceStatus("error".into()).classify(), ErrorClass::Permanent);
}

#[test]
fn test_response_status_mapping() {
    let throttled = HttpResponse {
        status: 429,
        retry_after: Some(Duration::from_secs(5)),
        body: String::new(),
    };
    let err = throttled.json::<serde_json::Value>().unwrap_err();
    assert!(matches!(err, FetchError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(5)));

    let broken = HttpResponse::ok("{not json");
    assert!(matches!(broken.json::<serde_json::Value>(), Err(FetchError::Decode(_))));
}

#[test]
fn test_chunking_bounds_length() {
    let prefixes: Vec<String> = (0..200).map(|i| format!("10.{}.{}.0/24", i / 256, i % 256)).collect();
    let chunks = chunk_prefixes(&prefixes, 100);

    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.join(",").len() <= 100);
    }
    let rejoined: Vec<String> = chunks.into_iter().flatten().collect();
    assert_eq!(rejoined, prefixes);
}

#[test]
fn test_chunking_counts_separators() {
    let prefixes = vec!["aaaa".to_string(), "bbbb".to_string(), "cccc".to_string()];
    // "aaaa,bbbb" is 9 characters
    assert_eq!(chunk_prefixes(&prefixes, 9).len(), 2);
    assert_eq!(chunk_prefixes(&prefixes, 8).len(), 3);
    assert_eq!(chunk_prefixes(&prefixes, 14).len(), 1);
}

#[test]
fn test_chunking_oversized_prefix() {
    let prefixes = vec!["2001:db8::/32".to_string(), "1.0.0.0/8".to_string()];
    let chunks = chunk_prefixes(&prefixes, 5);
    assert_eq!(chunks, vec![vec![prefixes[0].clone()], vec![prefixes[1].clone()]]);
    assert!(chunk_prefixes(&[], 1800).is_empty());
}

#[test]
fn test_waves_keep_order_and_isolate_failures() {
    let waves = Waves::new(3);
    let progress = Progress::hidden("test", 10);
    let outcome = waves.collect((0..10).collect(), &progress, |_, n: u32| {
        if n % 4 == 0 {
            Err(FetchError::Status(500))
        } else {
            Ok(n * 10)
        }
    });

    assert_eq!(outcome.summary.waves, 4);
    assert_eq!(outcome.summary.failed, 3);
    assert_eq!(outcome.summary.completed, 7);
    assert_eq!(outcome.results[1], Some(10));
    assert_eq!(outcome.results[4], None);
    assert_eq!(progress.completed(), 7);
    assert_eq!(progress.failed(), 3);
    assert!(progress.eta().is_some());
}

#[test]
fn test_waves_settle_before_next_wave() {
    let waves = Waves::new(4);
    let progress = Progress::hidden("test", 10);
    let in_flight = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let sizes = Mutex::new(Vec::new());

    let summary = waves
        .run(
            (0..10).collect(),
            &progress,
            |_, n: usize| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            },
            |wave| {
                assert_eq!(in_flight.load(Ordering::SeqCst), 0);
                sizes.lock().unwrap().push(wave.len());
                Ok::<(), ()>(())
            },
        )
        .unwrap();

    assert_eq!(summary.completed, 10);
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(*sizes.lock().unwrap(), vec![4, 4, 2]);
}

#[test]
fn test_waves_stop_on_interrupt() {
    let flag = Arc::new(AtomicBool::new(false));
    let waves = Waves::new(2).with_interrupt(Arc::clone(&flag));
    let progress = Progress::hidden("test", 6);
    let outcome = waves.collect((0..6).collect(), &progress, |_, n: u32| {
        flag.store(true, Ordering::SeqCst);
        Ok(n)
    });
    assert!(outcome.summary.interrupted);
    assert_eq!(outcome.summary.waves, 1);
    assert_eq!(outcome.successes().count(), 2);
}

#[test]
fn test_country_resources() {
    let transport = Arc::new(FakeTransport::new(|req, _| {
        assert!(req.url.ends_with("/country-resource-list/data.json"));
        assert_eq!(req.query_value("resource"), Some("bd"));
        assert_eq!(req.query_value("v4_format"), Some("prefix"));
        ok(json!({
            "resources": {
                "asn": ["AS100", 200, "300"],
                "ipv4": ["103.4.144.0/22", "10.0.0.0-10.0.0.255"],
                "ipv6": ["2001:db8::/32"]
            }
        }))
    }));
    let resources = client(Arc::clone(&transport)).country_resources("BD").unwrap();

    let expected: HashSet<u32> = [100, 200, 300].into_iter().collect();
    assert_eq!(resources.asns, expected);
    assert_eq!(resources.prefixes.len(), 2);
}

#[test]
fn test_service_status_is_permanent() {
    let transport = Arc::new(FakeTransport::new(|_, _| {
        Ok(HttpResponse::ok(json!({ "status": "error", "data": {} }).to_string()))
    }));
    let result = client(Arc::clone(&transport)).as_overview(174);
    assert!(matches!(result, Err(FetchError::ServiceStatus(_))));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn test_overview_retries_server_errors() {
    let transport = Arc::new(FakeTransport::new(|_, seen| {
        if seen < 2 {
            status(502)
        } else {
            ok(json!({ "holder": "COGENT-174 - Cogent Communications", "announced": true }))
        }
    }));
    let overview = client(Arc::clone(&transport)).as_overview(174).unwrap();
    assert_eq!(overview.holder.as_deref(), Some("COGENT-174 - Cogent Communications"));
    assert!(overview.announced);
    assert_eq!(transport.calls(), 3);
}

#[test]
fn test_geolocation_skips_unlocated() {
    let transport = Arc::new(FakeTransport::new(|_, _| {
        ok(json!({
            "located_resources": [
                { "locations": [
                    { "country": "SG", "city": "Singapore", "covered_percentage": 60.0, "resources": ["1.0.0.0/24"] },
                    { "country": "", "city": "", "covered_percentage": 10.0, "resources": [] }
                ]},
                { "locations": [
                    { "country": "BD", "city": "Dhaka", "covered_percentage": 30.0, "resources": ["1.0.1.0/24"] }
                ]}
            ]
        }))
    }));
    let locations = client(transport).geolocation(64500).unwrap();
    assert_eq!(locations.len(), 2);
    assert_eq!(locations[0].country, "SG");
    assert_eq!(locations[1].city, "Dhaka");
}

#[test]
fn test_fetch_routes_streams_waves() {
    let transport = Arc::new(FakeTransport::new(|req, _| {
        if resource(req).starts_with("10.0.2.") {
            return status(404);
        }
        ok(bgp_state(&[("1.0.0.0/24", "rrc00", &[174u32, 100][..])]))
    }));
    let ripestat = client(Arc::clone(&transport));
    let prefixes: Vec<ipnetwork::IpNetwork> = (0..3)
        .map(|i| format!("10.0.{}.0/24", i).parse().unwrap())
        .collect();

    let mut sunk = Vec::new();
    let summary = ripestat
        .fetch_routes(&prefixes, 12, &Waves::new(2), |records| {
            sunk.push(records.len());
            Ok::<(), ()>(())
        })
        .unwrap();

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.failed_batches, 1);
    assert_eq!(summary.records, 2);
    assert_eq!(sunk, vec![2, 0]);
    assert!(!summary.interrupted);
}

#[test]
fn test_widen_prefixes_adds_announcements() {
    let transport = Arc::new(FakeTransport::new(|req, _| match resource(req).as_str() {
        "AS100" => ok(json!({ "prefixes": [{ "prefix": "10.0.0.0/24" }, { "prefix": "10.9.0.0/24" }] })),
        _ => status(500),
    }));
    let ripestat = client(transport);
    let asns: HashSet<u32> = [100, 200].into_iter().collect();
    let base = vec!["10.0.0.0/24".parse().unwrap()];

    let widened = ripestat.widen_prefixes(&asns, base, &Waves::new(4));

    assert_eq!(widened.len(), 2);
    assert_eq!(widened[1].to_string(), "10.9.0.0/24");
}

#[test]
fn test_peeringdb_batches_and_caches_exchanges() {
    let transport = Arc::new(FakeTransport::new(|req, _| {
        if req.url.ends_with("/net") {
            assert_eq!(req.query_value("depth"), Some("2"));
            ok(json!([
                {
                    "asn": 100,
                    "netfac_set": [{ "name": "Equinix SG1", "city": "Singapore", "country": "SG" }],
                    "netixlan_set": [{ "ix_id": 7, "name": "SGIX", "speed": 10000 }]
                },
                { "asn": 174 }
            ]))
        } else {
            assert_eq!(req.query_value("id__in"), Some("7,9"));
            ok(json!([{ "id": 7, "country": "SG" }, { "id": 9, "country": "HK" }]))
        }
    }));
    let pdb = PeeringDbClient::new(transport.clone(), Arc::new(fast_limiter())).with_policy(fast_policy(0));

    let nets = pdb.networks(&[174, 100, 174]).unwrap();
    assert_eq!(nets.len(), 2);
    assert_eq!(nets[&100].facilities[0].country, "SG");
    assert_eq!(nets[&100].exchanges[0].speed, 10000);
    assert!(nets[&174].facilities.is_empty());
    let net_query = transport.requests()[0].query_value("asn__in").map(str::to_string);
    assert_eq!(net_query.as_deref(), Some("100,174"));

    let countries = pdb.exchange_countries(&[9, 7]).unwrap();
    assert_eq!(countries.get(&9).map(String::as_str), Some("HK"));
    assert_eq!(pdb.cached_exchanges(), 2);

    // Cached ids do not hit the directory again
    let again = pdb.exchange_countries(&[7]).unwrap();
    assert_eq!(again.get(&7).map(String::as_str), Some("SG"));
    assert_eq!(transport.calls_to("/ix"), 1);
}
