#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use bordergraph::fetch::{HttpRequest, HttpResponse, Transport};
use bordergraph::FetchError;

type Handler = Box<dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, FetchError> + Send + Sync>;

/// In-memory transport answering from a handler and remembering every request.
/// The handler also gets how many earlier requests hit the same endpoint.
pub struct FakeTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
    per_endpoint: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> Result<HttpResponse, FetchError> + Send + Sync + 'static,
    {
        FakeTransport {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            per_endpoint: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(endpoint))
            .count()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let seen = {
            let mut per = self.per_endpoint.lock().unwrap();
            let counter = per.entry(request.url.clone()).or_insert(0);
            let seen = *counter;
            *counter += 1;
            seen
        };
        (self.handler)(request, seen)
    }
}

pub fn ok(data: Value) -> Result<HttpResponse, FetchError> {
    Ok(HttpResponse::ok(json!({ "status": "ok", "data": data }).to_string()))
}

pub fn status(code: u16) -> Result<HttpResponse, FetchError> {
    Ok(HttpResponse {
        status: code,
        retry_after: None,
        body: String::new(),
    })
}

pub fn overview(holder: &str) -> Value {
    json!({ "holder": holder, "announced": true })
}

pub fn bgp_state(entries: &[(&str, &str, &[u32])]) -> Value {
    let state: Vec<Value> = entries
        .iter()
        .map(|(target, source, path)| json!({ "target_prefix": target, "source_id": source, "path": path }))
        .collect();
    json!({ "bgp_state": state })
}

pub fn resource(request: &HttpRequest) -> String {
    request.query_value("resource").unwrap_or_default().to_string()
}
