use anyhow::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("strata_connections_total", "Total client connections").unwrap()
});
pub static QUERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("strata_queries_total", "Total single-shard queries routed").unwrap()
});
pub static FANOUT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("strata_fanout_total", "Total cross-shard fan-out queries").unwrap()
});
pub static ROUTE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("strata_route_misses_total", "Keys that matched no shard range").unwrap()
});
pub static SHARD_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("strata_shard_errors_total", "Failures observed per shard"),
        &["shard"]
    )
    .unwrap()
});
pub static QUERY_LATENCY_SECS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("strata_query_latency_seconds", "End-to-end query latency in seconds")
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]);
    prometheus::register_histogram!(opts).unwrap()
});

/// Launch the Prometheus exporter HTTP server on the given address.
/// `/metrics` serves the text exposition, `/healthz` answers liveness.
/// When `basic_auth` is Some((user, pass)), `/metrics` requires the
/// matching Authorization header.
pub async fn serve(addr: &str, basic_auth: Option<(String, String)>) -> Result<()> {
    let make_svc = make_service_fn(move |_| {
        let auth = basic_auth.clone();
        async move { Ok::<_, hyper::Error>(service_fn(move |req| handler(req, auth.clone()))) }
    });
    let server = Server::bind(&addr.parse()?).serve(make_svc);
    tokio::spawn(async move {
        if let Err(e) = server.await {
            eprintln!("metrics server error: {e}");
        }
    });
    Ok(())
}

async fn handler(
    req: Request<Body>,
    auth: Option<(String, String)>,
) -> Result<Response<Body>, hyper::Error> {
    match req.uri().path() {
        "/healthz" => return Ok(Response::new(Body::from("ok"))),
        "/metrics" => {}
        _ => {
            return Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()).unwrap())
        }
    }
    if let Some((u, p)) = auth {
        let expected = format!("Basic {}", B64.encode(format!("{}:{}", u, p)));
        let presented = req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if presented != expected {
            return Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Body::empty())
                .unwrap());
        }
    }
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    Ok(Response::builder().status(StatusCode::OK).body(Body::from(buffer)).unwrap())
}
