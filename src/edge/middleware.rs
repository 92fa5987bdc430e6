use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const LATENCY_HEADER: &str = "x-edge-latency-ms";

/// Stamp every response with the time spent inside the router
pub async fn track_latency(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    response
        .headers_mut()
        .insert(LATENCY_HEADER, HeaderValue::from(latency_ms));
    response
}
