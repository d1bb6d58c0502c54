use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Total server-side handling time of a redirect, in milliseconds.
pub const TIMING_HEADER: &str = "x-linkpulse-timing-total-ms";

pub async fn time_redirect(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let mut response = next.run(request).await;

    if response.status().is_redirection() {
        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        response
            .headers_mut()
            .insert(TIMING_HEADER, HeaderValue::from(elapsed));
    }
    response
}
