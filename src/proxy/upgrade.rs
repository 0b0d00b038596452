use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

/// True for `Connection: upgrade` requests that name a protocol in `Upgrade`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    wants_upgrade && headers.contains_key(header::UPGRADE)
}

/// Answer the caller with the upstream's 101 and splice the two upgraded
/// connections together once both sides have switched.
pub fn switch_protocols(downstream: OnUpgrade, upstream: reqwest::Response, request_id: String) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = upstream.headers().clone();

    tokio::spawn(async move {
        let upstream = match upstream.upgrade().await {
            Ok(io) => io,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Upstream upgrade failed");
                return;
            }
        };
        let downstream = match downstream.await {
            Ok(io) => io,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Client upgrade failed");
                return;
            }
        };

        let mut upstream = upstream;
        let mut downstream = TokioIo::new(downstream);
        match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
            Ok((to_upstream, to_client)) => {
                debug!(request_id = %request_id, to_upstream, to_client, "Upgraded connection closed")
            }
            Err(e) => debug!(request_id = %request_id, error = %e, "Upgraded connection ended with error"),
        }
    });

    response
}
