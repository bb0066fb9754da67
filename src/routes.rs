//! Route tables of the gateway and the backend.
//!
//! | Service | Method | Path                   | Handler                           |
//! |---------|--------|------------------------|-----------------------------------|
//! | gateway | GET    | `/`                    | liveness, `OK`                    |
//! | gateway | GET    | `/core/{resource}`     | echoes `resource: <r>`            |
//! | gateway | any    | `/database/{resource}` | forwarded (only when enabled)     |
//! | backend | GET    | `/`                    | liveness, `ok..`                  |
//! | backend | GET    | `/database/{resource}` | trust decision, JSON              |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::proxy::ProxyForwarder;
use crate::server::PeerCertificates;
use crate::trust::TrustedProxyAuthenticator;

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway handler state.
#[derive(Clone, Default)]
pub struct GatewayState {
    forwarder: Option<Arc<ProxyForwarder>>,
}

/// Build the gateway router.  `/database/{resource}` exists only when a
/// forwarder is given.
pub fn gateway_router(forwarder: Option<ProxyForwarder>) -> Router {
    let forwarding = forwarder.is_some();
    let state = GatewayState {
        forwarder: forwarder.map(Arc::new),
    };

    let router = Router::new()
        .route("/", get(gateway_liveness))
        .route("/core/{resource}", get(core_resource));
    let router = if forwarding {
        router.route("/database/{resource}", any(forward_to_backend))
    } else {
        router
    };

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn gateway_liveness() -> &'static str {
    "OK"
}

async fn core_resource(Path(resource): Path<String>) -> String {
    format!("resource: {resource}\n")
}

async fn forward_to_backend(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<PeerCertificates>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(forwarder) = state.forwarder else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let caller = peer.common_name();
    let path = uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str());

    match forwarder
        .forward(method, path, &headers, body, caller.as_deref())
        .await
    {
        Ok(response) => response.into_response(),
        Err(e) => {
            error!(
                path,
                caller = caller.as_deref().unwrap_or("-"),
                error = %e,
                "Forwarding to backend failed"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "backend unavailable\n").into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Backend handler state.
#[derive(Clone)]
pub struct BackendState {
    authenticator: Arc<TrustedProxyAuthenticator>,
    username_header: HeaderName,
}

impl BackendState {
    /// State resolving callers with `authenticator`, reading the forwarded
    /// identity from `username_header`.
    #[must_use]
    pub fn new(authenticator: TrustedProxyAuthenticator, username_header: HeaderName) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
            username_header,
        }
    }
}

/// Body of `GET /database/{resource}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceView {
    /// Requested resource name.
    pub resource: String,
    /// Resolved caller identity.
    pub user: String,
    /// Label of the identity source.
    pub source: String,
}

/// Build the backend router.
pub fn backend_router(state: BackendState) -> Router {
    Router::new()
        .route("/", get(backend_liveness))
        .route("/database/{resource}", get(database_resource))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn backend_liveness() -> &'static str {
    "ok.."
}

async fn database_resource(
    State(state): State<BackendState>,
    ConnectInfo(peer): ConnectInfo<PeerCertificates>,
    Path(resource): Path<String>,
    headers: HeaderMap,
) -> Json<ResourceView> {
    let forwarded = headers
        .get(&state.username_header)
        .and_then(|v| v.to_str().ok());
    let decision = state.authenticator.authenticate(peer.chain(), forwarded);

    info!(
        resource = %resource,
        user = %decision.identity,
        source = %decision.source,
        peer_addr = %peer.remote_addr,
        "Resolved caller identity"
    );

    Json(ResourceView {
        resource,
        user: decision.identity,
        source: decision.source.label().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use crate::pki::{AltNames, CertificateAuthority, KeyRole, TrustPool};
    use crate::trust::ANONYMOUS_USER;

    fn request(uri: &str, peer: PeerCertificates) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .extension(ConnectInfo(peer))
            .body(Body::empty())
            .unwrap()
    }

    fn anonymous() -> PeerCertificates {
        PeerCertificates::anonymous("127.0.0.1:5000".parse().unwrap())
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn gateway_echoes_core_resource() {
        let response = gateway_router(None)
            .oneshot(request("/core/widgets", anonymous()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "resource: widgets\n");
    }

    #[tokio::test]
    async fn gateway_liveness_is_ok() {
        let response = gateway_router(None)
            .oneshot(request("/", anonymous()))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn database_route_absent_when_forwarding_is_off() {
        let response = gateway_router(None)
            .oneshot(request("/database/orders", anonymous()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn backend_resolves_anonymous_without_certificate() {
        // GIVEN: a backend trusting a request-header CA
        let rh = CertificateAuthority::generate("requestheader", 30).unwrap();
        let pool = TrustPool::from_der([rh.cert_der().clone()]).unwrap();
        let state = BackendState::new(
            TrustedProxyAuthenticator::new(pool),
            HeaderName::from_static("x-remote-user"),
        );

        // WHEN: a caller without a certificate claims to be root
        let mut req = request("/database/orders", anonymous());
        req.headers_mut().insert("x-remote-user", "root".parse().unwrap());
        let response = backend_router(state).oneshot(req).await.unwrap();

        // THEN: anonymous
        assert_eq!(response.status(), StatusCode::OK);
        let view: ResourceView = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            view,
            ResourceView {
                resource: "orders".to_string(),
                user: ANONYMOUS_USER.to_string(),
                source: "-".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn backend_trusts_header_from_proxy_certificate() {
        let rh = CertificateAuthority::generate("requestheader", 30).unwrap();
        let proxy = rh
            .issue(KeyRole::Client, &AltNames::dns("apiserver.rudro"), 30)
            .unwrap();
        let pool = TrustPool::from_der([rh.cert_der().clone()]).unwrap();
        let state = BackendState::new(
            TrustedProxyAuthenticator::new(pool),
            HeaderName::from_static("x-remote-user"),
        );
        let peer = PeerCertificates::new(
            "127.0.0.1:5000".parse().unwrap(),
            vec![proxy.cert_der().clone()],
        );

        let mut req = request("/database/orders", peer);
        req.headers_mut().insert("x-remote-user", "rudro".parse().unwrap());
        let response = backend_router(state).oneshot(req).await.unwrap();

        let view: ResourceView = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(view.user, "rudro");
        assert_eq!(view.source, "X-Remote-User");
    }

    #[tokio::test]
    async fn backend_liveness_is_ok() {
        let state = BackendState::new(
            TrustedProxyAuthenticator::without_proxy(),
            HeaderName::from_static("x-remote-user"),
        );
        let response = backend_router(state)
            .oneshot(request("/", anonymous()))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "ok..");
    }
}
