//! Local HTTP server mirroring the deployed API.
//!
//! The router is built from the same route table the stack deploys, guarded
//! by the token middleware, with the same CORS policy and the function's
//! 10-second limit as a request timeout.

use crate::authorizer::{require_token, TokenVerifier};
use crate::errors::ApiError;
use crate::handlers::{Caller, ListService, Reply};
use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodFilter, MethodRouter};
use axum::{middleware, Json, Router};
use http::{HeaderName, HeaderValue, Method, StatusCode, Uri};
use infra::api::{CorsPolicy, HttpMethod, Route, ROUTES};
use infra::compute::{ENV_CORS_ALLOW_ORIGINS, FUNCTION_TIMEOUT};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::warn;

/// Default listen address of the local server.
pub const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1:3000";

/// Settings that only exist for local runs.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Client id tokens must be issued to
    pub client_id: String,
    /// HS256 secret of locally minted tokens
    pub jwt_secret: Option<String>,
    /// PEM public key of RS256 tokens
    pub jwt_public_key_pem: Option<String>,
    /// Keep records in memory instead of the table
    pub memory_store: bool,
}

impl LocalConfig {
    /// Reads `LOCAL_ADDR`, `USER_POOL_CLIENT_ID`, `LOCAL_JWT_SECRET`,
    /// `LOCAL_JWT_PUBLIC_KEY` and `LOCAL_STORE` (`memory` or `dynamodb`).
    pub fn from_env() -> Result<Self, ApiError> {
        let addr = env::var("LOCAL_ADDR")
            .unwrap_or_else(|_| DEFAULT_LOCAL_ADDR.to_string())
            .parse()
            .map_err(|e| ApiError::Internal(format!("Invalid LOCAL_ADDR: {e}")))?;
        let client_id = env::var("USER_POOL_CLIENT_ID").map_err(|_| {
            ApiError::Internal("Missing environment variable USER_POOL_CLIENT_ID".to_string())
        })?;
        let memory_store = match env::var("LOCAL_STORE").as_deref() {
            Ok("dynamodb") => false,
            Ok("memory") | Err(_) => true,
            Ok(other) => {
                return Err(ApiError::Internal(format!(
                    "Invalid LOCAL_STORE {other:?}, expected memory or dynamodb"
                )))
            }
        };

        Ok(Self {
            addr,
            client_id,
            jwt_secret: env::var("LOCAL_JWT_SECRET").ok(),
            jwt_public_key_pem: env::var("LOCAL_JWT_PUBLIC_KEY").ok(),
            memory_store,
        })
    }

    /// Token verifier for tokens from `issuer`.
    pub fn verifier(&self, issuer: &str) -> Result<TokenVerifier, ApiError> {
        match (&self.jwt_public_key_pem, &self.jwt_secret) {
            (Some(pem), _) => TokenVerifier::rs256(issuer, &self.client_id, pem.as_bytes()),
            (None, Some(secret)) => {
                Ok(TokenVerifier::hs256(issuer, &self.client_id, secret.as_bytes()))
            }
            (None, None) => Err(ApiError::Internal(
                "Set LOCAL_JWT_PUBLIC_KEY or LOCAL_JWT_SECRET to validate tokens locally"
                    .to_string(),
            )),
        }
    }
}

/// CORS policy from `CORS_ALLOW_ORIGINS`, permissive when unset.
pub fn cors_from_env() -> CorsPolicy {
    match env::var(ENV_CORS_ALLOW_ORIGINS) {
        Ok(origins) if !origins.trim().is_empty() => CorsPolicy::default().with_origins(
            origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => CorsPolicy::default(),
    }
}

/// tower-http layer enforcing `policy`.
pub fn cors_layer(policy: &CorsPolicy) -> CorsLayer {
    let origin = if policy.allows_any_origin() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(policy.allow_origins.iter().filter_map(|o| {
            o.parse::<HeaderValue>()
                .inspect_err(|e| warn!("Ignoring invalid CORS origin '{}': {}", o, e))
                .ok()
        }))
    };

    let headers = if policy.allow_headers.iter().any(|h| h == "*") {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(
            policy
                .allow_headers
                .iter()
                .filter_map(|h| h.parse::<HeaderName>().ok()),
        )
    };

    let methods = AllowMethods::list(
        policy
            .allow_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_str().as_bytes()).ok()),
    );

    CorsLayer::new()
        .allow_origin(origin)
        .allow_headers(headers)
        .allow_methods(methods)
        .max_age(policy.max_age)
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Delete => MethodFilter::DELETE,
        HttpMethod::Head => MethodFilter::HEAD,
        HttpMethod::Options => MethodFilter::OPTIONS,
    }
}

/// Percent-decodes captured path parameters.
pub fn decode_params(
    params: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ApiError> {
    params
        .into_iter()
        .map(|(name, value)| {
            let decoded = urlencoding::decode(&value).map_err(|_| {
                ApiError::BadRequest(format!("Path parameter {name} is not valid UTF-8"))
            })?;
            Ok((name, decoded.into_owned()))
        })
        .collect()
}

async fn route_handler(
    route: Route,
    service: ListService,
    caller: Caller,
    uri: Uri,
    body: String,
) -> Response {
    let captured = route.matches(route.method, uri.path()).unwrap_or_default();
    let params = match decode_params(captured) {
        Ok(params) => params,
        Err(err) => return err.into_response(),
    };
    let body = (!body.is_empty()).then_some(body);

    match service.dispatch(&route, &params, &caller, body.as_deref()).await {
        Ok(Reply { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            match body {
                Some(body) => (status, Json(body)).into_response(),
                None => status.into_response(),
            }
        }
        Err(err) => err.into_response(),
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Creates the router: every API route behind the token middleware, plus `/health`.
pub fn create_app(service: ListService, verifier: Arc<TokenVerifier>, cors: &CorsPolicy) -> Router {
    let mut methods: BTreeMap<&'static str, MethodRouter<ListService>> = BTreeMap::new();
    for route in ROUTES {
        let handler = move |State(service): State<ListService>,
                            Extension(caller): Extension<Caller>,
                            uri: Uri,
                            body: String| async move {
            route_handler(route, service, caller, uri, body).await
        };
        let entry = methods.remove(route.path).unwrap_or_else(MethodRouter::new);
        methods.insert(route.path, entry.on(method_filter(route.method), handler));
    }

    let mut router = Router::new();
    for (path, method_router) in methods {
        router = router.route(path, method_router);
    }

    router
        .route_layer(middleware::from_fn_with_state(verifier, require_token))
        .route("/health", get(health_handler))
        .layer(cors_layer(cors))
        .layer(TimeoutLayer::new(FUNCTION_TIMEOUT))
        .with_state(service)
}
