//! API Gateway REST proxy integration.
//!
//! Requests reach the function only after the Cognito authorizer accepted the
//! token; the authorizer forwards the token claims in the request context.
//! A request without a `sub` claim is answered with 401 before any handler
//! or store call.

use crate::errors::ApiError;
use crate::handlers::{Caller, ListService, Reply};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use infra::api::{CorsPolicy, HttpMethod, RouteTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Incoming proxy event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub http_method: String,
    /// Declared resource path, e.g. `/items/{listID}`
    #[serde(default)]
    pub resource: String,
    /// Concrete request path
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub path_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
    #[serde(default)]
    pub request_context: RequestContext,
}

/// `requestContext` of a proxy event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub authorizer: Option<AuthorizerContext>,
}

/// What the authorizer forwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizerContext {
    #[serde(default)]
    pub claims: Option<HashMap<String, Value>>,
}

/// Proxy response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl ProxyRequest {
    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    /// Caller identity from the authorizer claims.
    pub fn caller(&self) -> Result<Caller, ApiError> {
        let claims = self
            .request_context
            .authorizer
            .as_ref()
            .and_then(|a| a.claims.as_ref())
            .ok_or_else(|| ApiError::Unauthorized("Missing authorizer claims".to_string()))?;

        let sub = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Unauthorized("Missing sub claim".to_string()))?;
        let email = claims.get("email").and_then(Value::as_str).map(str::to_string);
        Caller::new(sub, email)
    }

    /// Decoded request body.
    pub fn decoded_body(&self) -> Result<Option<String>, ApiError> {
        match &self.body {
            None => Ok(None),
            Some(body) if self.is_base64_encoded => {
                let bytes = STANDARD
                    .decode(body)
                    .map_err(|e| ApiError::BadRequest(format!("Invalid base64 body: {e}")))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| ApiError::BadRequest("Body is not valid UTF-8".to_string()))
            }
            Some(body) => Ok(Some(body.clone())),
        }
    }
}

/// Serves one proxy event. Never fails: every error becomes an error response.
pub async fn handle_event(
    service: &ListService,
    cors: &CorsPolicy,
    request: ProxyRequest,
) -> ProxyResponse {
    let origin = request.header("origin").map(str::to_string);
    let request_id = request.request_context.request_id.clone().unwrap_or_default();
    debug!(
        request_id = %request_id,
        method = %request.http_method,
        path = %request.path,
        "Received proxy event"
    );

    let result = serve(service, &request).await;
    let (status, body) = match result {
        Ok(Reply { status, body }) => (status, body.map(|b| b.to_string()).unwrap_or_default()),
        Err(err) => (err.status(), err.to_body().to_string()),
    };

    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    if let Some(allowed) = cors.allow_origin_header(origin.as_deref()) {
        headers.insert("Access-Control-Allow-Origin".to_string(), allowed);
        if !cors.allows_any_origin() {
            headers.insert("Vary".to_string(), "Origin".to_string());
        }
    }

    ProxyResponse {
        status_code: status,
        headers,
        body,
        is_base64_encoded: false,
    }
}

async fn serve(service: &ListService, request: &ProxyRequest) -> Result<Reply, ApiError> {
    let caller = request.caller().inspect_err(|e| {
        warn!(path = %request.path, "Rejected request without identity: {e}");
    })?;

    let method: HttpMethod = request
        .http_method
        .parse()
        .map_err(|_| ApiError::NotFound(format!("Unsupported method {}", request.http_method)))?;

    let table = RouteTable::default();
    let (route, params) = match table.route_for(method, &request.resource) {
        Some(route) => {
            let params: BTreeMap<String, String> = request
                .path_parameters
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            (route, params)
        }
        None => table
            .find(method, &request.path)
            .ok_or_else(|| ApiError::NotFound(format!("No route for {method} {}", request.path)))?,
    };

    let body = request.decoded_body()?;
    service.dispatch(&route, &params, &caller, body.as_deref()).await
}
