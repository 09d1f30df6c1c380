//! Routing layer: the REST API, its route table and the token authorizer.
//!
//! Every declared route is bound to the same function and the same Cognito
//! authorizer. CORS preflight `OPTIONS` methods are generated per resource
//! and are the only unauthenticated methods in the API.

use crate::compute::Function;
use crate::identity::{ClientRegistration, UserPool};
use crate::template::{Expr, Resource, Template};
use crate::{InfraError, InfraResult, StackConfig};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Logical id of the REST API.
pub const API_ID: &str = "ItemsApi";
/// Logical id of the authorizer.
pub const AUTHORIZER_ID: &str = "ItemsApiAuthorizer";
/// Logical id of the stage.
pub const STAGE_ID: &str = "ItemsApiStage";
/// Logical id of the invoke permission.
pub const INVOKE_PERMISSION_ID: &str = "ItemsApiInvokePermission";
/// Stage name.
pub const STAGE_NAME: &str = "prod";
/// Request header carrying the bearer token.
pub const TOKEN_HEADER: &str = "Authorization";

/// Preflight cache lifetime of the default CORS policy.
pub const DEFAULT_CORS_MAX_AGE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// HTTP methods used by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl HttpMethod {
    /// Every method, as accepted by a permissive CORS policy.
    pub const ALL: [HttpMethod; 7] = [
        Self::Options,
        Self::Get,
        Self::Put,
        Self::Post,
        Self::Delete,
        Self::Patch,
        Self::Head,
    ];

    /// Upper-case spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| InfraError::invalid("HttpMethod", format!("unknown method {s:?}")))
    }
}

/// A (method, path) pair served by the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// HTTP method
    pub method: HttpMethod,
    /// Path template with `{param}` segments
    pub path: &'static str,
}

/// The fixed route table.
pub const ROUTES: [Route; 8] = [
    Route { method: HttpMethod::Post, path: "/items" },
    Route { method: HttpMethod::Get, path: "/items" },
    Route { method: HttpMethod::Get, path: "/items/{listID}" },
    Route { method: HttpMethod::Patch, path: "/items/{listID}" },
    Route { method: HttpMethod::Patch, path: "/items/{listID}/status" },
    Route { method: HttpMethod::Patch, path: "/items/{listID}/{taskID}/status" },
    Route { method: HttpMethod::Delete, path: "/items/{listID}" },
    Route { method: HttpMethod::Delete, path: "/items/{listID}/{taskID}" },
];

impl Route {
    /// Path segments without the leading slash.
    pub fn segments(&self) -> impl Iterator<Item = &'static str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Matches a concrete request, returning the bound path parameters.
    ///
    /// Literal segments beat parameters only through [`RouteTable::find`]:
    /// on its own, `/items/{listID}/{taskID}` also matches `/items/a/status`.
    pub fn matches(&self, method: HttpMethod, path: &str) -> Option<BTreeMap<String, String>> {
        if method != self.method {
            return None;
        }
        let actual: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let expected: Vec<&str> = self.segments().collect();
        if actual.len() != expected.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (pattern, value) in expected.iter().zip(actual) {
            match parameter_name(pattern) {
                Some(name) => {
                    params.insert(name.to_string(), value.to_string());
                }
                None if *pattern == value => {}
                None => return None,
            }
        }
        Some(params)
    }

    fn literal_segments(&self) -> usize {
        self.segments().filter(|s| parameter_name(s).is_none()).count()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

fn parameter_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('{').and_then(|s| s.strip_suffix('}'))
}

/// Lookup over a set of routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(ROUTES.to_vec())
    }
}

impl RouteTable {
    /// Creates a table from routes.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Routes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Looks up the route for a declared path template, as API Gateway reports it.
    pub fn route_for(&self, method: HttpMethod, resource: &str) -> Option<Route> {
        self.routes
            .iter()
            .copied()
            .find(|route| route.method == method && route.path == resource)
    }

    /// Resolves a concrete request to a route, preferring the most literal match.
    pub fn find(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Option<(Route, BTreeMap<String, String>)> {
        self.routes
            .iter()
            .filter_map(|route| route.matches(method, path).map(|params| (*route, params)))
            .max_by_key(|(route, _)| route.literal_segments())
    }
}

/// Cross-origin policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    /// Allowed origins; `*` for any
    pub allow_origins: Vec<String>,
    /// Allowed request headers; `*` for any
    pub allow_headers: Vec<String>,
    /// Allowed methods
    pub allow_methods: Vec<HttpMethod>,
    /// Preflight cache lifetime
    pub max_age: Duration,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
            allow_headers: vec!["*".to_string()],
            allow_methods: HttpMethod::ALL.to_vec(),
            max_age: DEFAULT_CORS_MAX_AGE,
        }
    }
}

impl CorsPolicy {
    /// Replaces the allowed origins.
    pub fn with_origins(mut self, origins: Vec<String>) -> Self {
        self.allow_origins = origins;
        self
    }

    /// True when any origin is accepted.
    pub fn allows_any_origin(&self) -> bool {
        self.allow_origins.iter().any(|o| o == "*")
    }

    /// True when `origin` may read responses.
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allows_any_origin() || self.allow_origins.iter().any(|o| o == origin)
    }

    /// `Access-Control-Allow-Origin` value for a request from `origin`.
    pub fn allow_origin_header(&self, origin: Option<&str>) -> Option<String> {
        if self.allows_any_origin() {
            return Some("*".to_string());
        }
        origin
            .filter(|origin| self.allows_origin(origin))
            .map(str::to_string)
    }

    /// Origin used where a single static header value is required.
    pub fn static_origin(&self) -> &str {
        if self.allows_any_origin() {
            "*"
        } else {
            self.allow_origins.first().map_or("*", String::as_str)
        }
    }

    /// Comma-joined methods.
    pub fn methods_header(&self) -> String {
        self.allow_methods
            .iter()
            .map(HttpMethod::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Comma-joined headers.
    pub fn headers_header(&self) -> String {
        self.allow_headers.join(",")
    }

    fn validate(&self) -> InfraResult<()> {
        if self.allow_origins.is_empty() {
            return Err(InfraError::invalid("CorsPolicy", "at least one origin is required"));
        }
        Ok(())
    }
}

/// How a method authenticates callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Public method
    None,
    /// Bearer token validated by the named Cognito authorizer
    CognitoUserPools {
        /// Logical id of the authorizer
        authorizer_id: String,
    },
}

impl Authorization {
    /// CloudFormation `AuthorizationType`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::CognitoUserPools { .. } => "COGNITO_USER_POOLS",
        }
    }
}

/// A route bound to the function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiMethod {
    /// Route served
    pub route: Route,
    /// Caller authentication
    pub authorization: Authorization,
}

/// Token-validating authorizer bound to the user directory.
#[derive(Debug, Clone)]
pub struct Authorizer {
    /// Logical id
    pub logical_id: String,
    /// Authorizer name
    pub name: String,
    /// User pools whose tokens are accepted
    pub provider_arns: Vec<Expr>,
    /// Client registration tokens are expected to be issued to
    pub client_id: Expr,
    /// Header carrying the token
    pub token_header: String,
}

impl Authorizer {
    /// Creates an authorizer for tokens of `client` issued by `user_pool`.
    pub fn new(config: &StackConfig, user_pool: &UserPool, client: &ClientRegistration) -> Self {
        Self {
            logical_id: AUTHORIZER_ID.to_string(),
            name: config.resource_name("authorizer"),
            provider_arns: vec![user_pool.arn()],
            client_id: client.client_id(),
            token_header: TOKEN_HEADER.to_string(),
        }
    }
}

/// The REST API fronting the function.
#[derive(Debug, Clone)]
pub struct RestApi {
    /// Logical id
    pub logical_id: String,
    /// API name
    pub name: String,
    /// Stage name
    pub stage: String,
    /// Function ARN every route integrates with
    pub function_arn: Expr,
    /// Token authorizer
    pub authorizer: Authorizer,
    /// Route bindings
    pub methods: Vec<ApiMethod>,
    /// Cross-origin policy
    pub cors: CorsPolicy,
}

impl RestApi {
    /// Declares the API binding every route in [`ROUTES`] to `function` behind the authorizer.
    pub fn new(
        config: &StackConfig,
        function: &Function,
        user_pool: &UserPool,
        client: &ClientRegistration,
    ) -> Self {
        let authorizer = Authorizer::new(config, user_pool, client);
        let methods = ROUTES
            .into_iter()
            .map(|route| ApiMethod {
                route,
                authorization: Authorization::CognitoUserPools {
                    authorizer_id: authorizer.logical_id.clone(),
                },
            })
            .collect();

        Self {
            logical_id: API_ID.to_string(),
            name: config.resource_name("api"),
            stage: STAGE_NAME.to_string(),
            function_arn: function.arn(),
            authorizer,
            methods,
            cors: config.cors.clone(),
        }
    }

    /// `Ref RestApi`, the API id.
    pub fn id(&self) -> Expr {
        Expr::reference(&self.logical_id)
    }

    /// `execute-api` ARN of this API with `suffix` appended (`stage/method/path`).
    pub fn execute_arn(&self, suffix: &str) -> Expr {
        Expr::sub(format!(
            "arn:${{AWS::Partition}}:execute-api:${{AWS::Region}}:${{AWS::AccountId}}:${{{}}}/{}",
            self.logical_id, suffix
        ))
    }

    /// Base URL of the deployed stage.
    pub fn url(&self) -> Expr {
        Expr::sub(format!(
            "https://${{{}}}.execute-api.${{AWS::Region}}.${{AWS::URLSuffix}}/{}/",
            self.logical_id, self.stage
        ))
    }

    /// Paths of every API resource implied by the routes, parents first.
    pub fn resource_paths(&self) -> Vec<String> {
        let mut paths = BTreeSet::new();
        for method in &self.methods {
            let mut current = String::new();
            for segment in method.route.segments() {
                current.push('/');
                current.push_str(segment);
                paths.insert(current.clone());
            }
        }
        let mut paths: Vec<String> = paths.into_iter().collect();
        paths.sort_by_key(|p| p.matches('/').count());
        paths
    }

    /// Adds the API and everything hanging off it to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        self.cors.validate()?;

        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::ApiGateway::RestApi",
                json!({
                    "Name": self.name,
                    "Description": "Task lists API",
                    "EndpointConfiguration": { "Types": ["REGIONAL"] },
                }),
            ),
        )?;

        template.add_resource(
            &self.authorizer.logical_id,
            Resource::new(
                "AWS::ApiGateway::Authorizer",
                json!({
                    "Name": self.authorizer.name,
                    "RestApiId": self.id(),
                    "Type": "COGNITO_USER_POOLS",
                    "IdentitySource":
                        format!("method.request.header.{}", self.authorizer.token_header),
                    "ProviderARNs": self.authorizer.provider_arns,
                }),
            ),
        )?;

        for path in self.resource_paths() {
            let (parent, part) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
            template.add_resource(
                &resource_logical_id(&self.logical_id, &path),
                Resource::new(
                    "AWS::ApiGateway::Resource",
                    json!({
                        "RestApiId": self.id(),
                        "ParentId": self.resource_ref(parent),
                        "PathPart": part,
                    }),
                ),
            )?;
        }

        let integration_uri = Expr::sub(format!(
            "arn:${{AWS::Partition}}:apigateway:${{AWS::Region}}:lambda:\
             path/2015-03-31/functions/{}/invocations",
            match &self.function_arn {
                Expr::GetAtt(id, attribute) => format!("${{{id}.{attribute}}}"),
                _ => {
                    return Err(InfraError::invalid(
                        "FunctionArn",
                        "must be a GetAtt of the function",
                    ))
                }
            }
        ));

        let mut method_ids = Vec::new();
        let mut fingerprint = Sha256::new();
        for method in &self.methods {
            let logical_id = method_logical_id(&self.logical_id, &method.route);
            let mut properties = json!({
                "RestApiId": self.id(),
                "ResourceId": self.resource_ref(method.route.path),
                "HttpMethod": method.route.method.as_str(),
                "AuthorizationType": method.authorization.as_str(),
                "Integration": {
                    "Type": "AWS_PROXY",
                    "IntegrationHttpMethod": "POST",
                    "Uri": integration_uri,
                },
            });
            if let Authorization::CognitoUserPools { authorizer_id } = &method.authorization {
                properties["AuthorizerId"] = json!(Expr::reference(authorizer_id));
            }
            fingerprint.update(logical_id.as_bytes());
            fingerprint.update(serde_json::to_vec(&properties)?);

            template.add_resource(
                &logical_id,
                Resource::new("AWS::ApiGateway::Method", properties),
            )?;
            method_ids.push(logical_id);
        }

        for path in self.resource_paths() {
            let logical_id = format!("{}Options", resource_logical_id(&self.logical_id, &path));
            let properties = self.preflight_method(&path);
            fingerprint.update(logical_id.as_bytes());
            fingerprint.update(serde_json::to_vec(&properties)?);
            template.add_resource(
                &logical_id,
                Resource::new("AWS::ApiGateway::Method", properties),
            )?;
            method_ids.push(logical_id);
        }

        let gateway_responses = [("Default4xx", "DEFAULT_4XX"), ("Default5xx", "DEFAULT_5XX")];
        for (suffix, response_type) in gateway_responses {
            template.add_resource(
                &format!("{}{}", self.logical_id, suffix),
                Resource::new(
                    "AWS::ApiGateway::GatewayResponse",
                    json!({
                        "RestApiId": self.id(),
                        "ResponseType": response_type,
                        "ResponseParameters": self.gateway_cors_headers(),
                    }),
                ),
            )?;
        }

        let digest = format!("{:x}", fingerprint.finalize());
        let deployment_id = format!("{}Deployment{}", self.logical_id, &digest[..8]);
        template.add_resource(
            &deployment_id,
            Resource::new(
                "AWS::ApiGateway::Deployment",
                json!({ "RestApiId": self.id(), "Description": "Task lists API deployment" }),
            )
            .depends_on(method_ids),
        )?;

        template.add_resource(
            STAGE_ID,
            Resource::new(
                "AWS::ApiGateway::Stage",
                json!({
                    "RestApiId": self.id(),
                    "DeploymentId": Expr::reference(&deployment_id),
                    "StageName": self.stage,
                }),
            ),
        )?;

        template.add_resource(
            INVOKE_PERMISSION_ID,
            Resource::new(
                "AWS::Lambda::Permission",
                json!({
                    "Action": "lambda:InvokeFunction",
                    "FunctionName": self.function_arn,
                    "Principal": "apigateway.amazonaws.com",
                    "SourceArn": self.execute_arn("*/*/*"),
                }),
            ),
        )
    }

    fn resource_ref(&self, path: &str) -> Expr {
        if path.is_empty() || path == "/" {
            Expr::get_att(&self.logical_id, "RootResourceId")
        } else {
            Expr::reference(resource_logical_id(&self.logical_id, path))
        }
    }

    fn preflight_method(&self, path: &str) -> Value {
        let origin = self.cors.static_origin();
        let header = |name: &str| format!("method.response.header.{name}");

        let mut response_parameters = Map::new();
        response_parameters.insert(
            header("Access-Control-Allow-Headers"),
            json!(format!("'{}'", self.cors.headers_header())),
        );
        response_parameters.insert(
            header("Access-Control-Allow-Origin"),
            json!(format!("'{origin}'")),
        );
        response_parameters.insert(
            header("Access-Control-Allow-Methods"),
            json!(format!("'{}'", self.cors.methods_header())),
        );
        response_parameters.insert(
            header("Access-Control-Max-Age"),
            json!(format!("'{}'", self.cors.max_age.as_secs())),
        );
        if !self.cors.allows_any_origin() {
            response_parameters.insert(header("Vary"), json!("'Origin'"));
        }

        let declared: Map<String, Value> = response_parameters
            .keys()
            .map(|key| (key.clone(), Value::Bool(true)))
            .collect();

        let mut integration_response = json!({
            "StatusCode": "204",
            "ResponseParameters": Value::Object(response_parameters),
        });
        if self.cors.allow_origins.len() > 1 && !self.cors.allows_any_origin() {
            integration_response["ResponseTemplates"] = json!({
                "application/json": self.origin_template(),
            });
        }

        json!({
            "RestApiId": self.id(),
            "ResourceId": self.resource_ref(path),
            "HttpMethod": HttpMethod::Options.as_str(),
            "AuthorizationType": Authorization::None.as_str(),
            "Integration": {
                "Type": "MOCK",
                "RequestTemplates": { "application/json": "{ statusCode: 200 }" },
                "IntegrationResponses": [integration_response],
            },
            "MethodResponses": [{
                "StatusCode": "204",
                "ResponseParameters": Value::Object(declared),
            }],
        })
    }

    /// Velocity template echoing the request origin when it is on the allow list.
    fn origin_template(&self) -> String {
        let condition = self
            .cors
            .allow_origins
            .iter()
            .map(|o| format!("$origin == \"{o}\""))
            .collect::<Vec<_>>()
            .join(" || ");
        format!(
            "#set($origin = $input.params().header.get(\"Origin\"))\n\
             #if($origin == \"\") #set($origin = $input.params().header.get(\"origin\")) #end\n\
             #if({condition})\n  \
             #set($context.responseOverride.header.Access-Control-Allow-Origin = $origin)\n\
             #end"
        )
    }

    fn gateway_cors_headers(&self) -> Value {
        let origin = format!("'{}'", self.cors.static_origin());
        let headers = format!("'{}'", self.cors.headers_header());
        json!({
            "gatewayresponse.header.Access-Control-Allow-Origin": origin,
            "gatewayresponse.header.Access-Control-Allow-Headers": headers,
        })
    }
}

/// `ItemsApi` + `/items/{listID}/status` → `ItemsApiItemsListIDStatus`.
pub fn resource_logical_id(api_id: &str, path: &str) -> String {
    let mut id = api_id.to_string();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let cleaned: String = segment.chars().filter(char::is_ascii_alphanumeric).collect();
        let mut chars = cleaned.chars();
        if let Some(first) = chars.next() {
            id.push(first.to_ascii_uppercase());
            id.push_str(chars.as_str());
        }
    }
    id
}

/// Logical id of the method serving `route`.
pub fn method_logical_id(api_id: &str, route: &Route) -> String {
    let method = route.method.as_str();
    let mut name = method[..1].to_string();
    name.push_str(&method[1..].to_ascii_lowercase());
    format!("{}{}", resource_logical_id(api_id, route.path), name)
}
