//! Post-deploy checks against live resources.
//!
//! Each check turns what the AWS APIs report into a list of problems. The
//! checks themselves are plain functions over the reported values so they
//! can be tested without an account.

use anyhow::{Context, Result};
use aws_config::SdkConfig;
use infra::api::RouteTable;
use infra::compute::{is_placeholder, FUNCTION_TIMEOUT, REQUIRED_ENV};
use infra::table::{PARTITION_KEY, SORT_KEY};
use infra::StackOutputs;
use serde_json::Value;
use std::collections::HashMap;

/// Authorization type every declared route must use.
pub const COGNITO_AUTHORIZATION: &str = "COGNITO_USER_POOLS";

/// Problems found on one resource.
#[derive(Debug, Default)]
pub struct Verification {
    pub problems: Vec<String>,
}

impl Verification {
    fn push(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }

    fn extend(&mut self, problems: Vec<String>) {
        self.problems.extend(problems);
    }

    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Checks the deployed function configuration.
pub fn check_function(
    timeout_secs: Option<i32>,
    variables: &HashMap<String, String>,
) -> Vec<String> {
    let mut problems = Vec::new();

    let expected = FUNCTION_TIMEOUT.as_secs() as i32;
    match timeout_secs {
        Some(t) if t == expected => {}
        Some(t) => problems.push(format!("function timeout is {t}s, expected {expected}s")),
        None => problems.push("function timeout is not reported".to_string()),
    }

    for name in REQUIRED_ENV {
        match variables.get(name) {
            None => problems.push(format!("function environment lacks {name}")),
            Some(value) if is_placeholder(name, value) => {
                problems.push(format!("function environment {name}={value:?} is a placeholder"))
            }
            Some(_) => {}
        }
    }

    problems
}

/// Checks every deployed `(path, method) -> authorization type` entry, then
/// that each declared route is present.
pub fn check_routes(deployed: &HashMap<(String, String), String>) -> Vec<String> {
    let mut problems: Vec<String> = deployed
        .iter()
        .filter(|(_, kind)| kind.as_str() != COGNITO_AUTHORIZATION)
        .map(|((path, method), kind)| format!("route {method} {path} uses authorization {kind}"))
        .collect();
    problems.sort();

    problems.extend(RouteTable::default().iter().filter_map(|route| {
        let key = (route.path.to_string(), route.method.as_str().to_string());
        (!deployed.contains_key(&key)).then(|| format!("route {route} is not deployed"))
    }));
    problems
}

/// Checks the table key schema `(attribute, key type)` and billing mode.
pub fn check_table(key_schema: &[(String, String)], billing_mode: Option<&str>) -> Vec<String> {
    let mut problems = Vec::new();
    let expected = [
        (PARTITION_KEY.to_string(), "HASH".to_string()),
        (SORT_KEY.to_string(), "RANGE".to_string()),
    ];
    if key_schema != expected {
        problems.push(format!("table key schema is {key_schema:?}, expected {expected:?}"));
    }
    if billing_mode != Some("PAY_PER_REQUEST") {
        problems.push(format!(
            "table billing mode is {}, expected PAY_PER_REQUEST",
            billing_mode.unwrap_or("PROVISIONED")
        ));
    }
    problems
}

fn as_strings(value: Option<&Value>) -> Vec<&str> {
    match value {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Checks one inline policy document for data-store grants on any resource.
pub fn check_policy_document(policy_name: &str, document: &str) -> Result<Vec<String>> {
    let document: Value = serde_json::from_str(document)
        .with_context(|| format!("Failed to parse policy document {policy_name}"))?;

    let statements = match document.get("Statement") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(statement) => vec![statement],
        None => Vec::new(),
    };

    let mut problems = Vec::new();
    for statement in statements {
        if statement.get("Effect").and_then(Value::as_str) != Some("Allow") {
            continue;
        }
        let actions = as_strings(statement.get("Action"));
        let resources = as_strings(statement.get("Resource"));
        let data_store = actions
            .iter()
            .any(|a| *a == "*" || a.to_ascii_lowercase().starts_with("dynamodb:"));
        if data_store && resources.contains(&"*") {
            problems.push(format!(
                "policy {policy_name} grants {} on every resource",
                actions.join(", ")
            ));
        }
    }
    Ok(problems)
}

/// Runs every check against the deployed stack.
pub async fn verify_deployment(config: &SdkConfig, outputs: &StackOutputs) -> Result<Verification> {
    let mut verification = Verification::default();

    println!("🔎 Checking function {}...", outputs.function_name());
    let lambda = aws_sdk_lambda::Client::new(config);
    let function = lambda
        .get_function_configuration()
        .function_name(outputs.function_name())
        .send()
        .await
        .context("Failed to describe function")?;
    let variables = function
        .environment()
        .and_then(|e| e.variables())
        .cloned()
        .unwrap_or_default();
    verification.extend(check_function(function.timeout(), &variables));

    match outputs.api_id() {
        Some(api_id) => {
            println!("🔎 Checking routes of API {api_id}...");
            let deployed = deployed_methods(config, api_id).await?;
            verification.extend(check_routes(&deployed));
        }
        None => verification.push(format!("cannot read API id from {}", outputs.api_url)),
    }

    match &outputs.table_name {
        Some(table_name) => {
            println!("🔎 Checking table {table_name}...");
            let dynamodb = aws_sdk_dynamodb::Client::new(config);
            let described = dynamodb
                .describe_table()
                .table_name(table_name)
                .send()
                .await
                .context("Failed to describe table")?;
            let table = described.table().context("Table description is empty")?;
            let key_schema: Vec<(String, String)> = table
                .key_schema()
                .iter()
                .map(|k| (k.attribute_name().to_string(), k.key_type().as_str().to_string()))
                .collect();
            let billing = table
                .billing_mode_summary()
                .and_then(|b| b.billing_mode())
                .map(|m| m.as_str());
            verification.extend(check_table(&key_schema, billing));
        }
        None => verification.push("stack does not report a table name"),
    }

    println!("🔎 Checking role {}...", outputs.execution_role_name());
    let iam = aws_sdk_iam::Client::new(config);
    let role_name = outputs.execution_role_name();
    let policies = iam
        .list_role_policies()
        .role_name(role_name)
        .send()
        .await
        .context("Failed to list role policies")?;
    for policy_name in policies.policy_names() {
        let policy = iam
            .get_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
            .with_context(|| format!("Failed to read policy {policy_name}"))?;
        let document = urlencoding::decode(policy.policy_document())
            .with_context(|| format!("Failed to decode policy {policy_name}"))?;
        verification.extend(check_policy_document(policy_name, &document)?);
    }

    Ok(verification)
}

async fn deployed_methods(
    config: &SdkConfig,
    api_id: &str,
) -> Result<HashMap<(String, String), String>> {
    let client = aws_sdk_apigateway::Client::new(config);
    let resources = client
        .get_resources()
        .rest_api_id(api_id)
        .limit(500)
        .send()
        .await
        .context("Failed to list API resources")?;

    let mut deployed = HashMap::new();
    for resource in resources.items() {
        let (Some(path), Some(resource_id)) = (resource.path(), resource.id()) else {
            continue;
        };
        let methods = resource.resource_methods().map(|m| m.keys().cloned().collect::<Vec<_>>());
        for method in methods.unwrap_or_default() {
            if method == "OPTIONS" {
                continue;
            }
            let described = client
                .get_method()
                .rest_api_id(api_id)
                .resource_id(resource_id)
                .http_method(&method)
                .send()
                .await
                .with_context(|| format!("Failed to describe {method} {path}"))?;
            deployed.insert(
                (path.to_string(), method),
                described.authorization_type().unwrap_or("NONE").to_string(),
            );
        }
    }
    Ok(deployed)
}
