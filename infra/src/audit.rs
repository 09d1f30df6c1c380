//! Static policy assertions over a wired [`Stack`].
//!
//! The audit runs before anything is deployed. Each rule inspects the typed
//! resource graph; the trust policy rule goes further and evaluates the
//! policy against sample tokens instead of pattern-matching its JSON.

use crate::api::{Authorization, ROUTES};
use crate::compute::{FUNCTION_TIMEOUT, REQUIRED_ENV};
use crate::iam::{
    Principal, Role, TokenContext, ASSUME_WITH_WEB_IDENTITY, AMR_CONDITION_KEY, AUD_CONDITION_KEY,
    DATA_STORE_ACTIONS, IDENTITY_FEDERATION_PRINCIPAL,
};
use crate::identity::PasswordPolicy;
use crate::stack::Stack;
use crate::template::Bindings;
use crate::{InfraError, InfraResult};
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

const AUDITED_POOL: &str = "audit-region:00000000-0000-0000-0000-000000000001";
const FOREIGN_POOL: &str = "audit-region:ffffffff-ffff-ffff-ffff-ffffffffffff";

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Worth a look
    Warning,
    /// Blocks deployment
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// Audit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// A route is reachable without the token authorizer
    RouteWithoutAuthorizer,
    /// Data store actions are granted beyond the items table
    TableGrantNotScoped,
    /// Password policy is weaker than the baseline
    WeakPasswordPolicy,
    /// The authenticated role can be assumed with foreign or guest tokens
    TrustPolicyUnscoped,
    /// A function environment value is a placeholder
    PlaceholderEnvironment,
    /// `*` action on `*` resource
    WildcardGrant,
    /// Service-wide identity management access
    BroadIdentityAdmin,
    /// The identity pool hands out guest credentials
    UnauthenticatedIdentities,
    /// Any origin may read API responses
    PermissiveCors,
    /// Function timeout differs from the declared limit
    ComputeTimeout,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One audit result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Rule that fired
    pub rule: Rule,
    /// Severity
    pub severity: Severity,
    /// Logical id of the offending resource
    pub resource: String,
    /// Explanation
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} on {}: {}", self.severity, self.rule, self.resource, self.message)
    }
}

/// All findings of one audit run.
#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    /// Findings in rule order
    pub findings: Vec<Finding>,
}

impl AuditReport {
    fn push(&mut self, rule: Rule, severity: Severity, resource: &str, message: impl Into<String>) {
        self.findings.push(Finding {
            rule,
            severity,
            resource: resource.to_string(),
            message: message.into(),
        });
    }

    /// Error-severity findings.
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    /// Warning-severity findings.
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    /// True when no error was found.
    pub fn is_clean(&self) -> bool {
        self.errors().next().is_none()
    }

    /// True when `rule` fired.
    pub fn has(&self, rule: Rule) -> bool {
        self.findings.iter().any(|f| f.rule == rule)
    }

    /// Fails with [`InfraError::AuditFailed`] when errors were found.
    pub fn into_result(self) -> InfraResult<Self> {
        match self.errors().count() {
            0 => Ok(self),
            n => Err(InfraError::AuditFailed(n)),
        }
    }
}

/// Runs every rule against `stack`.
pub fn audit(stack: &Stack) -> AuditReport {
    let mut report = AuditReport::default();

    check_routes(stack, &mut report);
    check_table_grant(stack, &mut report);
    check_password_policy(stack, &mut report);
    check_trust_policy(stack, &mut report);
    check_environment(stack, &mut report);
    check_wildcards(&stack.execution_role, &mut report);
    check_wildcards(&stack.authenticated_role, &mut report);
    check_identity_admin(stack, &mut report);
    check_identity_pool(stack, &mut report);
    check_cors(stack, &mut report);
    check_timeout(stack, &mut report);

    for Finding { rule, severity, resource, message } in &report.findings {
        match severity {
            Severity::Error => warn!(rule = %rule, resource = %resource, "{message}"),
            Severity::Warning => info!(rule = %rule, resource = %resource, "{message}"),
        }
    }
    report
}

fn check_routes(stack: &Stack, report: &mut AuditReport) {
    let api = &stack.api;
    let expected = Authorization::CognitoUserPools {
        authorizer_id: api.authorizer.logical_id.clone(),
    };

    let mut seen = HashSet::new();
    for method in &api.methods {
        let route = method.route;
        if method.authorization != expected {
            report.push(
                Rule::RouteWithoutAuthorizer,
                Severity::Error,
                &api.logical_id,
                format!("route {route} does not use authorizer {}", api.authorizer.logical_id),
            );
        }
        if !seen.insert(route) {
            report.push(
                Rule::RouteWithoutAuthorizer,
                Severity::Error,
                &api.logical_id,
                format!("route {route} is declared more than once"),
            );
        }
    }

    for route in ROUTES {
        if !seen.contains(&route) {
            report.push(
                Rule::RouteWithoutAuthorizer,
                Severity::Error,
                &api.logical_id,
                format!("route {route} is not declared"),
            );
        }
    }

    if !api.authorizer.provider_arns.contains(&stack.user_pool.arn()) {
        report.push(
            Rule::RouteWithoutAuthorizer,
            Severity::Error,
            &api.authorizer.logical_id,
            "authorizer does not trust this stack's user pool",
        );
    }
}

fn check_table_grant(stack: &Stack, report: &mut AuditReport) {
    let role = &stack.execution_role;
    let table_arn = stack.table.arn();

    for statement in role.statements() {
        let touches_data = statement
            .actions
            .iter()
            .any(|a| a.to_ascii_lowercase().starts_with("dynamodb:") || a == "*");
        if touches_data && statement.resources.iter().any(|r| *r != table_arn) {
            report.push(
                Rule::TableGrantNotScoped,
                Severity::Error,
                &role.logical_id,
                format!(
                    "statement {} grants data store actions beyond table {}",
                    statement.sid.as_deref().unwrap_or("<unnamed>"),
                    stack.table.logical_id
                ),
            );
        }
    }

    for action in DATA_STORE_ACTIONS {
        let granted = role
            .statements()
            .any(|s| s.matches_action(action) && s.resources.contains(&table_arn));
        if !granted {
            report.push(
                Rule::TableGrantNotScoped,
                Severity::Error,
                &role.logical_id,
                format!("{action} is not granted on table {}", stack.table.logical_id),
            );
        }
    }
}

fn check_password_policy(stack: &Stack, report: &mut AuditReport) {
    let policy = &stack.user_pool.password_policy;
    if !policy.is_at_least(&PasswordPolicy::default()) {
        report.push(
            Rule::WeakPasswordPolicy,
            Severity::Error,
            &stack.user_pool.logical_id,
            format!(
                "policy (min length {}) is weaker than length 8 with all character classes",
                policy.min_length
            ),
        );
    }
}

fn check_trust_policy(stack: &Stack, report: &mut AuditReport) {
    let role = &stack.authenticated_role;
    let policy = &role.assume_role_policy;
    let bindings = Bindings::new().with_ref(&stack.identity_pool.logical_id, AUDITED_POOL);
    let federated = Principal::Federated(IDENTITY_FEDERATION_PRINCIPAL.to_string());
    let assume = |context: &TokenContext| {
        policy.allows_assume(&federated, ASSUME_WITH_WEB_IDENTITY, context, &bindings)
    };

    let samples = [
        (
            TokenContext::web_identity(FOREIGN_POOL, &["authenticated"]),
            "token from a foreign identity pool",
        ),
        (
            TokenContext::web_identity(AUDITED_POOL, &["unauthenticated"]),
            "guest token",
        ),
        (
            TokenContext::new().with(AUD_CONDITION_KEY, &[AUDITED_POOL]),
            "token without authentication method claim",
        ),
        (
            TokenContext::new().with(AMR_CONDITION_KEY, &["authenticated"]),
            "token without audience",
        ),
    ];
    for (context, description) in &samples {
        if assume(context) {
            report.push(
                Rule::TrustPolicyUnscoped,
                Severity::Error,
                &role.logical_id,
                format!("role can be assumed with a {description}"),
            );
        }
    }

    if !assume(&TokenContext::web_identity(AUDITED_POOL, &["authenticated"])) {
        report.push(
            Rule::TrustPolicyUnscoped,
            Severity::Error,
            &role.logical_id,
            "role cannot be assumed by authenticated identities of this pool",
        );
    }
}

fn check_environment(stack: &Stack, report: &mut AuditReport) {
    let function = &stack.function;
    for name in REQUIRED_ENV {
        if !function.environment.contains_key(name) {
            report.push(
                Rule::PlaceholderEnvironment,
                Severity::Error,
                &function.logical_id,
                format!("{name} is not set"),
            );
        }
    }
    for (name, value) in function.placeholder_variables() {
        report.push(
            Rule::PlaceholderEnvironment,
            Severity::Error,
            &function.logical_id,
            format!("{name} holds placeholder value {value:?}"),
        );
    }
}

fn check_wildcards(role: &Role, report: &mut AuditReport) {
    for statement in role.statements() {
        if statement.has_wildcard_action() && statement.has_wildcard_resource() {
            report.push(
                Rule::WildcardGrant,
                Severity::Error,
                &role.logical_id,
                format!(
                    "statement {} allows every action on every resource",
                    statement.sid.as_deref().unwrap_or("<unnamed>")
                ),
            );
        }
    }
}

fn check_identity_admin(stack: &Stack, report: &mut AuditReport) {
    let role = &stack.execution_role;
    for statement in role.statements() {
        let broad = statement.actions.iter().any(|action| {
            let action = action.to_ascii_lowercase();
            action == "cognito-idp:*" || action == "cognito-identity:*"
        });
        if broad {
            report.push(
                Rule::BroadIdentityAdmin,
                Severity::Error,
                &role.logical_id,
                "execution role has service-wide identity management access",
            );
        }
    }
}

fn check_identity_pool(stack: &Stack, report: &mut AuditReport) {
    if stack.identity_pool.allow_unauthenticated {
        report.push(
            Rule::UnauthenticatedIdentities,
            Severity::Error,
            &stack.identity_pool.logical_id,
            "identity pool issues guest credentials",
        );
    }
}

fn check_cors(stack: &Stack, report: &mut AuditReport) {
    let cors = &stack.api.cors;
    if cors.allows_any_origin() {
        let severity = if stack.config.is_production() {
            Severity::Error
        } else {
            Severity::Warning
        };
        report.push(
            Rule::PermissiveCors,
            severity,
            &stack.api.logical_id,
            "any origin may call the API; set CORS_ALLOW_ORIGINS",
        );
    }
}

fn check_timeout(stack: &Stack, report: &mut AuditReport) {
    let function = &stack.function;
    if function.timeout != FUNCTION_TIMEOUT {
        report.push(
            Rule::ComputeTimeout,
            Severity::Error,
            &function.logical_id,
            format!(
                "timeout is {}s, expected {}s",
                function.timeout.as_secs(),
                FUNCTION_TIMEOUT.as_secs()
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiMethod, CorsPolicy, HttpMethod, Route};
    use crate::compute::ENV_IDENTITY_POOL_ID;
    use crate::iam::{AuthenticatedAccess, IdentityAdminAccess, Statement};
    use crate::template::Expr;
    use crate::StackConfig;
    use std::time::Duration;

    fn stack() -> Stack {
        Stack::new(&StackConfig::default()).unwrap()
    }

    fn rules(report: &AuditReport) -> Vec<Rule> {
        report.findings.iter().map(|f| f.rule).collect()
    }

    #[test]
    fn test_default_stack_is_clean() {
        let report = audit(&stack());
        assert!(report.is_clean(), "{:?}", report.findings);
        // Development keeps the permissive CORS policy as a warning only.
        assert_eq!(rules(&report), vec![Rule::PermissiveCors]);
        assert_eq!(report.warnings().count(), 1);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_production_rejects_permissive_cors() {
        let mut config = StackConfig::new("tasklists", "prod", "us-west-2");
        let report = audit(&Stack::new(&config).unwrap());
        assert!(!report.is_clean());
        assert_eq!(report.into_result().unwrap_err(), InfraError::AuditFailed(1));

        config.cors =
            CorsPolicy::default().with_origins(vec!["https://app.example.com".to_string()]);
        let report = audit(&Stack::new(&config).unwrap());
        assert!(report.findings.is_empty(), "{:?}", report.findings);
    }

    #[test]
    fn test_route_without_authorizer() {
        let mut stack = stack();
        stack.api.methods[3].authorization = Authorization::None;
        let report = audit(&stack);
        assert!(report.has(Rule::RouteWithoutAuthorizer));

        let mut stack = self::stack();
        stack.api.methods.pop();
        assert!(audit(&stack).has(Rule::RouteWithoutAuthorizer));
    }

    #[test]
    fn test_extra_public_methods_are_flagged() {
        let mut stack = stack();
        stack.api.methods.push(ApiMethod {
            route: Route { method: HttpMethod::Get, path: "/items/{listID}/{taskID}" },
            authorization: Authorization::None,
        });
        stack.api.methods.push(ApiMethod {
            route: ROUTES[0],
            authorization: Authorization::None,
        });

        let report = audit(&stack);
        assert!(!report.is_clean());
        let messages: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.rule == Rule::RouteWithoutAuthorizer)
            .map(|f| f.message.clone())
            .collect();
        assert_eq!(messages.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("GET /items/{listID}/{taskID}")));
        assert!(messages.iter().any(|m| m.contains("POST /items is declared more than once")));
    }

    #[test]
    fn test_duplicate_authorized_method_is_flagged() {
        let mut stack = stack();
        let duplicate = stack.api.methods[0].clone();
        stack.api.methods.push(duplicate);
        assert!(audit(&stack).has(Rule::RouteWithoutAuthorizer));
    }

    #[test]
    fn test_unscoped_table_grant() {
        let mut stack = stack();
        stack.execution_role.policies[0].document.statements[0].resources = vec![Expr::wildcard()];
        let report = audit(&stack);
        assert!(report.has(Rule::TableGrantNotScoped));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_missing_table_action() {
        let mut stack = stack();
        stack.execution_role.policies[0].document.statements[0]
            .actions
            .retain(|a| a != "dynamodb:BatchWriteItem");
        let report = audit(&stack);
        let finding = report
            .findings
            .iter()
            .find(|f| f.rule == Rule::TableGrantNotScoped)
            .unwrap();
        assert!(finding.message.contains("dynamodb:BatchWriteItem"));
    }

    #[test]
    fn test_weak_password_policy() {
        let mut stack = stack();
        stack.user_pool.password_policy.min_length = 6;
        assert!(audit(&stack).has(Rule::WeakPasswordPolicy));

        let mut stack = self::stack();
        stack.user_pool.password_policy.require_symbols = false;
        assert!(audit(&stack).has(Rule::WeakPasswordPolicy));
    }

    #[test]
    fn test_trust_policy_without_audience_condition() {
        let mut stack = stack();
        let trust = &mut stack.authenticated_role.assume_role_policy.statements[0];
        trust.condition.remove("StringEquals");
        let report = audit(&stack);
        let messages: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.rule == Rule::TrustPolicyUnscoped)
            .map(|f| f.message.clone())
            .collect();
        assert_eq!(
            messages,
            vec![
                "role can be assumed with a token from a foreign identity pool",
                "role can be assumed with a token without audience",
            ]
        );
    }

    #[test]
    fn test_trust_policy_without_amr_condition() {
        let mut stack = stack();
        let trust = &mut stack.authenticated_role.assume_role_policy.statements[0];
        trust.condition.remove("ForAnyValue:StringLike");
        let report = audit(&stack);
        assert!(report.findings.iter().any(|f| f.rule == Rule::TrustPolicyUnscoped
            && f.message.contains("guest token")));
    }

    #[test]
    fn test_trust_policy_unassumable() {
        let mut stack = stack();
        stack.authenticated_role.assume_role_policy.statements[0] = Statement::trust(
            Principal::Service("lambda.amazonaws.com".to_string()),
            "sts:AssumeRole",
        );
        assert!(audit(&stack).has(Rule::TrustPolicyUnscoped));
    }

    #[test]
    fn test_placeholder_environment() {
        let mut config = StackConfig::default();
        config
            .compute_env_overrides
            .insert(ENV_IDENTITY_POOL_ID.to_string(), "IDENTITY_POOL_ID".to_string());
        let report = audit(&Stack::new(&config).unwrap());
        assert!(report.has(Rule::PlaceholderEnvironment));
        assert!(!report.is_clean());

        let mut stack = stack();
        stack.function.environment.remove(ENV_IDENTITY_POOL_ID);
        assert!(audit(&stack).has(Rule::PlaceholderEnvironment));
    }

    #[test]
    fn test_unrestricted_access_levels() {
        let mut config = StackConfig::default();
        config.identity_admin = IdentityAdminAccess::Unrestricted;
        config.authenticated_access = AuthenticatedAccess::Unrestricted;
        let report = audit(&Stack::new(&config).unwrap());

        assert!(report.has(Rule::BroadIdentityAdmin));
        let wildcard: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.rule == Rule::WildcardGrant)
            .map(|f| f.resource.as_str())
            .collect();
        assert_eq!(wildcard, vec![crate::iam::AUTHENTICATED_ROLE_ID]);
    }

    #[test]
    fn test_guest_identities() {
        let mut stack = stack();
        stack.identity_pool.allow_unauthenticated = true;
        assert!(audit(&stack).has(Rule::UnauthenticatedIdentities));
    }

    #[test]
    fn test_compute_timeout() {
        let mut stack = stack();
        stack.function.timeout = Duration::from_secs(30);
        let report = audit(&stack);
        let finding = report.findings.iter().find(|f| f.rule == Rule::ComputeTimeout).unwrap();
        assert_eq!(finding.message, "timeout is 30s, expected 10s");
    }

    #[test]
    fn test_finding_display() {
        let report = audit(&stack());
        assert_eq!(
            report.findings[0].to_string(),
            "[warning] PermissiveCors on ItemsApi: \
             any origin may call the API; set CORS_ALLOW_ORIGINS"
        );
    }
}
