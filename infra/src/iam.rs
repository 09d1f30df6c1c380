//! Permission and trust boundaries.
//!
//! This module models IAM policy documents precisely enough to both render
//! them into the template and evaluate them locally. Two roles exist:
//!
//! - **Execution role**: assumed by the compute unit. Data store access is
//!   scoped to the single table; identity-management access is read-only by
//!   default; log writes are scoped to the function log namespace.
//! - **Authenticated role**: assumed by end users through the identity pool.
//!   Its trust policy pins the token audience to this stack's identity pool
//!   and requires the `authenticated` method claim.

use crate::api::RestApi;
use crate::identity::{IdentityPool, UserPool};
use crate::table::Table;
use crate::template::{Bindings, Expr, Resource, Template};
use crate::{InfraError, InfraResult, StackConfig};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;

/// IAM policy language version.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Logical id of the compute unit's execution role.
pub const EXECUTION_ROLE_ID: &str = "FunctionExecutionRole";
/// Logical id of the authenticated end-user role.
pub const AUTHENTICATED_ROLE_ID: &str = "AuthenticatedUserRole";

/// Data store actions granted to the compute unit.
pub const DATA_STORE_ACTIONS: [&str; 7] = [
    "dynamodb:GetItem",
    "dynamodb:PutItem",
    "dynamodb:UpdateItem",
    "dynamodb:DeleteItem",
    "dynamodb:Scan",
    "dynamodb:Query",
    "dynamodb:BatchWriteItem",
];

/// Log actions granted to the compute unit.
pub const LOG_ACTIONS: [&str; 3] = [
    "logs:CreateLogGroup",
    "logs:CreateLogStream",
    "logs:PutLogEvents",
];

/// Read-only directory lookups granted by [`IdentityAdminAccess::ReadOnly`].
pub const DIRECTORY_READ_ACTIONS: [&str; 2] = ["cognito-idp:AdminGetUser", "cognito-idp:ListUsers"];

/// Identity pool lookup granted by [`IdentityAdminAccess::ReadOnly`].
pub const IDENTITY_READ_ACTIONS: [&str; 1] = ["cognito-identity:DescribeIdentity"];

/// Condition key carrying the identity pool id of a web identity token.
pub const AUD_CONDITION_KEY: &str = "cognito-identity.amazonaws.com:aud";
/// Condition key carrying the authentication method references.
pub const AMR_CONDITION_KEY: &str = "cognito-identity.amazonaws.com:amr";
/// Federated principal of the identity pool service.
pub const IDENTITY_FEDERATION_PRINCIPAL: &str = "cognito-identity.amazonaws.com";
/// Action used by the identity pool to hand out credentials.
pub const ASSUME_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effect {
    /// Grants
    Allow,
    /// Overrides any grant
    Deny,
}

/// Who may assume a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// An AWS service, e.g. `lambda.amazonaws.com`
    Service(String),
    /// A web identity federation provider
    Federated(String),
}

impl Serialize for Principal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::Service(name) => map.serialize_entry("Service", name)?,
            Self::Federated(name) => map.serialize_entry("Federated", name)?,
        }
        map.end()
    }
}

/// `operator → condition key → accepted values`.
pub type ConditionBlock = BTreeMap<String, BTreeMap<String, Vec<Expr>>>;

/// One policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    /// Statement id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Allow or deny
    pub effect: Effect,
    /// Trust policies only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    /// Action patterns
    #[serde(rename = "Action")]
    pub actions: Vec<String>,
    /// Resource patterns; empty in trust policies
    #[serde(rename = "Resource", skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Expr>,
    /// Conditions, all of which must hold
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: ConditionBlock,
}

impl Statement {
    /// Allows `actions` on `resources`.
    pub fn allow(actions: &[&str], resources: Vec<Expr>) -> Self {
        Self {
            sid: None,
            effect: Effect::Allow,
            principal: None,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
            condition: BTreeMap::new(),
        }
    }

    /// Allows `principal` to perform `action` on the role carrying this trust statement.
    pub fn trust(principal: Principal, action: &str) -> Self {
        Self {
            sid: None,
            effect: Effect::Allow,
            principal: Some(principal),
            actions: vec![action.to_string()],
            resources: Vec::new(),
            condition: BTreeMap::new(),
        }
    }

    /// Names the statement.
    pub fn with_sid(mut self, sid: &str) -> Self {
        self.sid = Some(sid.to_string());
        self
    }

    /// Adds a condition.
    pub fn with_condition(mut self, operator: &str, key: &str, values: Vec<Expr>) -> Self {
        self.condition
            .entry(operator.to_string())
            .or_default()
            .insert(key.to_string(), values);
        self
    }

    /// True if any action is `*`.
    pub fn has_wildcard_action(&self) -> bool {
        self.actions.iter().any(|a| a == "*")
    }

    /// True if any action covers a whole service, like `cognito-idp:*`.
    pub fn has_service_wildcard(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a == "*" || a.split_once(':').is_some_and(|(_, name)| name == "*"))
    }

    /// True if any resource is `*`.
    pub fn has_wildcard_resource(&self) -> bool {
        self.resources.iter().any(Expr::is_wildcard)
    }

    /// True if some action pattern covers `action`.
    pub fn matches_action(&self, action: &str) -> bool {
        self.actions
            .iter()
            .any(|pattern| glob_match(&pattern.to_ascii_lowercase(), &action.to_ascii_lowercase()))
    }

    fn matches_principal(&self, principal: &Principal) -> bool {
        self.principal.as_ref() == Some(principal)
    }

    fn conditions_hold(&self, context: &TokenContext, bindings: &Bindings) -> bool {
        self.condition.iter().all(|(operator, keys)| {
            keys.iter().all(|(key, expected)| {
                let expected: Option<Vec<String>> =
                    expected.iter().map(|value| bindings.resolve(value)).collect();
                match expected {
                    Some(expected) => {
                        evaluate_condition(operator, context.values(key), &expected)
                    }
                    None => false,
                }
            })
        })
    }
}

/// A policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    /// Policy language version
    pub version: String,
    /// Statements
    #[serde(rename = "Statement")]
    pub statements: Vec<Statement>,
}

impl PolicyDocument {
    /// Creates a document from statements.
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statements,
        }
    }

    /// Allow statements covering `action`.
    pub fn grants<'a>(&'a self, action: &'a str) -> impl Iterator<Item = &'a Statement> + 'a {
        self.statements
            .iter()
            .filter(move |s| s.effect == Effect::Allow && s.matches_action(action))
    }

    /// Evaluates a trust policy for an assume-role request.
    ///
    /// Unresolvable condition values and unknown operators never match, and an
    /// applicable deny wins over any allow.
    pub fn allows_assume(
        &self,
        principal: &Principal,
        action: &str,
        context: &TokenContext,
        bindings: &Bindings,
    ) -> bool {
        let applicable = |s: &&Statement| {
            s.matches_principal(principal)
                && s.matches_action(action)
                && s.conditions_hold(context, bindings)
        };

        let denied = self
            .statements
            .iter()
            .filter(|s| s.effect == Effect::Deny)
            .any(|s| applicable(&s));
        let allowed = self
            .statements
            .iter()
            .filter(|s| s.effect == Effect::Allow)
            .any(|s| applicable(&s));

        allowed && !denied
    }
}

/// Request context of an assume-role call: condition key → values.
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    values: BTreeMap<String, Vec<String>>,
}

impl TokenContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a condition key.
    pub fn with(mut self, key: &str, values: &[&str]) -> Self {
        self.values
            .insert(key.to_string(), values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Context presented by the identity pool for a web identity token.
    pub fn web_identity(audience: &str, methods: &[&str]) -> Self {
        Self::new()
            .with(AUD_CONDITION_KEY, &[audience])
            .with(AMR_CONDITION_KEY, methods)
    }

    fn values(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn evaluate_condition(operator: &str, actual: &[String], expected: &[String]) -> bool {
    let equals = |a: &String| expected.iter().any(|e| e == a);
    let like = |a: &String| expected.iter().any(|e| glob_match(e, a));

    match operator {
        "StringEquals" => actual.len() == 1 && equals(&actual[0]),
        "StringLike" => actual.len() == 1 && like(&actual[0]),
        "ForAnyValue:StringEquals" => actual.iter().any(equals),
        "ForAnyValue:StringLike" => actual.iter().any(like),
        "ForAllValues:StringEquals" => actual.iter().all(equals),
        "ForAllValues:StringLike" => actual.iter().all(like),
        _ => false,
    }
}

/// IAM wildcard matching: `*` spans any run of characters, `?` exactly one.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Breadth of the execution role's identity-management grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityAdminAccess {
    /// No identity-management actions
    None,
    /// User lookups on this stack's pools only
    #[default]
    ReadOnly,
    /// `cognito-idp:*` and `cognito-identity:*` on `*`
    Unrestricted,
}

impl FromStr for IdentityAdminAccess {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "read-only" | "readonly" => Ok(Self::ReadOnly),
            "unrestricted" => Ok(Self::Unrestricted),
            other => Err(InfraError::invalid(
                "IDENTITY_ADMIN_ACCESS",
                format!("unknown access level {other:?}"),
            )),
        }
    }
}

/// Permission policy of the authenticated end-user role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticatedAccess {
    /// `execute-api:Invoke` on this stack's API
    #[default]
    InvokeApi,
    /// `*` on `*`
    Unrestricted,
}

impl FromStr for AuthenticatedAccess {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invoke-api" | "invokeapi" => Ok(Self::InvokeApi),
            "unrestricted" => Ok(Self::Unrestricted),
            other => Err(InfraError::invalid(
                "AUTHENTICATED_ACCESS",
                format!("unknown access level {other:?}"),
            )),
        }
    }
}

/// Named inline policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePolicy {
    /// Policy name
    pub name: String,
    /// Policy document
    pub document: PolicyDocument,
}

/// An IAM role with inline policies.
#[derive(Debug, Clone)]
pub struct Role {
    /// Logical id
    pub logical_id: String,
    /// Physical role name
    pub name: String,
    /// Description
    pub description: String,
    /// Trust policy
    pub assume_role_policy: PolicyDocument,
    /// Permission policies
    pub policies: Vec<InlinePolicy>,
}

impl Role {
    /// Role ARN.
    pub fn arn(&self) -> Expr {
        Expr::get_att(&self.logical_id, "Arn")
    }

    /// All permission statements across inline policies.
    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.policies
            .iter()
            .flat_map(|policy| policy.document.statements.iter())
    }

    /// Adds the role to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        if self.name.len() > 64 {
            return Err(InfraError::invalid(
                "RoleName",
                format!("{:?} exceeds 64 characters", self.name),
            ));
        }

        let policies: Vec<_> = self
            .policies
            .iter()
            .map(|p| json!({ "PolicyName": p.name, "PolicyDocument": p.document }))
            .collect();

        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "RoleName": self.name,
                    "Description": self.description,
                    "AssumeRolePolicyDocument": self.assume_role_policy,
                    "Policies": policies,
                }),
            ),
        )
    }
}

/// Builds the compute unit's execution role.
pub fn execution_role(
    config: &StackConfig,
    table: &Table,
    user_pool: &UserPool,
    identity_pool: &IdentityPool,
) -> Role {
    let mut statements = vec![
        Statement::allow(&DATA_STORE_ACTIONS, vec![table.arn()]).with_sid("DataStoreAccess"),
    ];

    match config.identity_admin {
        IdentityAdminAccess::None => {}
        IdentityAdminAccess::ReadOnly => {
            statements.push(
                Statement::allow(&DIRECTORY_READ_ACTIONS, vec![user_pool.arn()])
                    .with_sid("DirectoryLookup"),
            );
            statements.push(
                Statement::allow(&IDENTITY_READ_ACTIONS, vec![identity_pool.arn()])
                    .with_sid("IdentityLookup"),
            );
        }
        IdentityAdminAccess::Unrestricted => {
            statements.push(
                Statement::allow(&["cognito-idp:*", "cognito-identity:*"], vec![Expr::wildcard()])
                    .with_sid("IdentityAdministration"),
            );
        }
    }

    statements.push(
        Statement::allow(
            &LOG_ACTIONS,
            vec![Expr::sub(
                "arn:${AWS::Partition}:logs:${AWS::Region}:${AWS::AccountId}:\
                 log-group:/aws/lambda/*",
            )],
        )
        .with_sid("FunctionLogs"),
    );

    Role {
        logical_id: EXECUTION_ROLE_ID.to_string(),
        name: config.resource_name("function-role"),
        description: "Execution role of the task lists function".to_string(),
        assume_role_policy: PolicyDocument::new(vec![Statement::trust(
            Principal::Service("lambda.amazonaws.com".to_string()),
            "sts:AssumeRole",
        )]),
        policies: vec![InlinePolicy {
            name: "function-access".to_string(),
            document: PolicyDocument::new(statements),
        }],
    }
}

/// Builds the role end users assume through the identity pool.
pub fn authenticated_role(
    config: &StackConfig,
    identity_pool: &IdentityPool,
    api: &RestApi,
) -> Role {
    let trust = Statement::trust(
        Principal::Federated(IDENTITY_FEDERATION_PRINCIPAL.to_string()),
        ASSUME_WITH_WEB_IDENTITY,
    )
    .with_condition("StringEquals", AUD_CONDITION_KEY, vec![identity_pool.id()])
    .with_condition(
        "ForAnyValue:StringLike",
        AMR_CONDITION_KEY,
        vec![Expr::literal("authenticated")],
    );

    let permissions = match config.authenticated_access {
        AuthenticatedAccess::InvokeApi => {
            Statement::allow(&["execute-api:Invoke"], vec![api.execute_arn("*")])
                .with_sid("ApiInvoke")
        }
        AuthenticatedAccess::Unrestricted => {
            Statement::allow(&["*"], vec![Expr::wildcard()]).with_sid("Unrestricted")
        }
    };

    Role {
        logical_id: AUTHENTICATED_ROLE_ID.to_string(),
        name: config.resource_name("authenticated-role"),
        description: "Role assumed by signed-in users of the task lists app".to_string(),
        assume_role_policy: PolicyDocument::new(vec![trust]),
        policies: vec![InlinePolicy {
            name: "authenticated-access".to_string(),
            document: PolicyDocument::new(vec![permissions]),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    fn stack(config: &StackConfig) -> Stack {
        Stack::new(config).unwrap()
    }

    fn bindings() -> Bindings {
        Bindings::new().with_ref(crate::identity::IDENTITY_POOL_ID, "us-west-2:pool-1")
    }

    fn federated() -> Principal {
        Principal::Federated(IDENTITY_FEDERATION_PRINCIPAL.to_string())
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("dynamodb:*", "dynamodb:GetItem"));
        assert!(glob_match("auth*ed", "authenticated"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(!glob_match("dynamodb:Get*", "dynamodb:PutItem"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn test_execution_role_table_grant_is_scoped() {
        let config = StackConfig::default();
        let stack = stack(&config);
        let role = &stack.execution_role;

        let data: Vec<_> = role
            .statements()
            .filter(|s| s.matches_action("dynamodb:GetItem"))
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].resources, vec![stack.table.arn()]);
        assert!(!data[0].has_wildcard_resource());

        for action in DATA_STORE_ACTIONS {
            assert!(data[0].matches_action(action), "{action}");
        }
        assert!(!data[0].matches_action("dynamodb:DeleteTable"));
    }

    #[test]
    fn test_execution_role_identity_grant_levels() {
        let mut config = StackConfig::default();
        let read_only = stack(&config).execution_role;
        assert!(read_only.statements().all(|s| !s.has_service_wildcard()));
        assert!(read_only.statements().any(|s| s.matches_action("cognito-idp:AdminGetUser")));
        assert!(!read_only.statements().any(|s| s.matches_action("cognito-idp:AdminDeleteUser")));

        config.identity_admin = IdentityAdminAccess::None;
        let none = stack(&config).execution_role;
        assert!(!none.statements().any(|s| s.matches_action("cognito-idp:AdminGetUser")));

        config.identity_admin = IdentityAdminAccess::Unrestricted;
        let broad = stack(&config).execution_role;
        assert!(broad.statements().any(|s| s.has_service_wildcard() && s.has_wildcard_resource()));
    }

    #[test]
    fn test_execution_role_log_grant() {
        let role = stack(&StackConfig::default()).execution_role;
        let logs: Vec<_> = role
            .statements()
            .filter(|s| s.matches_action("logs:PutLogEvents"))
            .collect();
        assert_eq!(logs.len(), 1);

        let bindings = Bindings::new()
            .with_ref("AWS::Partition", "aws")
            .with_ref("AWS::Region", "us-west-2")
            .with_ref("AWS::AccountId", "123456789012");
        let resource = bindings.resolve(&logs[0].resources[0]).unwrap();
        assert_eq!(
            resource,
            "arn:aws:logs:us-west-2:123456789012:log-group:/aws/lambda/*"
        );
    }

    #[test]
    fn test_trust_policy_accepts_authenticated_token_for_pool() {
        let role = stack(&StackConfig::default()).authenticated_role;
        let context =
            TokenContext::web_identity("us-west-2:pool-1", &["authenticated", "cognito-idp"]);
        assert!(role.assume_role_policy.allows_assume(
            &federated(),
            ASSUME_WITH_WEB_IDENTITY,
            &context,
            &bindings()
        ));
    }

    #[test]
    fn test_trust_policy_rejects_foreign_audience() {
        let role = stack(&StackConfig::default()).authenticated_role;
        let context = TokenContext::web_identity("us-west-2:other-pool", &["authenticated"]);
        assert!(!role.assume_role_policy.allows_assume(
            &federated(),
            ASSUME_WITH_WEB_IDENTITY,
            &context,
            &bindings()
        ));
    }

    #[test]
    fn test_trust_policy_rejects_unauthenticated_method() {
        let role = stack(&StackConfig::default()).authenticated_role;
        let policy = &role.assume_role_policy;

        let guest = TokenContext::web_identity("us-west-2:pool-1", &["unauthenticated"]);
        assert!(!policy.allows_assume(&federated(), ASSUME_WITH_WEB_IDENTITY, &guest, &bindings()));

        let no_amr = TokenContext::new().with(AUD_CONDITION_KEY, &["us-west-2:pool-1"]);
        assert!(!policy.allows_assume(
            &federated(),
            ASSUME_WITH_WEB_IDENTITY,
            &no_amr,
            &bindings()
        ));
    }

    #[test]
    fn test_trust_policy_rejects_other_principal_and_action() {
        let role = stack(&StackConfig::default()).authenticated_role;
        let policy = &role.assume_role_policy;
        let context = TokenContext::web_identity("us-west-2:pool-1", &["authenticated"]);

        let service = Principal::Service("lambda.amazonaws.com".to_string());
        assert!(!policy.allows_assume(&service, ASSUME_WITH_WEB_IDENTITY, &context, &bindings()));
        assert!(!policy.allows_assume(&federated(), "sts:AssumeRole", &context, &bindings()));
    }

    #[test]
    fn test_trust_policy_denies_when_pool_unresolved() {
        let role = stack(&StackConfig::default()).authenticated_role;
        let context = TokenContext::web_identity("us-west-2:pool-1", &["authenticated"]);
        assert!(!role.assume_role_policy.allows_assume(
            &federated(),
            ASSUME_WITH_WEB_IDENTITY,
            &context,
            &Bindings::new()
        ));
    }

    #[test]
    fn test_explicit_deny_wins() {
        let policy = PolicyDocument::new(vec![
            Statement::trust(federated(), ASSUME_WITH_WEB_IDENTITY),
            Statement {
                effect: Effect::Deny,
                ..Statement::trust(federated(), "sts:*")
            },
        ]);
        let context = TokenContext::new();
        assert!(!policy.allows_assume(
            &federated(),
            ASSUME_WITH_WEB_IDENTITY,
            &context,
            &bindings()
        ));
    }

    #[test]
    fn test_authenticated_role_permissions() {
        let mut config = StackConfig::default();
        let role = stack(&config).authenticated_role;
        assert!(role.statements().all(|s| !s.has_wildcard_action() && !s.has_wildcard_resource()));
        assert!(role.statements().any(|s| s.matches_action("execute-api:Invoke")));

        config.authenticated_access = AuthenticatedAccess::Unrestricted;
        let role = stack(&config).authenticated_role;
        assert!(role.statements().any(|s| s.has_wildcard_action() && s.has_wildcard_resource()));
    }

    #[test]
    fn test_policy_document_serialization() {
        let role = stack(&StackConfig::default()).authenticated_role;
        let value = serde_json::to_value(&role.assume_role_policy).unwrap();

        assert_eq!(value["Version"], POLICY_VERSION);
        let statement = &value["Statement"][0];
        assert_eq!(statement["Effect"], "Allow");
        assert_eq!(statement["Principal"], json!({"Federated": IDENTITY_FEDERATION_PRINCIPAL}));
        assert_eq!(statement["Action"], json!([ASSUME_WITH_WEB_IDENTITY]));
        assert!(statement.get("Resource").is_none());
        assert_eq!(
            statement["Condition"]["StringEquals"][AUD_CONDITION_KEY],
            json!([{"Ref": crate::identity::IDENTITY_POOL_ID}])
        );
        assert_eq!(
            statement["Condition"]["ForAnyValue:StringLike"][AMR_CONDITION_KEY],
            json!(["authenticated"])
        );
    }

    #[test]
    fn test_access_level_parsing() {
        assert_eq!(
            IdentityAdminAccess::from_str("read-only").unwrap(),
            IdentityAdminAccess::ReadOnly
        );
        assert_eq!(IdentityAdminAccess::from_str("NONE").unwrap(), IdentityAdminAccess::None);
        assert!(IdentityAdminAccess::from_str("all").is_err());
        assert_eq!(
            AuthenticatedAccess::from_str("unrestricted").unwrap(),
            AuthenticatedAccess::Unrestricted
        );
    }
}
