//! Identity subsystem: the user directory, its app client and the federated
//! identity pool that trades directory tokens for temporary AWS credentials.

use crate::iam::Role;
use crate::template::{Expr, Resource, Template};
use crate::{InfraError, InfraResult, StackConfig};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Logical id of the user pool.
pub const USER_POOL_ID: &str = "UserPool";
/// Logical id of the app client.
pub const USER_POOL_CLIENT_ID: &str = "UserPoolClient";
/// Logical id of the identity pool.
pub const IDENTITY_POOL_ID: &str = "IdentityPool";
/// Logical id of the identity pool role attachment.
pub const ROLE_ATTACHMENT_ID: &str = "IdentityPoolRoleAttachment";

/// Characters the directory accepts as password symbols.
pub const PASSWORD_SYMBOLS: &str = "^$*.[]{}()?\"!@#%&/\\,><':;|_~`=+-";

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// Password complexity policy of the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    /// Minimum number of characters
    pub min_length: usize,
    /// At least one `a-z`
    pub require_lowercase: bool,
    /// At least one `A-Z`
    pub require_uppercase: bool,
    /// At least one `0-9`
    pub require_digits: bool,
    /// At least one of [`PASSWORD_SYMBOLS`]
    pub require_symbols: bool,
    /// Days an administrator-issued temporary password stays valid
    pub temporary_password_validity_days: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_lowercase: true,
            require_uppercase: true,
            require_digits: true,
            require_symbols: true,
            temporary_password_validity_days: 7,
        }
    }
}

/// Reason a password fails the policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PasswordViolation {
    /// Fewer characters than the minimum
    #[error("Password must be at least {min} characters, got {actual}")]
    TooShort {
        /// Required length
        min: usize,
        /// Actual length
        actual: usize,
    },
    /// No lowercase letter
    #[error("Password must contain a lowercase letter")]
    MissingLowercase,
    /// No uppercase letter
    #[error("Password must contain an uppercase letter")]
    MissingUppercase,
    /// No digit
    #[error("Password must contain a digit")]
    MissingDigit,
    /// No symbol
    #[error("Password must contain a symbol")]
    MissingSymbol,
}

impl PasswordPolicy {
    /// Checks a candidate password, reporting every violation.
    pub fn validate(&self, password: &str) -> Result<(), Vec<PasswordViolation>> {
        let mut violations = Vec::new();

        let length = password.chars().count();
        if length < self.min_length {
            violations.push(PasswordViolation::TooShort {
                min: self.min_length,
                actual: length,
            });
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
            violations.push(PasswordViolation::MissingLowercase);
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
            violations.push(PasswordViolation::MissingUppercase);
        }
        if self.require_digits && !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PasswordViolation::MissingDigit);
        }
        if self.require_symbols && !password.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) {
            violations.push(PasswordViolation::MissingSymbol);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// True when this policy is at least as strict as `baseline` on every axis.
    pub fn is_at_least(&self, baseline: &PasswordPolicy) -> bool {
        self.min_length >= baseline.min_length
            && (self.require_lowercase || !baseline.require_lowercase)
            && (self.require_uppercase || !baseline.require_uppercase)
            && (self.require_digits || !baseline.require_digits)
            && (self.require_symbols || !baseline.require_symbols)
            && self.temporary_password_validity_days <= baseline.temporary_password_validity_days
    }
}

/// Account status of a directory user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    /// Signed up, verification code not yet confirmed
    Unconfirmed,
    /// Verified and able to sign in
    Confirmed,
    /// Password reset requested, waiting for the emailed code
    ResetRequired,
}

/// Directory events that move a user between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    /// Sign-up verification code confirmed
    ConfirmSignUp,
    /// Password recovery started
    ForgotPassword,
    /// Recovery code and new password accepted
    ConfirmForgotPassword,
}

impl UserStatus {
    /// Applies an event.
    pub fn on(self, event: UserEvent) -> Result<UserStatus, InfraError> {
        match (self, event) {
            (Self::Unconfirmed, UserEvent::ConfirmSignUp) => Ok(Self::Confirmed),
            (Self::Confirmed, UserEvent::ForgotPassword) => Ok(Self::ResetRequired),
            (Self::ResetRequired, UserEvent::ForgotPassword) => Ok(Self::ResetRequired),
            (Self::ResetRequired, UserEvent::ConfirmForgotPassword) => Ok(Self::Confirmed),
            (from, event) => Err(InfraError::InvalidTransition {
                from: from.to_string(),
                event: format!("{event:?}"),
            }),
        }
    }

    /// Only confirmed users receive tokens.
    pub fn can_sign_in(self) -> bool {
        self == Self::Confirmed
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconfirmed => "UNCONFIRMED",
            Self::Confirmed => "CONFIRMED",
            Self::ResetRequired => "RESET_REQUIRED",
        })
    }
}

/// The user-credential directory.
#[derive(Debug, Clone)]
pub struct UserPool {
    /// Logical id
    pub logical_id: String,
    /// Physical pool name
    pub name: String,
    /// Users may register themselves
    pub self_sign_up: bool,
    /// Verification codes are sent to the email address
    pub auto_verify_email: bool,
    /// Password policy
    pub password_policy: PasswordPolicy,
    /// Account recovery mechanisms, in priority order
    pub recovery_mechanisms: Vec<String>,
    /// Multi-factor authentication required
    pub mfa_required: bool,
    /// Keep the directory when the stack is deleted
    pub retain_on_delete: bool,
}

impl UserPool {
    /// Declares the directory: email sign-in, self sign-up, email-only recovery.
    pub fn new(config: &StackConfig) -> Self {
        Self {
            logical_id: USER_POOL_ID.to_string(),
            name: config.resource_name("users"),
            self_sign_up: true,
            auto_verify_email: true,
            password_policy: PasswordPolicy::default(),
            recovery_mechanisms: vec!["verified_email".to_string()],
            mfa_required: false,
            retain_on_delete: config.is_production(),
        }
    }

    /// `Ref UserPool`, the pool id.
    pub fn id(&self) -> Expr {
        Expr::reference(&self.logical_id)
    }

    /// Pool ARN.
    pub fn arn(&self) -> Expr {
        Expr::get_att(&self.logical_id, "Arn")
    }

    /// Provider name used by the identity pool.
    pub fn provider_name(&self) -> Expr {
        Expr::get_att(&self.logical_id, "ProviderName")
    }

    /// Adds the pool to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        let policy = &self.password_policy;
        let recovery: Vec<_> = self
            .recovery_mechanisms
            .iter()
            .enumerate()
            .map(|(i, name)| json!({ "Name": name, "Priority": i + 1 }))
            .collect();

        let mfa = if self.mfa_required { "ON" } else { "OFF" };
        let mut properties = json!({
            "UserPoolName": self.name,
            "AdminCreateUserConfig": { "AllowAdminCreateUserOnly": !self.self_sign_up },
            "UsernameAttributes": ["email"],
            "UsernameConfiguration": { "CaseSensitive": false },
            "Schema": [
                {
                    "Name": "email",
                    "AttributeDataType": "String",
                    "Required": true,
                    "Mutable": true
                }
            ],
            "Policies": {
                "PasswordPolicy": {
                    "MinimumLength": policy.min_length,
                    "RequireLowercase": policy.require_lowercase,
                    "RequireUppercase": policy.require_uppercase,
                    "RequireNumbers": policy.require_digits,
                    "RequireSymbols": policy.require_symbols,
                    "TemporaryPasswordValidityDays": policy.temporary_password_validity_days,
                }
            },
            "AccountRecoverySetting": { "RecoveryMechanisms": recovery },
            "MfaConfiguration": mfa,
        });
        if self.auto_verify_email {
            properties["AutoVerifiedAttributes"] = json!(["email"]);
        }

        let policy = if self.retain_on_delete { "Retain" } else { "Delete" };
        template.add_resource(
            &self.logical_id,
            Resource::new("AWS::Cognito::UserPool", properties).retention(policy),
        )
    }
}

/// Authentication flows an app client may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthFlow {
    /// Server-side admin username/password
    AdminUserPassword,
    /// Lambda-triggered custom challenge
    Custom,
    /// Plain username/password
    UserPassword,
    /// Secure remote password
    UserSrp,
    /// Refresh token exchange
    RefreshToken,
}

impl AuthFlow {
    /// CloudFormation spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdminUserPassword => "ALLOW_ADMIN_USER_PASSWORD_AUTH",
            Self::Custom => "ALLOW_CUSTOM_AUTH",
            Self::UserPassword => "ALLOW_USER_PASSWORD_AUTH",
            Self::UserSrp => "ALLOW_USER_SRP_AUTH",
            Self::RefreshToken => "ALLOW_REFRESH_TOKEN_AUTH",
        }
    }
}

/// OAuth 2.0 scopes granted to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthScope {
    /// `openid`
    OpenId,
    /// `email`
    Email,
    /// `profile`
    Profile,
}

impl OAuthScope {
    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenId => "openid",
            Self::Email => "email",
            Self::Profile => "profile",
        }
    }
}

/// Token lifetimes issued to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenValidity {
    /// Access token lifetime
    pub access: Duration,
    /// ID token lifetime
    pub id: Duration,
    /// Refresh token lifetime
    pub refresh: Duration,
}

impl Default for TokenValidity {
    fn default() -> Self {
        Self {
            access: Duration::from_secs(60 * MINUTE),
            id: Duration::from_secs(60 * MINUTE),
            refresh: Duration::from_secs(30 * DAY),
        }
    }
}

impl TokenValidity {
    /// Checks the directory's accepted ranges.
    pub fn validate(&self) -> InfraResult<()> {
        let short_lived = Duration::from_secs(5 * MINUTE)..=Duration::from_secs(DAY);
        for (field, value) in [("AccessTokenValidity", self.access), ("IdTokenValidity", self.id)] {
            if !short_lived.contains(&value) {
                return Err(InfraError::invalid(field, "must be between 5 minutes and 1 day"));
            }
        }
        if !(Duration::from_secs(60 * MINUTE)..=Duration::from_secs(3650 * DAY))
            .contains(&self.refresh)
        {
            return Err(InfraError::invalid(
                "RefreshTokenValidity",
                "must be between 60 minutes and 10 years",
            ));
        }
        Ok(())
    }
}

/// App client registration on the user pool.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    /// Logical id
    pub logical_id: String,
    /// Client name
    pub name: String,
    /// Owning user pool
    pub user_pool: Expr,
    /// Enabled authentication flows
    pub auth_flows: BTreeSet<AuthFlow>,
    /// Token lifetimes
    pub validity: TokenValidity,
    /// OAuth authorization-code grant enabled
    pub authorization_code_grant: bool,
    /// OAuth scopes
    pub scopes: Vec<OAuthScope>,
    /// Registered redirect URIs
    pub callback_urls: Vec<String>,
    /// Confidential client
    pub generate_secret: bool,
}

impl ClientRegistration {
    /// Registers the web client on `user_pool`.
    pub fn new(config: &StackConfig, user_pool: &UserPool) -> Self {
        Self {
            logical_id: USER_POOL_CLIENT_ID.to_string(),
            name: config.resource_name("web-client"),
            user_pool: user_pool.id(),
            auth_flows: BTreeSet::from([
                AuthFlow::AdminUserPassword,
                AuthFlow::Custom,
                AuthFlow::UserPassword,
                AuthFlow::UserSrp,
                AuthFlow::RefreshToken,
            ]),
            validity: TokenValidity::default(),
            authorization_code_grant: true,
            scopes: vec![OAuthScope::OpenId, OAuthScope::Email, OAuthScope::Profile],
            callback_urls: vec![config.callback_url.clone()],
            generate_secret: false,
        }
    }

    /// Whether the directory will issue tokens through `flow` for this client.
    pub fn permits(&self, flow: AuthFlow) -> bool {
        self.auth_flows.contains(&flow)
    }

    /// `Ref UserPoolClient`, the client id.
    pub fn client_id(&self) -> Expr {
        Expr::reference(&self.logical_id)
    }

    /// Adds the client to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        self.validity.validate()?;
        if self.authorization_code_grant && self.callback_urls.is_empty() {
            return Err(InfraError::invalid(
                "CallbackURLs",
                "authorization-code grant needs a callback URL",
            ));
        }

        let flows: Vec<_> = self.auth_flows.iter().map(AuthFlow::as_str).collect();
        let scopes: Vec<_> = self.scopes.iter().map(OAuthScope::as_str).collect();
        let mut properties = json!({
            "ClientName": self.name,
            "UserPoolId": self.user_pool,
            "ExplicitAuthFlows": flows,
            "GenerateSecret": self.generate_secret,
            "AccessTokenValidity": self.validity.access.as_secs() / MINUTE,
            "IdTokenValidity": self.validity.id.as_secs() / MINUTE,
            "RefreshTokenValidity": self.validity.refresh.as_secs() / MINUTE,
            "TokenValidityUnits": {
                "AccessToken": "minutes",
                "IdToken": "minutes",
                "RefreshToken": "minutes",
            },
            "SupportedIdentityProviders": ["COGNITO"],
            "PreventUserExistenceErrors": "ENABLED",
        });
        if self.authorization_code_grant {
            properties["AllowedOAuthFlowsUserPoolClient"] = json!(true);
            properties["AllowedOAuthFlows"] = json!(["code"]);
            properties["AllowedOAuthScopes"] = json!(scopes);
            properties["CallbackURLs"] = json!(self.callback_urls);
        }

        template.add_resource(
            &self.logical_id,
            Resource::new("AWS::Cognito::UserPoolClient", properties),
        )
    }
}

/// Federated identity pool backed by the user directory.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    /// Logical id
    pub logical_id: String,
    /// Pool name (letters, digits, underscore and space)
    pub name: String,
    /// Guest credentials
    pub allow_unauthenticated: bool,
    /// Directory client whose tokens are accepted
    pub client_id: Expr,
    /// Directory provider name
    pub provider_name: Expr,
}

impl IdentityPool {
    /// Declares the pool trusting `client` of `user_pool`.
    pub fn new(config: &StackConfig, user_pool: &UserPool, client: &ClientRegistration) -> Self {
        Self {
            logical_id: IDENTITY_POOL_ID.to_string(),
            name: format!("{}_{}_identities", config.project, config.environment).replace('-', "_"),
            allow_unauthenticated: false,
            client_id: client.client_id(),
            provider_name: user_pool.provider_name(),
        }
    }

    /// `Ref IdentityPool`, the pool id.
    pub fn id(&self) -> Expr {
        Expr::reference(&self.logical_id)
    }

    /// Pool ARN.
    pub fn arn(&self) -> Expr {
        Expr::sub(format!(
            "arn:${{AWS::Partition}}:cognito-identity:${{AWS::Region}}:${{AWS::AccountId}}:\
             identitypool/${{{}}}",
            self.logical_id
        ))
    }

    /// Adds the pool to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        if self.name.is_empty()
            || self.name.len() > 128
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ')
        {
            return Err(InfraError::invalid(
                "IdentityPoolName",
                format!("{:?} may only contain letters, digits, '_' and ' '", self.name),
            ));
        }

        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::Cognito::IdentityPool",
                json!({
                    "IdentityPoolName": self.name,
                    "AllowUnauthenticatedIdentities": self.allow_unauthenticated,
                    "CognitoIdentityProviders": [{
                        "ClientId": self.client_id,
                        "ProviderName": self.provider_name,
                        "ServerSideTokenCheck": true,
                    }],
                }),
            ),
        )
    }
}

/// Binds the authenticated role to the identity pool.
#[derive(Debug, Clone)]
pub struct IdentityPoolRoleAttachment {
    /// Logical id
    pub logical_id: String,
    /// Identity pool id
    pub identity_pool: Expr,
    /// Role assumed by authenticated identities
    pub authenticated_role: Expr,
}

impl IdentityPoolRoleAttachment {
    /// Attaches `role` as the authenticated role of `pool`.
    pub fn new(pool: &IdentityPool, role: &Role) -> Self {
        Self {
            logical_id: ROLE_ATTACHMENT_ID.to_string(),
            identity_pool: pool.id(),
            authenticated_role: role.arn(),
        }
    }

    /// Adds the attachment to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::Cognito::IdentityPoolRoleAttachment",
                json!({
                    "IdentityPoolId": self.identity_pool,
                    "Roles": { "authenticated": self.authenticated_role },
                }),
            ),
        )
    }
}
