//! Configuration management for the task lists stack.
//!
//! [`StackConfig`] carries everything that varies between deployments of the
//! same resource graph: naming, region, the OAuth callback, the CORS policy and
//! the breadth of the two identity-related grants. It is read from environment
//! variables by the task runner and passed by reference into every resource
//! constructor.

use crate::api::CorsPolicy;
use crate::iam::{AuthenticatedAccess, IdentityAdminAccess};
use crate::InfraError;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use url::Url;

/// Default project name, used as the prefix of every physical name.
pub const DEFAULT_PROJECT: &str = "tasklists";
/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-west-2";
/// Default environment name.
pub const DEFAULT_ENVIRONMENT: &str = "dev";
/// Default OAuth callback URL registered on the app client.
pub const DEFAULT_CALLBACK_URL: &str = "http://localhost:3000/callback";

/// Prefix of variables that override compute unit environment values.
const COMPUTE_ENV_PREFIX: &str = "COMPUTE_ENV_";

/// Deployment-wide stack configuration.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Project name (physical name prefix)
    pub project: String,
    /// Environment name (dev, staging, prod)
    pub environment: String,
    /// AWS region
    pub region: String,
    /// OAuth authorization-code callback URL
    pub callback_url: String,
    /// Cross-origin policy of the routing layer
    pub cors: CorsPolicy,
    /// Identity-management grant on the execution role
    pub identity_admin: IdentityAdminAccess,
    /// Permission policy of the authenticated end-user role
    pub authenticated_access: AuthenticatedAccess,
    /// Literal values replacing the compute unit's wired environment
    pub compute_env_overrides: BTreeMap<String, String>,
}

impl StackConfig {
    /// Creates a configuration with defaults for everything but naming and region.
    pub fn new(project: &str, environment: &str, region: &str) -> Self {
        Self {
            project: project.to_string(),
            environment: environment.to_string(),
            region: region.to_string(),
            callback_url: DEFAULT_CALLBACK_URL.to_string(),
            cors: CorsPolicy::default(),
            identity_admin: IdentityAdminAccess::default(),
            authenticated_access: AuthenticatedAccess::default(),
            compute_env_overrides: BTreeMap::new(),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// `environment` and `region` come from the command line when given and
    /// take precedence over `ENVIRONMENT` / `AWS_REGION`.
    pub fn from_env(environment: Option<&str>, region: Option<&str>) -> Result<Self, InfraError> {
        let project = env::var("STACK_PROJECT").unwrap_or_else(|_| DEFAULT_PROJECT.to_string());
        let environment = environment.map(str::to_string).unwrap_or_else(|| {
            env::var("ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
        });
        let region = region.map(str::to_string).unwrap_or_else(|| {
            env::var("AWS_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string())
        });

        let mut config = Self::new(&project, &environment, &region);

        if let Ok(url) = env::var("OAUTH_CALLBACK_URL") {
            config.callback_url = url;
        }
        if let Ok(origins) = env::var("CORS_ALLOW_ORIGINS") {
            config.cors = CorsPolicy::default().with_origins(
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        if let Ok(access) = env::var("IDENTITY_ADMIN_ACCESS") {
            config.identity_admin = IdentityAdminAccess::from_str(&access)?;
        }
        if let Ok(access) = env::var("AUTHENTICATED_ACCESS") {
            config.authenticated_access = AuthenticatedAccess::from_str(&access)?;
        }
        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix(COMPUTE_ENV_PREFIX) {
                config.compute_env_overrides.insert(name.to_string(), value);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks naming and URL constraints.
    pub fn validate(&self) -> Result<(), InfraError> {
        for (field, value) in [("project", &self.project), ("environment", &self.environment)] {
            if value.is_empty()
                || !value
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return Err(InfraError::invalid(
                    field,
                    format!("{value:?} must be lowercase alphanumeric or '-'"),
                ));
            }
        }

        if self.region.is_empty() {
            return Err(InfraError::invalid("region", "must not be empty"));
        }

        let callback = Url::parse(&self.callback_url)
            .map_err(|e| InfraError::invalid("callback_url", e.to_string()))?;
        let local = matches!(callback.host_str(), Some("localhost") | Some("127.0.0.1"));
        if callback.scheme() != "https" && !(callback.scheme() == "http" && local) {
            return Err(InfraError::invalid(
                "callback_url",
                "must use https unless it points at localhost",
            ));
        }

        Ok(())
    }

    /// CloudFormation stack name.
    pub fn stack_name(&self) -> String {
        format!("{}-{}", self.project, self.environment)
    }

    /// Physical resource name of the form `{project}-{kind}-{env}`.
    pub fn resource_name(&self, kind: &str) -> String {
        format!("{}-{}-{}", self.project, kind, self.environment)
    }

    /// True for the production environment.
    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "prod" | "production")
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROJECT, DEFAULT_ENVIRONMENT, DEFAULT_REGION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_config_naming() {
        let config = StackConfig::new("tasklists", "test", "eu-west-1");
        assert_eq!(config.stack_name(), "tasklists-test");
        assert_eq!(config.resource_name("items"), "tasklists-items-test");
        assert!(!config.is_production());
        assert!(StackConfig::new("tasklists", "prod", "eu-west-1").is_production());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut config = StackConfig::default();
        assert!(config.validate().is_ok());

        config.project = "Task_Lists".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_callback_url() {
        let mut config = StackConfig::default();

        config.callback_url = "https://app.example.com/callback".to_string();
        assert!(config.validate().is_ok());

        config.callback_url = "http://app.example.com/callback".to_string();
        assert!(config.validate().is_err());

        config.callback_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
