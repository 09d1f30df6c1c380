//! Compute unit declaration and its runtime environment contract.
//!
//! The function receives the identity directory, region and identity pool
//! through environment variables. In the synthesized template those values are
//! wired to the real resources; literal overrides are possible and are the one
//! place a placeholder can sneak in, so both the audit and the function's own
//! cold start reject placeholder values.

use crate::iam::Role;
use crate::identity::{IdentityPool, UserPool};
use crate::table::Table;
use crate::template::{Expr, Parameter, Resource, Template};
use crate::{InfraError, InfraResult, StackConfig};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Logical id of the function.
pub const FUNCTION_ID: &str = "ItemsFunction";
/// Template parameter naming the S3 bucket of the deployment package.
pub const CODE_BUCKET_PARAMETER: &str = "CodeBucket";
/// Template parameter naming the S3 key of the deployment package.
pub const CODE_KEY_PARAMETER: &str = "CodeKey";

/// Hard invocation timeout.
pub const FUNCTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Memory size in MB.
pub const FUNCTION_MEMORY_MB: u32 = 256;

/// Identity directory id variable.
pub const ENV_USER_POOL_ID: &str = "USER_POOL_ID";
/// Region variable.
pub const ENV_REGION: &str = "REGION";
/// Identity pool id variable.
pub const ENV_IDENTITY_POOL_ID: &str = "IDENTITY_POOL_ID";
/// Table name variable.
pub const ENV_TABLE_NAME: &str = "TABLE_NAME";

/// Optional comma-separated list of origins allowed to read responses.
pub const ENV_CORS_ALLOW_ORIGINS: &str = "CORS_ALLOW_ORIGINS";

/// Every variable the function requires.
pub const REQUIRED_ENV: [&str; 4] =
    [ENV_USER_POOL_ID, ENV_REGION, ENV_IDENTITY_POOL_ID, ENV_TABLE_NAME];

const PLACEHOLDER_MARKERS: [&str; 6] = [
    "placeholder",
    "changeme",
    "change-me",
    "your-",
    "replace",
    "xxx",
];

/// Returns true when `value` is obviously not a real value for variable `name`.
///
/// Empty values, values equal to the variable's own name, angle-bracket
/// templates such as `<pool-id>` and common placeholder words all count.
pub fn is_placeholder(name: &str, value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(name) {
        return true;
    }
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Function CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Graviton
    Arm64,
    /// Intel/AMD
    X86_64,
}

impl Architecture {
    /// CloudFormation spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::X86_64 => "x86_64",
        }
    }
}

/// The compute unit.
#[derive(Debug, Clone)]
pub struct Function {
    /// Logical id
    pub logical_id: String,
    /// Physical function name
    pub name: String,
    /// Runtime identifier
    pub runtime: String,
    /// Handler name
    pub handler: String,
    /// CPU architecture
    pub architecture: Architecture,
    /// Memory size in MB
    pub memory_mb: u32,
    /// Invocation timeout
    pub timeout: Duration,
    /// Execution role ARN
    pub role: Expr,
    /// Environment variables
    pub environment: BTreeMap<String, Expr>,
}

impl Function {
    /// Declares the function, wiring its environment to the given resources.
    pub fn new(
        config: &StackConfig,
        role: &Role,
        table: &Table,
        user_pool: &UserPool,
        identity_pool: &IdentityPool,
    ) -> Self {
        let mut environment = BTreeMap::from([
            (ENV_USER_POOL_ID.to_string(), user_pool.id()),
            (ENV_REGION.to_string(), Expr::region()),
            (ENV_IDENTITY_POOL_ID.to_string(), identity_pool.id()),
            (ENV_TABLE_NAME.to_string(), table.name_ref()),
        ]);
        if !config.cors.allows_any_origin() {
            environment.insert(
                ENV_CORS_ALLOW_ORIGINS.to_string(),
                Expr::literal(config.cors.allow_origins.join(",")),
            );
        }
        for (name, value) in &config.compute_env_overrides {
            environment.insert(name.clone(), Expr::literal(value.clone()));
        }

        Self {
            logical_id: FUNCTION_ID.to_string(),
            name: config.resource_name("items"),
            runtime: "provided.al2023".to_string(),
            handler: "bootstrap".to_string(),
            architecture: Architecture::Arm64,
            memory_mb: FUNCTION_MEMORY_MB,
            timeout: FUNCTION_TIMEOUT,
            role: role.arn(),
            environment,
        }
    }

    /// Function ARN.
    pub fn arn(&self) -> Expr {
        Expr::get_att(&self.logical_id, "Arn")
    }

    /// Literal environment values that look like placeholders.
    pub fn placeholder_variables(&self) -> Vec<(&str, &str)> {
        self.environment
            .iter()
            .filter(|(name, _)| name.as_str() != ENV_CORS_ALLOW_ORIGINS)
            .filter_map(|(name, value)| {
                value
                    .as_literal()
                    .filter(|literal| is_placeholder(name, literal))
                    .map(|literal| (name.as_str(), literal))
            })
            .collect()
    }

    /// Adds the code parameters and the function to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        let seconds = self.timeout.as_secs();
        if !(1..=900).contains(&seconds) {
            return Err(InfraError::invalid("Timeout", "must be between 1 and 900 seconds"));
        }

        template.add_parameter(
            CODE_BUCKET_PARAMETER,
            Parameter::string("S3 bucket holding the function deployment package"),
        )?;
        template.add_parameter(
            CODE_KEY_PARAMETER,
            Parameter::string("S3 key of the function deployment package"),
        )?;

        let mut variables = Map::new();
        for (name, value) in &self.environment {
            variables.insert(name.clone(), serde_json::to_value(value)?);
        }

        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::Lambda::Function",
                json!({
                    "FunctionName": self.name,
                    "Runtime": self.runtime,
                    "Handler": self.handler,
                    "Architectures": [self.architecture.as_str()],
                    "MemorySize": self.memory_mb,
                    "Timeout": seconds,
                    "Role": self.role,
                    "Code": {
                        "S3Bucket": Expr::reference(CODE_BUCKET_PARAMETER),
                        "S3Key": Expr::reference(CODE_KEY_PARAMETER),
                    },
                    "Environment": { "Variables": Value::Object(variables) },
                }),
            )
            .depends_on(self.role.references()),
        )
    }
}

/// Environment the function reads at cold start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeEnv {
    /// Identity directory id
    pub user_pool_id: String,
    /// Deployment region
    pub region: String,
    /// Identity pool id
    pub identity_pool_id: String,
    /// Items table name
    pub table_name: String,
}

impl ComputeEnv {
    /// Loads and validates the environment from process variables.
    pub fn from_env() -> Result<Self, InfraError> {
        let read = |name: &str| {
            env::var(name)
                .map_err(|_| InfraError::config(format!("Missing environment variable {name}")))
        };
        let env = Self {
            user_pool_id: read(ENV_USER_POOL_ID)?,
            region: read(ENV_REGION)?,
            identity_pool_id: read(ENV_IDENTITY_POOL_ID)?,
            table_name: read(ENV_TABLE_NAME)?,
        };
        env.validate()?;
        Ok(env)
    }

    /// Builds from a name → value map, such as a deployed function's configuration.
    pub fn from_map<S: std::hash::BuildHasher>(
        variables: &std::collections::HashMap<String, String, S>,
    ) -> Result<Self, InfraError> {
        let read = |name: &str| {
            variables
                .get(name)
                .cloned()
                .ok_or_else(|| InfraError::config(format!("Missing environment variable {name}")))
        };
        let env = Self {
            user_pool_id: read(ENV_USER_POOL_ID)?,
            region: read(ENV_REGION)?,
            identity_pool_id: read(ENV_IDENTITY_POOL_ID)?,
            table_name: read(ENV_TABLE_NAME)?,
        };
        env.validate()?;
        Ok(env)
    }

    /// Rejects placeholder values.
    pub fn validate(&self) -> Result<(), InfraError> {
        for (name, value) in self.pairs() {
            if is_placeholder(name, value) {
                return Err(InfraError::Placeholder {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Issuer URL of tokens minted by the identity directory.
    pub fn issuer(&self) -> String {
        format!(
            "https://cognito-idp.{}.amazonaws.com/{}",
            self.region, self.user_pool_id
        )
    }

    fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (ENV_USER_POOL_ID, self.user_pool_id.as_str()),
            (ENV_REGION, self.region.as_str()),
            (ENV_IDENTITY_POOL_ID, self.identity_pool_id.as_str()),
            (ENV_TABLE_NAME, self.table_name.as_str()),
        ]
    }
}
