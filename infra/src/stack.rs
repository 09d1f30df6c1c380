//! The whole deployment unit: every resource wired together, synthesized into
//! one template, plus the outputs a deployed stack reports back.

use crate::api::RestApi;
use crate::compute::Function;
use crate::iam::{authenticated_role, execution_role, Role};
use crate::identity::{ClientRegistration, IdentityPool, IdentityPoolRoleAttachment, UserPool};
use crate::table::Table;
use crate::template::{Export, Expr, Output, Template};
use crate::{InfraError, InfraResult, StackConfig};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::debug;

/// Output: base URL of the API stage.
pub const OUTPUT_API_URL: &str = "ApiUrl";
/// Output: function ARN.
pub const OUTPUT_FUNCTION_ARN: &str = "FunctionArn";
/// Output: execution role ARN.
pub const OUTPUT_EXECUTION_ROLE_ARN: &str = "ExecutionRoleArn";
/// Output: identity pool id.
pub const OUTPUT_IDENTITY_POOL_ID: &str = "IdentityPoolId";
/// Output: user pool id.
pub const OUTPUT_USER_POOL_ID: &str = "UserPoolId";
/// Output: app client id.
pub const OUTPUT_USER_POOL_CLIENT_ID: &str = "UserPoolClientId";
/// Output: table name.
pub const OUTPUT_TABLE_NAME: &str = "TableName";

/// Outputs every deployed stack must report.
pub const REQUIRED_OUTPUTS: [&str; 6] = [
    OUTPUT_API_URL,
    OUTPUT_FUNCTION_ARN,
    OUTPUT_EXECUTION_ROLE_ARN,
    OUTPUT_IDENTITY_POOL_ID,
    OUTPUT_USER_POOL_ID,
    OUTPUT_USER_POOL_CLIENT_ID,
];

/// A fully wired stack.
#[derive(Debug, Clone)]
pub struct Stack {
    /// Settings the stack was built from
    pub config: StackConfig,
    /// Items table
    pub table: Table,
    /// User directory
    pub user_pool: UserPool,
    /// Web app client
    pub client: ClientRegistration,
    /// Identity pool
    pub identity_pool: IdentityPool,
    /// Function execution role
    pub execution_role: Role,
    /// The function
    pub function: Function,
    /// REST API
    pub api: RestApi,
    /// Role of signed-in identities
    pub authenticated_role: Role,
    /// Identity pool role binding
    pub role_attachment: IdentityPoolRoleAttachment,
}

impl Stack {
    /// Builds every resource from a validated configuration.
    pub fn new(config: &StackConfig) -> InfraResult<Self> {
        config.validate()?;

        let table = Table::new(config);
        let user_pool = UserPool::new(config);
        let client = ClientRegistration::new(config, &user_pool);
        let identity_pool = IdentityPool::new(config, &user_pool, &client);
        let execution_role = execution_role(config, &table, &user_pool, &identity_pool);
        let function = Function::new(config, &execution_role, &table, &user_pool, &identity_pool);
        let api = RestApi::new(config, &function, &user_pool, &client);
        let authenticated_role = authenticated_role(config, &identity_pool, &api);
        let role_attachment = IdentityPoolRoleAttachment::new(&identity_pool, &authenticated_role);

        Ok(Self {
            config: config.clone(),
            table,
            user_pool,
            client,
            identity_pool,
            execution_role,
            function,
            api,
            authenticated_role,
            role_attachment,
        })
    }

    /// Stack name in CloudFormation.
    pub fn name(&self) -> String {
        self.config.stack_name()
    }

    /// Renders the stack into a template.
    pub fn synthesize(&self) -> InfraResult<Template> {
        let mut template = Template::new(format!(
            "Task lists backend ({} / {})",
            self.config.project, self.config.environment
        ));

        self.table.synthesize(&mut template)?;
        self.user_pool.synthesize(&mut template)?;
        self.client.synthesize(&mut template)?;
        self.identity_pool.synthesize(&mut template)?;
        self.execution_role.synthesize(&mut template)?;
        self.function.synthesize(&mut template)?;
        self.api.synthesize(&mut template)?;
        self.authenticated_role.synthesize(&mut template)?;
        self.role_attachment.synthesize(&mut template)?;

        let stack_name = self.name();
        let outputs = [
            (OUTPUT_API_URL, "Base URL of the API stage", self.api.url()),
            (OUTPUT_FUNCTION_ARN, "Function ARN", self.function.arn()),
            (OUTPUT_EXECUTION_ROLE_ARN, "Function execution role ARN", self.execution_role.arn()),
            (OUTPUT_IDENTITY_POOL_ID, "Identity pool id", self.identity_pool.id()),
            (OUTPUT_USER_POOL_ID, "User pool id", self.user_pool.id()),
            (OUTPUT_USER_POOL_CLIENT_ID, "User pool client id", self.client.client_id()),
            (OUTPUT_TABLE_NAME, "Items table name", self.table.name_ref()),
        ];
        for (name, description, value) in outputs {
            template.add_output(
                name,
                Output {
                    description: description.to_string(),
                    value,
                    export: Some(Export {
                        name: Expr::literal(format!("{stack_name}-{name}")),
                    }),
                },
            )?;
        }

        debug!(
            stack = %stack_name,
            resources = template.resource_count(),
            "Synthesized stack template"
        );
        Ok(template)
    }
}

/// Values reported by a deployed stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOutputs {
    /// API stage URL
    pub api_url: String,
    /// Function ARN
    pub function_arn: String,
    /// Execution role ARN
    pub execution_role_arn: String,
    /// Identity pool id
    pub identity_pool_id: String,
    /// User pool id
    pub user_pool_id: String,
    /// App client id
    pub user_pool_client_id: String,
    /// Table name, when reported
    pub table_name: Option<String>,
}

impl StackOutputs {
    /// Parses `(OutputKey, OutputValue)` pairs. Every required output must be present
    /// and non-empty.
    pub fn from_pairs<I, K, V>(pairs: I) -> InfraResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let take = |key: &str| {
            map.get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| InfraError::config(format!("Stack output {key} is missing")))
        };

        Ok(Self {
            api_url: take(OUTPUT_API_URL)?,
            function_arn: take(OUTPUT_FUNCTION_ARN)?,
            execution_role_arn: take(OUTPUT_EXECUTION_ROLE_ARN)?,
            identity_pool_id: take(OUTPUT_IDENTITY_POOL_ID)?,
            user_pool_id: take(OUTPUT_USER_POOL_ID)?,
            user_pool_client_id: take(OUTPUT_USER_POOL_CLIENT_ID)?,
            table_name: take(OUTPUT_TABLE_NAME).ok(),
        })
    }

    /// Function name, the last segment of its ARN.
    pub fn function_name(&self) -> &str {
        self.function_arn
            .rsplit(':')
            .next()
            .unwrap_or(&self.function_arn)
    }

    /// Role name, the last path segment of its ARN.
    pub fn execution_role_name(&self) -> &str {
        self.execution_role_arn
            .rsplit('/')
            .next()
            .unwrap_or(&self.execution_role_arn)
    }

    /// API id, the first host label of the stage URL.
    pub fn api_id(&self) -> Option<&str> {
        self.api_url
            .strip_prefix("https://")
            .and_then(|rest| rest.split('.').next())
            .filter(|id| !id.is_empty())
    }

    /// Renders a dotenv file for front-end and local development.
    pub fn to_env_file(&self, environment: &str, region: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated from stack outputs ({environment})");
        let mut line = |key: &str, value: &str| {
            let _ = writeln!(out, "{key}={value}");
        };
        line("ENVIRONMENT", environment);
        line("AWS_REGION", region);
        line("API_URL", &self.api_url);
        line("USER_POOL_ID", &self.user_pool_id);
        line("USER_POOL_CLIENT_ID", &self.user_pool_client_id);
        line("IDENTITY_POOL_ID", &self.identity_pool_id);
        line("FUNCTION_ARN", &self.function_arn);
        if let Some(table) = &self.table_name {
            line("TABLE_NAME", table);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> Vec<(&'static str, &'static str)> {
        vec![
            (OUTPUT_API_URL, "https://a1b2c3.execute-api.us-west-2.amazonaws.com/prod/"),
            (
                OUTPUT_FUNCTION_ARN,
                "arn:aws:lambda:us-west-2:123456789012:function:tasklists-items-dev",
            ),
            (
                OUTPUT_EXECUTION_ROLE_ARN,
                "arn:aws:iam::123456789012:role/tasklists-function-role-dev",
            ),
            (OUTPUT_IDENTITY_POOL_ID, "us-west-2:0b1c2d3e-1111-2222-3333-444455556666"),
            (OUTPUT_USER_POOL_ID, "us-west-2_AbCdEf123"),
            (OUTPUT_USER_POOL_CLIENT_ID, "4abcdefghijklmnopqrstu"),
        ]
    }

    #[test]
    fn test_stack_rejects_invalid_config() {
        let config = StackConfig::new("Task Lists", "dev", "us-west-2");
        assert!(Stack::new(&config).is_err());
    }

    #[test]
    fn test_synthesized_resource_inventory() {
        let template = Stack::new(&StackConfig::default()).unwrap().synthesize().unwrap();
        let count = |ty: &str| template.resources_of_type(ty).count();

        assert_eq!(count("AWS::DynamoDB::Table"), 1);
        assert_eq!(count("AWS::Cognito::UserPool"), 1);
        assert_eq!(count("AWS::Cognito::UserPoolClient"), 1);
        assert_eq!(count("AWS::Cognito::IdentityPool"), 1);
        assert_eq!(count("AWS::Cognito::IdentityPoolRoleAttachment"), 1);
        assert_eq!(count("AWS::IAM::Role"), 2);
        assert_eq!(count("AWS::Lambda::Function"), 1);
        assert_eq!(count("AWS::Lambda::Permission"), 1);
        assert_eq!(count("AWS::ApiGateway::RestApi"), 1);
        assert_eq!(count("AWS::ApiGateway::Authorizer"), 1);
        assert_eq!(count("AWS::ApiGateway::Deployment"), 1);
        assert_eq!(count("AWS::ApiGateway::Stage"), 1);
        // 8 routes + one preflight per resource path
        assert_eq!(count("AWS::ApiGateway::Method"), 8 + 5);
    }

    #[test]
    fn test_synthesized_references_resolve() {
        let template = Stack::new(&StackConfig::default()).unwrap().synthesize().unwrap();
        let value = template.to_value().unwrap();
        let parameters: Vec<&str> = template.parameter_names().collect();

        fn collect(value: &serde_json::Value, refs: &mut Vec<String>) {
            match value {
                serde_json::Value::Object(map) => {
                    if let Some(serde_json::Value::String(target)) = map.get("Ref") {
                        refs.push(target.clone());
                    }
                    if let Some(serde_json::Value::Array(att)) = map.get("Fn::GetAtt") {
                        if let Some(serde_json::Value::String(target)) = att.first() {
                            refs.push(target.clone());
                        }
                    }
                    map.values().for_each(|v| collect(v, refs));
                }
                serde_json::Value::Array(items) => items.iter().for_each(|v| collect(v, refs)),
                _ => {}
            }
        }

        let mut refs = Vec::new();
        collect(&value, &mut refs);
        assert!(!refs.is_empty());
        for target in refs {
            if target.starts_with("AWS::") {
                continue;
            }
            assert!(
                template.resource(&target).is_some() || parameters.contains(&target.as_str()),
                "dangling reference to {target}"
            );
        }
    }

    #[test]
    fn test_outputs_are_exported() {
        let template = Stack::new(&StackConfig::default()).unwrap().synthesize().unwrap();
        let value = template.to_value().unwrap();
        for name in REQUIRED_OUTPUTS {
            assert!(template.outputs().contains_key(name), "{name}");
        }
        assert_eq!(
            value["Outputs"][OUTPUT_USER_POOL_ID]["Export"]["Name"],
            json!("tasklists-dev-UserPoolId")
        );
    }

    #[test]
    fn test_stack_outputs_parsing() {
        let parsed = StackOutputs::from_pairs(outputs()).unwrap();
        assert_eq!(parsed.function_name(), "tasklists-items-dev");
        assert_eq!(parsed.execution_role_name(), "tasklists-function-role-dev");
        assert_eq!(parsed.api_id(), Some("a1b2c3"));
        assert_eq!(parsed.table_name, None);

        let mut missing = outputs();
        missing.retain(|(k, _)| *k != OUTPUT_USER_POOL_CLIENT_ID);
        assert!(StackOutputs::from_pairs(missing).is_err());

        let mut empty = outputs();
        empty.push((OUTPUT_USER_POOL_ID, ""));
        assert!(StackOutputs::from_pairs(empty).is_err());
    }

    #[test]
    fn test_env_file() {
        let env = StackOutputs::from_pairs(outputs()).unwrap().to_env_file("dev", "us-west-2");
        assert!(env.contains("USER_POOL_ID=us-west-2_AbCdEf123\n"));
        assert!(env.contains("USER_POOL_CLIENT_ID=4abcdefghijklmnopqrstu\n"));
        assert!(env.contains("API_URL=https://a1b2c3.execute-api.us-west-2.amazonaws.com/prod/\n"));
        assert!(!env.contains("TABLE_NAME"));
    }
}
