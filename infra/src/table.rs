//! Data store declaration.
//!
//! The stack owns a single DynamoDB table keyed by a composite `PK` + `SK`
//! string key and billed per request. No other attribute is declared: the
//! record shape belongs to the compute unit.

use crate::template::{Expr, Resource, Template};
use crate::{InfraError, InfraResult, StackConfig};
use serde_json::json;

/// Logical id of the table.
pub const TABLE_ID: &str = "ItemsTable";
/// Partition key attribute name.
pub const PARTITION_KEY: &str = "PK";
/// Sort key attribute name.
pub const SORT_KEY: &str = "SK";

/// DynamoDB billing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingMode {
    /// On-demand capacity
    PayPerRequest,
    /// Fixed read/write capacity units
    Provisioned {
        /// Read capacity units
        read: u32,
        /// Write capacity units
        write: u32,
    },
}

impl BillingMode {
    /// CloudFormation spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayPerRequest => "PAY_PER_REQUEST",
            Self::Provisioned { .. } => "PROVISIONED",
        }
    }
}

/// The key-value table.
#[derive(Debug, Clone)]
pub struct Table {
    /// Logical id
    pub logical_id: String,
    /// Physical table name
    pub name: String,
    /// Partition key attribute
    pub partition_key: String,
    /// Sort key attribute
    pub sort_key: String,
    /// Billing mode
    pub billing: BillingMode,
    /// Continuous backups
    pub point_in_time_recovery: bool,
    /// Keep the table when the stack is deleted
    pub retain_on_delete: bool,
}

impl Table {
    /// Declares the items table for the given deployment.
    pub fn new(config: &StackConfig) -> Self {
        Self {
            logical_id: TABLE_ID.to_string(),
            name: config.resource_name("items"),
            partition_key: PARTITION_KEY.to_string(),
            sort_key: SORT_KEY.to_string(),
            billing: BillingMode::PayPerRequest,
            point_in_time_recovery: config.is_production(),
            retain_on_delete: config.is_production(),
        }
    }

    /// `Fn::GetAtt [Table, Arn]`.
    pub fn arn(&self) -> Expr {
        Expr::get_att(&self.logical_id, "Arn")
    }

    /// `Ref Table`, which resolves to the table name.
    pub fn name_ref(&self) -> Expr {
        Expr::reference(&self.logical_id)
    }

    /// Adds the table to a template.
    pub fn synthesize(&self, template: &mut Template) -> InfraResult<()> {
        let mut properties = json!({
            "TableName": self.name,
            "AttributeDefinitions": [
                { "AttributeName": self.partition_key, "AttributeType": "S" },
                { "AttributeName": self.sort_key, "AttributeType": "S" },
            ],
            "KeySchema": [
                { "AttributeName": self.partition_key, "KeyType": "HASH" },
                { "AttributeName": self.sort_key, "KeyType": "RANGE" },
            ],
            "BillingMode": self.billing.as_str(),
            "PointInTimeRecoverySpecification": {
                "PointInTimeRecoveryEnabled": self.point_in_time_recovery,
            },
        });
        if let BillingMode::Provisioned { read, write } = self.billing {
            properties["ProvisionedThroughput"] = json!({
                "ReadCapacityUnits": read,
                "WriteCapacityUnits": write,
            });
        }

        let policy = if self.retain_on_delete { "Retain" } else { "Delete" };
        template.add_resource(
            &self.logical_id,
            Resource::new("AWS::DynamoDB::Table", properties).retention(policy),
        )
    }
}

/// Composite primary key of a table record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    /// Partition key value
    pub pk: String,
    /// Sort key value
    pub sk: String,
}

impl ItemKey {
    /// Creates a key. Any non-empty strings are accepted.
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Result<Self, InfraError> {
        let key = Self {
            pk: pk.into(),
            sk: sk.into(),
        };
        if key.pk.is_empty() {
            return Err(InfraError::invalid(PARTITION_KEY, "must not be empty"));
        }
        if key.sk.is_empty() {
            return Err(InfraError::invalid(SORT_KEY, "must not be empty"));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_declaration() {
        let config = StackConfig::new("tasklists", "dev", "us-west-2");
        let table = Table::new(&config);
        assert_eq!(table.name, "tasklists-items-dev");
        assert_eq!(table.billing, BillingMode::PayPerRequest);
        assert!(!table.retain_on_delete);

        let mut template = Template::new("test");
        table.synthesize(&mut template).unwrap();
        let value = template.to_value().unwrap();
        let resource = &value["Resources"][TABLE_ID];

        assert_eq!(resource["Type"], "AWS::DynamoDB::Table");
        assert_eq!(resource["DeletionPolicy"], "Delete");
        assert_eq!(resource["Properties"]["BillingMode"], "PAY_PER_REQUEST");
        assert_eq!(resource["Properties"]["KeySchema"][0]["AttributeName"], "PK");
        assert_eq!(resource["Properties"]["KeySchema"][0]["KeyType"], "HASH");
        assert_eq!(resource["Properties"]["KeySchema"][1]["AttributeName"], "SK");
        assert_eq!(resource["Properties"]["KeySchema"][1]["KeyType"], "RANGE");
        assert!(resource["Properties"].get("ProvisionedThroughput").is_none());
    }

    #[test]
    fn test_production_table_is_retained() {
        let config = StackConfig::new("tasklists", "prod", "us-west-2");
        let table = Table::new(&config);
        assert!(table.retain_on_delete);
        assert!(table.point_in_time_recovery);
    }

    #[test]
    fn test_item_key_accepts_arbitrary_strings() {
        let key = ItemKey::new("USER#ünïcødé sub", "LIST#a b/c#TASK#1").unwrap();
        assert_eq!(key.pk, "USER#ünïcødé sub");
        assert!(ItemKey::new("", "x").is_err());
        assert!(ItemKey::new("x", "").is_err());
    }
}
