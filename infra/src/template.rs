//! CloudFormation template model.
//!
//! Resources are described as typed Rust values elsewhere in this crate and
//! lowered into this model for synthesis. Maps are ordered so that the same
//! stack always renders byte-identical JSON, which keeps change sets quiet.

use crate::{InfraError, InfraResult};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// CloudFormation template format version.
pub const FORMAT_VERSION: &str = "2010-09-09";

/// A CloudFormation value: either a literal or an intrinsic function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Plain string value
    Literal(String),
    /// `{"Ref": id}`
    Ref(String),
    /// `{"Fn::GetAtt": [id, attribute]}`
    GetAtt(String, String),
    /// `{"Fn::Sub": template}`
    Sub(String),
    /// `{"Fn::Join": [delimiter, parts]}`
    Join(String, Vec<Expr>),
}

impl Expr {
    /// Creates a literal value.
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a `Ref` to a resource, parameter or pseudo parameter.
    pub fn reference(logical_id: impl Into<String>) -> Self {
        Self::Ref(logical_id.into())
    }

    /// Creates a `Fn::GetAtt`.
    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::GetAtt(logical_id.into(), attribute.into())
    }

    /// Creates a `Fn::Sub`.
    pub fn sub(template: impl Into<String>) -> Self {
        Self::Sub(template.into())
    }

    /// `AWS::Region` pseudo parameter.
    pub fn region() -> Self {
        Self::reference("AWS::Region")
    }

    /// Literal `*`.
    pub fn wildcard() -> Self {
        Self::literal("*")
    }

    /// Returns the literal string, if this is a literal.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// True for the literal `*`.
    pub fn is_wildcard(&self) -> bool {
        self.as_literal() == Some("*")
    }

    /// Logical ids this expression depends on.
    pub fn references(&self) -> Vec<String> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Ref(id) | Self::GetAtt(id, _) => {
                if id.starts_with("AWS::") {
                    Vec::new()
                } else {
                    vec![id.clone()]
                }
            }
            Self::Sub(template) => sub_variables(template)
                .into_iter()
                .filter(|var| !var.starts_with("AWS::"))
                .map(|var| var.split('.').next().unwrap_or(&var).to_string())
                .collect(),
            Self::Join(_, parts) => parts.iter().flat_map(Expr::references).collect(),
        }
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Self::literal(value)
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Literal(value) => serializer.serialize_str(value),
            Self::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Ref", id)?;
                map.end()
            }
            Self::GetAtt(id, attribute) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::GetAtt", &[id, attribute])?;
                map.end()
            }
            Self::Sub(template) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::Sub", template)?;
                map.end()
            }
            Self::Join(delimiter, parts) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::Join", &(delimiter, parts))?;
                map.end()
            }
        }
    }
}

/// Extracts `${Name}` variables from a `Fn::Sub` template, skipping `${!Literal}` escapes.
fn sub_variables(template: &str) -> Vec<String> {
    let mut variables = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if !name.starts_with('!') {
                    variables.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    variables
}

/// Physical values for logical ids, used to evaluate expressions outside CloudFormation.
///
/// Keys are logical ids (for `Ref`), `Id.Attribute` pairs (for `Fn::GetAtt`)
/// and pseudo parameters such as `AWS::Region`.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: HashMap<String, String>,
}

impl Bindings {
    /// Creates empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a `Ref` target.
    pub fn with_ref(mut self, logical_id: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(logical_id.into(), value.into());
        self
    }

    /// Binds a `Fn::GetAtt` target.
    pub fn with_att(
        mut self,
        logical_id: &str,
        attribute: &str,
        value: impl Into<String>,
    ) -> Self {
        self.values
            .insert(format!("{logical_id}.{attribute}"), value.into());
        self
    }

    /// Resolves an expression, or `None` if anything it mentions is unbound.
    pub fn resolve(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Literal(value) => Some(value.clone()),
            Expr::Ref(id) => self.values.get(id).cloned(),
            Expr::GetAtt(id, attribute) => self.values.get(&format!("{id}.{attribute}")).cloned(),
            Expr::Sub(template) => self.substitute(template),
            Expr::Join(delimiter, parts) => parts
                .iter()
                .map(|part| self.resolve(part))
                .collect::<Option<Vec<_>>>()
                .map(|resolved| resolved.join(delimiter)),
        }
    }

    fn substitute(&self, template: &str) -> Option<String> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}')?;
            let name = &after[..end];
            match name.strip_prefix('!') {
                Some(escaped) => {
                    output.push_str("${");
                    output.push_str(escaped);
                    output.push('}');
                }
                None => output.push_str(self.values.get(name)?),
            }
            rest = &after[end + 1..];
        }
        output.push_str(rest);
        Some(output)
    }
}

/// Template input parameter.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    /// Parameter type, e.g. `String`
    #[serde(rename = "Type")]
    pub parameter_type: String,
    /// Human readable description
    pub description: String,
    /// Default value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Parameter {
    /// Creates a string parameter without default.
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            parameter_type: "String".to_string(),
            description: description.into(),
            default: None,
        }
    }
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    /// CloudFormation resource type, e.g. `AWS::DynamoDB::Table`
    #[serde(rename = "Type")]
    pub resource_type: String,
    /// Resource properties
    pub properties: Value,
    /// Explicit ordering dependencies
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// `Delete`, `Retain` or `Snapshot`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    /// Policy applied when an update replaces the resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<String>,
}

impl Resource {
    /// Creates a resource of the given type.
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    /// Adds explicit dependencies.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Sets both deletion and update-replace policies.
    pub fn retention(mut self, policy: &str) -> Self {
        self.deletion_policy = Some(policy.to_string());
        self.update_replace_policy = Some(policy.to_string());
        self
    }
}

/// Stack output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    /// Human readable description
    pub description: String,
    /// Output value
    pub value: Expr,
    /// Cross-stack export
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

/// Cross-stack export name.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    /// Export name
    pub name: Expr,
}

/// A synthesized CloudFormation template.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: String,
    description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<String, Parameter>,
    resources: BTreeMap<String, Resource>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, Output>,
}

impl Template {
    /// Creates an empty template.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description: description.into(),
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Declares an input parameter.
    pub fn add_parameter(&mut self, name: &str, parameter: Parameter) -> InfraResult<()> {
        if self.parameters.contains_key(name) || self.resources.contains_key(name) {
            return Err(InfraError::DuplicateResource(name.to_string()));
        }
        self.parameters.insert(name.to_string(), parameter);
        Ok(())
    }

    /// Declares a resource. Logical ids are unique across parameters and resources.
    pub fn add_resource(&mut self, logical_id: &str, resource: Resource) -> InfraResult<()> {
        if !is_valid_logical_id(logical_id) {
            return Err(InfraError::invalid(
                "LogicalId",
                format!("{logical_id:?} must be non-empty and alphanumeric"),
            ));
        }
        if self.resources.contains_key(logical_id) || self.parameters.contains_key(logical_id) {
            return Err(InfraError::DuplicateResource(logical_id.to_string()));
        }
        self.resources.insert(logical_id.to_string(), resource);
        Ok(())
    }

    /// Declares an output.
    pub fn add_output(&mut self, name: &str, output: Output) -> InfraResult<()> {
        if self.outputs.contains_key(name) {
            return Err(InfraError::DuplicateResource(name.to_string()));
        }
        self.outputs.insert(name.to_string(), output);
        Ok(())
    }

    /// Looks up a resource by logical id.
    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    /// All resources of one type, in logical id order.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource.resource_type == resource_type)
            .map(|(id, resource)| (id.as_str(), resource))
    }

    /// Declared parameter names.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    /// Declared outputs.
    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    /// Number of declared resources.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Renders the template as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> InfraResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Renders the template as a JSON value.
    pub fn to_value(&self) -> InfraResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// CloudFormation logical ids are ASCII alphanumeric.
pub fn is_valid_logical_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 255 && id.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expr_serialization() {
        assert_eq!(serde_json::to_value(Expr::literal("a")).unwrap(), json!("a"));
        assert_eq!(
            serde_json::to_value(Expr::reference("Table")).unwrap(),
            json!({"Ref": "Table"})
        );
        assert_eq!(
            serde_json::to_value(Expr::get_att("Table", "Arn")).unwrap(),
            json!({"Fn::GetAtt": ["Table", "Arn"]})
        );
        assert_eq!(
            serde_json::to_value(Expr::Join(
                ":".to_string(),
                vec![Expr::literal("a"), Expr::reference("B")]
            ))
            .unwrap(),
            json!({"Fn::Join": [":", ["a", {"Ref": "B"}]]})
        );
    }

    #[test]
    fn test_expr_references_skip_pseudo_parameters() {
        let expr = Expr::sub("arn:${AWS::Partition}:execute-api:${AWS::Region}:${Api}/*/${Fn.Arn}");
        assert_eq!(expr.references(), vec!["Api".to_string(), "Fn".to_string()]);
        assert!(Expr::region().references().is_empty());
    }

    #[test]
    fn test_bindings_resolve() {
        let bindings = Bindings::new()
            .with_ref("AWS::Region", "us-west-2")
            .with_ref("Pool", "us-west-2_abc")
            .with_att("Table", "Arn", "arn:aws:dynamodb:us-west-2:1:table/t");

        assert_eq!(
            bindings.resolve(&Expr::reference("Pool")).as_deref(),
            Some("us-west-2_abc")
        );
        assert_eq!(
            bindings.resolve(&Expr::sub("${AWS::Region}/${Pool}/${!Literal}")).as_deref(),
            Some("us-west-2/us-west-2_abc/${Literal}")
        );
        assert!(bindings.resolve(&Expr::reference("Missing")).is_none());
        assert!(bindings.resolve(&Expr::sub("${Missing}")).is_none());
    }

    #[test]
    fn test_template_rejects_duplicates() {
        let mut template = Template::new("test");
        template
            .add_resource("Table", Resource::new("AWS::DynamoDB::Table", json!({})))
            .unwrap();
        let err = template
            .add_resource("Table", Resource::new("AWS::DynamoDB::Table", json!({})))
            .unwrap_err();
        assert_eq!(err, InfraError::DuplicateResource("Table".to_string()));

        let err = template
            .add_parameter("Table", Parameter::string("clash"))
            .unwrap_err();
        assert_eq!(err, InfraError::DuplicateResource("Table".to_string()));
    }

    #[test]
    fn test_template_rejects_bad_logical_id() {
        let mut template = Template::new("test");
        assert!(template
            .add_resource("items-table", Resource::new("AWS::DynamoDB::Table", json!({})))
            .is_err());
    }

    #[test]
    fn test_template_json_shape() {
        let mut template = Template::new("demo");
        template
            .add_resource(
                "Table",
                Resource::new("AWS::DynamoDB::Table", json!({"TableName": "t"}))
                    .retention("Retain"),
            )
            .unwrap();
        template
            .add_output(
                "TableName",
                Output {
                    description: "Name".to_string(),
                    value: Expr::reference("Table"),
                    export: None,
                },
            )
            .unwrap();

        let value = template.to_value().unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(value["Resources"]["Table"]["Type"], "AWS::DynamoDB::Table");
        assert_eq!(value["Resources"]["Table"]["DeletionPolicy"], "Retain");
        assert!(value["Resources"]["Table"].get("DependsOn").is_none());
        assert_eq!(value["Outputs"]["TableName"]["Value"], json!({"Ref": "Table"}));
        assert!(value.get("Parameters").is_none());
    }
}
