use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Attribute section holding the group settings.
pub const GROUP_SECTION: &str = "group";
/// Ordered list of member store names.
pub const GROUP_MEMBERS_KEY: &str = "members";
/// Name of the placement policy.
pub const GROUP_FILL_POLICY_KEY: &str = "fillPolicy";

/// The persisted configuration of a blob store.
///
/// Attributes are grouped in sections, e.g. `group.members` lives under
/// `attributes["group"]["members"]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobStoreConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl BlobStoreConfiguration {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.attributes
            .entry(section.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, section: &str, key: &str) -> Option<&Value> {
        self.attributes.get(section).and_then(|s| s.get(key))
    }
}

/// The group settings parsed from a [BlobStoreConfiguration].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupConfiguration {
    pub members: Vec<String>,
    /// None if unset, the group then uses the default policy.
    pub fill_policy: Option<String>,
}

impl TryFrom<&BlobStoreConfiguration> for GroupConfiguration {
    type Error = Error;

    fn try_from(config: &BlobStoreConfiguration) -> Result<Self, Self::Error> {
        let members = match config.attribute(GROUP_SECTION, GROUP_MEMBERS_KEY) {
            None | Some(Value::Null) => vec![],
            Some(Value::Array(names)) => names
                .iter()
                .map(|v| match v {
                    Value::String(name) if !name.is_empty() => Ok(name.clone()),
                    other => Err(Error::InvalidRequest(format!(
                        "{}: invalid member name {}",
                        config.name, other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(Error::InvalidRequest(format!(
                    "{}: {}.{} must be a list, got {}",
                    config.name, GROUP_SECTION, GROUP_MEMBERS_KEY, other
                )))
            }
        };

        for (i, name) in members.iter().enumerate() {
            if *name == config.name {
                return Err(Error::InvalidRequest(format!(
                    "{}: a group cannot be its own member",
                    config.name
                )));
            }
            if members[..i].contains(name) {
                return Err(Error::InvalidRequest(format!(
                    "{}: duplicate member {}",
                    config.name, name
                )));
            }
        }

        let fill_policy = match config.attribute(GROUP_SECTION, GROUP_FILL_POLICY_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(other) => {
                return Err(Error::InvalidRequest(format!(
                    "{}: {}.{} must be a string, got {}",
                    config.name, GROUP_SECTION, GROUP_FILL_POLICY_KEY, other
                )))
            }
        };

        Ok(Self {
            members,
            fill_policy,
        })
    }
}
