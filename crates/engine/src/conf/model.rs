//! Model — the configuration document as written by users.
//!
//! This is the loosely-typed shape; [`super::DescriptorSet`] is what the
//! engine actually runs on once it has been validated.

use serde::Deserialize;

use super::serde_utils::deserialize_ordered_map;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct DescriptorConfig {
    /// Trigger text → options, in declaration order
    #[serde(deserialize_with = "deserialize_ordered_map")]
    pub user_status_lines: Vec<(String, StatusLineConfig)>,
    /// Chart definitions; only the chart renderer reads these
    pub user_charts: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct StatusLineConfig {
    /// Prepended to every column alias contributed by this line
    #[serde(alias = "keyPrefix")]
    pub field_prefix: Option<String>,
    /// Raw field name → display alias. Raw names starting with `=` declare
    /// computed fields (`=rx /sec`, `=pm delta MB`).
    #[serde(
        rename = "field:alias",
        alias = "key:alias",
        deserialize_with = "deserialize_ordered_map"
    )]
    pub field_alias: Vec<(String, String)>,
    /// Makes the line keyed: one set of columns per captured `key`
    pub key_regex: Option<String>,
    pub max_keys_to_allocate_columns_for: Option<usize>,
}

impl DescriptorConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
