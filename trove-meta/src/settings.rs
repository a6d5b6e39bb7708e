//! Provider settings schema and validation
//!
//! Each provider publishes an ordered list of setting fields. Stored settings
//! are validated against that schema before every provider call, and the
//! validated map is handed to the provider explicitly; providers never read
//! ambient configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Settings values for one provider, keyed by setting key
pub type ProviderSettings = BTreeMap<String, Value>;

/// Setting input type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    Text,
    Password,
    Number,
    Boolean,
    Dropdown,
    Multiselect,
    Url,
}

/// One entry of a provider's settings schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: SettingType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Allowed values for dropdown/multiselect
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

impl SettingField {
    pub fn new(key: impl Into<String>, label: impl Into<String>, kind: SettingType) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            kind,
            required: false,
            default: None,
            options: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }
}

/// Settings validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("missing required setting '{0}'")]
    MissingRequired(String),

    #[error("setting '{key}' must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("setting '{key}' has value '{value}' outside its options")]
    InvalidOption { key: String, value: String },

    #[error("setting '{key}' is not a valid URL: {reason}")]
    InvalidUrl { key: String, reason: String },

    #[error("unknown setting '{0}'")]
    UnknownKey(String),
}

/// Ordered provider settings schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsSchema {
    fields: Vec<SettingField>,
}

impl SettingsSchema {
    pub fn new(fields: Vec<SettingField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[SettingField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fill in schema defaults for keys absent (or null) in `settings`
    pub fn with_defaults(&self, settings: &ProviderSettings) -> ProviderSettings {
        let mut merged = settings.clone();
        for field in &self.fields {
            let absent = merged.get(&field.key).map_or(true, Value::is_null);
            if absent {
                if let Some(default) = &field.default {
                    merged.insert(field.key.clone(), default.clone());
                }
            }
        }
        merged
    }

    /// Validate stored settings against this schema
    ///
    /// Schema defaults satisfy `required`; keys the schema does not declare
    /// are rejected.
    pub fn validate(&self, settings: &ProviderSettings) -> Result<(), SettingsError> {
        if let Some(unknown) = settings
            .keys()
            .find(|k| !self.fields.iter().any(|f| &f.key == *k))
        {
            return Err(SettingsError::UnknownKey(unknown.clone()));
        }

        let effective = self.with_defaults(settings);

        for field in &self.fields {
            match effective.get(&field.key) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(SettingsError::MissingRequired(field.key.clone()));
                    }
                }
                Some(value) => validate_value(field, value)?,
            }
        }

        Ok(())
    }
}

fn validate_value(field: &SettingField, value: &Value) -> Result<(), SettingsError> {
    let wrong = |expected: &'static str| SettingsError::WrongType {
        key: field.key.clone(),
        expected,
    };

    match field.kind {
        SettingType::Text | SettingType::Password => {
            let s = value.as_str().ok_or_else(|| wrong("a string"))?;
            if field.required && s.trim().is_empty() {
                return Err(SettingsError::MissingRequired(field.key.clone()));
            }
        }
        SettingType::Number => {
            if !value.is_number() {
                return Err(wrong("a number"));
            }
        }
        SettingType::Boolean => {
            if !value.is_boolean() {
                return Err(wrong("a boolean"));
            }
        }
        SettingType::Url => {
            let s = value.as_str().ok_or_else(|| wrong("a URL string"))?;
            reqwest::Url::parse(s).map_err(|e| SettingsError::InvalidUrl {
                key: field.key.clone(),
                reason: e.to_string(),
            })?;
        }
        SettingType::Dropdown => {
            let s = value.as_str().ok_or_else(|| wrong("a string"))?;
            check_option(field, s)?;
        }
        SettingType::Multiselect => {
            let items = value.as_array().ok_or_else(|| wrong("a list of strings"))?;
            for item in items {
                let s = item.as_str().ok_or_else(|| wrong("a list of strings"))?;
                check_option(field, s)?;
            }
        }
    }

    Ok(())
}

fn check_option(field: &SettingField, value: &str) -> Result<(), SettingsError> {
    match &field.options {
        Some(options) if !options.iter().any(|o| o == value) => {
            Err(SettingsError::InvalidOption {
                key: field.key.clone(),
                value: value.to_string(),
            })
        }
        _ => Ok(()),
    }
}
