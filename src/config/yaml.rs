//! YAML documents with `!env`, `!file` and `!include` tags.
//!
//! - `!env NAME` is replaced by the variable's value, itself parsed as YAML
//! - `!file PATH` is replaced by the trimmed text of the file
//! - `!include PATH` is replaced by the YAML document in the file
//!
//! Paths are relative to the directory of the file holding the tag.

use std::path::Path;

use serde_yaml::Value;
use serde_yaml::value::TaggedValue;

use super::validation::ConfigError;

/// Read a YAML file and resolve its tags.
pub fn load_yaml(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_yaml(&content, base)
}

/// Parse YAML text and resolve its tags relative to `base`.
pub fn parse_yaml(content: &str, base: &Path) -> Result<Value, ConfigError> {
    let value: Value = serde_yaml::from_str(content)?;
    resolve_tags(value, base)
}

fn resolve_tags(value: Value, base: &Path) -> Result<Value, ConfigError> {
    match value {
        Value::Tagged(tagged) => resolve_tag(*tagged, base),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| resolve_tags(item, base))
            .collect::<Result<_, _>>()
            .map(Value::Sequence),
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(key, value)| -> Result<_, ConfigError> { Ok((key, resolve_tags(value, base)?)) })
            .collect::<Result<_, _>>()
            .map(Value::Mapping),
        other => Ok(other),
    }
}

fn resolve_tag(tagged: TaggedValue, base: &Path) -> Result<Value, ConfigError> {
    let TaggedValue { tag, value } = tagged;
    let tag = tag.to_string();
    let name = tag.trim_start_matches('!');
    let Value::String(arg) = value else {
        return Err(ConfigError::invalid(format!("tag '{tag}' requires a string value")));
    };

    match name {
        "env" => {
            let raw = std::env::var(&arg).map_err(|_| {
                ConfigError::invalid(format!("while processing 'env' tag: variable {arg} undefined"))
            })?;
            Ok(serde_yaml::from_str(&raw)?)
        }
        "file" => {
            let path = base.join(&arg);
            std::fs::read_to_string(&path)
                .map(|text| Value::String(text.trim().to_string()))
                .map_err(|_| {
                    ConfigError::invalid(format!(
                        "while processing 'file' tag: file {} not found",
                        path.display()
                    ))
                })
        }
        "include" => {
            let path = base.join(&arg);
            if !path.is_file() {
                return Err(ConfigError::invalid(format!(
                    "while processing 'include' tag: file {} not found",
                    path.display()
                )));
            }
            load_yaml(&path)
        }
        _ => Err(ConfigError::invalid(format!("unknown tag '{tag}'"))),
    }
}
