//! Compose document representations

use serde_yaml::Value;

use crate::errors::EngineError;

/// The user-authored compose document.
///
/// This is the source of truth for what the user wrote. It never contains
/// injected labels, managed-by markers or other orchestrator-owned fields;
/// those exist only in the derived [`DeployTimeComposeDocument`].
#[derive(Debug, Clone)]
pub struct RawComposeDocument {
    text: String,
    value: Value,
}

impl RawComposeDocument {
    /// Parse user-authored compose text. Fails with a diagnostic when the
    /// YAML is malformed or the document has no `services` section.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let value: Value = serde_yaml::from_str(text)?;

        let has_services = value
            .get("services")
            .and_then(Value::as_mapping)
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        if !has_services {
            return Err(EngineError::Deployment(
                "compose document does not declare any services".to_string(),
            ));
        }

        Ok(Self {
            text: text.to_string(),
            value,
        })
    }

    /// The original, unmodified text.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Iterate over `(service name, service config)` pairs in declaration order.
    pub fn services(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.value
            .get("services")
            .and_then(Value::as_mapping)
            .into_iter()
            .flat_map(|m| m.iter())
            .filter_map(|(k, v)| k.as_str().map(|name| (name, v)))
    }

    /// A copy of the document suitable for redisplaying to the user.
    ///
    /// Orchestrator-internal fields are stripped (inline `content` under a
    /// volume entry); nothing is added. Round-tripping through this value
    /// never introduces an orchestrator-owned label.
    pub fn display_value(&self) -> Value {
        let mut copy = self.value.clone();
        if let Some(services) = copy.get_mut("services").and_then(Value::as_mapping_mut) {
            for (_, service) in services.iter_mut() {
                strip_inline_volume_content(service);
            }
        }
        copy
    }

    /// Serialize the display representation back to YAML.
    pub fn to_display_yaml(&self) -> Result<String, EngineError> {
        Ok(serde_yaml::to_string(&self.display_value())?)
    }
}

fn strip_inline_volume_content(service: &mut Value) {
    let Some(volumes) = service.get_mut("volumes").and_then(Value::as_sequence_mut) else {
        return;
    };
    for volume in volumes.iter_mut() {
        if let Some(mapping) = volume.as_mapping_mut() {
            mapping.remove(Value::from("content"));
        }
    }
}

/// The derived, deploy-time compose document.
///
/// Produced by label injection from the raw document plus deployment
/// metadata. It is regenerated on every deployment and never persisted as a
/// source of truth.
#[derive(Debug, Clone)]
pub struct DeployTimeComposeDocument {
    value: Value,
    requires_empty_env_file: bool,
}

impl DeployTimeComposeDocument {
    pub fn new(value: Value, requires_empty_env_file: bool) -> Self {
        Self {
            value,
            requires_empty_env_file,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether an empty `.env` file must be materialized next to the
    /// document even when no environment variables are defined.
    pub fn requires_empty_env_file(&self) -> bool {
        self.requires_empty_env_file
    }

    /// Labels attached to a named service, normalized to `key=value` strings.
    pub fn service_labels(&self, service: &str) -> Vec<String> {
        self.value
            .get("services")
            .and_then(|s| s.get(service))
            .and_then(|s| s.get("labels"))
            .map(labels_as_strings)
            .unwrap_or_default()
    }

    pub fn to_yaml(&self) -> Result<String, EngineError> {
        Ok(serde_yaml::to_string(&self.value)?)
    }
}

/// Normalize a compose `labels` node (mapping or string sequence) into
/// `key=value` strings, preserving order.
pub fn labels_as_strings(labels: &Value) -> Vec<String> {
    match labels {
        Value::Sequence(seq) => seq
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::Mapping(map) => map
            .iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?;
                let value = scalar_to_string(v)?;
                Some(format!("{}={}", key, value))
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  web:
    image: nginx:latest
    labels:
      - my.custom=label
    volumes:
      - type: bind
        source: ./config.conf
        target: /etc/app/config.conf
        content: |
          listen 8080;
"#;

    #[test]
    fn test_parse_requires_services() {
        assert!(RawComposeDocument::parse("version: '3'\n").is_err());
        assert!(RawComposeDocument::parse("not yaml: [").is_err());
        assert!(RawComposeDocument::parse(SAMPLE).is_ok());
    }

    #[test]
    fn test_display_strips_inline_content_only() {
        let doc = RawComposeDocument::parse(SAMPLE).unwrap();
        let yaml = doc.to_display_yaml().unwrap();

        assert!(!yaml.contains("listen 8080"));
        assert!(!yaml.contains("content"));
        // User-authored labels survive, nothing orchestrator-owned appears.
        assert!(yaml.contains("my.custom=label"));
        assert!(!yaml.contains("dockhand.managed"));
    }

    #[test]
    fn test_labels_as_strings_mapping_form() {
        let value: Value = serde_yaml::from_str("a.b: c\nd: 1\n").unwrap();
        let labels = labels_as_strings(&value);
        assert_eq!(labels, vec!["a.b=c".to_string(), "d=1".to_string()]);
    }
}
