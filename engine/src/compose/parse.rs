//! Compose service graph construction

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::compose::classify::{classify_service, ServiceClassification};
use crate::compose::document::{labels_as_strings, scalar_to_string, RawComposeDocument};
use crate::compose::volume::parse_docker_volume_string;
use crate::errors::EngineError;

/// A mounted volume, normalized from short or long syntax.
///
/// `inline_content` carries the optional inline file payload under a bind
/// mount. It is used to generate the deploy-time mount and is stripped from
/// the raw document's display form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_content: Option<String>,
}

/// One normalized service from a compose document.
///
/// Created during parsing; mutated only additively by label injection.
/// Classification is computed once here and never re-derived from labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub image: Option<String>,
    pub environment: IndexMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: Vec<String>,
    pub classification: ServiceClassification,
}

impl ServiceDefinition {
    pub fn is_database(&self) -> bool {
        self.classification == ServiceClassification::Database
    }
}

/// The normalized service graph of one compose document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGraph {
    pub services: Vec<ServiceDefinition>,
}

impl ServiceGraph {
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Build the service graph from a parsed raw document.
pub fn parse(raw: &RawComposeDocument) -> Result<ServiceGraph, EngineError> {
    let mut services = Vec::new();

    for (name, config) in raw.services() {
        let image = config
            .get("image")
            .and_then(Value::as_str)
            .map(str::to_string);

        let environment = normalize_environment(config.get("environment"));
        let volumes = normalize_volumes(name, config.get("volumes"))?;
        let labels = config.get("labels").map(labels_as_strings).unwrap_or_default();

        let classification = classify_service(image.as_deref(), Some(&environment));

        services.push(ServiceDefinition {
            name: name.to_string(),
            image,
            environment,
            volumes,
            labels,
            classification,
        });
    }

    Ok(ServiceGraph { services })
}

/// Normalize `environment` from mapping or `KEY=VALUE` list form into an
/// ordered map with unique keys; later entries win.
fn normalize_environment(node: Option<&Value>) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    match node {
        Some(Value::Mapping(map)) => {
            for (key, value) in map {
                if let (Some(key), Some(value)) = (key.as_str(), scalar_to_string(value)) {
                    env.insert(key.to_string(), value);
                }
            }
        }
        Some(Value::Sequence(seq)) => {
            for entry in seq.iter().filter_map(Value::as_str) {
                match entry.split_once('=') {
                    Some((key, value)) => env.insert(key.to_string(), value.to_string()),
                    None => env.insert(entry.to_string(), String::new()),
                };
            }
        }
        _ => {}
    }
    env
}

fn normalize_volumes(service: &str, node: Option<&Value>) -> Result<Vec<VolumeMount>, EngineError> {
    let Some(Value::Sequence(entries)) = node else {
        return Ok(Vec::new());
    };

    let mut volumes = Vec::new();
    for entry in entries {
        match entry {
            Value::String(spec) => {
                let parts = parse_docker_volume_string(spec)?;
                volumes.push(VolumeMount {
                    source: parts.source,
                    target: parts.target,
                    mode: parts.mode,
                    inline_content: None,
                });
            }
            Value::Mapping(mapping) => {
                let source = mapping
                    .get(Value::from("source"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let target = mapping
                    .get(Value::from("target"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some((source, target)) = source.zip(target) else {
                    return Err(EngineError::Deployment(format!(
                        "service '{}' has a volume without source or target",
                        service
                    )));
                };
                let inline_content = mapping
                    .get(Value::from("content"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let mode = mapping
                    .get(Value::from("read_only"))
                    .and_then(Value::as_bool)
                    .and_then(|ro| ro.then(|| "ro".to_string()));
                volumes.push(VolumeMount {
                    source,
                    target,
                    mode,
                    inline_content,
                });
            }
            _ => {
                return Err(EngineError::Deployment(format!(
                    "service '{}' has an unrecognized volume entry",
                    service
                )))
            }
        }
    }

    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::classify::ServiceClassification;

    const STACK: &str = r#"
services:
  web:
    image: ghcr.io/acme/shop:v4
    environment:
      - APP_ENV=production
      - APP_DEBUG=false
    labels:
      - my.label=yes
    volumes:
      - ./uploads:/app/uploads
  db:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: secret
      POSTGRES_DB: shop
    volumes:
      - pgdata:/var/lib/postgresql/data
"#;

    #[test]
    fn test_parse_builds_graph() {
        let raw = RawComposeDocument::parse(STACK).unwrap();
        let graph = parse(&raw).unwrap();

        assert_eq!(graph.services.len(), 2);

        let web = graph.service("web").unwrap();
        assert_eq!(web.classification, ServiceClassification::Application);
        assert_eq!(web.environment.get("APP_ENV").map(String::as_str), Some("production"));
        assert_eq!(web.volumes[0].source, "./uploads");
        assert_eq!(web.labels, vec!["my.label=yes".to_string()]);

        let db = graph.service("db").unwrap();
        assert_eq!(db.classification, ServiceClassification::Database);
        assert_eq!(db.volumes[0].source, "pgdata");
    }

    #[test]
    fn test_environment_list_and_map_forms_agree() {
        let raw = RawComposeDocument::parse(STACK).unwrap();
        let graph = parse(&raw).unwrap();

        let db = graph.service("db").unwrap();
        assert_eq!(db.environment.get("POSTGRES_DB").map(String::as_str), Some("shop"));

        let web = graph.service("web").unwrap();
        // "false" survives as a literal string, not a YAML bool.
        assert_eq!(web.environment.get("APP_DEBUG").map(String::as_str), Some("false"));
    }

    #[test]
    fn test_inline_content_preserved_for_deploy() {
        let raw = RawComposeDocument::parse(
            r#"
services:
  app:
    image: acme/app
    volumes:
      - type: bind
        source: ./app.conf
        target: /etc/app.conf
        content: "listen 9000;"
"#,
        )
        .unwrap();
        let graph = parse(&raw).unwrap();
        let app = graph.service("app").unwrap();
        assert_eq!(app.volumes[0].inline_content.as_deref(), Some("listen 9000;"));
    }
}
