//! Label injection for the deploy-time compose document

use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::compose::document::{labels_as_strings, DeployTimeComposeDocument, RawComposeDocument};
use crate::compose::parse::ServiceGraph;
use crate::errors::EngineError;
use crate::proxy::ProxyKind;

/// Marker label identifying containers owned by this orchestrator.
pub const MANAGED_BY_LABEL: &str = "dockhand.managed";

/// Label carrying the owning stack's id.
pub const STACK_LABEL: &str = "dockhand.stack";

/// Deployment metadata consumed by label injection.
///
/// Every recognized option is enumerated here; per-server settings change
/// the exact label text, never which services receive labels.
#[derive(Debug, Clone)]
pub struct InjectionMetadata {
    /// Reverse proxy flavor running on the target server.
    pub proxy: ProxyKind,

    /// Docker network the proxy shares with the stack.
    pub network: String,

    /// Domains routed to the application services.
    pub domains: Vec<String>,

    /// Owning stack identity, stamped on every managed container.
    pub stack_id: Uuid,

    /// Per-server setting: escape `$` in generated label values so compose
    /// does not expand them.
    pub escape_container_labels: bool,

    /// Per-server setting: attach the stack network alias to services.
    pub use_network_aliases: bool,

    /// Additional aliases configured on the application, attached alongside
    /// the derived one when `use_network_aliases` is on.
    pub extra_aliases: Vec<String>,

    /// Whether the active build pack requires an empty `.env` file to be
    /// materialized even without environment variables.
    pub requires_empty_env_file: bool,
}

/// Compute routing labels for one application service from the domain list
/// and the proxy flavor.
pub fn routing_labels(service: &str, meta: &InjectionMetadata) -> Vec<String> {
    if meta.domains.is_empty() {
        return Vec::new();
    }

    let mut labels = Vec::new();
    match meta.proxy {
        ProxyKind::Traefik => {
            labels.push("traefik.enable=true".to_string());
            labels.push(format!("traefik.docker.network={}", meta.network));
            for (idx, domain) in meta.domains.iter().enumerate() {
                let router = format!("{}-{}", service, idx);
                labels.push(format!(
                    "traefik.http.routers.{}.rule=Host(`{}`)",
                    router, domain
                ));
                labels.push(format!("traefik.http.routers.{}.entryPoints=https", router));
                labels.push(format!("traefik.http.routers.{}.tls=true", router));
            }
        }
        ProxyKind::Caddy => {
            for (idx, domain) in meta.domains.iter().enumerate() {
                labels.push(format!("caddy_{}=https://{}", idx, domain));
                labels.push(format!("caddy_{}.reverse_proxy={{{{upstreams}}}}", idx));
            }
        }
    }

    if meta.escape_container_labels {
        labels = labels.into_iter().map(|l| l.replace('$', "$$")).collect();
    }

    labels
}

/// Aliases a service answers to on the stack network: one derived from
/// the service name and stack id, plus any user-configured extras.
pub fn network_aliases(service: &str, meta: &InjectionMetadata) -> Vec<String> {
    let mut aliases = vec![format!("{}-{}", service, meta.stack_id)];
    for alias in &meta.extra_aliases {
        if !aliases.contains(alias) {
            aliases.push(alias.clone());
        }
    }
    aliases
}

/// Attach the stack network with its alias list to a service definition.
/// Short-syntax `networks` lists are upgraded to the mapping form; the
/// stack network's entry is overwritten, so re-attaching is idempotent.
fn attach_network_aliases(config: &mut Mapping, service: &str, meta: &InjectionMetadata) {
    let mut networks = Mapping::new();
    match config.get("networks") {
        Some(Value::Sequence(entries)) => {
            for entry in entries {
                if let Some(name) = entry.as_str() {
                    networks.insert(Value::from(name), Value::Null);
                }
            }
        }
        Some(Value::Mapping(existing)) => networks = existing.clone(),
        _ => {}
    }

    let aliases = network_aliases(service, meta)
        .into_iter()
        .map(Value::from)
        .collect();
    let mut attachment = Mapping::new();
    attachment.insert(Value::from("aliases"), Value::Sequence(aliases));
    networks.insert(
        Value::from(meta.network.as_str()),
        Value::Mapping(attachment),
    );

    config.insert(Value::from("networks"), Value::Mapping(networks));
}

/// Labels stamped on every managed service regardless of classification.
fn ownership_labels(meta: &InjectionMetadata) -> Vec<String> {
    vec![
        format!("{}=true", MANAGED_BY_LABEL),
        format!("{}={}", STACK_LABEL, meta.stack_id),
    ]
}

/// Merge additions into an existing label list without duplicating keys.
/// A label whose key (text before `=`) is already present is skipped, so
/// injecting twice yields the same set as injecting once.
pub fn merge_labels(existing: &[String], additions: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = existing.to_vec();
    for addition in additions {
        let key = addition.split('=').next().unwrap_or(&addition);
        let present = merged
            .iter()
            .any(|l| l.split('=').next().unwrap_or(l) == key);
        if !present {
            merged.push(addition);
        }
    }
    merged
}

/// Produce the deploy-time document: a copy of the raw document with
/// ownership and routing labels merged in. The raw document is never
/// mutated.
pub fn inject(
    graph: &ServiceGraph,
    raw: &RawComposeDocument,
    meta: &InjectionMetadata,
) -> Result<DeployTimeComposeDocument, EngineError> {
    let mut value = raw.value().clone();

    let services = value
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| EngineError::Deployment("compose document has no services".to_string()))?;

    for (name, config) in services.iter_mut() {
        let Some(name) = name.as_str() else { continue };
        let Some(definition) = graph.service(name) else { continue };

        let mut additions = ownership_labels(meta);
        if !definition.is_database() {
            additions.extend(routing_labels(name, meta));
        }

        let existing = config.get("labels").map(labels_as_strings).unwrap_or_default();
        let merged = merge_labels(&existing, additions);

        if let Some(config) = config.as_mapping_mut() {
            config.insert(
                Value::from("labels"),
                Value::Sequence(merged.into_iter().map(Value::from).collect()),
            );
            if meta.requires_empty_env_file {
                config
                    .entry(Value::from("env_file"))
                    .or_insert_with(|| Value::Sequence(vec![Value::from(".env")]));
            }
            if meta.use_network_aliases {
                attach_network_aliases(config, name, meta);
            }
        }
    }

    Ok(DeployTimeComposeDocument::new(
        value,
        meta.requires_empty_env_file,
    ))
}
