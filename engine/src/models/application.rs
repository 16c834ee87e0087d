//! Application entity

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::deploy::buildpack::BuildPack;

/// User-tunable deployment settings for an application.
///
/// Every field here participates in the configuration-change hash; adding
/// a field means adding it to [`ApplicationSettings::hash_fields`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Comma-separated extra network aliases for the stack network.
    pub network_aliases: Option<String>,

    /// Inject build args (commit sha, build-time env) into image builds.
    #[serde(default)]
    pub inject_build_args: bool,

    /// Bake the source commit sha into the container environment.
    #[serde(default)]
    pub include_source_commit: bool,

    /// Whether container healthchecks gate deployment success.
    #[serde(default)]
    pub healthchecks_enabled: bool,

    /// Custom docker network name overriding the server default.
    pub custom_network: Option<String>,

    /// Subdirectory of the repository to build from.
    pub base_directory: Option<String>,

    /// Directory published by the static build pack.
    pub publish_directory: Option<String>,

    /// Install command for buildpack-style builds.
    pub install_command: Option<String>,

    /// Build command for buildpack-style builds.
    pub build_command: Option<String>,

    /// Start command override.
    pub start_command: Option<String>,

    /// Ports exposed by the generated service, comma-separated.
    pub ports_exposes: Option<String>,
}

impl ApplicationSettings {
    /// The hash input for every user-tunable field, in a fixed order.
    ///
    /// Booleans contribute their literal truthy/falsy string form: `true`
    /// renders as "1" and `false` as "". A known consequence is that
    /// `false` and an unset optional value hash identically, so disabling
    /// a flag that was never explicitly enabled does not register as a
    /// change. This is accepted, documented behavior; changing it means
    /// changing the hash algorithm and every stored hash.
    pub fn hash_fields(&self) -> Vec<(&'static str, String)> {
        fn opt(value: &Option<String>) -> String {
            value.clone().unwrap_or_default()
        }
        fn flag(value: bool) -> String {
            if value {
                "1".to_string()
            } else {
                String::new()
            }
        }

        vec![
            ("network_aliases", opt(&self.network_aliases)),
            ("inject_build_args", flag(self.inject_build_args)),
            ("include_source_commit", flag(self.include_source_commit)),
            ("healthchecks_enabled", flag(self.healthchecks_enabled)),
            ("custom_network", opt(&self.custom_network)),
            ("base_directory", opt(&self.base_directory)),
            ("publish_directory", opt(&self.publish_directory)),
            ("install_command", opt(&self.install_command)),
            ("build_command", opt(&self.build_command)),
            ("start_command", opt(&self.start_command)),
            ("ports_exposes", opt(&self.ports_exposes)),
        ]
    }
}

/// An application deployed and managed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub build_pack: BuildPack,

    /// Git source; None for prebuilt-image applications.
    pub git_repository: Option<Url>,
    #[serde(default)]
    pub git_branch: Option<String>,

    /// Prebuilt image reference for the dockerimage pack.
    pub docker_image: Option<String>,

    /// User-authored compose text for the dockercompose pack.
    pub compose_raw: Option<String>,

    /// Domains routed to this application.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Whether a HEALTHCHECK directive was detected in the Dockerfile on a
    /// previous deployment. Reset when the directive disappears, regardless
    /// of the healthchecks_enabled toggle.
    #[serde(default)]
    pub custom_healthcheck_found: bool,

    /// Configuration hash stored by the previous deployment.
    pub config_hash: Option<String>,

    pub settings: ApplicationSettings,

    /// Additional servers this application is also deployed to.
    #[serde(default)]
    pub additional_server_ids: Vec<Uuid>,
}

impl Application {
    pub fn new(name: impl Into<String>, build_pack: BuildPack) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            build_pack,
            git_repository: None,
            git_branch: None,
            docker_image: None,
            compose_raw: None,
            domains: Vec::new(),
            custom_healthcheck_found: false,
            config_hash: None,
            settings: ApplicationSettings::default(),
            additional_server_ids: Vec::new(),
        }
    }
}
