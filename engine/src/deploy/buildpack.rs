//! Build-pack dispatch
//!
//! A build pack is a named strategy for turning a source tree or image
//! reference into a compose document the engine can deploy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::compose::document::RawComposeDocument;
use crate::compose::volume::validate_docker_compose_for_injection;
use crate::deploy::source::ResolvedSource;
use crate::errors::EngineError;
use crate::models::application::Application;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPack {
    Dockerfile,
    DockerCompose,
    DockerImage,
    Nixpacks,
    Static,
    Buildpack,
}

impl BuildPack {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPack::Dockerfile => "dockerfile",
            BuildPack::DockerCompose => "dockercompose",
            BuildPack::DockerImage => "dockerimage",
            BuildPack::Nixpacks => "nixpacks",
            BuildPack::Static => "static",
            BuildPack::Buildpack => "buildpack",
        }
    }

    /// Whether an empty `.env` file must be materialized for this pack even
    /// when no environment variables are defined. Only the image- and
    /// compose-based packs reference a `.env` in their generated compose;
    /// the other packs write their own runtime environment file later in
    /// their pipeline and must not have it double-created here.
    pub fn requires_empty_env_file(&self) -> bool {
        matches!(self, BuildPack::DockerImage | BuildPack::DockerCompose)
    }
}

impl std::str::FromStr for BuildPack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dockerfile" => Ok(BuildPack::Dockerfile),
            "dockercompose" | "docker-compose" => Ok(BuildPack::DockerCompose),
            "dockerimage" | "docker-image" => Ok(BuildPack::DockerImage),
            "nixpacks" => Ok(BuildPack::Nixpacks),
            "static" => Ok(BuildPack::Static),
            "buildpack" => Ok(BuildPack::Buildpack),
            other => Err(format!("Unknown build pack: {}", other)),
        }
    }
}

/// Everything a generator needs to produce a compose document.
pub struct BuildContext<'a> {
    pub application: &'a Application,
    pub resolved: &'a ResolvedSource,

    /// Working directory on the server the source was fetched into.
    pub workdir: String,
}

impl BuildContext<'_> {
    /// Image tag for packs that build an image from source.
    fn built_image(&self) -> String {
        let tag = match self.resolved {
            ResolvedSource::Commit(sha) => &sha[..7.min(sha.len())],
            ResolvedSource::Image(_) => "latest",
        };
        format!("{}:{}", self.application.name, tag)
    }

    fn exposed_port(&self) -> String {
        self.application
            .settings
            .ports_exposes
            .as_deref()
            .and_then(|p| p.split(',').next())
            .unwrap_or("80")
            .to_string()
    }
}

/// Turns a build context into a compose document.
#[async_trait]
pub trait ComposeGenerator: Send + Sync {
    fn pack(&self) -> BuildPack;

    async fn generate(&self, ctx: &BuildContext<'_>) -> Result<RawComposeDocument, EngineError>;
}

/// Factory dispatching on the application's configured pack.
pub struct GeneratorFactory;

impl GeneratorFactory {
    pub fn create(pack: BuildPack) -> Arc<dyn ComposeGenerator> {
        match pack {
            BuildPack::Dockerfile => Arc::new(BuiltImageGenerator {
                pack: BuildPack::Dockerfile,
            }),
            BuildPack::Nixpacks => Arc::new(BuiltImageGenerator {
                pack: BuildPack::Nixpacks,
            }),
            BuildPack::Buildpack => Arc::new(BuiltImageGenerator {
                pack: BuildPack::Buildpack,
            }),
            BuildPack::DockerCompose => Arc::new(UserComposeGenerator),
            BuildPack::DockerImage => Arc::new(PrebuiltImageGenerator),
            BuildPack::Static => Arc::new(StaticSiteGenerator),
        }
    }
}

/// Packs that build an image on the server (dockerfile, nixpacks,
/// buildpack) and then run it as a single service.
struct BuiltImageGenerator {
    pack: BuildPack,
}

#[async_trait]
impl ComposeGenerator for BuiltImageGenerator {
    fn pack(&self) -> BuildPack {
        self.pack
    }

    async fn generate(&self, ctx: &BuildContext<'_>) -> Result<RawComposeDocument, EngineError> {
        let app = ctx.application;
        let mut yaml = format!(
            "services:\n  {name}:\n    image: {image}\n    restart: unless-stopped\n    expose:\n      - \"{port}\"\n",
            name = app.name,
            image = ctx.built_image(),
            port = ctx.exposed_port(),
        );
        if let Some(command) = &app.settings.start_command {
            yaml.push_str(&format!("    command: {}\n", command));
        }
        RawComposeDocument::parse(&yaml)
    }
}

/// The dockercompose pack deploys the user's own compose document.
struct UserComposeGenerator;

#[async_trait]
impl ComposeGenerator for UserComposeGenerator {
    fn pack(&self) -> BuildPack {
        BuildPack::DockerCompose
    }

    async fn generate(&self, ctx: &BuildContext<'_>) -> Result<RawComposeDocument, EngineError> {
        let text = ctx.application.compose_raw.as_deref().ok_or_else(|| {
            EngineError::Deployment("application has no compose document".to_string())
        })?;
        // Reject unsafe volume strings before any command generation.
        validate_docker_compose_for_injection(text)?;
        RawComposeDocument::parse(text)
    }
}

/// The dockerimage pack runs a prebuilt image reference.
struct PrebuiltImageGenerator;

#[async_trait]
impl ComposeGenerator for PrebuiltImageGenerator {
    fn pack(&self) -> BuildPack {
        BuildPack::DockerImage
    }

    async fn generate(&self, ctx: &BuildContext<'_>) -> Result<RawComposeDocument, EngineError> {
        let app = ctx.application;
        let image = match ctx.resolved {
            ResolvedSource::Image(reference) => reference.clone(),
            ResolvedSource::Commit(_) => app.docker_image.clone().ok_or_else(|| {
                EngineError::Deployment("application has no image reference".to_string())
            })?,
        };
        let yaml = format!(
            "services:\n  {name}:\n    image: {image}\n    restart: unless-stopped\n    expose:\n      - \"{port}\"\n",
            name = app.name,
            image = image,
            port = ctx.exposed_port(),
        );
        RawComposeDocument::parse(&yaml)
    }
}

/// The static pack serves a publish directory through nginx.
struct StaticSiteGenerator;

#[async_trait]
impl ComposeGenerator for StaticSiteGenerator {
    fn pack(&self) -> BuildPack {
        BuildPack::Static
    }

    async fn generate(&self, ctx: &BuildContext<'_>) -> Result<RawComposeDocument, EngineError> {
        let app = ctx.application;
        let publish = app
            .settings
            .publish_directory
            .as_deref()
            .unwrap_or("dist")
            .trim_matches('/');
        let yaml = format!(
            "services:\n  {name}:\n    image: nginx:alpine\n    restart: unless-stopped\n    expose:\n      - \"80\"\n    volumes:\n      - {workdir}/{publish}:/usr/share/nginx/html:ro\n",
            name = app.name,
            workdir = ctx.workdir,
            publish = publish,
        );
        RawComposeDocument::parse(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_file_requirement_per_pack() {
        assert!(BuildPack::DockerImage.requires_empty_env_file());
        assert!(BuildPack::DockerCompose.requires_empty_env_file());

        assert!(!BuildPack::Dockerfile.requires_empty_env_file());
        assert!(!BuildPack::Nixpacks.requires_empty_env_file());
        assert!(!BuildPack::Static.requires_empty_env_file());
        assert!(!BuildPack::Buildpack.requires_empty_env_file());
    }

    #[tokio::test]
    async fn test_built_image_generator() {
        let mut app = Application::new("shop", BuildPack::Dockerfile);
        app.settings.ports_exposes = Some("3000,9000".to_string());

        let resolved =
            ResolvedSource::Commit("196d3df7665359a8c8fa3329a6bcde0267e550bf".to_string());
        let ctx = BuildContext {
            application: &app,
            resolved: &resolved,
            workdir: "/tmp/dockhand/shop".to_string(),
        };

        let generator = GeneratorFactory::create(BuildPack::Dockerfile);
        let doc = generator.generate(&ctx).await.unwrap();
        assert!(doc.text().contains("image: shop:196d3df"));
        assert!(doc.text().contains("\"3000\""));
    }

    #[tokio::test]
    async fn test_user_compose_rejects_unsafe_volumes() {
        let mut app = Application::new("shop", BuildPack::DockerCompose);
        app.compose_raw = Some(
            "services:\n  web:\n    image: acme/web\n    volumes:\n      - \"/a$(id):/b\"\n"
                .to_string(),
        );

        let resolved = ResolvedSource::Image("acme/web".to_string());
        let ctx = BuildContext {
            application: &app,
            resolved: &resolved,
            workdir: "/tmp/dockhand/shop".to_string(),
        };

        let generator = GeneratorFactory::create(BuildPack::DockerCompose);
        assert!(generator.generate(&ctx).await.is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!("dockercompose".parse::<BuildPack>(), Ok(BuildPack::DockerCompose));
        assert_eq!("docker-image".parse::<BuildPack>(), Ok(BuildPack::DockerImage));
        assert!("mystery".parse::<BuildPack>().is_err());
    }
}
