//! Database-vs-application classification for compose services

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Classification tag computed once during parsing. It is never re-derived
/// from labels afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClassification {
    Application,
    Database,
}

/// Known database image name stems. Matching is exact on the final image
/// name segment, never substring-based: `postgrest/postgrest` and
/// `supabase/postgres-meta` embed "postgres" but are applications.
const DATABASE_IMAGE_STEMS: &[&str] = &[
    "postgres",
    "postgresql",
    "mysql",
    "percona",
    "mariadb",
    "redis",
    "redis-stack",
    "valkey",
    "keydb",
    "dragonfly",
    "mongo",
    "mongodb",
    "timescaledb",
    "timescaledb-ha",
    "clickhouse",
    "clickhouse-server",
    "couchdb",
    "memcached",
    "influxdb",
    "neo4j",
    "ferretdb",
    "surrealdb",
];

/// Environment variables characteristic of a database engine's admin or
/// password configuration. Used to refine classification when the image
/// name alone is not conclusive.
const DATABASE_ENV_MARKERS: &[&str] = &[
    "POSTGRES_PASSWORD",
    "POSTGRES_USER",
    "MYSQL_ROOT_PASSWORD",
    "MYSQL_PASSWORD",
    "MARIADB_ROOT_PASSWORD",
    "MONGO_INITDB_ROOT_PASSWORD",
    "MONGO_INITDB_ROOT_USERNAME",
    "REDIS_PASSWORD",
    "CLICKHOUSE_PASSWORD",
    "COUCHDB_PASSWORD",
    "NEO4J_AUTH",
];

/// The image name stripped of registry prefix, tag and digest, reduced to
/// its final path segment: `ghcr.io/acme/postgres:16` -> `postgres`.
pub fn image_stem(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);

    // Strip the tag: the last colon is a tag separator only when no slash
    // follows it (otherwise it is a registry port, e.g. localhost:5000/x).
    let without_tag = match image.rfind(':') {
        Some(pos) if !image[pos + 1..].contains('/') => &image[..pos],
        _ => image,
    };

    without_tag.rsplit('/').next().unwrap_or(without_tag)
}

/// Whether the image (optionally refined by the service's environment)
/// identifies a database engine.
///
/// Allow-list membership alone is sufficient and takes priority: a
/// clearly-named database image is classified as a database even when no
/// service config is supplied. For images outside the allow-list, the
/// presence of a database-identifying environment variable widens the
/// classification.
pub fn is_database_image(image: &str, environment: Option<&IndexMap<String, String>>) -> bool {
    let stem = image_stem(image);
    if DATABASE_IMAGE_STEMS.contains(&stem) {
        return true;
    }

    if let Some(env) = environment {
        return DATABASE_ENV_MARKERS.iter().any(|marker| env.contains_key(*marker));
    }

    false
}

pub fn classify_service(
    image: Option<&str>,
    environment: Option<&IndexMap<String, String>>,
) -> ServiceClassification {
    match image {
        Some(image) if is_database_image(image, environment) => ServiceClassification::Database,
        _ => ServiceClassification::Application,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_stem() {
        assert_eq!(image_stem("postgres"), "postgres");
        assert_eq!(image_stem("postgres:16-alpine"), "postgres");
        assert_eq!(image_stem("bitnami/postgresql:latest"), "postgresql");
        assert_eq!(image_stem("ghcr.io/acme/mysql:8"), "mysql");
        assert_eq!(image_stem("localhost:5000/postgres:14"), "postgres");
        assert_eq!(image_stem("redis@sha256:abcdef"), "redis");
    }

    #[test]
    fn test_allow_listed_stems_are_databases() {
        for image in ["postgres:16", "mariadb", "redis:7", "mongo:6", "timescaledb", "clickhouse"] {
            assert!(is_database_image(image, None), "{image} should be a database");
        }
    }

    #[test]
    fn test_postgres_adjacent_tools_are_applications() {
        // Substrings of "postgres" never match; only exact stems do.
        assert!(!is_database_image("postgrest/postgrest", None));
        assert!(!is_database_image("supabase/postgres-meta", None));
        assert_eq!(
            classify_service(Some("postgrest/postgrest:v12"), None),
            ServiceClassification::Application
        );
    }

    #[test]
    fn test_env_refinement_widens_classification() {
        let mut env = IndexMap::new();
        env.insert("POSTGRES_PASSWORD".to_string(), "secret".to_string());

        // Custom-built database image, recognized by its environment.
        assert!(is_database_image("acme/custom-db:1.0", Some(&env)));
        // Allow-list membership does not depend on the environment at all.
        assert!(is_database_image("postgres:16", None));
    }

    #[test]
    fn test_missing_image_is_application() {
        assert_eq!(classify_service(None, None), ServiceClassification::Application);
    }
}
