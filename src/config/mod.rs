// tenantbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::backup::BackupOptions;
use crate::catalog::SourceCatalog;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_STREAM_BUFFER_BYTES: usize = 64 * 1024;
const MIN_STREAM_BUFFER_BYTES: usize = 1024;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonCatalog {
    #[serde(default)]
    pub record_sets: Vec<String>,
    #[serde(default)]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub fetch_concurrency: Option<usize>,
    pub enumeration_queue_depth: Option<usize>,
    pub stream_buffer_bytes: Option<usize>,
    pub include_manifest: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonApiToken {
    pub token: String,
    pub subject: String,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub bind_address: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    #[serde(default)]
    pub catalog: JsonCatalog,
    #[serde(default)]
    pub backup: JsonBackupOptions,
    #[serde(default)]
    pub api_tokens: Vec<JsonApiToken>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Staff,
}

#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct ApiToken {
    pub token: String,
    pub subject: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    pub spaces_config: SpacesConfig,
    pub catalog: SourceCatalog,
    pub backup: BackupOptions,
    pub stream_buffer_bytes: usize,
    pub api_tokens: Vec<ApiToken>,
}

/// Reads and parses `config.json` without validating it.
fn read_raw_config(config_path: &Path) -> Result<RawJsonConfig> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Failed to parse JSON from config file at {}",
            config_path.display()
        )
    })
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let raw_json_config = read_raw_config(config_path)?;
        let database_override = env::var("SOURCE_DATABASE_URL").ok().filter(|s| !s.is_empty());
        Self::from_raw(raw_json_config, database_override)
    }

    /// Validates the raw file contents. `database_override` wins over the
    /// `database_url` in the file.
    pub fn from_raw(raw: RawJsonConfig, database_override: Option<String>) -> Result<Self> {
        let bind_address = raw
            .bind_address
            .as_deref()
            .unwrap_or(DEFAULT_BIND_ADDRESS)
            .parse::<SocketAddr>()
            .context("bind_address in config.json is not a valid socket address")?;

        let database_url = database_override
            .or(raw.database_url)
            .filter(|s| !s.trim().is_empty())
            .context("database_url must be set in config.json or SOURCE_DATABASE_URL")?;

        let database_max_connections = raw.database_max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be at least 1");
        }

        let spaces_config = parse_spaces_config(raw.s3_storage.as_ref())?;

        let catalog = SourceCatalog::new(raw.catalog.record_sets, raw.catalog.containers)
            .context("Invalid catalog in config.json")?;

        let defaults = BackupOptions::default();
        let backup = BackupOptions {
            fetch_concurrency: raw.backup.fetch_concurrency.unwrap_or(defaults.fetch_concurrency),
            enumeration_queue_depth: raw
                .backup
                .enumeration_queue_depth
                .unwrap_or(defaults.enumeration_queue_depth),
            include_manifest: raw.backup.include_manifest.unwrap_or(defaults.include_manifest),
        };
        if backup.fetch_concurrency == 0 || backup.enumeration_queue_depth == 0 {
            anyhow::bail!("backup.fetch_concurrency and backup.enumeration_queue_depth must be at least 1");
        }

        let stream_buffer_bytes = raw
            .backup
            .stream_buffer_bytes
            .unwrap_or(DEFAULT_STREAM_BUFFER_BYTES);
        if stream_buffer_bytes < MIN_STREAM_BUFFER_BYTES {
            anyhow::bail!(
                "backup.stream_buffer_bytes must be at least {} bytes",
                MIN_STREAM_BUFFER_BYTES
            );
        }

        let api_tokens = parse_api_tokens(raw.api_tokens)?;

        Ok(AppConfig {
            bind_address,
            database_url,
            database_max_connections,
            spaces_config,
            catalog,
            backup,
            stream_buffer_bytes,
            api_tokens,
        })
    }
}

fn parse_spaces_config(raw: Option<&JsonS3StorageConfig>) -> Result<SpacesConfig> {
    let s3_raw = raw.context("s3_storage must be configured in config.json")?;

    let field = |value: &Option<String>, name: &'static str| -> std::result::Result<String, &'static str> {
        value
            .as_ref()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .ok_or(name)
    };

    let fields = [
        field(&s3_raw.endpoint_url, "endpoint_url"),
        field(&s3_raw.region, "region"),
        field(&s3_raw.access_key_id, "access_key_id"),
        field(&s3_raw.secret_access_key, "secret_access_key"),
    ];
    let missing: Vec<&str> = fields.iter().filter_map(|f| f.as_ref().err().copied()).collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "s3_storage in config.json is missing required fields: {}",
            missing.join(", ")
        );
    }

    let [endpoint_url, region, access_key_id, secret_access_key] =
        fields.map(|f| f.unwrap_or_default());
    Ok(SpacesConfig {
        endpoint_url,
        region,
        access_key_id,
        secret_access_key,
        force_path_style: s3_raw.force_path_style.unwrap_or(false),
    })
}

fn parse_api_tokens(raw: Vec<JsonApiToken>) -> Result<Vec<ApiToken>> {
    if raw.is_empty() {
        anyhow::bail!("api_tokens in config.json must contain at least one token");
    }
    let mut tokens: Vec<ApiToken> = Vec::with_capacity(raw.len());
    for entry in raw {
        if entry.token.trim().is_empty() || entry.subject.trim().is_empty() {
            anyhow::bail!("api_tokens entries need a non-empty token and subject");
        }
        if tokens.iter().any(|t| t.token == entry.token) {
            anyhow::bail!("api_tokens contains the same token twice (subject {})", entry.subject);
        }
        tokens.push(ApiToken {
            token: entry.token,
            subject: entry.subject,
            role: entry.role,
        });
    }
    Ok(tokens)
}
