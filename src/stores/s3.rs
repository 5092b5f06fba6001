// tenantbackup/src/stores/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;

use crate::backup::{ListedEntry, ObjectBody, ObjectStore};
use crate::config::SpacesConfig;

/// Object store over an S3-compatible service. Containers map to buckets.
pub struct S3ObjectStore {
    client: s3::Client,
}

impl S3ObjectStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.force_path_style)
            .build();

        tracing::info!(endpoint = %spaces_config.endpoint_url, "configured object store client");
        S3ObjectStore {
            client: s3::Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ListedEntry>> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(container)
                .delimiter("/")
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", container, prefix))?;

            for common in page.common_prefixes() {
                if let Some(folder) = common.prefix().and_then(|p| p.strip_prefix(prefix)) {
                    entries.push(ListedEntry {
                        name: folder.trim_end_matches('/').to_string(),
                        id: None,
                        size: None,
                    });
                }
            }

            for object in page.contents() {
                let Some(name) = object.key().and_then(|k| k.strip_prefix(prefix)) else {
                    continue;
                };
                let size = object.size().and_then(|s| u64::try_from(s).ok());
                // Zero-byte "folder/" placeholders are not objects.
                if (name.is_empty() || name.ends_with('/')) && size.unwrap_or(0) == 0 {
                    continue;
                }
                entries.push(ListedEntry {
                    name: name.to_string(),
                    id: Some(object.e_tag().unwrap_or(name).to_string()),
                    size,
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(entries)
    }

    async fn download(&self, container: &str, key: &str) -> Result<ObjectBody> {
        let object = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get object s3://{}/{}", container, key))?;

        let size = object.content_length().and_then(|len| u64::try_from(len).ok());
        Ok(ObjectBody {
            reader: Box::new(Box::pin(object.body.into_async_read())),
            size,
        })
    }
}
