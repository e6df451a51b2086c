//! MinIO/S3 object store client for testcase blobs and compiled binaries.
//!
//! Testcase objects are addressed by `(objectName, versionId)` so a grading
//! task always reads exactly the version that existed when it was dispatched.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::info;

use crate::messages::TestcaseObject;

/// S3/MinIO storage client
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    /// Create a client from the `STORAGE_*` environment variables. Defaults
    /// target a local MinIO; path-style addressing is required for it.
    pub async fn from_env() -> Result<Self> {
        let endpoint_url =
            std::env::var("STORAGE_ENDPOINT").unwrap_or_else(|_| "http://localhost:9000".into());
        let access_key =
            std::env::var("STORAGE_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key =
            std::env::var("STORAGE_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "judge-storage".into());

        info!("Using object store at {}", endpoint_url);

        let credentials = Credentials::new(access_key, secret_key, None, None, "static");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Download a specific version of an object
    pub async fn download_versioned(&self, object: &TestcaseObject) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object.object_name)
            .version_id(&object.version_id)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to download {} (version {})",
                    object.object_name, object.version_id
                )
            })?;

        let data = response.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }

    /// Download a specific version of an object as string
    pub async fn download_versioned_string(&self, object: &TestcaseObject) -> Result<String> {
        let bytes = self.download_versioned(object).await?;
        String::from_utf8(bytes).context("Invalid UTF-8 content")
    }

    /// Download the latest version of an object
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", key))?;

        let data = response.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }

    /// Upload an object (used for compiled submission binaries)
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", key))?;
        Ok(())
    }
}

/// Object key for a submission's compiled artifact.
pub fn binary_key(submission_id: &str) -> String {
    format!("binaries/{}", submission_id)
}
