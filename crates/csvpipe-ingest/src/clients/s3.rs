//! S3-backed object store

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{DownloadError, ObjectStore};

#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Path-style addressing is used whenever a custom endpoint is configured
    /// (MinIO, LocalStack).
    pub fn new(sdk_config: &SdkConfig) -> Self {
        let config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(sdk_config.endpoint_url().is_some())
            .build();

        Self {
            client: Client::from_conf(config),
        }
    }
}

fn classify(error: SdkError<GetObjectError>) -> DownloadError {
    if let Some(service) = error.as_service_error() {
        if service.is_no_such_key() {
            return DownloadError::NotFound;
        }
        if service.code() == Some("NoSuchBucket") {
            return DownloadError::BucketNotFound;
        }
    }
    DownloadError::Other(DisplayErrorContext(&error).to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, dest))]
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, DownloadError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        let mut body = output.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| DownloadError::Other(format!("object body read failed: {e}")))?
        {
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        debug!(bytes = written, "object downloaded");
        Ok(written)
    }
}
