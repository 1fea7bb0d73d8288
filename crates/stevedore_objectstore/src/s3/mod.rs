use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use http::Uri;
use serde::Deserialize;

use super::{Chunk, Key, S3_MIN_PART_SIZE};

pub(crate) mod logging;
use super::errors::{Error, Result};
use super::s3::logging::LoggingInterceptor;
use super::ObjectStore;

#[derive(Clone, Deserialize)]
pub struct S3Config {
    bucket_name: String,
    region: String,
    /// Overrides the AWS endpoint, for S3-compatible stores.
    hostname: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl S3Config {
    pub async fn new_objects(&self) -> Result<S3> {
        let sdk_config = aws_config::load_from_env().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .region(Region::new(self.region.clone()))
            .interceptor(LoggingInterceptor);

        if let (Some(access_key), Some(secret_key)) = (&self.access_key, &self.secret_key) {
            let scp = SharedCredentialsProvider::new(
                Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "stevedore",
                )
                .provide_credentials()
                .await?,
            );
            builder = builder.credentials_provider(scp);
        }

        if let Some(hostname) = &self.hostname {
            let uri = Uri::builder()
                .scheme("https")
                .authority(hostname.as_str())
                .path_and_query("/")
                .build()?;
            builder = builder.endpoint_url(uri.to_string());
        }

        let s3_client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(S3 {
            bucket_name: self.bucket_name.clone(),
            client: s3_client,
        })
    }
}

#[derive(Clone)]
pub struct S3 {
    bucket_name: String,
    client: Client,
}

#[async_trait]
impl ObjectStore for S3 {
    fn min_part_size(&self) -> u64 {
        S3_MIN_PART_SIZE
    }

    async fn initiate_chunked_upload(&self, key: &Key, content_type: &str) -> Result<String> {
        let create_multipart_upload_output = self
            .client
            .create_multipart_upload()
            .key(key.as_str())
            .content_type(content_type)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let upload_id = create_multipart_upload_output.upload_id.ok_or(
            Error::ObjectsFailedToInitiateChunkedUpload("missing upload id"),
        )?;

        Ok(upload_id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &Key,
        chunk_number: i32,
        path: &Path,
    ) -> Result<Chunk> {
        let content_length = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path).await?;
        let upload_part_output = self
            .client
            .upload_part()
            .upload_id(upload_id)
            .part_number(chunk_number)
            .key(key.as_str())
            .body(body)
            .content_length(content_length as i64)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let chunk = Chunk {
            e_tag: upload_part_output.e_tag,
            chunk_number,
        };

        Ok(chunk)
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        key: &Key,
        chunks: Vec<Chunk>,
    ) -> Result<()> {
        let mut mpu = CompletedMultipartUpload::builder();
        for chunk in chunks {
            let mut pb = CompletedPart::builder();
            if let Some(e_tag) = &chunk.e_tag {
                pb = pb.e_tag(e_tag);
            }
            mpu = mpu.parts(pb.part_number(chunk.chunk_number).build());
        }
        let _complete_multipart_upload_output = self
            .client
            .complete_multipart_upload()
            .multipart_upload(mpu.build())
            .upload_id(upload_id)
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(())
    }

    /// Abort the upload with a single `AbortMultipartUpload` call.
    ///
    /// Callers stop sending parts before they abort, so the only parts that can land afterwards
    /// are requests S3 had already accepted. Storage for those is reclaimed by the bucket's
    /// `AbortIncompleteMultipartUpload` lifecycle rule rather than by repeating the abort here.
    async fn abort_chunked_upload(&self, upload_id: &str, key: &Key) -> Result<()> {
        let _abort_multipart_upload_output = self
            .client
            .abort_multipart_upload()
            .upload_id(upload_id)
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(())
    }

    async fn presign_get(&self, key: &Key, ttl: Duration) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .presigned(PresigningConfig::expires_in(ttl)?)
            .await?;

        Ok(presigned.uri().to_string())
    }
}
