use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// One bucket of blob storage, with objects addressed by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn bucket_name(&self) -> &str;

    /// Time-limited URL a client can PUT the object to.
    async fn presigned_upload_url(&self, key: &str, expires_secs: u32)
        -> Result<String, StorageError>;

    /// Time-limited URL a client can GET the object from.
    async fn presigned_download_url(
        &self,
        key: &str,
        expires_secs: u32,
    ) -> Result<String, StorageError>;

    /// Stable reference URL of an object.
    fn object_url(&self, key: &str) -> String;

    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn download_to_file(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    async fn upload_from_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// S3-compatible (MinIO, R2, AWS) bucket client.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
    endpoint: String,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region.clone(), credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            region,
            credentials,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        _ => Err(StorageError::Status {
            key: key.to_string(),
            status,
        }),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket_name(&self) -> &str {
        &self.bucket.name
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        expires_secs: u32,
    ) -> Result<String, StorageError> {
        Ok(self.bucket.presign_put(key, expires_secs, None, None).await?)
    }

    async fn presigned_download_url(
        &self,
        key: &str,
        expires_secs: u32,
    ) -> Result<String, StorageError> {
        Ok(self.bucket.presign_get(key, expires_secs, None).await?)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket.name, key)
    }

    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self.bucket.exists().await? {
            return Ok(());
        }

        tracing::info!(bucket = %self.bucket.name, "Creating missing bucket");
        Bucket::create_with_path_style(
            &self.bucket.name,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        match check_status(key, response.status_code()) {
            Err(StorageError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(key, response.status_code())?;
        tokio::fs::write(path, response.bytes()).await?;
        Ok(())
    }

    async fn upload_from_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let data = tokio::fs::read(path).await?;
        let response = self
            .bucket
            .put_object_with_content_type(key, &data, content_type)
            .await?;
        check_status(key, response.status_code())
    }
}

/// In-memory bucket.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    name: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Store an object directly, as a client upload through a presigned URL would.
    pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.to_string(), data.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

fn poisoned() -> StorageError {
    StorageError::Config("in-memory bucket lock poisoned".to_string())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket_name(&self) -> &str {
        &self.name
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        expires_secs: u32,
    ) -> Result<String, StorageError> {
        Ok(format!("{}?method=PUT&expires={expires_secs}", self.object_url(key)))
    }

    async fn presigned_download_url(
        &self,
        key: &str,
        expires_secs: u32,
    ) -> Result<String, StorageError> {
        Ok(format!("{}?method=GET&expires={expires_secs}", self.object_url(key)))
    }

    fn object_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.name, key)
    }

    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let data = self
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn upload_from_file(
        &self,
        key: &str,
        path: &Path,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let data = tokio::fs::read(path).await?;
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), data);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage returned HTTP {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
