use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Extensions accepted by the listing filter, matched case-insensitively.
const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Client for an S3-compatible object store. Credentials and endpoint
/// are shared; the bucket ("store") is chosen per operation, since
/// batches may target different buckets.
pub struct ObjectStore {
    region: Region,
    credentials: Credentials,
}

impl ObjectStore {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, store_name: &str) -> Result<Box<Bucket>, StorageError> {
        Bucket::new(store_name, self.region.clone(), self.credentials.clone())
            .map_err(StorageError::S3)
    }

    /// List image keys under a prefix, filtering out empty objects and
    /// non-image extensions. Pagination is handled by the underlying
    /// client; callers see one finite sequence.
    pub async fn list_images(
        &self,
        store_name: &str,
        prefix: &str,
    ) -> Result<Vec<String>, StorageError> {
        let bucket = self.bucket(store_name)?;
        let prefix = normalize_prefix(prefix);

        let pages = bucket
            .list(prefix, None)
            .await
            .map_err(StorageError::S3)?;

        let mut keys = Vec::new();
        for page in pages {
            for object in page.contents {
                if is_listable(&object.key, object.size) {
                    keys.push(object.key);
                }
            }
        }

        Ok(keys)
    }

    /// Download object bytes.
    pub async fn download(&self, store_name: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let bucket = self.bucket(store_name)?;
        let response = bucket.get_object(key).await.map_err(StorageError::S3)?;
        Ok(response.to_vec())
    }

    /// Upload bytes under a key.
    pub async fn upload(
        &self,
        store_name: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let bucket = self.bucket(store_name)?;
        bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(())
    }

    /// Delete an object. Missing objects are not an error at the S3
    /// level, which keeps retention re-runnable.
    pub async fn delete(&self, store_name: &str, key: &str) -> Result<(), StorageError> {
        let bucket = self.bucket(store_name)?;
        bucket.delete_object(key).await.map_err(StorageError::S3)?;
        Ok(())
    }

    /// Presigned, expiring GET URL for an object.
    pub async fn presign_get(
        &self,
        store_name: &str,
        key: &str,
        expiry_secs: u32,
    ) -> Result<String, StorageError> {
        let bucket = self.bucket(store_name)?;
        bucket
            .presign_get(key, expiry_secs, None)
            .await
            .map_err(StorageError::S3)
    }
}

/// Listing filter: objects must be non-empty and carry an allowed
/// image extension. Anything else never becomes an item task.
pub fn is_listable(key: &str, size: u64) -> bool {
    if size == 0 {
        return false;
    }
    match key.rsplit_once('.') {
        Some((_, ext)) => ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| ext.eq_ignore_ascii_case(allowed)),
        None => false,
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
