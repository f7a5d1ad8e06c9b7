use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::fs;

use crate::error::AppError;

/// Blob store for customer documents, vehicle papers and inspection photos.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), AppError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
    fn backend_name(&self) -> &'static str;
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), AppError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|error| {
                tracing::error!(key, error = %error, "S3 upload failed");
                AppError::Dependency("File storage upload failed.".to_string())
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, AppError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| {
                tracing::error!(key, error = %error, "S3 download failed");
                AppError::Dependency("File storage download failed.".to_string())
            })?;

        let data = output.body.collect().await.map_err(|error| {
            tracing::error!(key, error = %error, "S3 body collection failed");
            AppError::Dependency("File storage download failed.".to_string())
        })?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| {
                tracing::error!(key, error = %error, "S3 delete failed");
                AppError::Dependency("File storage delete failed.".to_string())
            })?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Directory-backed storage used when no bucket is configured.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(AppError::BadRequest(format!("Invalid storage key '{key}'.")));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<(), AppError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        fs::write(path, data).await.map_err(io_error)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, AppError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Stored file '{key}' not found.")))
            }
            Err(error) => Err(io_error(error)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let path = self.resolve(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(io_error(error)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

fn io_error(error: std::io::Error) -> AppError {
    tracing::error!(error = %error, "Local storage I/O failed");
    AppError::Dependency("File storage operation failed.".to_string())
}

/// Org-scoped object key: `<org>/<scope>/<owner>/<uuid>.<ext>`.
pub fn build_object_key(org_id: &str, scope: &str, owner_id: &str, file_name: &str) -> String {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    format!(
        "{org_id}/{scope}/{owner_id}/{}.{extension}",
        uuid::Uuid::new_v4()
    )
}

pub fn guess_mime_type(key: &str) -> &'static str {
    let lowered = key.to_ascii_lowercase();
    if lowered.ends_with(".png") {
        "image/png"
    } else if lowered.ends_with(".jpg") || lowered.ends_with(".jpeg") {
        "image/jpeg"
    } else if lowered.ends_with(".webp") {
        "image/webp"
    } else if lowered.ends_with(".gif") {
        "image/gif"
    } else if lowered.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

pub fn to_data_uri(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Loads an image either from storage or, for legacy rows, an absolute URL,
/// and returns it as an embeddable data URI.
pub async fn fetch_as_data_uri(
    storage: &dyn ObjectStorage,
    http_client: &reqwest::Client,
    key_or_url: &str,
    mime_type: Option<&str>,
) -> Result<String, AppError> {
    let mime = mime_type
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| guess_mime_type(key_or_url))
        .to_string();

    if key_or_url.starts_with("http://") || key_or_url.starts_with("https://") {
        let response = http_client.get(key_or_url).send().await.map_err(|error| {
            tracing::warn!(url = key_or_url, error = %error, "Image download failed");
            AppError::Dependency("Image download failed.".to_string())
        })?;
        if !response.status().is_success() {
            return Err(AppError::Dependency(format!(
                "Image download failed with status {}.",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(|error| {
            tracing::warn!(url = key_or_url, error = %error, "Image body read failed");
            AppError::Dependency("Image download failed.".to_string())
        })?;
        return Ok(to_data_uri(&bytes, &mime));
    }

    let bytes = storage.get(key_or_url).await?;
    Ok(to_data_uri(&bytes, &mime))
}

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::ObjectStorage;
    use crate::error::AppError;

    #[derive(Default)]
    pub struct MemoryStorage {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<(), AppError> {
            self.objects
                .lock()
                .expect("storage lock")
                .insert(key.to_string(), data);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, AppError> {
            self.objects
                .lock()
                .expect("storage lock")
                .get(key)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("Stored file '{key}' not found.")))
        }

        async fn delete(&self, key: &str) -> Result<(), AppError> {
            self.objects.lock().expect("storage lock").remove(key);
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "memory"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{build_object_key, fetch_as_data_uri, guess_mime_type, memory::MemoryStorage, LocalStorage, ObjectStorage};

    #[test]
    fn object_keys_are_org_scoped_and_keep_safe_extensions() {
        let key = build_object_key("org-1", "customers", "cust-9", "Licencia.JPG");
        assert!(key.starts_with("org-1/customers/cust-9/"));
        assert!(key.ends_with(".jpg"));

        let odd = build_object_key("org-1", "customers", "cust-9", "weird.name.$$$");
        assert!(odd.ends_with(".bin"));
    }

    #[test]
    fn guesses_common_mime_types() {
        assert_eq!(guess_mime_type("a/b/c.PNG"), "image/png");
        assert_eq!(guess_mime_type("a/b/c.jpeg"), "image/jpeg");
        assert_eq!(guess_mime_type("a/b/c"), "application/octet-stream");
    }

    #[test]
    fn local_storage_rejects_path_traversal() {
        let storage = LocalStorage::new(std::env::temp_dir());
        assert!(storage.resolve("../etc/passwd").is_err());
        assert!(storage.resolve("/etc/passwd").is_err());
        assert!(storage.resolve("org/photos/a.png").is_ok());
    }

    #[tokio::test]
    async fn embeds_stored_images_as_data_uris() {
        let storage = MemoryStorage::default();
        storage
            .put("org/inspections/i1/a.png", vec![1, 2, 3], "image/png")
            .await
            .expect("put");
        let client = reqwest::Client::new();
        let uri = fetch_as_data_uri(&storage, &client, "org/inspections/i1/a.png", None)
            .await
            .expect("data uri");
        assert_eq!(uri, "data:image/png;base64,AQID");
    }
}
