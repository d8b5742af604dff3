use crate::config::StorageConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Duration;
use uuid::Uuid;

/// Хранилище изображений квитанций. Ключи непрозрачны для вызывающего кода.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save(&self, bytes: Vec<u8>, filename: &str) -> AppResult<String>;
    /// Временная ссылка на объект; ошибка, если объекта нет.
    async fn url(&self, key: &str) -> AppResult<String>;
    async fn delete(&self, key: &str) -> AppResult<()>;
}

pub struct FileService {
    client: Client,
    bucket: String,
    url_ttl: Duration,
}

impl FileService {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "dom-billing",
        );

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(30))
            .build();

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint_url())
            .timeout_config(timeouts)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            url_ttl: Duration::from_secs(config.url_ttl_secs),
        }
    }
}

#[async_trait]
impl ImageStore for FileService {
    async fn save(&self, bytes: Vec<u8>, filename: &str) -> AppResult<String> {
        let extension = file_extension(filename);
        let key = format!("bills/{}.{}", Uuid::new_v4(), extension);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type_for(&extension))
            .send()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        tracing::debug!("Uploaded image {}", key);
        Ok(key)
    }

    async fn url(&self, key: &str) -> AppResult<String> {
        // Пресайн не проверяет наличие объекта, поэтому сначала HEAD
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        let presigning = PresigningConfig::expires_in(self.url_ttl)
            .map_err(|e| AppError::Storage(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        Ok(())
    }
}

fn file_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext.to_lowercase(),
        _ => "bin".to_string(),
    }
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

pub fn validate_image_content_type(content_type: &str) -> bool {
    matches!(
        content_type,
        "image/jpeg" | "image/png" | "image/gif" | "image/webp"
    )
}

pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB
