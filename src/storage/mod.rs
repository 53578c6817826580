pub mod local;
pub mod s3;

use crate::config::{StorageConfig, StorageType};
use crate::error::StorageResult;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalStorage;
pub use s3::S3Storage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// S3 分片下限：除最后一片外每片不小于 5MB
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// S3 单次分片上传最多 10000 片
pub const S3_MAX_PARTS: u32 = 10_000;

/// 内容指纹
///
/// `Md5` 是内容的 MD5（本地文件、S3 单次上传的 ETag），可以跨后端比较；
/// `Opaque` 是后端自己的标记（例如 S3 分片上传的 `xxx-N` ETag），只能和同样的标记比较。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Fingerprint {
    Md5(String),
    Opaque(String),
}

impl Fingerprint {
    /// 解析 S3/HTTP 风格的 ETag
    pub fn from_etag(etag: &str) -> Self {
        let tag = etag.trim().trim_matches('"');
        if tag.len() == 32 && tag.bytes().all(|b| b.is_ascii_hexdigit()) {
            Fingerprint::Md5(tag.to_ascii_lowercase())
        } else {
            Fingerprint::Opaque(tag.to_string())
        }
    }

    pub fn md5_hex(&self) -> Option<&str> {
        match self {
            Fingerprint::Md5(h) => Some(h),
            Fingerprint::Opaque(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Fingerprint::Md5(s) | Fingerprint::Opaque(s) => s,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fingerprint::Md5(h) => write!(f, "md5:{}", h),
            Fingerprint::Opaque(s) => write!(f, "etag:{}", s),
        }
    }
}

/// 一个对象的描述，`path` 相对于后端根目录，统一使用 `/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub fingerprint: Option<Fingerprint>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// 分片上传会话句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartSession {
    /// 后端的会话 ID（S3 upload id / 本地暂存目录名）
    pub id: String,
    /// 目标对象路径
    pub path: String,
}

/// 单个分片的确认，`index` 从 1 开始
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAck {
    pub index: u32,
    pub tag: String,
    pub size: u64,
}

/// 后端对分片上传的限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    /// 除最后一片外的最小分片大小
    pub min_part_size: u64,
    pub max_parts: u32,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: 1,
            max_parts: u32::MAX,
        }
    }
}

/// 存储抽象接口
#[async_trait]
pub trait Storage: Send + Sync {
    /// 递归列出 `prefix` 下的所有对象（不含目录），按需惰性产生
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StorageResult<FileEntry>>;

    /// 获取对象元数据，不存在时返回 `None`
    async fn stat(&self, path: &str) -> StorageResult<Option<FileEntry>>;

    /// 读取对象的一部分
    async fn read_chunk(&self, path: &str, offset: u64, length: u64) -> StorageResult<Bytes>;

    /// 整体写入对象
    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()>;

    async fn begin_multipart(&self, path: &str) -> StorageResult<MultipartSession>;

    async fn upload_part(
        &self,
        session: &MultipartSession,
        index: u32,
        data: Bytes,
    ) -> StorageResult<PartAck>;

    /// 提交分片，`parts` 必须按 index 连续排列
    async fn complete_multipart(
        &self,
        session: MultipartSession,
        parts: Vec<PartAck>,
    ) -> StorageResult<()>;

    /// 放弃分片上传，已上传的分片全部丢弃
    async fn abort_multipart(&self, session: MultipartSession) -> StorageResult<()>;

    /// 删除对象，对象不存在时视为成功
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// 检查对象是否存在
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 分片上传的限制，执行器据此调整分片大小
    fn part_limits(&self) -> PartLimits {
        PartLimits::default()
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 存储 + 根路径，同步的一端
#[derive(Clone)]
pub struct Endpoint {
    pub storage: Arc<dyn Storage>,
    pub root: String,
}

impl Endpoint {
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>) -> Self {
        let root = root.into().replace('\\', "/").trim_matches('/').to_string();
        Self { storage, root }
    }

    /// 相对路径 -> 后端中的完整路径
    pub fn key(&self, relative: &str) -> String {
        if self.root.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.root, relative)
        }
    }

    /// 后端中的完整路径 -> 相对路径，不在根目录下时返回 `None`
    pub fn relative<'k>(&self, key: &'k str) -> Option<&'k str> {
        relative_to(&self.root, key)
    }

    pub fn name(&self) -> &str {
        self.storage.name()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("storage", &self.storage.name())
            .field("root", &self.root)
            .finish()
    }
}

pub(crate) fn relative_to<'k>(root: &str, key: &'k str) -> Option<&'k str> {
    let key = key.trim_start_matches('/');
    if root.is_empty() {
        return Some(key);
    }
    key.strip_prefix(root)?.strip_prefix('/')
}

/// 计算内容的 MD5（十六进制），与 S3 单次上传的 ETag 一致
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 根据配置创建存储实例
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.typ {
        StorageType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalStorage::new(path)?.with_checksum(config.checksum)) as Arc<dyn Storage>)
        }
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(
                S3Storage::new(
                    bucket,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.clone(),
                    config.prefix.clone(),
                )
                .await?,
            ) as Arc<dyn Storage>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_with_part_count_is_opaque() {
        assert_eq!(
            Fingerprint::from_etag("\"9bb58f26192e4ba00f01e2e7b136bbd8\""),
            Fingerprint::Md5("9bb58f26192e4ba00f01e2e7b136bbd8".into())
        );
        assert_eq!(
            Fingerprint::from_etag("\"d41d8cd98f00b204e9800998ecf8427e-3\""),
            Fingerprint::Opaque("d41d8cd98f00b204e9800998ecf8427e-3".into())
        );
    }

    #[test]
    fn md5_of_empty_input() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn relative_paths_respect_root_boundaries() {
        assert_eq!(relative_to("", "/a/b.txt"), Some("a/b.txt"));
        assert_eq!(relative_to("data", "data/a.txt"), Some("a.txt"));
        assert_eq!(relative_to("data", "database/a.txt"), None);
        assert_eq!(relative_to("data", "data"), None);
    }
}
