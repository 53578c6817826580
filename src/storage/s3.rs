use super::{
    FileEntry, Fingerprint, MultipartSession, PartAck, PartLimits, Storage, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS, S3_MAX_PARTS, S3_MIN_PART_SIZE,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

/// S3 存储
///
/// 普通读写走 opendal；opendal 不暴露分片级别的接口，分片上传直接使用 aws-sdk-s3。
pub struct S3Storage {
    operator: Operator,
    client: S3Client,
    bucket: String,
    /// 去掉首尾 `/` 的前缀，空字符串表示整个 bucket
    prefix: String,
    name: String,
}

impl S3Storage {
    pub async fn new(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> StorageResult<Self> {
        use opendal::services::S3;

        let prefix = prefix
            .as_deref()
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_default();

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if !prefix.is_empty() {
            builder = builder.root(&format!("/{}", prefix));
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let credentials = aws_credential_types::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "bucketsync-static",
        );
        let mut config_builder = aws_sdk_s3::Config::builder()
            .region(aws_types::region::Region::new(region.to_string()))
            .credentials_provider(credentials)
            .behavior_version_latest();

        if let Some(ref ep) = endpoint {
            config_builder = config_builder.endpoint_url(ep).force_path_style(true);
        }

        let client = S3Client::from_conf(config_builder.build());

        let name = if prefix.is_empty() {
            format!("s3://{}", bucket)
        } else {
            format!("s3://{}/{}", bucket, prefix)
        };

        Ok(Self {
            operator,
            client,
            bucket: bucket.to_string(),
            prefix,
            name,
        })
    }

    /// aws-sdk 使用的完整 key（opendal 已经通过 root 处理了前缀）
    fn object_key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn to_entry(path: &str, meta: &opendal::Metadata) -> FileEntry {
        FileEntry {
            path: path.trim_start_matches('/').to_string(),
            size: meta.content_length(),
            fingerprint: meta.etag().map(Fingerprint::from_etag),
            modified_at: meta.last_modified(),
        }
    }

    fn sdk_error(action: &str, key: &str, e: impl std::fmt::Display) -> StorageError {
        StorageError::Backend(format!("{} 失败 {}: {}", action, key, e))
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StorageResult<FileEntry>> {
        let prefix = prefix.trim_matches('/');
        let dir = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };
        let operator = self.operator.clone();

        // 使用 lister_with 进行递归列表，第一次 poll 时才真正发起请求
        stream::once(async move {
            operator
                .lister_with(&dir)
                .recursive(true)
                .metakey(
                    Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag,
                )
                .await
        })
        .map_ok(|lister| lister.map_err(StorageError::from))
        .map_err(StorageError::from)
        .try_flatten()
        .try_filter_map(|entry| async move {
            let path = entry.path();
            let meta = entry.metadata();
            // 跳过根目录和目录占位对象
            if path.is_empty() || path == "/" || meta.is_dir() || path.ends_with('/') {
                return Ok(None);
            }
            Ok(Some(Self::to_entry(path, meta)))
        })
        .boxed()
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<FileEntry>> {
        match self.operator.stat(path).await {
            Ok(meta) if meta.is_dir() => Ok(None),
            Ok(meta) => Ok(Some(Self::to_entry(path, &meta))),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_chunk(&self, path: &str, offset: u64, length: u64) -> StorageResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let data = self
            .operator
            .read_with(path)
            .range(offset..offset + length)
            .await?;
        Ok(data.to_bytes())
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        self.operator.write(path, data).await?;
        Ok(())
    }

    async fn begin_multipart(&self, path: &str) -> StorageResult<MultipartSession> {
        let key = self.object_key(path);
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::sdk_error("创建分片上传", &key, e))?;

        let upload_id = resp
            .upload_id()
            .ok_or_else(|| Self::sdk_error("创建分片上传", &key, "响应缺少 upload id"))?;
        debug!("开始分片上传: s3://{}/{} ({})", self.bucket, key, upload_id);

        Ok(MultipartSession {
            id: upload_id.to_string(),
            path: path.to_string(),
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        index: u32,
        data: Bytes,
    ) -> StorageResult<PartAck> {
        let key = self.object_key(&session.path);
        let size = data.len() as u64;
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&session.id)
            .part_number(index as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::sdk_error(&format!("上传分片 {}", index), &key, e))?;

        let tag = resp
            .e_tag()
            .ok_or_else(|| Self::sdk_error(&format!("上传分片 {}", index), &key, "响应缺少 ETag"))?;

        Ok(PartAck {
            index,
            tag: tag.to_string(),
            size,
        })
    }

    async fn complete_multipart(
        &self,
        session: MultipartSession,
        parts: Vec<PartAck>,
    ) -> StorageResult<()> {
        let key = self.object_key(&session.path);
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.index as i32)
                    .e_tag(p.tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&session.id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::sdk_error("提交分片上传", &key, e))?;

        Ok(())
    }

    async fn abort_multipart(&self, session: MultipartSession) -> StorageResult<()> {
        let key = self.object_key(&session.path);
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&session.id)
            .send()
            .await
            .map_err(|e| Self::sdk_error("放弃分片上传", &key, e))?;

        debug!("已放弃分片上传: s3://{}/{} ({})", self.bucket, key, session.id);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        // S3 删除不存在的文件不会报错
        self.operator.delete(path).await?;
        Ok(())
    }

    fn part_limits(&self) -> PartLimits {
        PartLimits {
            min_part_size: S3_MIN_PART_SIZE,
            max_parts: S3_MAX_PARTS,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
