use super::{FileEntry, Fingerprint, MultipartSession, PartAck, Storage};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use md5::{Digest, Md5};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use walkdir::WalkDir;

/// 本地临时文件/分片暂存目录的前缀，列举时会被跳过
pub const INTERNAL_PREFIX: &str = ".bucketsync-";
const STAGING_DIR: &str = ".bucketsync-multipart";

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
    /// 是否计算 MD5 指纹
    checksum: bool,
}

impl LocalStorage {
    /// 根目录不存在时不会自动创建：作为源端列举时报 `NotFound`，
    /// 作为目标端时由第一次写入创建。
    pub fn new(path: &str) -> StorageResult<Self> {
        let base_path = PathBuf::from(path);
        if base_path.exists() && !base_path.is_dir() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let name = format!("local:{}", path);
        Ok(Self {
            base_path,
            name,
            checksum: true,
        })
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> StorageResult<PathBuf> {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            return Ok(self.base_path.clone());
        }
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    fn staging_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(session_id)
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    /// 在目标文件旁边生成临时文件名，写完后原子重命名
    fn temp_path_for(full_path: &Path) -> PathBuf {
        let name = format!("{}{}.tmp", INTERNAL_PREFIX, uuid::Uuid::new_v4());
        match full_path.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    /// 构造 FileEntry（阻塞调用，需在 spawn_blocking 中执行）
    fn entry_for(base_path: &Path, full_path: &Path, checksum: bool) -> StorageResult<FileEntry> {
        let metadata = std::fs::metadata(full_path)?;
        let relative_path = full_path
            .strip_prefix(base_path)
            .ok()
            .and_then(|p| p.to_str())
            .ok_or_else(|| StorageError::InvalidPath(full_path.display().to_string()))?;

        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        let fingerprint = if checksum {
            Some(Fingerprint::Md5(Self::hash_file(full_path)?))
        } else {
            None
        };

        Ok(FileEntry {
            path: Self::normalize_path(relative_path),
            size: metadata.len(),
            fingerprint,
            modified_at,
        })
    }

    fn hash_file(path: &Path) -> StorageResult<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn is_internal(name: &std::ffi::OsStr) -> bool {
        name.to_str()
            .map(|n| n.starts_with(INTERNAL_PREFIX))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StorageResult<FileEntry>> {
        let (tx, rx) = mpsc::channel(256);
        let base = match self.resolve_path(prefix) {
            Ok(base) => base,
            Err(e) => return futures::stream::once(async move { Err(e) }).boxed(),
        };
        let base_path = self.base_path.clone();
        let checksum = self.checksum;

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || {
            if !base.is_dir() {
                let _ = tx.blocking_send(Err(StorageError::NotFound(base.display().to_string())));
                return;
            }

            let walker = WalkDir::new(&base)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !Self::is_internal(e.file_name()));

            for entry in walker {
                let item = match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        match Self::entry_for(&base_path, entry.path(), checksum) {
                            // 遍历期间被删除的文件直接跳过
                            Err(e) if e.is_not_found() => continue,
                            other => other,
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => Err(StorageError::Io(e.into())),
                };
                // 接收端已丢弃，停止遍历
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<FileEntry>> {
        let full_path = self.resolve_path(path)?;
        let base_path = self.base_path.clone();
        let checksum = self.checksum;

        let result = tokio::task::spawn_blocking(move || {
            if full_path.is_dir() {
                return Ok(None);
            }
            Self::entry_for(&base_path, &full_path, checksum).map(Some)
        })
        .await?;

        match result {
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }

    async fn read_chunk(&self, path: &str, offset: u64, length: u64) -> StorageResult<Bytes> {
        let full_path = self.resolve_path(path)?;
        let mut file = fs::File::open(&full_path).await?;

        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; length as usize];
        match file.read_exact(&mut buffer).await {
            Ok(_) => Ok(Bytes::from(buffer)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // 文件剩余内容不足 length，读取实际可用的数据
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let full_path = self.resolve_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::temp_path_for(&full_path);
        if let Err(e) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn begin_multipart(&self, path: &str) -> StorageResult<MultipartSession> {
        // 先校验路径，避免在提交时才发现非法路径
        self.resolve_path(path)?;

        let id = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(self.staging_dir(&id)).await?;

        Ok(MultipartSession {
            id,
            path: path.to_string(),
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        index: u32,
        data: Bytes,
    ) -> StorageResult<PartAck> {
        let dir = self.staging_dir(&session.id);
        if !dir.is_dir() {
            return Err(StorageError::NotFound(format!("分片会话 {}", session.id)));
        }

        let tag = super::md5_hex(&data);
        let size = data.len() as u64;
        // 同一分片重试时直接覆盖
        fs::write(dir.join(format!("{:05}", index)), &data).await?;

        Ok(PartAck { index, tag, size })
    }

    async fn complete_multipart(
        &self,
        session: MultipartSession,
        parts: Vec<PartAck>,
    ) -> StorageResult<()> {
        for (i, part) in parts.iter().enumerate() {
            if part.index != i as u32 + 1 {
                return Err(StorageError::Backend(format!(
                    "分片不连续: 位置 {} 的分片序号为 {}",
                    i + 1,
                    part.index
                )));
            }
        }

        let dir = self.staging_dir(&session.id);
        let full_path = self.resolve_path(&session.path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path_for(&full_path);
        // 任何一步失败都删除临时文件
        let temp_guard = scopeguard::guard(temp_path.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });

        let mut out = fs::File::create(&temp_path).await?;
        for part in &parts {
            let data = fs::read(dir.join(format!("{:05}", part.index))).await?;
            if data.len() as u64 != part.size {
                return Err(StorageError::Backend(format!(
                    "分片 {} 大小不符: 期望 {}, 实际 {}",
                    part.index,
                    part.size,
                    data.len()
                )));
            }
            out.write_all(&data).await?;
        }
        out.sync_all().await?;
        drop(out);

        fs::rename(&temp_path, &full_path).await?;
        scopeguard::ScopeGuard::into_inner(temp_guard);

        let _ = fs::remove_dir_all(&dir).await;
        Ok(())
    }

    async fn abort_multipart(&self, session: MultipartSession) -> StorageResult<()> {
        match fs::remove_dir_all(self.staging_dir(&session.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let full_path = self.resolve_path(path)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
