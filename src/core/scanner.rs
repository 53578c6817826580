use crate::core::ignore::{IgnoreFilter, IgnoreRules};
use crate::error::SyncError;
use crate::storage::{relative_to, FileEntry, Storage};
use futures::stream::{Stream, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 一侧存储在某一时刻的全部文件，按相对路径排序
pub type Catalog = BTreeMap<String, FileEntry>;

/// 文件扫描器
pub struct FileScanner {
    ignore: Arc<dyn IgnoreFilter>,
    cancel: Option<CancellationToken>,
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            ignore: Arc::new(IgnoreRules::empty()),
            cancel: None,
        }
    }

    pub fn with_ignore(ignore: Arc<dyn IgnoreFilter>) -> Self {
        Self {
            ignore,
            cancel: None,
        }
    }

    /// 设置取消标志
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.is_cancelled())
            .unwrap_or(false)
    }

    /// 惰性遍历 `root` 下的文件
    ///
    /// 产生的路径相对于 `root`，被忽略的文件不会出现。每次调用都重新列举。
    /// 列举失败返回 `BackendUnavailable`，这里不做重试。
    pub fn catalog<'a>(
        &'a self,
        storage: &'a dyn Storage,
        root: &'a str,
    ) -> impl Stream<Item = Result<FileEntry, SyncError>> + Send + 'a {
        let root = root.trim_matches('/');
        storage
            .list(root)
            .map_err(move |e| SyncError::unavailable(storage.name(), e))
            .try_filter_map(move |mut entry| {
                let result = if self.is_cancelled() {
                    Err(SyncError::Cancelled)
                } else {
                    match relative_to(root, &entry.path) {
                        // 跳过根目录本身和目录占位
                        Some(rel) if rel.is_empty() || rel.ends_with('/') => Ok(None),
                        Some(rel) if self.ignore.is_ignored(rel) => {
                            debug!("排除文件: {}", rel);
                            Ok(None)
                        }
                        Some(rel) => {
                            let rel = rel.to_string();
                            entry.path = rel;
                            Ok(Some(entry))
                        }
                        None => {
                            warn!("列举结果不在根目录下，已跳过: {}", entry.path);
                            Ok(None)
                        }
                    }
                };
                futures::future::ready(result)
            })
    }

    /// 扫描存储并返回完整的 Catalog
    pub async fn collect_catalog(
        &self,
        storage: &dyn Storage,
        root: &str,
    ) -> Result<Catalog, SyncError> {
        info!("开始扫描存储: {}, root: {:?}", storage.name(), root);

        let mut catalog = Catalog::new();
        let mut stream = Box::pin(self.catalog(storage, root));

        while let Some(entry) = stream.try_next().await? {
            if let Some(existing) = catalog.get(&entry.path) {
                warn!("重复的路径，保留第一次出现的条目: {} ({} 字节)", existing.path, existing.size);
                continue;
            }
            catalog.insert(entry.path.clone(), entry);
        }

        info!("扫描完成: {} 共 {} 个文件", storage.name(), catalog.len());
        Ok(catalog)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use bytes::Bytes;

    #[tokio::test]
    async fn catalog_is_relative_to_root_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_str().unwrap()).unwrap();
        for path in ["site/index.html", "site/cache/x.bin", "other/readme.md"] {
            storage.write(path, Bytes::from_static(b"x")).await.unwrap();
        }

        let filter = |path: &str| path.starts_with("cache/");
        let scanner = FileScanner::with_ignore(Arc::new(filter));
        let catalog = scanner.collect_catalog(&storage, "/site/").await.unwrap();

        assert_eq!(catalog.keys().collect::<Vec<_>>(), vec!["index.html"]);
    }

    #[tokio::test]
    async fn cancelled_scan_stops_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_str().unwrap()).unwrap();
        storage.write("a.txt", Bytes::from_static(b"a")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let scanner = FileScanner::new().with_cancel(cancel);

        let err = scanner.collect_catalog(&storage, "").await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
