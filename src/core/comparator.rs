use crate::core::scanner::Catalog;
use crate::storage::{FileEntry, Fingerprint};
use serde::{Deserialize, Serialize};

/// 指纹无法比较时使用的判定方式
///
/// 这是一个近似：`SizeAndMtime` 下只改了时间戳的文件会被重新复制，
/// 内容变了但大小和时间都没变的文件会被漏掉。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackPolicy {
    /// 大小不同，或目标比源旧，才复制；时间未知时视为未变化
    SizeAndMtime,
    /// 只看大小
    SizeOnly,
    /// 无法确认时一律复制
    AlwaysCopy,
}

/// 比较配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompareConfig {
    /// 时间容差（秒）
    pub time_tolerance_seconds: i64,
    pub fallback: FallbackPolicy,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance_seconds: 2,
            fallback: FallbackPolicy::SizeAndMtime,
        }
    }
}

/// 文件比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 指纹相同
    Equal,
    /// 指纹无法比较，按回退规则认为相同
    ProbablyEqual,
    /// 指纹或大小不同
    Different,
    /// 大小相同，但目标比源旧
    SourceNewer,
}

impl FileRelation {
    pub fn needs_copy(self) -> bool {
        matches!(self, FileRelation::Different | FileRelation::SourceNewer)
    }
}

/// 同步计划，两个列表都按路径排序且互不相交
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub copy: Vec<String>,
    pub delete: Vec<String>,
    /// 需要复制的总字节数
    pub copy_bytes: u64,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.copy.len() + self.delete.len()
    }
}

/// 文件比较器
#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn new(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 比较两个文件
    pub fn compare_files(&self, source: &FileEntry, dest: &FileEntry) -> FileRelation {
        // 首先检查指纹
        match (&source.fingerprint, &dest.fingerprint) {
            (Some(Fingerprint::Md5(a)), Some(Fingerprint::Md5(b))) => {
                return if a == b {
                    FileRelation::Equal
                } else {
                    FileRelation::Different
                };
            }
            (Some(Fingerprint::Opaque(a)), Some(Fingerprint::Opaque(b))) if a == b => {
                return FileRelation::Equal;
            }
            _ => {}
        }

        // 大小不同，肯定不同
        if source.size != dest.size {
            tracing::debug!(
                "文件大小不同: {} (src={}, dst={})",
                source.path,
                source.size,
                dest.size
            );
            return FileRelation::Different;
        }

        match self.config.fallback {
            FallbackPolicy::SizeOnly => FileRelation::ProbablyEqual,
            FallbackPolicy::AlwaysCopy => FileRelation::Different,
            FallbackPolicy::SizeAndMtime => match (source.modified_at, dest.modified_at) {
                (Some(src_time), Some(dst_time)) => {
                    let behind = (src_time - dst_time).num_seconds();
                    if behind > self.config.time_tolerance_seconds {
                        tracing::debug!(
                            "目标文件较旧: {} (src_time={}, dst_time={})",
                            source.path,
                            src_time,
                            dst_time
                        );
                        FileRelation::SourceNewer
                    } else {
                        FileRelation::ProbablyEqual
                    }
                }
                // 时间未知时倾向于不复制
                _ => FileRelation::ProbablyEqual,
            },
        }
    }

    /// 比较源和目标，生成同步计划
    ///
    /// 纯函数：没有 IO，同样的输入总得到同样的输出。`delete_enabled` 只影响 `delete`。
    pub fn compute_plan(&self, source: &Catalog, dest: &Catalog, delete_enabled: bool) -> SyncPlan {
        let mut plan = SyncPlan::default();

        for (path, src) in source {
            let needs_copy = match dest.get(path) {
                None => true,
                Some(dst) => self.compare_files(src, dst).needs_copy(),
            };
            if needs_copy {
                plan.copy.push(path.clone());
                plan.copy_bytes += src.size;
            }
        }

        if delete_enabled {
            plan.delete = dest
                .keys()
                .filter(|path| !source.contains_key(*path))
                .cloned()
                .collect();
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn entry(path: &str, size: u64, md5: Option<&str>, mtime: Option<i64>) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            fingerprint: md5.map(|h| Fingerprint::Md5(h.to_string())),
            modified_at: mtime.map(|t| Utc.timestamp_opt(t, 0).unwrap()),
        }
    }

    fn catalog(entries: Vec<FileEntry>) -> Catalog {
        entries.into_iter().map(|e| (e.path.clone(), e)).collect()
    }

    #[test]
    fn scenario_copy_and_optional_delete() {
        let source = catalog(vec![
            entry("a.txt", 1, Some("hash1"), None),
            entry("b.txt", 1, Some("hash2"), None),
        ]);
        let dest = catalog(vec![
            entry("b.txt", 1, Some("hash2"), None),
            entry("c.txt", 1, Some("hash3"), None),
        ]);
        let comparator = FileComparator::default();

        let plan = comparator.compute_plan(&source, &dest, false);
        assert_eq!(plan.copy, vec!["a.txt".to_string()]);
        assert!(plan.delete.is_empty());

        let plan = comparator.compute_plan(&source, &dest, true);
        assert_eq!(plan.copy, vec!["a.txt".to_string()]);
        assert_eq!(plan.delete, vec!["c.txt".to_string()]);
    }

    #[test]
    fn differing_fingerprint_overwrites() {
        let source = catalog(vec![entry("a.txt", 3, Some("aaa"), Some(10))]);
        let dest = catalog(vec![entry("a.txt", 3, Some("bbb"), Some(100))]);
        let plan = FileComparator::default().compute_plan(&source, &dest, true);
        assert_eq!(plan.copy, vec!["a.txt".to_string()]);
        assert_eq!(plan.copy_bytes, 3);
    }

    #[test]
    fn opaque_etag_falls_back_to_size_and_time() {
        let src = entry("big.bin", 10, Some("0123456789abcdef0123456789abcdef"), Some(100));
        let mut dst = entry("big.bin", 10, None, Some(200));
        dst.fingerprint = Some(Fingerprint::Opaque("abc-3".into()));
        let comparator = FileComparator::default();

        // 目标更新：认为未变化
        assert_eq!(comparator.compare_files(&src, &dst), FileRelation::ProbablyEqual);

        // 目标更旧：复制
        dst.modified_at = Utc.timestamp_opt(50, 0).single();
        assert_eq!(comparator.compare_files(&src, &dst), FileRelation::SourceNewer);

        // 大小不同：复制
        dst.size = 11;
        assert_eq!(comparator.compare_files(&src, &dst), FileRelation::Different);
    }

    #[test]
    fn unknown_timestamps_are_treated_as_unchanged() {
        let src = entry("a", 5, None, None);
        let dst = entry("a", 5, None, Some(1));
        assert_eq!(
            FileComparator::default().compare_files(&src, &dst),
            FileRelation::ProbablyEqual
        );
    }

    #[test]
    fn time_tolerance_absorbs_small_skew() {
        let src = entry("a", 5, None, Some(102));
        let dst = entry("a", 5, None, Some(100));
        assert_eq!(
            FileComparator::default().compare_files(&src, &dst),
            FileRelation::ProbablyEqual
        );
    }

    #[test]
    fn fallback_policies_are_tunable() {
        let src = entry("a", 5, None, Some(1_000));
        let dst = entry("a", 5, None, Some(1));

        let size_only = FileComparator::new(CompareConfig {
            fallback: FallbackPolicy::SizeOnly,
            ..Default::default()
        });
        assert!(!size_only.compare_files(&src, &dst).needs_copy());

        let always = FileComparator::new(CompareConfig {
            fallback: FallbackPolicy::AlwaysCopy,
            ..Default::default()
        });
        assert!(always.compare_files(&dst, &src).needs_copy());
    }
}
