//! 忽略规则
//!
//! 规则语法与 shell 通配符一致（`*` 也匹配 `/`），以 `/` 结尾的规则忽略该目录下的全部内容。
//! 规则文件中空行和 `#` 开头的行会被跳过。

use crate::error::SyncError;
use crate::storage::Storage;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::debug;

/// 判断相对路径是否被排除
pub trait IgnoreFilter: Send + Sync {
    fn is_ignored(&self, path: &str) -> bool;
}

impl<F> IgnoreFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_ignored(&self, path: &str) -> bool {
        self(path)
    }
}

/// 编译后的忽略规则
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    globs: GlobSet,
    dir_prefixes: Vec<String>,
}

impl IgnoreRules {
    pub fn empty() -> Self {
        Self {
            patterns: vec![],
            globs: GlobSet::empty(),
            dir_prefixes: vec![],
        }
    }

    pub fn new<I, S>(patterns: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut dir_prefixes = Vec::new();
        let mut kept = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() || kept.iter().any(|p| p == pattern) {
                continue;
            }

            if pattern.ends_with('/') {
                dir_prefixes.push(pattern.trim_start_matches('/').to_string());
            }

            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|e| SyncError::Config(format!("无效的忽略规则 {}: {}", pattern, e)))?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }

        let globs = builder
            .build()
            .map_err(|e| SyncError::Config(format!("忽略规则编译失败: {}", e)))?;

        Ok(Self {
            patterns: kept,
            globs,
            dir_prefixes,
        })
    }

    /// 解析忽略规则文件内容
    pub fn parse_ignore_file(content: &str) -> Vec<String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    /// 从存储根目录读取规则文件，并与额外规则合并
    ///
    /// 规则文件不存在时只使用额外规则。
    pub async fn load(
        storage: &dyn Storage,
        root: &str,
        file_name: &str,
        extra: &[String],
    ) -> Result<Self, SyncError> {
        let key = if root.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", root, file_name)
        };

        let mut patterns = extra.to_vec();
        let entry = match storage.stat(&key).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(SyncError::unavailable(storage.name(), e)),
        };

        if let Some(entry) = entry {
            let data = storage
                .read_chunk(&key, 0, entry.size)
                .await
                .map_err(|e| SyncError::unavailable(storage.name(), e))?;
            let content = String::from_utf8_lossy(&data);
            let from_file = Self::parse_ignore_file(&content);
            debug!("从 {} 读取 {} 条忽略规则", key, from_file.len());
            patterns.extend(from_file);
        }

        Self::new(patterns)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::empty()
    }
}

impl IgnoreFilter for IgnoreRules {
    fn is_ignored(&self, path: &str) -> bool {
        self.globs.is_match(path) || self.dir_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_across_directories() {
        let rules = IgnoreRules::new(["*.tmp"]).unwrap();
        assert!(rules.is_ignored("scratch.tmp"));
        assert!(rules.is_ignored("deep/nested/scratch.tmp"));
        assert!(!rules.is_ignored("notes.txt"));
    }

    #[test]
    fn trailing_slash_ignores_directory_contents() {
        let rules = IgnoreRules::new(["__pycache__/"]).unwrap();
        assert!(rules.is_ignored("__pycache__/mod.pyc"));
        assert!(!rules.is_ignored("src/__pycache__.py"));
    }

    #[test]
    fn exact_names_only_match_whole_path() {
        let rules = IgnoreRules::new(["secrets.env"]).unwrap();
        assert!(rules.is_ignored("secrets.env"));
        assert!(!rules.is_ignored("config/secrets.env"));
    }

    #[test]
    fn ignore_file_skips_comments_and_blanks() {
        let parsed = IgnoreRules::parse_ignore_file("# build output\n\ntarget/\n  *.log  \n");
        assert_eq!(parsed, vec!["target/".to_string(), "*.log".to_string()]);
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = IgnoreRules::new(["[unterminated"]).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn closures_are_filters() {
        let filter = |path: &str| path.starts_with(".git/");
        assert!(filter.is_ignored(".git/HEAD"));
        assert!(!IgnoreRules::empty().is_ignored("anything"));
    }
}
