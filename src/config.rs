//! 应用配置模块
//!
//! 所有配置保存在配置目录的 `config.json` 中，每个关注点一个小节（`sync`、`log`）。

use crate::core::comparator::CompareConfig;
use crate::core::engine::SyncDirection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 默认的忽略规则文件名
pub const DEFAULT_IGNORE_FILE: &str = ".bucketsyncignore";

/// 存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// 本地存储是否计算 MD5 指纹（关闭后只能按大小+时间比较）
    #[serde(default = "default_true")]
    pub checksum: bool,
}

fn default_true() -> bool {
    true
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// 最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 大文件阈值（字节），不小于此大小的文件使用分片传输
    pub multipart_threshold: u64,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 单个操作的最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 重试基础延迟（毫秒），每次翻倍
    pub retry_base_delay_ms: u64,
    /// 重试延迟上限（毫秒）
    pub retry_max_delay_ms: u64,
    /// 只计算计划，不执行
    pub dry_run: bool,
    /// 忽略规则文件名（位于本地根目录）
    pub ignore_file: String,
    /// 额外的忽略规则
    pub ignore_patterns: Vec<String>,
    pub compare: CompareConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            multipart_threshold: 16 * 1024 * 1024, // 16MB
            chunk_size: 8 * 1024 * 1024,           // 8MB，S3 要求除最后一片外不小于 5MB
            max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            dry_run: false,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            ignore_patterns: vec![],
            compare: CompareConfig::default(),
        }
    }
}

impl SyncConfig {
    /// 从配置文件加载同步配置
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "sync").unwrap_or_default()
    }

    /// 保存同步配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }

    /// 检查配置是否可用
    pub fn validate(&self) -> Result<(), crate::error::SyncError> {
        use crate::error::SyncError;

        if self.max_concurrent_transfers == 0 {
            return Err(SyncError::Config("maxConcurrentTransfers 不能为 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunkSize 不能为 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("maxAttempts 不能为 0".into()));
        }
        Ok(())
    }

    /// 在 `validate` 的基础上检查远程存储的限制
    pub fn validate_for(&self, remote: &StorageConfig) -> Result<(), crate::error::SyncError> {
        use crate::error::SyncError;
        use crate::storage::S3_MIN_PART_SIZE;

        self.validate()?;
        if remote.typ == StorageType::S3 && self.chunk_size < S3_MIN_PART_SIZE {
            return Err(SyncError::Config(format!(
                "S3 的 chunkSize 不能小于 {} 字节，当前 {}",
                S3_MIN_PART_SIZE, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// 一次同步任务的描述（命令行读取的 job 文件）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// 本地目录
    pub local_path: String,
    /// 远程存储
    pub remote: StorageConfig,
    #[serde(default = "default_mode")]
    pub mode: SyncDirection,
    #[serde(default)]
    pub delete: bool,
}

fn default_mode() -> SyncDirection {
    SyncDirection::Push
}

impl JobConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// 配置目录：`BUCKETSYNC_CONFIG_DIR`，否则为系统配置目录下的 `bucketsync`
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("BUCKETSYNC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    let base = if cfg!(target_os = "windows") {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    } else {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    };

    base.map(|p| p.join("bucketsync"))
        .unwrap_or_else(|| PathBuf::from(".bucketsync"))
}

/// 读取 config.json 中的一个小节，文件或小节不存在、格式错误时返回 `None`
pub(crate) fn read_section<T: serde::de::DeserializeOwned>(
    config_dir: &Path,
    section: &str,
) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    match serde_json::from_value::<T>(config.get(section)?.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置小节 {} 格式错误，使用默认值: {}", section, e);
            None
        }
    }
}

/// 更新 config.json 中的一个小节，保留其它小节
pub(crate) fn write_section<T: Serialize>(
    config_dir: &Path,
    section: &str,
    value: &T,
) -> io::Result<()> {
    let config_file = config_dir.join("config.json");

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[section] = serde_json::to_value(value)?;

    fs::create_dir_all(config_dir)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(dir.path());
        assert_eq!(config.max_concurrent_transfers, 4);
        assert_eq!(config.ignore_file, DEFAULT_IGNORE_FILE);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"sync": {"maxAttempts": 2, "ignorePatterns": ["*.tmp"]}, "log": {"level": "debug"}}"#,
        )
        .unwrap();

        let config = SyncConfig::load(dir.path());
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.ignore_patterns, vec!["*.tmp".to_string()]);
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
    }

    #[test]
    fn save_preserves_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"log": {"level": "warn"}}"#).unwrap();

        let config = SyncConfig {
            dry_run: true,
            ..Default::default()
        };
        config.save(dir.path()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(raw["log"]["level"], "warn");
        assert_eq!(raw["sync"]["dryRun"], true);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = SyncConfig {
            max_concurrent_transfers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn small_chunks_are_rejected_only_for_s3() {
        let remote = |typ| StorageConfig {
            typ,
            path: Some("/backup".into()),
            bucket: Some("b".into()),
            region: Some("us-east-1".into()),
            access_key: None,
            secret_key: None,
            endpoint: None,
            prefix: None,
            checksum: true,
        };
        let config = SyncConfig {
            chunk_size: 1024 * 1024,
            ..Default::default()
        };

        assert!(matches!(
            config.validate_for(&remote(StorageType::S3)),
            Err(crate::error::SyncError::Config(_))
        ));
        assert!(config.validate_for(&remote(StorageType::Local)).is_ok());
        assert!(SyncConfig::default()
            .validate_for(&remote(StorageType::S3))
            .is_ok());
    }

    #[test]
    fn job_file_defaults_to_push_without_delete() {
        let job: JobConfig = serde_json::from_str(
            r#"{"localPath": "/data", "remote": {"type": "s3", "bucket": "b", "region": "us-east-1"}}"#,
        )
        .unwrap();
        assert_eq!(job.mode, SyncDirection::Push);
        assert!(!job.delete);
        assert!(job.remote.checksum);
    }
}
