//! 错误类型

use thiserror::Error;

/// 存储后端错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("对象不存在: {0}")]
    NotFound(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储后端错误: {0}")]
    Backend(String),

    #[error("非法路径: {0}")]
    InvalidPath(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<opendal::Error> for StorageError {
    fn from(e: opendal::Error) -> Self {
        if e.kind() == opendal::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Backend(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Backend(format!("后台任务失败: {}", e))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 同步过程中的错误
///
/// 只有 `BackendUnavailable` 会终止整个同步，其余都按单个文件记录。
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("存储不可用 ({backend}): {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: StorageError,
    },

    #[error("传输失败: {path} (尝试 {attempts} 次): {reason}")]
    TransferFailed {
        path: String,
        attempts: u32,
        reason: String,
    },

    #[error("校验不一致: {path} (期望 {expected}, 实际 {actual})")]
    VerificationMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("删除失败: {path}: {reason}")]
    DeleteFailed { path: String, reason: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("配置错误: {0}")]
    Config(String),
}

impl SyncError {
    pub fn unavailable(backend: &str, source: StorageError) -> Self {
        SyncError::BackendUnavailable {
            backend: backend.to_string(),
            source,
        }
    }

    /// 是否为终止整个同步的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::BackendUnavailable { .. } | SyncError::Config(_)
        )
    }
}
