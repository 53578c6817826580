//! 安全传输 - 重试、分片上传、写入后校验
//!
//! 小文件整体写入后重新 stat 目标并与源的 MD5 比较，不一致时再上传一次；
//! 大文件分片上传，每个分片单独重试，全部成功后才提交，任何失败或取消都会放弃整个分片会话。

use crate::config::SyncConfig;
use crate::error::{StorageError, SyncError};
use crate::storage::{md5_hex, Endpoint, FileEntry, MultipartSession, PartAck, PartLimits};
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// 不小于此大小的文件使用分片上传
    pub multipart_threshold: u64,
    pub chunk_size: u64,
    /// 单个操作的最大尝试次数（含第一次）
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl From<&SyncConfig> for TransferOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            multipart_threshold: config.multipart_threshold,
            chunk_size: config.chunk_size.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Succeeded,
    Failed,
}

/// 写入后的校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Verification {
    /// 目标的 MD5 与源一致
    Verified,
    /// 目标不提供可比较的校验和，只确认了存在和大小
    ExistenceOnly,
    /// 传输没有完成
    Unverified,
}

/// 单个文件的传输结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub path: String,
    pub status: TransferStatus,
    /// 整体上传的次数；分片上传时为单个分片用到的最多次数
    pub attempts: u32,
    pub verification: Verification,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferResult {
    fn succeeded(path: &str, attempts: u32, verification: Verification, bytes: u64) -> Self {
        Self {
            path: path.to_string(),
            status: TransferStatus::Succeeded,
            attempts,
            verification,
            bytes,
            error: None,
        }
    }

    pub(crate) fn failed(path: &str, attempts: u32, error: &SyncError) -> Self {
        Self {
            path: path.to_string(),
            status: TransferStatus::Failed,
            attempts,
            verification: Verification::Unverified,
            bytes: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Succeeded
    }
}

/// 单个操作的重试状态（尝试次数 + 下一次延迟），只在当前任务内使用
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    next_delay: Duration,
    max_attempts: u32,
    max_delay: Duration,
}

impl RetryState {
    pub fn new(options: &TransferOptions) -> Self {
        Self {
            attempt: 0,
            next_delay: options.retry_base_delay,
            max_attempts: options.max_attempts,
            max_delay: options.retry_max_delay,
        }
    }

    /// 开始一次新的尝试
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// 当前尝试失败后的等待时间，次数用完时返回 `None`（指数退避，有上限）
    pub fn backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        Some(delay)
    }
}

/// 分片确认的累加器，只属于执行该传输的任务
#[derive(Debug)]
pub struct PartAccumulator {
    expected: u32,
    parts: Vec<PartAck>,
}

impl PartAccumulator {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            parts: Vec::with_capacity(expected as usize),
        }
    }

    pub fn push(&mut self, ack: PartAck) {
        self.parts.push(ack);
    }

    pub fn is_complete(&self) -> bool {
        self.parts.len() as u32 == self.expected
            && self
                .parts
                .iter()
                .enumerate()
                .all(|(i, p)| p.index == i as u32 + 1)
    }

    /// 全部分片就绪时交出列表
    pub fn into_parts(mut self) -> Result<Vec<PartAck>, Self> {
        self.parts.sort_by_key(|p| p.index);
        if self.is_complete() {
            Ok(self.parts)
        } else {
            Err(self)
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// 分片数量（空文件也算一个分片）
pub fn part_count(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(chunk_size).max(1) as u32
}

/// 按后端限制调整分片大小：不小于最小分片，分片数超过上限时加大分片
pub fn effective_chunk_size(size: u64, chunk_size: u64, limits: PartLimits) -> u64 {
    let chunk = chunk_size.max(limits.min_part_size).max(1);
    let max_parts = u64::from(limits.max_parts.max(1));
    if size.div_ceil(chunk) > max_parts {
        size.div_ceil(max_parts)
    } else {
        chunk
    }
}

/// 一次尝试失败的原因
#[derive(Debug)]
enum AttemptError {
    /// 传输层失败，可以按退避重试
    Transport(StorageError),
    /// 写入成功但校验不一致
    Mismatch { expected: String, actual: String },
}

impl From<StorageError> for AttemptError {
    fn from(e: StorageError) -> Self {
        AttemptError::Transport(e)
    }
}

/// 带重试的操作失败
struct RetryFailure {
    error: SyncError,
    attempts: u32,
}

/// 安全传输执行器
#[derive(Debug, Clone, Default)]
pub struct TransferExecutor {
    options: TransferOptions,
}

impl TransferExecutor {
    pub fn new(options: TransferOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// 把 `path` 从源复制到目标
    ///
    /// 不会返回错误：所有失败都记录在 `TransferResult` 中。源不会被修改。
    pub async fn transfer(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
        path: &str,
        cancel: &CancellationToken,
    ) -> TransferResult {
        if cancel.is_cancelled() {
            return TransferResult::failed(path, 0, &SyncError::Cancelled);
        }

        let source_key = source.key(path);
        let entry = match source.storage.stat(&source_key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                let err = SyncError::TransferFailed {
                    path: path.to_string(),
                    attempts: 0,
                    reason: "源文件不存在".to_string(),
                };
                warn!("{}", err);
                return TransferResult::failed(path, 0, &err);
            }
            Err(e) => {
                let err = SyncError::TransferFailed {
                    path: path.to_string(),
                    attempts: 0,
                    reason: format!("读取源文件信息失败: {}", e),
                };
                warn!("{}", err);
                return TransferResult::failed(path, 0, &err);
            }
        };

        debug!(
            "复制: {} -> {} ({} 字节)",
            source.name(),
            dest.name(),
            entry.size
        );

        if entry.size >= self.options.multipart_threshold {
            self.transfer_multipart(source, dest, path, &entry, cancel)
                .await
        } else {
            self.transfer_single(source, dest, path, &entry, cancel)
                .await
        }
    }

    /// 小文件：整体写入 + 校验，校验不一致时再上传一次
    async fn transfer_single(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
        path: &str,
        entry: &FileEntry,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let source_key = source.key(path);
        let dest_key = dest.key(path);
        let mut retry = RetryState::new(&self.options);
        let mut mismatch_retries = 1;

        loop {
            if cancel.is_cancelled() {
                return TransferResult::failed(path, retry.attempts(), &SyncError::Cancelled);
            }

            let attempt = retry.begin_attempt();
            // 单次写入在两种后端上都是原子的，取消时让它完成
            let result = write_and_verify(source, dest, &source_key, &dest_key, entry.size).await;

            match result {
                Ok((verification, size)) => {
                    debug!("写入完成: {} ({:?}, 第 {} 次)", dest_key, verification, attempt);
                    return TransferResult::succeeded(path, attempt, verification, size);
                }
                Err(AttemptError::Mismatch { expected, actual }) => {
                    let err = SyncError::VerificationMismatch {
                        path: path.to_string(),
                        expected,
                        actual,
                    };
                    if mismatch_retries > 0 {
                        mismatch_retries -= 1;
                        warn!("{}，重新上传", err);
                        continue;
                    }
                    error!("{}", err);
                    return TransferResult::failed(path, attempt, &err);
                }
                Err(AttemptError::Transport(e)) => match retry.backoff() {
                    Some(delay) => {
                        warn!(
                            "上传失败，{}ms 后重试 ({}/{}): {}: {}",
                            delay.as_millis(),
                            attempt,
                            self.options.max_attempts,
                            path,
                            e
                        );
                        if !sleep_or_cancel(delay, cancel).await {
                            return TransferResult::failed(path, attempt, &SyncError::Cancelled);
                        }
                    }
                    None => {
                        let err = SyncError::TransferFailed {
                            path: path.to_string(),
                            attempts: attempt,
                            reason: e.to_string(),
                        };
                        error!("{}", err);
                        return TransferResult::failed(path, attempt, &err);
                    }
                },
            }
        }
    }

    /// 大文件：分片上传，每个分片独立重试
    async fn transfer_multipart(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
        path: &str,
        entry: &FileEntry,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let source_key = source.key(path);
        let dest_key = dest.key(path);
        let chunk_size = effective_chunk_size(
            entry.size,
            self.options.chunk_size,
            dest.storage.part_limits(),
        );
        if chunk_size != self.options.chunk_size {
            debug!("{} 的分片大小按后端限制调整为 {} 字节", path, chunk_size);
        }
        let total_parts = part_count(entry.size, chunk_size);

        let (session, mut max_attempts) = match self
            .with_retry(path, "创建分片上传", cancel, || {
                dest.storage.begin_multipart(&dest_key)
            })
            .await
        {
            Ok(v) => v,
            Err(failure) => return TransferResult::failed(path, failure.attempts, &failure.error),
        };

        debug!("分片上传 {}: {} 个分片, 会话 {}", path, total_parts, session.id);

        let mut accumulator = PartAccumulator::new(total_parts);
        let mut hasher = Md5::new();
        let mut transferred = 0u64;

        for index in 1..=total_parts {
            let offset = (index as u64 - 1) * chunk_size;
            let length = chunk_size.min(entry.size - offset);
            let session_ref = &session;
            let source_key = source_key.as_str();

            let outcome = self
                .with_retry(path, &format!("上传分片 {}/{}", index, total_parts), cancel, || async move {
                    let data = source.storage.read_chunk(source_key, offset, length).await?;
                    if data.len() as u64 != length {
                        return Err(StorageError::Backend(format!(
                            "源文件读取长度不符: 期望 {}, 实际 {}",
                            length,
                            data.len()
                        )));
                    }
                    let ack = dest
                        .storage
                        .upload_part(session_ref, index, data.clone())
                        .await?;
                    Ok((ack, data))
                })
                .await;

            match outcome {
                Ok(((ack, data), attempts)) => {
                    max_attempts = max_attempts.max(attempts);
                    hasher.update(&data);
                    transferred += data.len() as u64;
                    accumulator.push(ack);
                }
                Err(failure) => {
                    self.abort(dest, session).await;
                    return TransferResult::failed(
                        path,
                        max_attempts.max(failure.attempts),
                        &failure.error,
                    );
                }
            }
        }

        let parts = match accumulator.into_parts() {
            Ok(parts) => parts,
            Err(acc) => {
                let err = SyncError::TransferFailed {
                    path: path.to_string(),
                    attempts: max_attempts,
                    reason: format!("分片不完整: {}/{}", acc.len(), total_parts),
                };
                self.abort(dest, session).await;
                return TransferResult::failed(path, max_attempts, &err);
            }
        };

        if cancel.is_cancelled() {
            self.abort(dest, session).await;
            return TransferResult::failed(path, max_attempts, &SyncError::Cancelled);
        }

        let completion = {
            let session_ref = &session;
            let parts_ref = &parts;
            self.with_retry(path, "提交分片上传", cancel, || async move {
                dest.storage
                    .complete_multipart(session_ref.clone(), parts_ref.clone())
                    .await
            })
            .await
        };
        if let Err(failure) = completion {
            self.abort(dest, session).await;
            return TransferResult::failed(path, max_attempts.max(failure.attempts), &failure.error);
        }

        // 提交后确认对象存在；有可比较的 MD5 时再比对内容
        let expected = hex::encode(hasher.finalize());
        let written = match dest.storage.stat(&dest_key).await {
            Ok(written) => written,
            Err(e) => {
                let err = SyncError::TransferFailed {
                    path: path.to_string(),
                    attempts: max_attempts,
                    reason: format!("提交后无法确认目标: {}", e),
                };
                return TransferResult::failed(path, max_attempts, &err);
            }
        };

        match verify(written.as_ref(), &expected, transferred) {
            Ok(verification) => {
                debug!("分片上传完成: {} ({:?})", dest_key, verification);
                TransferResult::succeeded(path, max_attempts, verification, transferred)
            }
            Err(AttemptError::Mismatch { expected, actual }) => {
                let err = SyncError::VerificationMismatch {
                    path: path.to_string(),
                    expected,
                    actual,
                };
                error!("{}", err);
                // 已提交的对象内容不对，删掉，不留下错误的副本
                match dest.storage.delete(&dest_key).await {
                    Ok(()) => warn!("已删除校验失败的目标对象: {}", dest_key),
                    Err(e) => error!(
                        "校验失败的目标对象删除失败，错误内容仍在目标: {} ({})",
                        dest_key, e
                    ),
                }
                TransferResult::failed(path, max_attempts, &err)
            }
            Err(AttemptError::Transport(e)) => {
                let err = SyncError::TransferFailed {
                    path: path.to_string(),
                    attempts: max_attempts,
                    reason: e.to_string(),
                };
                error!("{}", err);
                TransferResult::failed(path, max_attempts, &err)
            }
        }
    }

    /// 放弃分片会话，失败只记录日志
    async fn abort(&self, dest: &Endpoint, session: MultipartSession) {
        let id = session.id.clone();
        match dest.storage.abort_multipart(session).await {
            Ok(()) => debug!("已放弃分片会话: {}", id),
            Err(e) => warn!("放弃分片会话失败 {}: {}", id, e),
        }
    }

    /// 带指数退避的重试；取消时立即中断正在进行的调用
    async fn with_retry<T, F, Fut>(
        &self,
        path: &str,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut retry = RetryState::new(&self.options);

        loop {
            let attempt = retry.begin_attempt();
            let result = tokio::select! {
                result = op() => result,
                _ = cancel.cancelled() => {
                    return Err(RetryFailure { error: SyncError::Cancelled, attempts: attempt });
                }
            };

            match result {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => match retry.backoff() {
                    Some(delay) => {
                        warn!(
                            "{}失败，{}ms 后重试 ({}/{}): {}: {}",
                            what,
                            delay.as_millis(),
                            attempt,
                            self.options.max_attempts,
                            path,
                            e
                        );
                        if !sleep_or_cancel(delay, cancel).await {
                            return Err(RetryFailure {
                                error: SyncError::Cancelled,
                                attempts: attempt,
                            });
                        }
                    }
                    None => {
                        let error = SyncError::TransferFailed {
                            path: path.to_string(),
                            attempts: attempt,
                            reason: format!("{}: {}", what, e),
                        };
                        error!("{}", error);
                        return Err(RetryFailure {
                            error,
                            attempts: attempt,
                        });
                    }
                },
            }
        }
    }
}

/// 读取整个源文件、写入目标并校验，返回校验结果和字节数
async fn write_and_verify(
    source: &Endpoint,
    dest: &Endpoint,
    source_key: &str,
    dest_key: &str,
    size: u64,
) -> Result<(Verification, u64), AttemptError> {
    let data = if size == 0 {
        Bytes::new()
    } else {
        source.storage.read_chunk(source_key, 0, size).await?
    };
    let expected = md5_hex(&data);
    let size = data.len() as u64;

    dest.storage.write(dest_key, data).await?;
    let written = dest.storage.stat(dest_key).await?;
    verify(written.as_ref(), &expected, size).map(|v| (v, size))
}

/// 比较写入后的目标与期望的 MD5/大小
fn verify(
    written: Option<&FileEntry>,
    expected_md5: &str,
    expected_size: u64,
) -> Result<Verification, AttemptError> {
    let written = written.ok_or_else(|| {
        AttemptError::Transport(StorageError::NotFound("写入后目标不存在".to_string()))
    })?;

    if written.size != expected_size {
        return Err(AttemptError::Mismatch {
            expected: format!("{} 字节", expected_size),
            actual: format!("{} 字节", written.size),
        });
    }

    match written.fingerprint.as_ref().and_then(|f| f.md5_hex()) {
        Some(actual) if actual.eq_ignore_ascii_case(expected_md5) => Ok(Verification::Verified),
        Some(actual) => Err(AttemptError::Mismatch {
            expected: expected_md5.to_string(),
            actual: actual.to_string(),
        }),
        None => Ok(Verification::ExistenceOnly),
    }
}

/// 等待 `delay`，期间被取消返回 `false`
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
