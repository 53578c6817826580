use crate::config::{StorageConfig, SyncConfig};
use crate::core::comparator::{FileComparator, SyncPlan};
use crate::core::ignore::IgnoreRules;
use crate::core::scanner::{Catalog, FileScanner};
use crate::core::transfer::{RetryState, TransferExecutor, TransferOptions, TransferResult};
use crate::error::SyncError;
use crate::storage::{Endpoint, LocalStorage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// 本地 -> 远程
    Push,
    /// 远程 -> 本地
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Destination,
}

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Cataloging(Side),
    Planning,
    Transferring,
    Deleting,
    Completed,
    /// 被取消，报告里 `cancelled` 为 true
    Cancelled,
    Aborted,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SyncPhase::Cataloging(Side::Source) => "正在扫描源文件",
            SyncPhase::Cataloging(Side::Destination) => "正在扫描目标文件",
            SyncPhase::Planning => "正在比较文件差异",
            SyncPhase::Transferring => "正在传输",
            SyncPhase::Deleting => "正在删除",
            SyncPhase::Completed => "同步完成",
            SyncPhase::Cancelled => "同步已取消",
            SyncPhase::Aborted => "同步中止",
        };
        f.write_str(text)
    }
}

/// 执行的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Copy,
    Delete,
}

/// 进度事件，由工作任务直接发送
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncProgress {
    Phase { phase: SyncPhase },
    #[serde(rename_all = "camelCase")]
    Planned {
        copy: usize,
        delete: usize,
        bytes_total: u64,
    },
    #[serde(rename_all = "camelCase")]
    ItemFinished {
        path: String,
        action: SyncAction,
        success: bool,
        bytes: u64,
    },
}

/// 失败的单个操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub path: String,
    pub action: SyncAction,
    pub error: String,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub id: String,
    pub mode: SyncDirection,
    /// 成功复制的路径（dry run 时为计划复制的路径）
    pub copy: Vec<String>,
    /// 成功删除的路径（dry run 时为计划删除的路径）
    pub delete: Vec<String>,
    pub failed: Vec<FailedItem>,
    /// 因取消而没有开始的操作
    pub skipped: Vec<String>,
    pub transfers: Vec<TransferResult>,
    pub cancelled: bool,
    pub dry_run: bool,
    pub bytes_transferred: u64,
    pub start_time: i64,
    pub end_time: i64,
}

impl SyncReport {
    fn new(mode: SyncDirection, start_time: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            copy: vec![],
            delete: vec![],
            failed: vec![],
            skipped: vec![],
            transfers: vec![],
            cancelled: false,
            dry_run: false,
            bytes_transferred: 0,
            start_time,
            end_time: start_time,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    /// 没有失败、没有取消
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled && self.skipped.is_empty()
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            progress_tx: None,
        })
    }

    /// 设置进度通道
    pub fn with_progress(mut self, tx: mpsc::Sender<SyncProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 取消同步
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 取消令牌，可交给其它任务（例如 Ctrl-C 处理）
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 同步本地与远程目录
    ///
    /// `Push` 以本地为源，`Pull` 以远程为源；`delete` 时删除目标上源没有的文件。
    /// 单个文件的失败记录在报告中，只有扫描失败才返回 `Err`。
    pub async fn sync_folder(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        mode: SyncDirection,
        delete: bool,
    ) -> Result<SyncReport, SyncError> {
        let start_time = chrono::Utc::now().timestamp();
        let (source, dest) = match mode {
            SyncDirection::Push => (local, remote),
            SyncDirection::Pull => (remote, local),
        };
        let mut report = SyncReport::new(mode, start_time);
        report.dry_run = self.config.dry_run;

        info!(
            "开始同步: {:?} {} -> {} (删除: {}, dry run: {})",
            mode,
            source.name(),
            dest.name(),
            delete,
            self.config.dry_run
        );

        let (source_catalog, dest_catalog) = match self.build_catalogs(local, source, dest).await {
            Ok(catalogs) => catalogs,
            Err(SyncError::Cancelled) => {
                info!("扫描阶段已取消");
                return Ok(self.finish(report, true).await);
            }
            Err(e) => {
                error!("同步中止: {}", e);
                self.send_progress(SyncProgress::Phase {
                    phase: SyncPhase::Aborted,
                })
                .await;
                return Err(e);
            }
        };

        // 比较文件
        self.send_progress(SyncProgress::Phase {
            phase: SyncPhase::Planning,
        })
        .await;
        let comparator = FileComparator::new(self.config.compare.clone());
        let plan = comparator.compute_plan(&source_catalog, &dest_catalog, delete);
        info!(
            "比较完成: {} 个复制 ({} 字节), {} 个删除",
            plan.copy.len(),
            plan.copy_bytes,
            plan.delete.len()
        );
        self.send_progress(SyncProgress::Planned {
            copy: plan.copy.len(),
            delete: plan.delete.len(),
            bytes_total: plan.copy_bytes,
        })
        .await;

        if self.config.dry_run {
            report.copy = plan.copy;
            report.delete = plan.delete;
            return Ok(self.finish(report, false).await);
        }

        let SyncPlan {
            copy: to_copy,
            delete: to_delete,
            ..
        } = plan;

        // 传输
        self.send_progress(SyncProgress::Phase {
            phase: SyncPhase::Transferring,
        })
        .await;
        let (transfers, skipped) = self.execute_transfers(source, dest, to_copy).await;
        report.skipped.extend(skipped);
        for result in transfers {
            if result.is_success() {
                report.bytes_transferred += result.bytes;
                report.copy.push(result.path.clone());
            } else {
                report.failed.push(FailedItem {
                    path: result.path.clone(),
                    action: SyncAction::Copy,
                    error: result.error.clone().unwrap_or_default(),
                });
            }
            report.transfers.push(result);
        }

        // 删除
        if !to_delete.is_empty() {
            self.send_progress(SyncProgress::Phase {
                phase: SyncPhase::Deleting,
            })
            .await;
            let (deleted, failed, skipped) = self.execute_deletes(dest, to_delete).await;
            report.delete = deleted;
            report.failed.extend(failed);
            report.skipped.extend(skipped);
        }

        let cancelled = self.is_cancelled();
        Ok(self.finish(report, cancelled).await)
    }

    /// 读取忽略规则并扫描两端
    async fn build_catalogs(
        &self,
        local: &Endpoint,
        source: &Endpoint,
        dest: &Endpoint,
    ) -> Result<(Catalog, Catalog), SyncError> {
        // 忽略规则文件总是从本地根目录读取
        let rules = IgnoreRules::load(
            local.storage.as_ref(),
            &local.root,
            &self.config.ignore_file,
            &self.config.ignore_patterns,
        )
        .await?;
        if !rules.is_empty() {
            debug!("忽略规则: {:?}", rules.patterns());
        }

        let scanner = FileScanner::with_ignore(Arc::new(rules)).with_cancel(self.cancel.clone());

        self.send_progress(SyncProgress::Phase {
            phase: SyncPhase::Cataloging(Side::Source),
        })
        .await;
        let source_catalog = scanner
            .collect_catalog(source.storage.as_ref(), &source.root)
            .await?;

        self.send_progress(SyncProgress::Phase {
            phase: SyncPhase::Cataloging(Side::Destination),
        })
        .await;
        let dest_catalog = match scanner
            .collect_catalog(dest.storage.as_ref(), &dest.root)
            .await
        {
            Ok(catalog) => catalog,
            // 目标目录还不存在：当作空目录
            Err(SyncError::BackendUnavailable { source, .. }) if source.is_not_found() => {
                debug!("目标目录不存在，视为空: {}", dest.name());
                Catalog::new()
            }
            Err(e) => return Err(e),
        };

        Ok((source_catalog, dest_catalog))
    }

    /// 并行执行复制，返回每个文件的结果和因取消未开始的路径
    async fn execute_transfers(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
        paths: Vec<String>,
    ) -> (Vec<TransferResult>, Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers));
        let executor = TransferExecutor::new(TransferOptions::from(&self.config));
        let mut handles: Vec<(String, JoinHandle<TransferResult>)> = Vec::new();
        let mut skipped = Vec::new();

        for path in paths {
            let Some(permit) = self.acquire(&semaphore).await else {
                skipped.push(path);
                continue;
            };

            let source = source.clone();
            let dest = dest.clone();
            let executor = executor.clone();
            let cancel = self.cancel.clone();
            let progress_tx = self.progress_tx.clone();
            let task_path = path.clone();

            let handle = tokio::spawn(async move {
                let result = executor.transfer(&source, &dest, &task_path, &cancel).await;
                send_event(
                    &progress_tx,
                    SyncProgress::ItemFinished {
                        path: task_path,
                        action: SyncAction::Copy,
                        success: result.is_success(),
                        bytes: result.bytes,
                    },
                )
                .await;
                drop(permit);
                result
            });
            handles.push((path, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (path, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    let err = SyncError::TransferFailed {
                        path: path.clone(),
                        attempts: 0,
                        reason: format!("任务异常: {}", e),
                    };
                    error!("{}", err);
                    results.push(TransferResult::failed(&path, 0, &err));
                }
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        skipped.sort();
        (results, skipped)
    }

    /// 并行删除目标上的文件，返回 (成功, 失败, 未开始)
    async fn execute_deletes(
        &self,
        dest: &Endpoint,
        paths: Vec<String>,
    ) -> (Vec<String>, Vec<FailedItem>, Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers));
        let options = TransferOptions::from(&self.config);
        let mut handles: Vec<(String, JoinHandle<Result<(), SyncError>>)> = Vec::new();
        let mut skipped = Vec::new();

        for path in paths {
            let Some(permit) = self.acquire(&semaphore).await else {
                skipped.push(path);
                continue;
            };

            let dest = dest.clone();
            let options = options.clone();
            let cancel = self.cancel.clone();
            let progress_tx = self.progress_tx.clone();
            let task_path = path.clone();

            let handle = tokio::spawn(async move {
                let result = delete_with_retry(&dest, &task_path, &options, &cancel).await;
                send_event(
                    &progress_tx,
                    SyncProgress::ItemFinished {
                        path: task_path,
                        action: SyncAction::Delete,
                        success: result.is_ok(),
                        bytes: 0,
                    },
                )
                .await;
                drop(permit);
                result
            });
            handles.push((path, handle));
        }

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (path, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::DeleteFailed {
                    path: path.clone(),
                    reason: format!("任务异常: {}", e),
                }),
            };
            match outcome {
                Ok(()) => deleted.push(path),
                Err(e) => failed.push(FailedItem {
                    path,
                    action: SyncAction::Delete,
                    error: e.to_string(),
                }),
            }
        }

        deleted.sort();
        skipped.sort();
        (deleted, failed, skipped)
    }

    /// 等待一个并发名额；已取消时返回 `None`，不再派发新任务
    async fn acquire(&self, semaphore: &Arc<Semaphore>) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }

    /// 收尾：排序、记录结束时间、发送完成事件
    async fn finish(&self, mut report: SyncReport, cancelled: bool) -> SyncReport {
        report.copy.sort();
        report.delete.sort();
        report.failed.sort_by(|a, b| a.path.cmp(&b.path));
        report.cancelled = cancelled;
        report.end_time = chrono::Utc::now().timestamp();

        let phase = if cancelled {
            SyncPhase::Cancelled
        } else {
            SyncPhase::Completed
        };
        self.send_progress(SyncProgress::Phase { phase }).await;

        info!(
            "同步任务完成: {} - 复制 {}, 删除 {}, 失败 {}, 跳过 {}{}",
            report.id,
            report.copy.len(),
            report.delete.len(),
            report.failed.len(),
            report.skipped.len(),
            if cancelled { " (已取消)" } else { "" }
        );
        report
    }

    async fn send_progress(&self, progress: SyncProgress) {
        send_event(&self.progress_tx, progress).await;
    }
}

async fn send_event(tx: &Option<mpsc::Sender<SyncProgress>>, progress: SyncProgress) {
    if let Some(tx) = tx {
        let _ = tx.send(progress).await;
    }
}

/// 删除单个文件，失败时按退避重试；文件不存在视为成功
async fn delete_with_retry(
    dest: &Endpoint,
    path: &str,
    options: &TransferOptions,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let key = dest.key(path);
    let mut retry = RetryState::new(options);

    loop {
        let attempt = retry.begin_attempt();
        match dest.storage.delete(&key).await {
            Ok(()) => {
                debug!("已删除: {}", key);
                return Ok(());
            }
            Err(e) => match retry.backoff() {
                Some(delay) => {
                    warn!(
                        "删除失败，{}ms 后重试 ({}/{}): {}: {}",
                        delay.as_millis(),
                        attempt,
                        options.max_attempts,
                        path,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    }
                }
                None => {
                    let err = SyncError::DeleteFailed {
                        path: path.to_string(),
                        reason: e.to_string(),
                    };
                    error!("{}", err);
                    return Err(err);
                }
            },
        }
    }
}

/// 用配置直接同步一个本地目录和一个远程存储
pub async fn sync_folder(
    local_root: &str,
    remote: &StorageConfig,
    mode: SyncDirection,
    delete: bool,
    config: &SyncConfig,
) -> anyhow::Result<SyncReport> {
    config.validate_for(remote)?;
    let local_storage = Arc::new(LocalStorage::new(local_root)?);
    let remote_storage = crate::storage::create_storage(remote).await?;

    let local = Endpoint::new(local_storage, "");
    let remote = Endpoint::new(remote_storage, "");

    let engine = SyncEngine::new(config.clone())?;
    Ok(engine.sync_folder(&local, &remote, mode, delete).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_without_failures_is_complete() {
        let mut report = SyncReport::new(SyncDirection::Push, 0);
        assert!(report.is_complete());

        report.failed.push(FailedItem {
            path: "a".into(),
            action: SyncAction::Delete,
            error: "boom".into(),
        });
        assert_eq!(report.failure_count(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn direction_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&SyncDirection::Pull).unwrap(), "\"pull\"");
        let mode: SyncDirection = serde_json::from_str("\"push\"").unwrap();
        assert_eq!(mode, SyncDirection::Push);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = SyncConfig {
            max_concurrent_transfers: 0,
            ..Default::default()
        };
        assert!(matches!(SyncEngine::new(config), Err(SyncError::Config(_))));
    }
}
