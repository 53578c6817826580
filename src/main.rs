use bucketsync::config::{config_dir, JobConfig, SyncConfig};
use bucketsync::logging::{init_logging, LogConfig};
use bucketsync::storage::{create_storage, Endpoint, LocalStorage};
use bucketsync::SyncEngine;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

async fn run(job_path: PathBuf) -> anyhow::Result<bool> {
    let config_dir = config_dir();
    let job = JobConfig::load(&job_path)?;
    let config = SyncConfig::load(&config_dir);
    config.validate_for(&job.remote)?;

    let local = Endpoint::new(Arc::new(LocalStorage::new(&job.local_path)?), "");
    let remote = Endpoint::new(create_storage(&job.remote).await?, "");

    let engine = SyncEngine::new(config)?;

    // Ctrl-C 取消同步，已开始的分片上传会被放弃
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，正在取消同步");
            cancel.cancel();
        }
    });

    let report = engine
        .sync_folder(&local, &remote, job.mode, job.delete)
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.is_complete())
}

#[tokio::main]
async fn main() -> ExitCode {
    let Some(job_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: bucketsync <job.json>");
        return ExitCode::from(2);
    };

    let config_dir = config_dir();
    init_logging(&config_dir.join("logs"), &LogConfig::load(&config_dir));

    match run(job_path).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("同步失败: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
