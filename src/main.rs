use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use compute_core::{AppConfig, BrokerMode};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("compute")
        .version("1.0.0")
        .about("分布式机器学习计算Worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式 (worker: RabbitMQ消费; embedded: 内存队列本地联调)")
                .value_parser(["worker", "embedded"])
                .default_value("worker"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker标识，默认取主机名"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode = matches.get_one::<String>("mode").unwrap();
    let worker_id = matches.get_one::<String>("worker-id");
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    init_logging(log_level, log_format)?;

    info!("启动分布式计算Worker");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    // 配置是一次构造的不可变快照
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;

    if *mode == "embedded" {
        config.broker.mode = BrokerMode::Memory;
    }
    if let Some(id) = worker_id {
        config.worker.worker_id = id.clone();
    }
    if config.worker.worker_id.is_empty() {
        config.worker.worker_id = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "compute-worker".to_string());
    }

    info!("Worker ID: {}", config.worker.worker_id);
    info!(
        "主题: {} (并发{}) / {} (并发{})",
        config.broker.learn_topic,
        config.broker.learn_parallelism,
        config.broker.predict_topic,
        config.broker.predict_parallelism
    );

    // 创建应用实例
    let app = Application::new(config).await?;

    // 优雅关闭管理
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("Worker运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;

    info!("收到关闭信号，停止领取新任务...");
    shutdown_manager.shutdown();

    // 在途任务给30秒自然结束
    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!("Worker关闭时发生错误: {e}");
            } else {
                info!("Worker已优雅关闭");
            }
        }
        Err(_) => {
            warn!("Worker关闭超时，强制退出");
        }
    }

    info!("分布式计算Worker已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
