//! GPS Relay CLI
//!
//! 命令行前端：扫描外设、连接并实时打印定位记录

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use gpsrelay_core::ble::fake::FakeTransport;
use gpsrelay_core::{
    BtleplugTransport, LogLevel, Relay, RelaySettings, ScanEvent, SessionEvent, Transport,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpsrelay", version, about = "BLE GPS relay")]
struct Cli {
    /// 配置文件路径 (默认: <config_dir>/gpsrelay/settings.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别 (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 连接设备并接收定位
    Connect {
        /// 设备地址
        address: String,
        /// 每条定位输出一行 JSON
        #[arg(long)]
        json: bool,
    },
    /// 使用合成设备演示完整流程
    Demo {
        #[arg(long)]
        json: bool,
    },
    /// 查看或初始化配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前生效的配置
    Show,
    /// 写入默认配置
    Init {
        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => RelaySettings::load_from(path)?,
        None => RelaySettings::load(),
    };
    init_logging(cli.log_level.unwrap_or(settings.log_level));

    match cli.command {
        Commands::Scan { timeout } => {
            let relay = Relay::from_settings(Arc::new(open_radio().await?), &settings)?;
            let timeout = timeout.map_or(settings.scan_timeout(), Duration::from_secs);
            scan(&relay, timeout).await?;
        }
        Commands::Connect { address, json } => {
            let relay = Relay::from_settings(Arc::new(open_radio().await?), &settings)?;
            stream_fixes(&relay, &address, json, None).await?;
        }
        Commands::Demo { json } => {
            let transport = Arc::new(FakeTransport::with_sample_data());
            let relay = Relay::from_settings(transport, &settings)?;
            let devices = scan(&relay, Duration::from_millis(500)).await?;
            let Some(first) = devices.first() else {
                bail!("Demo device did not advertise");
            };
            stream_fixes(&relay, first, json, Some(Duration::from_secs(1))).await?;
        }
        Commands::Config { action } => {
            let path = cli.config.unwrap_or_else(RelaySettings::config_path);
            match action {
                ConfigAction::Show => {
                    println!("# {}", path.display());
                    print!("{}", settings.to_toml()?);
                }
                ConfigAction::Init { force } => {
                    if path.exists() && !force {
                        bail!("{} already exists (use --force to overwrite)", path.display());
                    }
                    RelaySettings::default().save_to(&path)?;
                    println!("Wrote {}", path.display());
                }
            }
        }
    }

    Ok(())
}

/// 初始化日志，`RUST_LOG` 优先
fn init_logging(level: LogLevel) {
    // 桥接 log crate（gpsrelay-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

async fn open_radio() -> Result<BtleplugTransport> {
    BtleplugTransport::new()
        .await
        .context("Failed to open Bluetooth adapter")
}

/// 扫描并打印设备，返回发现的地址
async fn scan<T: Transport>(relay: &Relay<T>, timeout: Duration) -> Result<Vec<String>> {
    println!("Scanning for {}s...", timeout.as_secs_f32());
    let mut stream = relay.start_scan_for(timeout).await?;
    let mut found = Vec::new();

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(ScanEvent::Discovered(handle)) => {
                    let rssi = handle
                        .rssi
                        .map(|r| format!(" {} dBm", r))
                        .unwrap_or_default();
                    println!(
                        "  [{}] {} ({}){}",
                        found.len(),
                        handle.display_name(),
                        handle.address,
                        rssi
                    );
                    found.push(handle.address);
                }
                Some(ScanEvent::Stopped(reason)) => {
                    tracing::debug!("Scan stopped: {:?}", reason);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                relay.stop_scan().await;
            }
        }
    }

    if found.is_empty() {
        println!("  No devices found");
    }
    Ok(found)
}

/// 连接并打印事件，直到会话结束、Ctrl-C 或空闲超时
async fn stream_fixes<T: Transport>(
    relay: &Relay<T>,
    address: &str,
    json: bool,
    idle: Option<Duration>,
) -> Result<()> {
    let mut events = relay.subscribe();
    relay.connect(address).await?;

    loop {
        let next = async {
            match idle {
                Some(limit) => tokio::time::timeout(limit, events.recv()).await.ok(),
                None => Some(events.recv().await),
            }
        };

        tokio::select! {
            event = next => {
                let Some(Some(event)) = event else {
                    tracing::info!("No data, closing session");
                    relay.close().await;
                    break;
                };
                print_event(&event, json)?;
                match event {
                    SessionEvent::Disconnected => break,
                    SessionEvent::Error(e) if e.is_fatal() => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing session");
                relay.close().await;
                break;
            }
        }
    }

    let state = relay.wait_until_finished().await;
    tracing::debug!("Session finished in state {}", state);
    relay.close().await;
    Ok(())
}

fn print_event(event: &SessionEvent, json: bool) -> Result<()> {
    match (event, json) {
        (SessionEvent::FixReceived(fix), true) => println!("{}", serde_json::to_string(fix)?),
        (SessionEvent::DataReceived(_), true) => {}
        (SessionEvent::DataReceived(_), false) => {
            println!("  > {}", event.display_text().trim_end());
        }
        (_, true) => eprintln!("{}", event.display_text()),
        (_, false) => println!("{}", event.display_text()),
    }
    Ok(())
}
