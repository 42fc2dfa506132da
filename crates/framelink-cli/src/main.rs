//! Framelink CLI
//!
//! 命令行客户端，直接驱动 framelink-core 与眼镜通信

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use framelink_core::{
    BtleplugConnector, CommandChannel, Connection, Connector, DfuClient, LinkSettings, LinkState,
    ScriptOptions,
};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "framelink", version, about = "Frame 眼镜 BLE 调试工具")]
struct Cli {
    /// 转发外设的 debug print
    #[arg(long, global = true)]
    debug_print: bool,

    /// 协商后的 ATT MTU（btleplug 无法查询时手动指定）
    #[arg(long, global = true)]
    mtu: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 执行脚本并打印结果
    Run {
        /// 脚本文本，或配合 --file 使用的脚本路径
        script: String,
        /// 从文件读取脚本
        #[arg(short, long)]
        file: bool,
        /// 只等待执行确认，不等待打印输出
        #[arg(long)]
        no_output: bool,
        /// 响应超时 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 查看电量
    Battery,
    /// 上传文件到眼镜
    PushFile {
        local: PathBuf,
        remote: String,
        /// 使用二进制数据帧写入
        #[arg(long)]
        binary: bool,
    },
    /// 从眼镜下载文件
    PullFile { remote: String, local: PathBuf },
    /// 查看当前设置，--init 时写入默认配置文件
    Config {
        #[arg(long)]
        init: bool,
    },
    /// 固件更新
    Dfu {
        /// init packet (.dat)
        init: PathBuf,
        /// 固件镜像 (.bin)
        image: PathBuf,
    },
}

/// 初始化日志系统
///
/// 默认只显示 info 及以上级别，RUST_LOG 可覆盖
fn init_logging() {
    // 桥接 log crate（framelink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,framelink_core=debug"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}

async fn open_channel(
    settings: LinkSettings,
    debug_print: bool,
    mtu: Option<usize>,
) -> Result<CommandChannel> {
    let mut connector = BtleplugConnector::new(settings.name_allow_list.clone()).await?;
    if let Some(mtu) = mtu {
        connector = connector.with_mtu(mtu);
    }
    let conn = Arc::new(Connection::new(Arc::new(connector), settings));
    let channel = CommandChannel::new(conn);
    channel.set_print_debug(debug_print);
    Ok(channel)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = LinkSettings::load();
    debug!("Settings loaded from {:?}", LinkSettings::config_path());

    match cli.command {
        Commands::Scan { timeout, json } => {
            let connector = BtleplugConnector::new(settings.name_allow_list.clone()).await?;
            let devices = connector.scan(Duration::from_secs(timeout)).await?;
            if json {
                let list: Vec<_> = devices
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "id": d.id,
                            "name": d.name,
                            "rssi": d.rssi,
                            "dfu": d.profile == framelink_core::Profile::Dfu,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if devices.is_empty() {
                println!("   未发现设备");
            } else {
                for (i, d) in devices.iter().enumerate() {
                    println!("   [{}] {} ({}, rssi={:?}, {:?})", i, d.name, d.id, d.rssi, d.profile);
                }
            }
        }
        Commands::Run {
            script,
            file,
            no_output,
            timeout,
        } => {
            let code = if file {
                std::fs::read_to_string(&script)
                    .with_context(|| format!("Failed to read script {script}"))?
            } else {
                script
            };
            let mut opts = if no_output {
                ScriptOptions::checked()
            } else {
                ScriptOptions::printed()
            };
            if let Some(secs) = timeout {
                opts = opts.with_timeout(Duration::from_secs(secs));
            }

            let channel = open_channel(settings, cli.debug_print, cli.mtu).await?;
            channel.ensure_connected().await?;
            match channel.run_script(&code, opts).await? {
                Some(output) => println!("{output}"),
                None => println!("✅ 已执行"),
            }
            channel.disconnect().await?;
        }
        Commands::Battery => {
            let channel = open_channel(settings, cli.debug_print, cli.mtu).await?;
            channel.ensure_connected().await?;
            println!("🔋 {}%", channel.battery_level().await?);
            channel.disconnect().await?;
        }
        Commands::PushFile {
            local,
            remote,
            binary,
        } => {
            let data = std::fs::read(&local)
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let channel = open_channel(settings, cli.debug_print, cli.mtu).await?;
            channel.ensure_connected().await?;
            println!("📤 上传 {} -> {} ({} 字节)", local.display(), remote, data.len());
            if binary {
                channel.files().write_file_binary(&remote, &data).await?;
            } else {
                channel.files().write_file(&remote, &data).await?;
            }
            println!("✅ 完成");
            channel.disconnect().await?;
        }
        Commands::PullFile { remote, local } => {
            let channel = open_channel(settings, cli.debug_print, cli.mtu).await?;
            channel.ensure_connected().await?;
            let data = channel.files().read_file(&remote).await?;
            std::fs::write(&local, &data)
                .with_context(|| format!("Failed to write {}", local.display()))?;
            println!("📥 {} -> {} ({} 字节)", remote, local.display(), data.len());
            channel.disconnect().await?;
        }
        Commands::Config { init } => {
            if init {
                settings.save()?;
                println!("💾 已写入 {}", LinkSettings::config_path().display());
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Dfu { init, image } => {
            let init = std::fs::read(&init)
                .with_context(|| format!("Failed to read {}", init.display()))?;
            let image = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let connect_timeout = settings.connect_timeout;
            let channel = open_channel(settings, cli.debug_print, cli.mtu).await?;

            if !channel.connect(connect_timeout).await? {
                bail!("未发现设备");
            }
            if channel.connection().state() == LinkState::Connected {
                info!("Device is in application mode, switching to DFU");
                channel.enter_dfu_mode(connect_timeout).await?;
            }

            println!("⬆️  固件更新: init {} 字节, image {} 字节", init.len(), image.len());
            DfuClient::new(channel.connection().clone())
                .update_firmware_with_progress(&init, &image, |p| {
                    println!(
                        "   {:?}: {:.1}%",
                        p.object,
                        p.sent as f64 * 100.0 / p.total.max(1) as f64
                    );
                })
                .await?;
            println!("✅ 固件更新完成");
        }
    }

    Ok(())
}
