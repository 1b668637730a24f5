use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;

mod dialer;
mod pool;
mod socks5;

use dialer::RotatingDialer;
use pool::AddressPool;

#[derive(Parser)]
#[command(name = "socks5-rotate")]
#[command(about = "SOCKS5 proxy that rotates outbound source addresses")]
struct Args {
    /// Start IP of the range (e.g., 10.1.0.0)
    #[arg(long)]
    start: Option<String>,

    /// End IP of the range (e.g., 10.100.255.255)
    #[arg(long)]
    end: Option<String>,

    /// File containing a list of IP addresses (one per line)
    #[arg(long, conflicts_with_all = ["start", "end"])]
    file: Option<String>,

    /// Port on which the SOCKS5 proxy will listen
    #[arg(long, default_value_t = 1080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    // 构建地址池，配置错误直接退出，不进入监听
    let pool = match (&args.file, &args.start, &args.end) {
        (Some(file), None, None) => {
            let pool = AddressPool::from_file(file)?;
            info!("从文件 {} 加载了 {} 个 IP", file, pool.len());
            pool
        }
        (None, Some(start), Some(end)) => {
            let pool = AddressPool::from_range(start, end)?;
            info!("使用 IP 范围 {} - {}，共 {} 个 IP", start, end, pool.len());
            pool
        }
        _ => {
            return Err(anyhow!(
                "参数错误: 需要 --start 和 --end 指定 IP 范围，或 --file 指定 IP 列表文件"
            ));
        }
    };

    let dialer = Arc::new(RotatingDialer::new(Arc::new(pool)));

    let listen_addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("SOCKS5 代理服务器启动在 {}", listen_addr);

    socks5::serve(listener, dialer).await
}
