use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::pool::AddressPool;

/// 单次出站连接的最长建连时间
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 出站网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl std::str::FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(DialError::InvalidTarget(format!("未知的网络类型: {}", other))),
        }
    }
}

/// 一次拨号的产物：TCP 流或已 connect 的 UDP socket
#[derive(Debug)]
pub enum Outbound {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("非法的目标地址: {0}")]
    InvalidTarget(String),

    #[error("创建出站 socket 失败: {0}")]
    Socket(#[source] io::Error),

    #[error("设置 IP_FREEBIND 失败: {0}")]
    SocketOption(#[source] io::Error),

    #[error("绑定源地址 {local} 失败: {source}")]
    Bind {
        local: SocketAddr,
        source: io::Error,
    },

    #[error("连接 {0} 超时")]
    Timeout(SocketAddr),

    #[error("连接 {target} 失败: {source}")]
    Connect {
        target: SocketAddr,
        source: io::Error,
    },
}

/// 带源地址轮换的出站拨号器
///
/// 每次拨号从地址池随机抽取一个源地址，设置 IP_FREEBIND 后绑定建连，
/// 出站连接的本地端点因此在整个池上轮换。拨号失败不重试，由调用方
/// 决定是否换地址再试。
pub struct RotatingDialer {
    pool: Arc<AddressPool>,
}

impl RotatingDialer {
    pub fn new(pool: Arc<AddressPool>) -> Self {
        Self { pool }
    }

    /// 按网络类型拨号
    pub async fn dial(&self, network: Network, target: &str) -> Result<Outbound, DialError> {
        match network {
            Network::Tcp => self.dial_tcp(target).await.map(Outbound::Tcp),
            Network::Udp => self.dial_udp(target).await.map(Outbound::Udp),
        }
    }

    /// 以随机源地址建立 TCP 连接
    ///
    /// 调用方 drop 掉返回的 future 即中止建连并释放 socket。
    pub async fn dial_tcp(&self, target: &str) -> Result<TcpStream, DialError> {
        let remote = resolve_ipv4(target).await?;
        let source = self.pool.select();
        debug!("出站拨号: network=tcp target={} source={}", remote, source);

        let socket = rotated_socket(Type::STREAM, Some(Protocol::TCP), source)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        let stream = match tokio::time::timeout(DIAL_TIMEOUT, socket.connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(
                    "出站连接失败: target={} source={} error={}",
                    remote, source, e
                );
                return Err(DialError::Connect {
                    target: remote,
                    source: e,
                });
            }
            Err(_) => {
                warn!("出站连接超时: target={} source={}", remote, source);
                return Err(DialError::Timeout(remote));
            }
        };

        match stream.local_addr() {
            Ok(local) => info!("出站连接建立: target={} local={}", remote, local),
            Err(_) => info!("出站连接建立: target={}", remote),
        }
        Ok(stream)
    }

    /// 以随机源地址创建并 connect 一个 UDP socket
    pub async fn dial_udp(&self, target: &str) -> Result<UdpSocket, DialError> {
        let remote = resolve_ipv4(target).await?;
        let source = self.pool.select();
        debug!("出站拨号: network=udp target={} source={}", remote, source);

        let socket = rotated_socket(Type::DGRAM, Some(Protocol::UDP), source)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(DialError::Socket)?;
        socket.connect(remote).await.map_err(|e| DialError::Connect {
            target: remote,
            source: e,
        })?;

        if let Ok(local) = socket.local_addr() {
            info!("出站 UDP socket 就绪: target={} local={}", remote, local);
        }
        Ok(socket)
    }
}

/// 解析目标地址，出站只走 IPv4
async fn resolve_ipv4(target: &str) -> Result<SocketAddr, DialError> {
    let mut addrs = tokio::net::lookup_host(target)
        .await
        .map_err(|e| DialError::InvalidTarget(format!("{}: {}", target, e)))?;
    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| DialError::InvalidTarget(format!("{} 没有可用的 IPv4 地址", target)))
}

/// 创建绑定到指定源地址的出站 socket
///
/// IP_FREEBIND 允许绑定未配置在本机网卡上的地址，必须在 bind 前设置。
/// 设置失败直接报错，绝不回退到默认源地址，否则会暴露本机的固定出口。
fn rotated_socket(ty: Type, protocol: Option<Protocol>, source: Ipv4Addr) -> Result<Socket, DialError> {
    let socket = Socket::new(Domain::IPV4, ty, protocol).map_err(DialError::Socket)?;
    set_free_bind(&socket).map_err(DialError::SocketOption)?;
    socket.set_nonblocking(true).map_err(DialError::Socket)?;

    let local = SocketAddr::new(IpAddr::V4(source), 0);
    socket
        .bind(&local.into())
        .map_err(|e| DialError::Bind { local, source: e })?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_free_bind(socket: &Socket) -> io::Result<()> {
    socket.set_freebind(true)
}

// 其他平台没有 IP_FREEBIND，直接报不支持
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_free_bind(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_FREEBIND 仅在 Linux 上可用",
    ))
}
