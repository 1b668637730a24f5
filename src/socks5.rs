use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use log::{error, info, warn};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::dialer::{DialError, RotatingDialer};

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTHENTICATION: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;
const CONNECT_COMMAND: u8 = 0x01;
const IPV4_ADDRESS: u8 = 0x01;
const DOMAIN_NAME: u8 = 0x03;
const IPV6_ADDRESS: u8 = 0x04;

// 回复状态码
const SUCCESS: u8 = 0x00;
const GENERAL_FAILURE: u8 = 0x01;
const NETWORK_UNREACHABLE: u8 = 0x03;
const HOST_UNREACHABLE: u8 = 0x04;
const CONNECTION_REFUSED: u8 = 0x05;
const COMMAND_NOT_SUPPORTED: u8 = 0x07;
const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 入站服务，所有出站连接都经过拨号器
///
/// 每个客户端连接一个任务，单个连接出错不影响其他连接。
pub async fn serve(listener: TcpListener, dialer: Arc<RotatingDialer>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                info!("新连接来自: {}", addr);
                let dialer = Arc::clone(&dialer);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, dialer).await {
                        error!("处理连接时出错: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("接受连接时出错: {}", e);
            }
        }
    }
}

async fn handle_connection(mut client: TcpStream, dialer: Arc<RotatingDialer>) -> Result<()> {
    // 处理握手
    handle_handshake(&mut client).await?;

    // 解析请求，得到 host:port 形式的目标地址
    let target_addr = handle_request(&mut client).await?;

    // 通过轮换源地址的拨号器连接目标
    let target = match dialer.dial_tcp(&target_addr).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("出站拨号失败: target={} error={}", target_addr, e);
            send_reply(&mut client, reply_code(&e), None).await?;
            return Err(e.into());
        }
    };

    // 成功回复携带实际使用的出站本地地址
    let local_addr = target.local_addr().ok();
    send_reply(&mut client, SUCCESS, local_addr).await?;

    // 开始转发数据
    forward_data(client, target).await?;

    Ok(())
}

async fn handle_handshake(client: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await?;

    let version = buf[0];
    let nmethods = buf[1];

    if version != SOCKS_VERSION {
        return Err(anyhow!("不支持的SOCKS版本: {}", version));
    }

    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods).await?;

    // 检查是否支持无认证方法
    if !methods.contains(&NO_AUTHENTICATION) {
        let response = [SOCKS_VERSION, NO_ACCEPTABLE_METHOD];
        client.write_all(&response).await?;
        return Err(anyhow!("客户端不支持无认证方法"));
    }

    // 发送选择无认证方法的响应
    let response = [SOCKS_VERSION, NO_AUTHENTICATION];
    client.write_all(&response).await?;

    Ok(())
}

async fn handle_request(client: &mut TcpStream) -> Result<String> {
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await?;

    let version = buf[0];
    let command = buf[1];
    let _reserved = buf[2];
    let address_type = buf[3];

    if version != SOCKS_VERSION {
        return Err(anyhow!("不支持的SOCKS版本: {}", version));
    }

    if command != CONNECT_COMMAND {
        send_reply(client, COMMAND_NOT_SUPPORTED, None).await?;
        return Err(anyhow!("不支持的命令: {}", command));
    }

    let target_addr = match address_type {
        IPV4_ADDRESS => {
            let mut addr_buf = [0u8; 4];
            client.read_exact(&mut addr_buf).await?;
            let ip = Ipv4Addr::from(addr_buf);
            let port = read_port(client).await?;
            format!("{}:{}", ip, port)
        }
        DOMAIN_NAME => {
            let mut len_buf = [0u8; 1];
            client.read_exact(&mut len_buf).await?;
            let mut domain_buf = vec![0u8; len_buf[0] as usize];
            client.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf)?;
            let port = read_port(client).await?;

            // 域名不在这里解析，交给拨号器
            format!("{}:{}", domain, port)
        }
        IPV6_ADDRESS => {
            let mut addr_buf = [0u8; 16];
            client.read_exact(&mut addr_buf).await?;
            let ip = Ipv6Addr::from(addr_buf);
            let port = read_port(client).await?;
            format!("[{}]:{}", ip, port)
        }
        _ => {
            send_reply(client, ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
            return Err(anyhow!("不支持的地址类型: {}", address_type));
        }
    };

    info!("目标地址: {}", target_addr);
    Ok(target_addr)
}

async fn read_port(client: &mut TcpStream) -> Result<u16> {
    let mut port_buf = [0u8; 2];
    client.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}

/// 把拨号错误映射为 SOCKS5 回复状态码
fn reply_code(err: &DialError) -> u8 {
    match err {
        DialError::InvalidTarget(_) => HOST_UNREACHABLE,
        DialError::Timeout(_) => HOST_UNREACHABLE,
        DialError::Connect { source, .. } => match source.kind() {
            std::io::ErrorKind::ConnectionRefused => CONNECTION_REFUSED,
            std::io::ErrorKind::NetworkUnreachable => NETWORK_UNREACHABLE,
            std::io::ErrorKind::HostUnreachable => HOST_UNREACHABLE,
            _ => GENERAL_FAILURE,
        },
        _ => GENERAL_FAILURE,
    }
}

/// 发送 SOCKS5 回复，成功时 bound 为出站连接的本地地址
async fn send_reply(client: &mut TcpStream, code: u8, bound: Option<SocketAddr>) -> Result<()> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(code);
    buf.put_u8(0x00); // 保留字段
    match bound {
        Some(SocketAddr::V4(addr)) => {
            buf.put_u8(IPV4_ADDRESS);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.put_u8(IPV6_ADDRESS);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        None => {
            buf.put_u8(IPV4_ADDRESS);
            buf.put_slice(&[0, 0, 0, 0]);
            buf.put_u16(0);
        }
    }
    client.write_all(&buf).await?;
    Ok(())
}

async fn forward_data(mut client: TcpStream, mut target: TcpStream) -> Result<()> {
    let (mut client_read, mut client_write) = client.split();
    let (mut target_read, mut target_write) = target.split();

    let client_to_target = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if target_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    };

    let target_to_client = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match target_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_target => info!("客户端到目标的数据传输完成"),
        _ = target_to_client => info!("目标到客户端的数据传输完成"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AddressPool;
    use std::net::IpAddr;

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_relay(start: &str, end: &str) -> SocketAddr {
        let pool = Arc::new(AddressPool::from_range(start, end).unwrap());
        let dialer = Arc::new(RotatingDialer::new(pool));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve(listener, dialer).await;
        });
        addr
    }

    async fn handshake(client: &mut TcpStream) {
        client
            .write_all(&[SOCKS_VERSION, 1, NO_AUTHENTICATION])
            .await
            .unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [SOCKS_VERSION, NO_AUTHENTICATION]);
    }

    fn connect_request(target: SocketAddr) -> Vec<u8> {
        let IpAddr::V4(v4) = target.ip() else {
            panic!("测试目标必须是 IPv4");
        };
        let mut req = vec![SOCKS_VERSION, CONNECT_COMMAND, 0x00, IPV4_ADDRESS];
        req.extend_from_slice(&v4.octets());
        req.extend_from_slice(&target.port().to_be_bytes());
        req
    }

    #[tokio::test]
    async fn test_connect_roundtrip_with_rotated_source() {
        let echo = spawn_echo().await;
        let relay = spawn_relay("127.0.3.1", "127.0.3.3").await;

        let mut client = TcpStream::connect(relay).await.unwrap();
        handshake(&mut client).await;

        client.write_all(&connect_request(echo)).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SOCKS_VERSION);
        assert_eq!(reply[1], SUCCESS);
        assert_eq!(reply[3], IPV4_ADDRESS);

        // 回复携带的出站本地地址必须落在配置的池内
        let bound = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
        let low = u32::from(Ipv4Addr::new(127, 0, 3, 1));
        let high = u32::from(Ipv4Addr::new(127, 0, 3, 3));
        assert!(
            (low..=high).contains(&u32::from(bound)),
            "出站地址 {} 不在池内",
            bound
        );

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let relay = spawn_relay("127.0.0.1", "127.0.0.1").await;

        // 绑定后立刻释放，目标端口处于关闭状态
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            addr
        };

        let mut client = TcpStream::connect(relay).await.unwrap();
        handshake(&mut client).await;

        client.write_all(&connect_request(closed)).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], CONNECTION_REFUSED);
    }

    #[tokio::test]
    async fn test_unsupported_command_reply() {
        let relay = spawn_relay("127.0.0.1", "127.0.0.1").await;

        let mut client = TcpStream::connect(relay).await.unwrap();
        handshake(&mut client).await;

        // BIND 命令不支持
        let mut req = vec![SOCKS_VERSION, 0x02, 0x00, IPV4_ADDRESS];
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_handshake_rejects_auth_only_client() {
        let relay = spawn_relay("127.0.0.1", "127.0.0.1").await;

        let mut client = TcpStream::connect(relay).await.unwrap();
        // 只提供用户名密码认证方法
        client.write_all(&[SOCKS_VERSION, 1, 0x02]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [SOCKS_VERSION, NO_ACCEPTABLE_METHOD]);
    }
}
