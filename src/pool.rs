use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::Path;

use log::warn;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("非法的 IPv4 地址: {0}")]
    InvalidAddress(String),

    #[error("起始 IP ({start}) 必须小于等于结束 IP ({end})")]
    RangeOrder { start: Ipv4Addr, end: Ipv4Addr },

    #[error("读取 IP 文件 '{path}' 失败: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IP 池为空")]
    Empty,
}

/// 出站源地址池
///
/// 启动时构建一次，之后只读。每次出站连接从池中独立地均匀随机抽取
/// 一个地址，同一地址可能连续出现，不做轮询或公平性保证。
#[derive(Debug)]
pub struct AddressPool {
    addrs: Vec<Ipv4Addr>,
}

impl AddressPool {
    /// 从 [start, end] 闭区间生成地址池，两端都包含
    pub fn from_range(start: &str, end: &str) -> Result<Self, PoolError> {
        let start: Ipv4Addr = start
            .parse()
            .map_err(|_| PoolError::InvalidAddress(start.to_string()))?;
        let end: Ipv4Addr = end
            .parse()
            .map_err(|_| PoolError::InvalidAddress(end.to_string()))?;

        let start_val = u32::from(start);
        let end_val = u32::from(end);
        if start_val > end_val {
            return Err(PoolError::RangeOrder { start, end });
        }

        // 超大范围时限制预分配
        let count = (end_val - start_val) as u64 + 1;
        let mut addrs = Vec::with_capacity(count.min(10_000_000) as usize);

        // 闭区间迭代，end = 255.255.255.255 时不会回绕
        for v in start_val..=end_val {
            addrs.push(Ipv4Addr::from(v));
        }

        if addrs.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self { addrs })
    }

    /// 从文件加载地址池，每行一个 IPv4 地址
    ///
    /// 空行和 # 开头的行跳过；非法行记录警告后继续，不中断加载。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PoolError> {
        let path_str = path.as_ref().display().to_string();
        let file = File::open(path.as_ref()).map_err(|e| PoolError::Source {
            path: path_str.clone(),
            source: e,
        })?;
        let reader = BufReader::new(file);

        let mut addrs = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| PoolError::Source {
                path: path_str.clone(),
                source: e,
            })?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<Ipv4Addr>() {
                Ok(ip) => addrs.push(ip),
                Err(_) => warn!(
                    "忽略文件中的非法 IP 地址: '{}' (文件 {} 第 {} 行)",
                    line,
                    path_str,
                    idx + 1
                ),
            }
        }

        if addrs.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self { addrs })
    }

    /// 均匀随机抽取一个源地址
    ///
    /// 构造函数保证池非空，空池抽取属于调用方的编程错误，直接 panic。
    pub fn select(&self) -> Ipv4Addr {
        let idx = rand::thread_rng().gen_range(0..self.addrs.len());
        self.addrs[idx]
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }
}
