//! 按 IP 的连接准入控制
//!
//! 限制单个远端地址的并发连接数，防止单一客户端耗尽服务器资源

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// 默认单 IP 最大并发连接数
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 50;

/// 从远端地址提取准入键（仅 IP，去掉端口）
///
/// 每个连接的临时端口都不同，带端口的键会让单 IP 限制失效
pub fn admission_key(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

/// 连接准入控制器
///
/// 维护 地址 -> 活跃连接数 的映射，所有修改都在同一把锁内完成
#[derive(Debug)]
pub struct AdmissionController {
    /// 地址 -> 活跃连接数
    connections: Mutex<HashMap<String, usize>>,
    /// 单地址上限
    max_per_ip: usize,
}

/// 单个地址的准入快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionEntry {
    pub address: String,
    pub connections: usize,
}

impl AdmissionController {
    /// 创建新的准入控制器
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_per_ip,
        }
    }

    /// 使用默认上限创建
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_IP)
    }

    /// 检查并占用一个连接名额
    ///
    /// 检查与递增在同一个临界区内完成；已达上限时返回 false 且不修改状态
    pub fn check_limit(&self, address: &str) -> bool {
        let mut connections = self.connections.lock();
        let current = connections.get(address).copied().unwrap_or(0);
        if current >= self.max_per_ip {
            tracing::warn!(
                "[ADMISSION] 连接数已达上限: address={} current={} max={}",
                address,
                current,
                self.max_per_ip
            );
            return false;
        }
        connections.insert(address.to_string(), current + 1);
        true
    }

    /// 释放一个连接名额，计数归零时删除条目
    pub fn release(&self, address: &str) {
        let mut connections = self.connections.lock();
        let remaining = match connections.get_mut(address) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                tracing::debug!("[ADMISSION] 释放未登记的地址: {}", address);
                return;
            }
        };
        if remaining == 0 {
            connections.remove(address);
        }
    }

    /// 获取某地址当前的连接数
    pub fn connection_count(&self, address: &str) -> usize {
        self.connections.lock().get(address).copied().unwrap_or(0)
    }

    /// 当前登记的地址数
    pub fn tracked_addresses(&self) -> usize {
        self.connections.lock().len()
    }

    /// 所有地址的连接数（诊断用）
    pub fn snapshot(&self) -> Vec<AdmissionEntry> {
        let mut entries: Vec<AdmissionEntry> = self
            .connections
            .lock()
            .iter()
            .map(|(address, count)| AdmissionEntry {
                address: address.clone(),
                connections: *count,
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    /// 单地址上限
    pub fn max_per_ip(&self) -> usize {
        self.max_per_ip
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::with_defaults()
    }
}
