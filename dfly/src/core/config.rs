use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

// ===========================================================================
// 写死的配置值，一般也不会改的
// ===========================================================================

/// 进度 channel 大小
pub const CHANNEL_BUFFER: usize = 100;

/// 取消任务时，给 LeaveTask 上报留的时间
pub const LEAVE_TASK_TIMEOUT: Duration = Duration::from_secs(2);

/// 调度重连的退避基数
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// 存储策略
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum StoreStrategy {
    /// 数据落在 dataDir 下，Store 时拷贝到目标路径
    #[default]
    Simple,

    /// 数据直接写在目标目录下的 .cache 文件里，Store 时改名落位。
    /// dataDir 下保留（硬/软）链接，便于 GC 和重载找到它
    Advance,
}

#[derive(Clone, Default)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Serialize, Deserialize)]
pub struct ConfigInner {
    /// 本机对外通告的 ip
    peer_ip: String,

    /// peer server 监听地址
    peer_server_addr: SocketAddr,

    /// 调度器副本地址
    scheduler_addrs: Vec<SocketAddr>,

    /// 任务存储根目录
    data_dir: PathBuf,

    /// 存储策略
    store_strategy: StoreStrategy,

    /// 任务闲置多久可以回收
    task_expire_time: Duration,

    /// GC 扫描间隔
    gc_interval: Duration,

    /// 未回收任务占用的磁盘配额，超出触发按最久未访问回收。0 表示不启用
    disk_gc_threshold: u64,

    /// 磁盘使用率阈值（百分比），超出触发回收。0 表示不启用
    disk_gc_threshold_percent: f64,

    /// 等下一个调度包的超时
    schedule_timeout: Duration,

    /// 单个分片下载超时
    piece_download_timeout: Duration,

    /// 一元 rpc 超时
    rpc_timeout: Duration,

    /// 调度流断开后最多重连几次
    scheduler_reconnect_limit: usize,

    /// 进程级限速（字节/秒），0 不限速
    total_rate_limit: u64,

    /// 带 Range 的请求是否顺带预取整个对象
    enable_prefetch: bool,

    /// 向对端一次最多询问多少个分片
    piece_task_window: u32,

    /// 还没拿到调度包时的并发度兜底
    default_parallel_count: usize,
}

impl Default for ConfigInner {
    fn default() -> Self {
        Self {
            peer_ip: "127.0.0.1".to_string(),
            peer_server_addr: "0.0.0.0:65001".parse().unwrap(),
            scheduler_addrs: vec!["127.0.0.1:8002".parse().unwrap()],
            data_dir: PathBuf::from("./storage/data/"),
            store_strategy: StoreStrategy::Simple,
            task_expire_time: Duration::from_secs(6 * 60 * 60),
            gc_interval: Duration::from_secs(60),
            disk_gc_threshold: 0,
            disk_gc_threshold_percent: 95.0,
            schedule_timeout: Duration::from_secs(10),
            piece_download_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(5),
            scheduler_reconnect_limit: 5,
            total_rate_limit: 0,
            enable_prefetch: false,
            piece_task_window: 16,
            default_parallel_count: 4,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inner(inner: ConfigInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// 从 JSON 文件加载，文件不存在时用默认值
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let data = std::fs::read(path)
                    .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
                let inner: ConfigInner = serde_json::from_slice(&data)
                    .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
                Ok(Self::from_inner(inner))
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn set_peer_ip(mut self, ip: String) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.peer_ip = ip;
        }
        self
    }

    pub fn set_peer_server_addr(mut self, addr: SocketAddr) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.peer_server_addr = addr;
        }
        self
    }

    pub fn set_scheduler_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.scheduler_addrs = addrs;
        }
        self
    }

    pub fn set_data_dir(mut self, dir: PathBuf) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.data_dir = dir;
        }
        self
    }

    pub fn set_store_strategy(mut self, strategy: StoreStrategy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.store_strategy = strategy;
        }
        self
    }

    pub fn set_task_expire_time(mut self, expire: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.task_expire_time = expire;
        }
        self
    }

    pub fn set_gc_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.gc_interval = interval;
        }
        self
    }

    pub fn set_disk_gc_threshold(mut self, threshold: u64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.disk_gc_threshold = threshold;
        }
        self
    }

    pub fn set_disk_gc_threshold_percent(mut self, percent: f64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.disk_gc_threshold_percent = percent;
        }
        self
    }

    pub fn set_schedule_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.schedule_timeout = timeout;
        }
        self
    }

    pub fn set_piece_download_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.piece_download_timeout = timeout;
        }
        self
    }

    pub fn set_rpc_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.rpc_timeout = timeout;
        }
        self
    }

    pub fn set_scheduler_reconnect_limit(mut self, limit: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.scheduler_reconnect_limit = limit;
        }
        self
    }

    pub fn set_total_rate_limit(mut self, limit: u64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.total_rate_limit = limit;
        }
        self
    }

    pub fn set_enable_prefetch(mut self, enable: bool) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.enable_prefetch = enable;
        }
        self
    }

    pub fn set_piece_task_window(mut self, window: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.piece_task_window = window;
        }
        self
    }

    pub fn set_default_parallel_count(mut self, count: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.default_parallel_count = count;
        }
        self
    }

    pub fn peer_ip(&self) -> &str {
        &self.inner.peer_ip
    }

    pub fn peer_server_addr(&self) -> SocketAddr {
        self.inner.peer_server_addr
    }

    pub fn scheduler_addrs(&self) -> &[SocketAddr] {
        &self.inner.scheduler_addrs
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.inner.data_dir
    }

    pub fn store_strategy(&self) -> StoreStrategy {
        self.inner.store_strategy
    }

    pub fn task_expire_time(&self) -> Duration {
        self.inner.task_expire_time
    }

    pub fn gc_interval(&self) -> Duration {
        self.inner.gc_interval
    }

    pub fn disk_gc_threshold(&self) -> u64 {
        self.inner.disk_gc_threshold
    }

    pub fn disk_gc_threshold_percent(&self) -> f64 {
        self.inner.disk_gc_threshold_percent
    }

    pub fn schedule_timeout(&self) -> Duration {
        self.inner.schedule_timeout
    }

    pub fn piece_download_timeout(&self) -> Duration {
        self.inner.piece_download_timeout
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.inner.rpc_timeout
    }

    pub fn scheduler_reconnect_limit(&self) -> usize {
        self.inner.scheduler_reconnect_limit
    }

    pub fn total_rate_limit(&self) -> u64 {
        self.inner.total_rate_limit
    }

    pub fn enable_prefetch(&self) -> bool {
        self.inner.enable_prefetch
    }

    pub fn piece_task_window(&self) -> u32 {
        self.inner.piece_task_window
    }

    pub fn default_parallel_count(&self) -> usize {
        self.inner.default_parallel_count
    }
}
