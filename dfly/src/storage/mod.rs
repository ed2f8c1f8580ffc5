//! 任务存储服务。按 (task_id, peer_id) 管理本地存储，
//! 附带启动重载和磁盘配额回收

pub mod task_store;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dfly_util::sync::{MutexExt, RwLockExt};
use tokio::fs::File;
use tracing::{debug, info, warn};

use crate::config::StoreStrategy;
use crate::gc::Gc;
use crate::rpc::message::{PiecePacket, PieceInfo, PieceTaskRequest};
use self::task_store::{remove_broken_dir, LocalTaskStore};

pub type Result<T> = std::result::Result<T, Error>;

/// 错误类型
#[derive(Debug)]
pub enum Error {
    TaskNotFound,
    PieceNotFound(i32),
    TaskNotDone,
    TaskDone,
    DigestNotSet,
    InvalidDigest,
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::TaskNotFound => write!(f, "task not found"),
            Error::PieceNotFound(num) => write!(f, "piece {} not found", num),
            Error::TaskNotDone => write!(f, "task not done"),
            Error::TaskDone => write!(f, "task already done, store is read-only"),
            Error::DigestNotSet => write!(f, "digest not set"),
            Error::InvalidDigest => write!(f, "invalid digest"),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Json(e) => write!(f, "metadata error: {}", e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

/// 存储主键
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PeerTaskMetadata {
    pub task_id: String,
    pub peer_id: String,
}

pub struct RegisterTaskRequest {
    pub meta: PeerTaskMetadata,
    pub destination: Option<PathBuf>,
    pub content_length: i64,
    pub total_pieces: i32,
    pub piece_md5_sign: String,
}

pub struct StoreRequest {
    pub meta: PeerTaskMetadata,
    pub destination: PathBuf,
    pub metadata_only: bool,
}

/// GC 回调的通知内容
#[derive(Clone, Debug)]
pub struct CommonTaskRequest {
    pub task_id: String,
    pub peer_id: String,
}

/// 完成任务的复用信息
#[derive(Clone, Debug)]
pub struct ReusePeerTask {
    pub meta: PeerTaskMetadata,
    pub content_length: i64,
    pub total_pieces: i32,
}

pub struct StorageOption {
    pub data_dir: PathBuf,
    pub store_strategy: StoreStrategy,
    pub task_expire_time: Duration,
    pub gc_interval: Duration,
    pub disk_gc_threshold: u64,
    pub disk_gc_threshold_percent: f64,
}

pub type GcCallback = Box<dyn Fn(CommonTaskRequest) + Send + Sync>;

pub struct StorageManager {
    opt: StorageOption,

    /// 所有在管存储
    tasks: DashMap<PeerTaskMetadata, Arc<LocalTaskStore>>,

    /// task_id -> 存储列表，加速 find_completed_task
    index: RwLock<HashMap<String, Vec<Arc<LocalTaskStore>>>>,

    /// 创建存储时串行化，避免并发重复建
    create_lock: tokio::sync::Mutex<()>,

    /// 上一轮 GC 标记、这一轮才真正删除的任务
    marked_reclaim: Mutex<Vec<PeerTaskMetadata>>,

    /// 存储被回收时通知上层（比如让任务管理器丢掉复用项）
    gc_callback: OnceLock<GcCallback>,

    /// 整个存储管理器的最近使用时间
    last_access: AtomicI64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl StorageManager {
    /// 建管理器并从磁盘重载历史任务。重载错误不阻止启动
    pub async fn new(opt: StorageOption) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&opt.data_dir).await?;

        let manager = Arc::new(Self {
            opt,
            tasks: DashMap::new(),
            index: RwLock::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            marked_reclaim: Mutex::new(Vec::new()),
            gc_callback: OnceLock::new(),
            last_access: AtomicI64::new(now_millis()),
        });

        if let Err(e) = manager.reload_persistent_task().await {
            warn!("重载历史任务出错: {}", e);
        }
        Ok(manager)
    }

    pub fn set_gc_callback(&self, callback: GcCallback) {
        let _ = self.gc_callback.set(callback);
    }

    /// 最近一次被使用距今多久
    pub fn idle_time(&self) -> Duration {
        let idle = now_millis() - self.last_access.load(Ordering::Relaxed);
        Duration::from_millis(idle.max(0) as u64)
    }

    fn keep(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    pub fn load_task(&self, meta: &PeerTaskMetadata) -> Option<Arc<LocalTaskStore>> {
        self.keep();
        self.tasks.get(meta).map(|t| t.clone())
    }

    /// 注册存储。已存在时幂等返回现有的
    pub async fn register_task(
        &self,
        request: RegisterTaskRequest,
    ) -> Result<Arc<LocalTaskStore>> {
        if let Some(store) = self.load_task(&request.meta) {
            return Ok(store);
        }

        let _locked = self.create_lock.lock().await;
        // 拿锁后复查
        if let Some(store) = self.load_task(&request.meta) {
            return Ok(store);
        }

        debug!(
            "初始化本地存储, task: {} peer: {}",
            request.meta.task_id, request.meta.peer_id
        );
        let store = Arc::new(
            LocalTaskStore::create(
                &request.meta,
                &self.opt.data_dir,
                self.opt.store_strategy,
                request.destination.as_deref(),
                request.content_length,
                request.total_pieces,
                request.piece_md5_sign,
                self.opt.task_expire_time,
            )
            .await?,
        );

        self.tasks.insert(request.meta.clone(), store.clone());
        self.index
            .write_pe()
            .entry(request.meta.task_id)
            .or_default()
            .push(store.clone());
        Ok(store)
    }

    // ===========================================================================
    // 按 (task, peer) 转发的薄封装
    // ===========================================================================

    pub async fn write_piece(
        &self,
        meta: &PeerTaskMetadata,
        piece: &PieceInfo,
        data: &[u8],
    ) -> Result<u64> {
        self.load_task(meta)
            .ok_or(Error::TaskNotFound)?
            .write_piece(piece, data)
            .await
    }

    pub async fn read_piece(
        &self,
        meta: &PeerTaskMetadata,
        piece_num: i32,
    ) -> Result<(File, PieceInfo)> {
        self.load_task(meta)
            .ok_or(Error::TaskNotFound)?
            .read_piece(piece_num)
            .await
    }

    pub async fn read_all_pieces(&self, meta: &PeerTaskMetadata) -> Result<File> {
        self.load_task(meta)
            .ok_or(Error::TaskNotFound)?
            .read_all_pieces()
            .await
    }

    pub fn get_pieces(&self, request: &PieceTaskRequest) -> Result<PiecePacket> {
        let meta = PeerTaskMetadata {
            task_id: request.task_id.clone(),
            peer_id: request.dst_pid.clone(),
        };
        self.load_task(&meta)
            .ok_or(Error::TaskNotFound)?
            .get_pieces(request)
    }

    /// 读一个分片的完整内容，daemon 侧对外供片用
    pub async fn read_piece_bytes(
        &self,
        meta: &PeerTaskMetadata,
        piece_num: i32,
    ) -> Result<Bytes> {
        let (file, piece) = self.read_piece(meta, piece_num).await?;
        let mut reader = tokio::io::AsyncReadExt::take(file, piece.range_size as u64);
        let mut data = Vec::with_capacity(piece.range_size as usize);
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data).await?;
        if data.len() != piece.range_size as usize {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "分片数据不完整",
            )));
        }
        Ok(Bytes::from(data))
    }

    pub async fn store(&self, request: &StoreRequest) -> Result<()> {
        self.load_task(&request.meta)
            .ok_or(Error::TaskNotFound)?
            .store(request)
            .await
    }

    pub async fn validate_digest(&self, meta: &PeerTaskMetadata, expected: &str) -> Result<()> {
        self.load_task(meta)
            .ok_or(Error::TaskNotFound)?
            .validate_digest(expected)
            .await
    }

    pub fn is_invalid(&self, meta: &PeerTaskMetadata) -> Result<bool> {
        Ok(self.load_task(meta).ok_or(Error::TaskNotFound)?.is_invalid())
    }

    // ===========================================================================
    // 复用 / 索引
    // ===========================================================================

    /// 找一个可直接复用的完成存储。调用方消费前要再查一次 is_invalid
    pub fn find_completed_task(&self, task_id: &str) -> Option<ReusePeerTask> {
        self.keep();
        let index = self.index.read_pe();
        let stores = index.get(task_id)?;
        for store in stores {
            if store.is_invalid() {
                continue;
            }
            // 先续期再看标记，给活跃读者一个宽限窗口
            store.touch();
            if store.reclaim_marked() {
                continue;
            }
            if !store.is_done() {
                continue;
            }
            return Some(ReusePeerTask {
                meta: PeerTaskMetadata {
                    task_id: task_id.to_string(),
                    peer_id: store.peer_id(),
                },
                content_length: store.content_length(),
                total_pieces: store.total_pieces(),
            });
        }
        None
    }

    fn clean_index(&self, task_id: &str, peer_id: &str) {
        let mut index = self.index.write_pe();
        if let Some(stores) = index.get_mut(task_id) {
            stores.retain(|s| s.peer_id() != peer_id);
            if stores.is_empty() {
                index.remove(task_id);
            }
        }
    }

    /// 立即删除一个存储（任务失败清理现场用）
    pub async fn delete_task(&self, meta: &PeerTaskMetadata) {
        let Some((_, store)) = self.tasks.remove(meta) else {
            return;
        };
        self.clean_index(&meta.task_id, &meta.peer_id);
        store.mark_reclaim();
        if let Err(e) = store.reclaim().await {
            warn!("删除存储 {}/{} 失败: {}", meta.task_id, meta.peer_id, e);
        }
        self.remove_empty_task_dir(&meta.task_id).await;
    }

    async fn remove_empty_task_dir(&self, task_id: &str) {
        let task_dir = self.opt.data_dir.join(task_id);
        let _ = tokio::fs::remove_dir(&task_dir).await;
    }

    // ===========================================================================
    // 启动重载
    // ===========================================================================

    /// 扫描 dataDir 恢复历史任务。损坏目录就地清掉，
    /// 错误聚合返回但不影响其它任务加载
    pub async fn reload_persistent_task(&self) -> anyhow::Result<()> {
        let mut root = match tokio::fs::read_dir(&self.opt.data_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut load_errs: Vec<String> = Vec::new();
        while let Some(task_entry) = root.next_entry().await? {
            let task_id = task_entry.file_name().to_string_lossy().to_string();
            if task_id.starts_with('.') {
                continue;
            }
            let task_dir = task_entry.path();
            if !task_entry.file_type().await?.is_dir() {
                continue;
            }

            let mut peer_dirs = Vec::new();
            let mut read = tokio::fs::read_dir(&task_dir).await?;
            while let Some(peer_entry) = read.next_entry().await? {
                peer_dirs.push(peer_entry);
            }

            // 空任务目录直接清掉
            if peer_dirs.is_empty() {
                if let Err(e) = tokio::fs::remove_dir(&task_dir).await {
                    warn!("删除空任务目录 [{}] 失败: {}", task_dir.display(), e);
                } else {
                    info!("删除空任务目录 [{}]", task_dir.display());
                }
                continue;
            }

            for peer_entry in peer_dirs {
                let peer_id = peer_entry.file_name().to_string_lossy().to_string();
                let data_dir = peer_entry.path();
                match LocalTaskStore::load(data_dir.clone(), self.opt.task_expire_time).await {
                    Ok(store) => {
                        debug!("从磁盘恢复任务 {}/{}", task_id, peer_id);
                        let store = Arc::new(store);
                        let meta = PeerTaskMetadata {
                            task_id: task_id.clone(),
                            peer_id,
                        };
                        self.tasks.insert(meta, store.clone());
                        self.index
                            .write_pe()
                            .entry(task_id.clone())
                            .or_default()
                            .push(store);
                    }
                    Err(e) => {
                        warn!("加载任务 {}/{} 失败，清理现场: {}", task_id, peer_id, e);
                        load_errs.push(format!("{}/{}: {}", task_id, peer_id, e));
                        remove_broken_dir(&data_dir).await;
                    }
                }
            }
        }

        if load_errs.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("部分任务加载失败: {}", load_errs.join("; ")))
        }
    }

    // ===========================================================================
    // 回收
    // ===========================================================================

    async fn do_try_gc(&self) -> anyhow::Result<bool> {
        let mut marked: Vec<PeerTaskMetadata> = Vec::new();
        let mut total_not_marked: i64 = 0;

        for entry in self.tasks.iter() {
            let store = entry.value();
            if store.reclaim_marked() {
                continue;
            }
            if store.can_reclaim() {
                store.mark_reclaim();
                marked.push(entry.key().clone());
            } else {
                total_not_marked += store.content_length().max(0);
            }
        }

        // 磁盘压力：配额超了或使用率超了，按最久未访问补充标记
        let quota_bytes_exceed = total_not_marked - self.opt.disk_gc_threshold as i64;
        let quota_exceed = self.opt.disk_gc_threshold > 0 && quota_bytes_exceed > 0;
        let (usage_exceed, usage_bytes_exceed) = self.disk_usage_exceed();

        if quota_exceed || usage_exceed {
            let mut bytes_exceed = quota_bytes_exceed.max(usage_bytes_exceed);
            info!("磁盘压力触发回收, 需要释放 {} 字节", bytes_exceed);

            let mut candidates: Vec<Arc<LocalTaskStore>> = self
                .tasks
                .iter()
                .filter_map(|entry| {
                    let store = entry.value();
                    if store.reclaim_marked() {
                        return None;
                    }
                    // 没下完且最近还活跃的，留给下一轮再看
                    let idle = now_millis() - store.last_access_millis();
                    if !store.is_done() && (idle as u128) < self.opt.gc_interval.as_millis() {
                        return None;
                    }
                    Some(store.clone())
                })
                .collect();
            candidates.sort_by_key(|s| s.last_access_millis());

            for store in candidates {
                store.mark_reclaim();
                info!(
                    "配额回收标记 {}/{}, 大小 {} 字节",
                    store.task_id(),
                    store.peer_id(),
                    store.content_length().max(0)
                );
                marked.push(PeerTaskMetadata {
                    task_id: store.task_id(),
                    peer_id: store.peer_id(),
                });
                bytes_exceed -= store.content_length().max(0);
                if bytes_exceed <= 0 {
                    break;
                }
            }
            if bytes_exceed > 0 {
                warn!("没有更多可回收的任务了, 还差 {} 字节", bytes_exceed);
            }
        }

        // 删除上一轮标记的。这一轮才删，给活跃读者留出宽限
        let pending = std::mem::take(&mut *self.marked_reclaim.lock_pe());
        let mut reclaimed = 0;
        for key in pending {
            let Some((_, store)) = self.tasks.remove(&key) else {
                continue;
            };
            self.clean_index(&key.task_id, &key.peer_id);
            if let Err(e) = store.reclaim().await {
                warn!("回收 {}/{} 失败: {}", key.task_id, key.peer_id, e);
                continue;
            }
            self.remove_empty_task_dir(&key.task_id).await;
            reclaimed += 1;
            info!("任务 {}/{} 已回收", key.task_id, key.peer_id);
            if let Some(callback) = self.gc_callback.get() {
                callback(CommonTaskRequest {
                    task_id: key.task_id.clone(),
                    peer_id: key.peer_id.clone(),
                });
            }
            marked.retain(|m| m != &key);
        }

        info!("本轮标记 {} 个, 回收 {} 个", marked.len(), reclaimed);
        *self.marked_reclaim.lock_pe() = marked;
        Ok(true)
    }

    async fn force_gc(&self) {
        let keys: Vec<PeerTaskMetadata> =
            self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let Some((_, store)) = self.tasks.remove(&key) else {
                continue;
            };
            self.clean_index(&key.task_id, &key.peer_id);
            store.mark_reclaim();
            if let Err(e) = store.reclaim().await {
                warn!("强制回收 {}/{} 失败: {}", key.task_id, key.peer_id, e);
            }
            self.remove_empty_task_dir(&key.task_id).await;
            if let Some(callback) = self.gc_callback.get() {
                callback(CommonTaskRequest {
                    task_id: key.task_id,
                    peer_id: key.peer_id,
                });
            }
        }
        self.marked_reclaim.lock_pe().clear();
    }

    /// 磁盘使用率是否超阈值，以及要释放多少字节
    fn disk_usage_exceed(&self) -> (bool, i64) {
        if self.opt.disk_gc_threshold_percent <= 0.0 {
            return (false, 0);
        }
        let stat = match nix::sys::statvfs::statvfs(&self.opt.data_dir) {
            Ok(stat) => stat,
            Err(e) => {
                warn!("读取磁盘使用率失败: {}", e);
                return (false, 0);
            }
        };

        let frsize = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * frsize;
        let avail = stat.blocks_available() as u64 * frsize;
        let used = total.saturating_sub(stat.blocks_free() as u64 * frsize);
        if total == 0 {
            return (false, 0);
        }
        let used_percent = used as f64 / (used + avail).max(1) as f64 * 100.0;
        if used_percent < self.opt.disk_gc_threshold_percent {
            return (false, 0);
        }

        let bytes = (used_percent - self.opt.disk_gc_threshold_percent) / 100.0 * total as f64;
        info!(
            "磁盘使用率 {:.2}% 超过阈值 {:.2}%, 需要释放 {} 字节",
            used_percent, self.opt.disk_gc_threshold_percent, bytes as i64
        );
        (true, bytes as i64)
    }
}

#[async_trait]
impl Gc for StorageManager {
    async fn try_gc(&self) -> anyhow::Result<bool> {
        self.do_try_gc().await
    }

    async fn clean_up(&self) {
        self.force_gc().await;
    }
}
