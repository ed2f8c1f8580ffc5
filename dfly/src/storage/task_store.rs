//! 单个 (task, peer) 的本地存储。
//! 数据文件 + JSON 元数据文件，元数据每次变更都原子重写

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dfly_util::digest::{md5_hex, parse_md5, Md5Summer};
use dfly_util::fs::{write_atomic, AsyncOpenOptionsExt};
use dfly_util::sync::RwLockExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::{Error, PeerTaskMetadata, Result, StoreRequest};
use crate::config::StoreStrategy;
use crate::rpc::message::{PiecePacket, PieceInfo, PieceTaskRequest};

/// 元数据文件名
pub const TASK_METADATA: &str = "metadata";

/// 数据文件名
pub const TASK_DATA: &str = "data";

/// 等待在途写入者的时间，超过按分片不存在处理
const WAIT_WRITER_TIMEOUT: Duration = Duration::from_secs(10);

/// 校验整体摘要时的读块大小
const DIGEST_CHUNK: usize = 64 * 1024;

/// 落盘的任务元数据
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistentMetadata {
    pub store_strategy: StoreStrategy,
    pub task_id: String,
    pub peer_id: String,
    pub task_meta: HashMap<String, String>,

    /// -1 表示未知
    pub content_length: i64,

    /// -1 表示未知（流式下载中）
    pub total_pieces: i32,

    pub piece_md5_sign: String,
    pub pieces: HashMap<i32, PieceInfo>,

    /// 实际数据文件路径。Advance 策略下在目标目录里
    pub data_file_path: PathBuf,

    pub done: bool,
    pub invalid: bool,
}

pub struct LocalTaskStore {
    /// 存储目录 dataDir/<task>/<peer>
    data_dir: PathBuf,

    /// 元数据文件路径
    metadata_path: PathBuf,

    /// 闲置多久可回收
    expire_time: Duration,

    metadata: RwLock<PersistentMetadata>,

    /// 最近访问时间（unix 毫秒）
    last_access: AtomicI64,

    /// 已被 GC 标记
    reclaim_marked: AtomicBool,

    /// 在途写入计数，非零时不参与回收
    writing: AtomicUsize,

    /// 分片写去重：同一分片同时只有一个写入者，其余等它
    piece_guards: DashMap<i32, Arc<tokio::sync::Mutex<()>>>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

struct WritingGuard<'a>(&'a AtomicUsize);

impl<'a> WritingGuard<'a> {
    fn hold(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LocalTaskStore {
    /// 新建存储。Simple 策略数据落在 dataDir 下；
    /// Advance 策略数据写到目标目录的 .cache 文件，并在 dataDir 下留链接
    pub async fn create(
        meta: &PeerTaskMetadata,
        data_root: &Path,
        strategy: StoreStrategy,
        destination: Option<&Path>,
        content_length: i64,
        total_pieces: i32,
        piece_md5_sign: String,
        expire_time: Duration,
    ) -> Result<Self> {
        let data_dir = data_root.join(&meta.task_id).join(&meta.peer_id);
        tokio::fs::create_dir_all(&data_dir).await?;

        // 没有目标路径（proxy / seed 场景）退回 Simple
        let strategy = match destination {
            Some(_) => strategy,
            None => StoreStrategy::Simple,
        };

        let link_path = data_dir.join(TASK_DATA);
        let data_file_path = match strategy {
            StoreStrategy::Simple => {
                drop(
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&link_path)
                        .await?,
                );
                link_path.clone()
            }
            StoreStrategy::Advance => {
                let destination = destination.unwrap();
                let dir = destination.parent().ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "destination 没有父目录",
                    ))
                })?;
                let file_name = destination
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "destination 文件名非法",
                        ))
                    })?;
                let cache = dir.join(format!(".{}.dfly.cache.{}", file_name, meta.peer_id));
                drop(
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open_with_parent_dirs(&cache)
                        .await?,
                );

                // 同设备硬链接，失败退回软链接，保证重载 / GC 能顺着 dataDir 找到数据
                if tokio::fs::hard_link(&cache, &link_path).await.is_err() {
                    debug!("硬链接失败，退回软链接: {}", cache.display());
                    tokio::fs::symlink(&cache, &link_path).await?;
                }
                cache
            }
        };

        let metadata = PersistentMetadata {
            store_strategy: strategy,
            task_id: meta.task_id.clone(),
            peer_id: meta.peer_id.clone(),
            task_meta: HashMap::new(),
            content_length,
            total_pieces,
            piece_md5_sign,
            pieces: HashMap::new(),
            data_file_path,
            done: false,
            invalid: false,
        };

        let store = Self {
            metadata_path: data_dir.join(TASK_METADATA),
            data_dir,
            expire_time,
            metadata: RwLock::new(metadata),
            last_access: AtomicI64::new(now_millis()),
            reclaim_marked: AtomicBool::new(false),
            writing: AtomicUsize::new(0),
            piece_guards: DashMap::new(),
        };
        store.persist().await?;
        Ok(store)
    }

    /// 从磁盘加载已有存储。解析失败由调用方清理目录
    pub async fn load(data_dir: PathBuf, expire_time: Duration) -> Result<Self> {
        let metadata_path = data_dir.join(TASK_METADATA);
        let raw = tokio::fs::read(&metadata_path).await?;
        let metadata: PersistentMetadata = serde_json::from_slice(&raw)?;

        Ok(Self {
            metadata_path,
            data_dir,
            expire_time,
            metadata: RwLock::new(metadata),
            last_access: AtomicI64::new(now_millis()),
            reclaim_marked: AtomicBool::new(false),
            writing: AtomicUsize::new(0),
            piece_guards: DashMap::new(),
        })
    }

    pub fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    pub fn task_id(&self) -> String {
        self.metadata.read_pe().task_id.clone()
    }

    pub fn peer_id(&self) -> String {
        self.metadata.read_pe().peer_id.clone()
    }

    pub fn content_length(&self) -> i64 {
        self.metadata.read_pe().content_length
    }

    pub fn total_pieces(&self) -> i32 {
        self.metadata.read_pe().total_pieces
    }

    pub fn is_done(&self) -> bool {
        self.metadata.read_pe().done
    }

    pub fn is_invalid(&self) -> bool {
        self.metadata.read_pe().invalid
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn reclaim_marked(&self) -> bool {
        self.reclaim_marked.load(Ordering::Relaxed)
    }

    /// 所有已完成分片的字节数之和
    pub fn completed_length(&self) -> u64 {
        self.metadata
            .read_pe()
            .pieces
            .values()
            .map(|p| p.range_size as u64)
            .sum()
    }

    /// 把内存里的元数据原子落盘
    async fn persist(&self) -> Result<()> {
        let data = {
            let metadata = self.metadata.read_pe();
            serde_json::to_vec(&*metadata)?
        };
        write_atomic(&self.metadata_path, &data).await?;
        Ok(())
    }

    /// 写入一个分片。同分片并发写会合流到第一个写入者，
    /// 后来者直接复用结果。校验不过不会记录元数据
    pub async fn write_piece(&self, piece: &PieceInfo, data: &[u8]) -> Result<u64> {
        self.touch();

        if self.metadata.read_pe().done {
            return Err(Error::TaskDone);
        }
        if let Some(exist) = self.metadata.read_pe().pieces.get(&piece.piece_num) {
            return Ok(exist.range_size as u64);
        }

        let guard = self
            .piece_guards
            .entry(piece.piece_num)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _locked = guard.lock().await;

        // 拿到锁后复查，前一个写入者可能已经完成
        if let Some(exist) = self.metadata.read_pe().pieces.get(&piece.piece_num) {
            return Ok(exist.range_size as u64);
        }

        if data.len() != piece.range_size as usize {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("分片长度不符: 期望 {} 实际 {}", piece.range_size, data.len()),
            )));
        }

        // 先验摘要再落盘，坏数据不进文件
        if !piece.piece_md5.is_empty() && md5_hex(data) != piece.piece_md5 {
            return Err(Error::InvalidDigest);
        }

        let _writing = WritingGuard::hold(&self.writing);
        let data_file_path = self.metadata.read_pe().data_file_path.clone();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&data_file_path)
            .await?;
        file.seek(SeekFrom::Start(piece.piece_offset)).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, data).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;

        {
            let mut metadata = self.metadata.write_pe();
            metadata.pieces.insert(piece.piece_num, piece.clone());
        }
        self.persist().await?;
        self.piece_guards.remove(&piece.piece_num);
        Ok(data.len() as u64)
    }

    /// 读一个分片。分片还在写入中时短暂等待写入者
    pub async fn read_piece(&self, piece_num: i32) -> Result<(File, PieceInfo)> {
        self.touch();

        let piece = match self.find_piece(piece_num) {
            Some(piece) => piece,
            None => {
                // 有在途写入者就等它一下
                let guard = self.piece_guards.get(&piece_num).map(|g| g.clone());
                if let Some(guard) = guard {
                    let _ = tokio::time::timeout(WAIT_WRITER_TIMEOUT, guard.lock()).await;
                }
                self.find_piece(piece_num)
                    .ok_or(Error::PieceNotFound(piece_num))?
            }
        };

        let data_file_path = self.metadata.read_pe().data_file_path.clone();
        let mut file = File::open(&data_file_path).await?;
        file.seek(SeekFrom::Start(piece.piece_offset)).await?;
        Ok((file, piece))
    }

    fn find_piece(&self, piece_num: i32) -> Option<PieceInfo> {
        self.metadata.read_pe().pieces.get(&piece_num).cloned()
    }

    /// 整文件读取，只有 Done 的任务才允许
    pub async fn read_all_pieces(&self) -> Result<File> {
        self.touch();
        if !self.metadata.read_pe().done {
            return Err(Error::TaskNotDone);
        }
        let data_file_path = self.metadata.read_pe().data_file_path.clone();
        Ok(File::open(&data_file_path).await?)
    }

    /// 返回从 start_num 起最多 limit 个已完成分片
    pub fn get_pieces(&self, request: &PieceTaskRequest) -> Result<PiecePacket> {
        self.touch();
        let metadata = self.metadata.read_pe();

        let mut nums: Vec<i32> = metadata
            .pieces
            .keys()
            .copied()
            .filter(|n| *n >= request.start_num as i32)
            .collect();
        nums.sort_unstable();
        nums.truncate(request.limit as usize);

        Ok(PiecePacket {
            task_id: metadata.task_id.clone(),
            dst_pid: metadata.peer_id.clone(),
            piece_infos: nums
                .iter()
                .map(|n| metadata.pieces[n].clone())
                .collect(),
            total_piece: metadata.total_pieces,
            content_length: metadata.content_length,
            piece_md5_sign: metadata.piece_md5_sign.clone(),
        })
    }

    /// 原子更新任务级元数据
    pub async fn update_task(
        &self,
        content_length: Option<i64>,
        total_pieces: Option<i32>,
        piece_md5_sign: Option<String>,
    ) -> Result<()> {
        {
            let mut metadata = self.metadata.write_pe();
            if let Some(len) = content_length {
                metadata.content_length = len;
            }
            if let Some(total) = total_pieces {
                // 总分片数一旦敲定不允许再变
                if metadata.total_pieces >= 0 && metadata.total_pieces != total {
                    warn!(
                        "忽略对 total_pieces 的改写: {} -> {}",
                        metadata.total_pieces, total
                    );
                } else {
                    metadata.total_pieces = total;
                }
            }
            if let Some(sign) = piece_md5_sign {
                metadata.piece_md5_sign = sign;
            }
        }
        self.persist().await
    }

    /// Done 只能从 false 翻到 true 一次，之后存储只读
    pub async fn mark_done(&self) -> Result<bool> {
        let first = {
            let mut metadata = self.metadata.write_pe();
            if metadata.done {
                false
            } else {
                metadata.done = true;
                true
            }
        };
        if first {
            self.persist().await?;
        }
        Ok(first)
    }

    /// 把内容落到目标路径
    pub async fn store(&self, request: &StoreRequest) -> Result<()> {
        self.touch();
        let (done, strategy, data_file_path, content_length) = {
            let metadata = self.metadata.read_pe();
            (
                metadata.done,
                metadata.store_strategy,
                metadata.data_file_path.clone(),
                metadata.content_length,
            )
        };
        if !done {
            return Err(Error::TaskNotDone);
        }
        if request.metadata_only {
            return Ok(());
        }

        // 重复 Store 幂等：目标已就位直接返回
        if let Ok(stat) = tokio::fs::metadata(&request.destination).await {
            if content_length >= 0 && stat.len() == content_length as u64 {
                return Ok(());
            }
            tokio::fs::remove_file(&request.destination).await?;
        }
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match strategy {
            StoreStrategy::Simple => {
                tokio::fs::copy(&data_file_path, &request.destination).await?;
            }
            StoreStrategy::Advance => {
                // cache 文件和目标在同一目录，硬链接即可落位；失败退回拷贝
                if tokio::fs::hard_link(&data_file_path, &request.destination)
                    .await
                    .is_err()
                {
                    tokio::fs::copy(&data_file_path, &request.destination).await?;
                }
            }
        }
        Ok(())
    }

    /// 校验整体 md5。不匹配时把存储标记为 invalid 并持久化
    pub async fn validate_digest(&self, expected: &str) -> Result<()> {
        let expected = parse_md5(expected).ok_or(Error::DigestNotSet)?;

        let data_file_path = self.metadata.read_pe().data_file_path.clone();
        let mut file = File::open(&data_file_path).await?;
        let mut summer = Md5Summer::new();
        let mut buf = vec![0u8; DIGEST_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            summer.update(&buf[..n]);
        }

        let actual = summer.finish();
        if actual != expected {
            warn!(
                "任务 [{}] 摘要不符: 期望 {} 实际 {}",
                self.task_id(),
                expected,
                actual
            );
            self.metadata.write_pe().invalid = true;
            self.persist().await?;
            return Err(Error::InvalidDigest);
        }
        Ok(())
    }

    // ===========================================================================
    // 回收相关
    // ===========================================================================

    /// 闲置超期且没有写入者才可回收
    pub fn can_reclaim(&self) -> bool {
        if self.writing.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let idle = now_millis() - self.last_access.load(Ordering::Relaxed);
        idle >= 0 && idle as u128 >= self.expire_time.as_millis()
    }

    pub fn mark_reclaim(&self) {
        self.reclaim_marked.store(true, Ordering::Relaxed);
    }

    pub fn last_access_millis(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// 物理删除。链接指向的真实数据一并删掉
    pub async fn reclaim(&self) -> Result<()> {
        let data_file_path = self.metadata.read_pe().data_file_path.clone();
        let link_path = self.data_dir.join(TASK_DATA);

        // Advance 策略下 dataDir 里是链接，真实文件在目标目录
        if data_file_path != link_path {
            if let Err(e) = tokio::fs::remove_file(&data_file_path).await {
                warn!("删除数据文件 [{}] 失败: {}", data_file_path.display(), e);
            }
        }
        tokio::fs::remove_dir_all(&self.data_dir).await?;
        Ok(())
    }
}

/// 加载失败时的目录清理：元数据、数据（含链接目标）、目录本身
pub async fn remove_broken_dir(data_dir: &Path) {
    let metadata_path = data_dir.join(TASK_METADATA);
    if let Err(e) = tokio::fs::remove_file(&metadata_path).await {
        warn!("清理损坏元数据 [{}] 失败: {}", metadata_path.display(), e);
    }

    let data = data_dir.join(TASK_DATA);
    if let Ok(stat) = tokio::fs::symlink_metadata(&data).await {
        if stat.file_type().is_symlink() {
            if let Ok(target) = tokio::fs::read_link(&data).await {
                let _ = tokio::fs::remove_file(&target).await;
            }
        }
        let _ = tokio::fs::remove_file(&data).await;
    }

    if let Err(e) = tokio::fs::remove_dir_all(data_dir).await {
        warn!("清理损坏目录 [{}] 失败: {}", data_dir.display(), e);
    }
}
