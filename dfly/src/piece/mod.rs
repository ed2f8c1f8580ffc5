//! 分片下载器。从候选 peer 逐个尝试拉分片，或者整体回源。
//! 自身无状态，任务状态都在 peer task 和存储里

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dfly_util::digest::{md5_hex, sha256_hex};
use dfly_util::limit::RateLimiter;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::message::{
    Code, DestPeer, PeerTaskRequest, PieceDownloadRequest, PieceInfo, PieceStyle,
};
use crate::rpc::peer;
use crate::source::SourceRegistry;
use crate::storage::{PeerTaskMetadata, StorageManager};

/// 分片大小下限
pub const MIN_PIECE_SIZE: u64 = 4 << 20;

/// 分片大小上限
pub const MAX_PIECE_SIZE: u64 = 16 << 20;

/// 长度已知时取 length/100 向上取整到 2 的幂，再夹在 [4MiB, 16MiB]；
/// 未知长度固定 4MiB
pub fn compute_piece_size(length: i64) -> u32 {
    if length <= 0 {
        return MIN_PIECE_SIZE as u32;
    }
    let hinted = (length as u64 / 100).next_power_of_two();
    hinted.clamp(MIN_PIECE_SIZE, MAX_PIECE_SIZE) as u32
}

/// 分片下载器对任务的依赖面。conductor 是真实现，测试用打桩
#[async_trait]
pub trait PieceTask: Send + Sync {
    fn task_id(&self) -> String;

    fn peer_id(&self) -> String;

    fn set_content_length(&self, length: i64);

    fn set_total_pieces(&self, total: i32);

    fn total_pieces(&self) -> i32;

    fn add_traffic(&self, bytes: u64);

    /// 分片写好后发给订阅者
    fn publish_piece_info(&self, piece_num: i32, size: u32);

    /// 把一次分片尝试上报给调度器
    async fn report_piece_result(
        &self,
        piece: &PieceInfo,
        dst_pid: &str,
        begin_time: u64,
        end_time: u64,
        success: bool,
        code: Code,
    );

    fn cancel_token(&self) -> CancellationToken;

    /// 任务级限速器
    fn rate_limiter(&self) -> RateLimiter;
}

pub struct DownloadPieceRequest {
    pub piece: PieceInfo,
    pub candidates: Vec<DestPeer>,
}

#[derive(Debug)]
pub struct DownloadPieceResult {
    pub dst_pid: String,
    pub size: u32,
    pub begin_time: u64,
    pub end_time: u64,
}

/// 分片下载失败的分类，conductor 据此决定重试还是终止任务
#[derive(Debug)]
pub enum DownloadPieceError {
    /// 候选 peer 全试过了。等下一个调度包或者回源
    AllCandidatesFailed,

    /// 本地存储出错，任务级致命
    Storage(crate::storage::Error),

    /// 任务被取消
    Canceled,
}

impl std::fmt::Display for DownloadPieceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DownloadPieceError::AllCandidatesFailed => write!(f, "all candidates failed"),
            DownloadPieceError::Storage(e) => write!(f, "storage error: {}", e),
            DownloadPieceError::Canceled => write!(f, "task canceled"),
        }
    }
}

impl std::error::Error for DownloadPieceError {}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub struct PieceManager {
    storage: Arc<StorageManager>,
    sources: Arc<SourceRegistry>,

    /// 进程级限速，和任务级限速叠加生效
    total_limiter: RateLimiter,

    piece_download_timeout: Duration,

    /// 留成字段方便测试替换
    compute_piece_size: fn(i64) -> u32,
}

impl PieceManager {
    pub fn new(
        storage: Arc<StorageManager>,
        sources: Arc<SourceRegistry>,
        total_limiter: RateLimiter,
        piece_download_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            sources,
            total_limiter,
            piece_download_timeout,
            compute_piece_size,
        }
    }

    #[cfg(test)]
    pub fn set_compute_piece_size(&mut self, f: fn(i64) -> u32) {
        self.compute_piece_size = f;
    }

    /// 先过任务级再过进程级限速。停机 / 取消时中断等待
    async fn acquire_quota(&self, task: &dyn PieceTask, bytes: u64) -> Result<()> {
        let cancel = task.cancel_token();
        let task_limiter = task.rate_limiter();
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("任务已取消")),
            _ = async {
                task_limiter.acquire(bytes).await;
                self.total_limiter.acquire(bytes).await;
            } => Ok(()),
        }
    }

    /// 从候选列表逐个尝试拉一个分片。
    /// 写穿存储并校验后才发布、上报；全部候选失败交回 conductor 决策
    pub async fn download_piece(
        &self,
        task: &dyn PieceTask,
        request: &DownloadPieceRequest,
    ) -> std::result::Result<DownloadPieceResult, DownloadPieceError> {
        let piece = &request.piece;
        if self.acquire_quota(task, piece.range_size as u64).await.is_err() {
            return Err(DownloadPieceError::Canceled);
        }

        let begin_time = now_millis();
        let meta = PeerTaskMetadata {
            task_id: task.task_id(),
            peer_id: task.peer_id(),
        };

        for candidate in &request.candidates {
            let rpc_request = PieceDownloadRequest {
                task_id: task.task_id(),
                dst_pid: candidate.peer_id.clone(),
                piece_num: piece.piece_num,
                range_start: piece.range_start,
                range_size: piece.range_size,
            };
            let data = match peer::download_piece(
                candidate.addr,
                &rpc_request,
                self.piece_download_timeout,
            )
            .await
            {
                Ok(data) => data,
                Err(e) => {
                    debug!(
                        "从 [{}] 拉分片 {} 失败, 换下一个候选: {}",
                        candidate.peer_id, piece.piece_num, e
                    );
                    continue;
                }
            };

            match self.storage.write_piece(&meta, piece, &data).await {
                Ok(size) => {
                    let end_time = now_millis();
                    task.add_traffic(size);
                    task.publish_piece_info(piece.piece_num, size as u32);
                    task.report_piece_result(
                        piece,
                        &candidate.peer_id,
                        begin_time,
                        end_time,
                        true,
                        Code::Success,
                    )
                    .await;
                    return Ok(DownloadPieceResult {
                        dst_pid: candidate.peer_id.clone(),
                        size: size as u32,
                        begin_time,
                        end_time,
                    });
                }
                Err(crate::storage::Error::InvalidDigest) => {
                    // 坏数据没有落盘，换一个 peer 再试
                    warn!(
                        "分片 {} 来自 [{}] 的数据校验不过, 换候选重试",
                        piece.piece_num, candidate.peer_id
                    );
                    task.report_piece_result(
                        piece,
                        &candidate.peer_id,
                        begin_time,
                        now_millis(),
                        false,
                        Code::ClientPieceDownloadFail,
                    )
                    .await;
                    continue;
                }
                Err(e) => {
                    // 存储出问题对任务是致命的
                    return Err(DownloadPieceError::Storage(e));
                }
            }
        }

        task.report_piece_result(
            piece,
            "",
            begin_time,
            now_millis(),
            false,
            Code::ClientPieceDownloadFail,
        )
        .await;
        Err(DownloadPieceError::AllCandidatesFailed)
    }

    /// 整体回源。绕过 P2P 直接拉源站，切成顺序分片写进存储，
    /// 订阅者照常收到分片事件
    pub async fn download_source(
        &self,
        task: &dyn PieceTask,
        request: &PeerTaskRequest,
    ) -> Result<u64> {
        let client = self.sources.resolve(&request.url)?;
        let meta = PeerTaskMetadata {
            task_id: task.task_id(),
            peer_id: task.peer_id(),
        };

        let response = client
            .download(&request.url, &request.url_meta.header, &request.url_meta.range)
            .await?;
        let content_length = response.content_length.map(|l| l as i64).unwrap_or(-1);
        let piece_size = (self.compute_piece_size)(content_length);

        if content_length >= 0 {
            let total = total_pieces_of(content_length, piece_size);
            task.set_content_length(content_length);
            task.set_total_pieces(total);
            if let Some(store) = self.storage.load_task(&meta) {
                store
                    .update_task(Some(content_length), Some(total), None)
                    .await?;
            }
        }

        let mut reader = response.reader;
        let mut piece_md5s: Vec<String> = Vec::new();
        let mut offset: u64 = 0;
        let mut num: i32 = 0;
        let mut buf = vec![0u8; piece_size as usize];

        loop {
            if task.cancel_token().is_cancelled() {
                return Err(anyhow!("任务已取消"));
            }
            let n = read_full(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            self.acquire_quota(task, n as u64).await?;

            // 长度未知时靠末分片标记敲定总量；n 不满一个分片说明到尾了
            let is_last = (content_length >= 0
                && offset + n as u64 == content_length as u64)
                || (content_length < 0 && n < piece_size as usize);
            let piece = PieceInfo {
                piece_num: num,
                range_start: offset,
                range_size: n as u32,
                piece_md5: md5_hex(data),
                piece_offset: offset,
                piece_style: if is_last { PieceStyle::Last } else { PieceStyle::Plain },
            };

            let begin_time = now_millis();
            self.storage
                .write_piece(&meta, &piece, data)
                .await
                .map_err(|e| anyhow!("回源写分片 {} 失败: {}", num, e))?;
            task.add_traffic(n as u64);
            task.publish_piece_info(num, n as u32);
            task.report_piece_result(&piece, "", begin_time, now_millis(), true, Code::Success)
                .await;

            piece_md5s.push(piece.piece_md5.clone());
            offset += n as u64;
            num += 1;
            if n < piece_size as usize {
                break;
            }
        }

        // 到这里总量一定已知了
        task.set_content_length(offset as i64);
        task.set_total_pieces(num);
        let sign = sha256_hex(piece_md5s.join(",").as_bytes());
        if let Some(store) = self.storage.load_task(&meta) {
            store
                .update_task(Some(offset as i64), Some(num), Some(sign))
                .await?;
        }

        if !request.url_meta.digest.is_empty() {
            self.storage
                .validate_digest(&meta, &request.url_meta.digest)
                .await
                .map_err(|e| anyhow!("回源整体摘要校验失败: {}", e))?;
        }

        debug!("回源完成, {} 字节 {} 个分片", offset, num);
        Ok(offset)
    }
}

pub fn total_pieces_of(content_length: i64, piece_size: u32) -> i32 {
    if content_length <= 0 {
        return 0;
    }
    ((content_length as u64).div_ceil(piece_size as u64)) as i32
}

/// 读满 buf 或读到 EOF
async fn read_full<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
