//! 任务指挥。一个任务一个 conductor，负责：
//! 向调度器注册、跑双向调度流、派发分片下载、
//! 终态收束和回源切换。终态是吸收态，进去就不出来

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dfly_util::digest::md5_hex;
use dfly_util::limit::RateLimiter;
use dfly_util::sync::{MutexExt, RwLockExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LEAVE_TASK_TIMEOUT, RECONNECT_BACKOFF};
use crate::piece::{DownloadPieceError, DownloadPieceRequest, PieceManager, PieceTask};
use crate::rpc::message::{
    Code, DestPeer, DirectPiece, PeerPacket, PeerResult, PeerTarget, PeerTaskRequest, PieceInfo,
    PieceResult, PieceStyle, PieceTaskRequest, SinglePiece,
};
use crate::rpc::peer;
use crate::rpc::scheduler::{Registration, SchedulerClient, SchedulerStream};
use crate::storage::{PeerTaskMetadata, RegisterTaskRequest, StorageManager};
use crate::task::broker::{PieceBroker, PieceNotice};

/// main peer 暂时没有新分片时的轮询间隔
const WAIT_PIECE_POLL: Duration = Duration::from_millis(500);

/// 连续多少次分片重试失败后放弃 P2P，转回源或判死
const MAX_PIECE_RETRIES: u32 = 8;

/// 任务状态机：Init → Running → (Success | Failed | BackSource → Success | Failed)
#[derive(Clone, Debug, PartialEq)]
pub enum TaskState {
    Init,
    Running,
    BackSource,
    Success,
    Failed { code: Code, msg: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Success)
    }
}

/// conductor 的外部包装，clone 共享同一个内部
#[derive(Clone)]
pub struct PeerTaskConductor(Arc<ConductorInner>);

impl Deref for PeerTaskConductor {
    type Target = Arc<ConductorInner>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct ConductorInner {
    task_id: String,
    request: PeerTaskRequest,

    /// Advance 策略下数据直接写去这里
    destination: Option<PathBuf>,

    disable_back_source: bool,
    config: Config,
    storage: Arc<StorageManager>,
    piece_manager: Arc<PieceManager>,
    scheduler: Arc<SchedulerClient>,
    broker: PieceBroker,

    /// 任务级限速
    limiter: RateLimiter,

    /// 任务根取消令牌
    cancel: CancellationToken,

    /// P2P 拉取阶段的令牌，回源前先砍掉它
    peer_cancel: CancellationToken,

    state_tx: watch::Sender<TaskState>,

    /// 最新调度包，后到覆盖先到
    packet_tx: watch::Sender<Option<PeerPacket>>,

    /// 当前调度流的上行把手，迁移后换新
    result_sender: RwLock<Option<mpsc::Sender<PieceResult>>>,

    /// 迁移重连后重发的最后一条上报
    last_piece_result: Mutex<Option<PieceResult>>,

    /// -1 表示未知
    content_length: AtomicI64,

    /// -1 表示未知
    total_pieces: AtomicI32,

    completed_length: AtomicU64,
    finished_count: AtomicI32,
    traffic: AtomicU64,
    start_time: Instant,

    /// 下一个要向 main peer 询问的分片号
    next_piece_num: AtomicI32,

    /// 已派发（或已完成）的分片
    requested: DashMap<i32, ()>,

    /// 失败待重试的分片，下个调度包来了再派
    retry_pieces: Mutex<Vec<PieceInfo>>,

    /// 连续重试失败计数，有分片成功就清零
    retry_rounds: AtomicU32,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
impl PeerTaskConductor {
    pub(crate) fn new(
        task_id: String,
        request: PeerTaskRequest,
        destination: Option<PathBuf>,
        disable_back_source: bool,
        rate_limit: u64,
        config: Config,
        storage: Arc<StorageManager>,
        piece_manager: Arc<PieceManager>,
        scheduler: Arc<SchedulerClient>,
        parent_cancel: CancellationToken,
    ) -> Self {
        let cancel = parent_cancel.child_token();
        let peer_cancel = cancel.child_token();
        let (state_tx, _) = watch::channel(TaskState::Init);
        let (packet_tx, _) = watch::channel(None);

        Self(Arc::new(ConductorInner {
            task_id,
            request,
            destination,
            disable_back_source,
            config,
            storage,
            piece_manager,
            scheduler,
            broker: PieceBroker::new(),
            limiter: RateLimiter::new(rate_limit),
            cancel,
            peer_cancel,
            state_tx,
            packet_tx,
            result_sender: RwLock::new(None),
            last_piece_result: Mutex::new(None),
            content_length: AtomicI64::new(-1),
            total_pieces: AtomicI32::new(-1),
            completed_length: AtomicU64::new(0),
            finished_count: AtomicI32::new(0),
            traffic: AtomicU64::new(0),
            start_time: Instant::now(),
            next_piece_num: AtomicI32::new(0),
            requested: DashMap::new(),
            retry_pieces: Mutex::new(Vec::new()),
            retry_rounds: AtomicU32::new(0),
        }))
    }

    // ===========================================================================
    // 对消费者的只读面
    // ===========================================================================

    /// 订阅分片事件和状态变化
    pub fn subscribe(&self) -> (mpsc::UnboundedReceiver<PieceNotice>, watch::Receiver<TaskState>) {
        (self.broker.subscribe(), self.state_tx.subscribe())
    }

    pub fn state(&self) -> TaskState {
        self.state_tx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    pub fn get_task_id(&self) -> &str {
        &self.task_id
    }

    pub fn get_peer_id(&self) -> &str {
        &self.request.peer_id
    }

    pub fn get_content_length(&self) -> i64 {
        self.content_length.load(Ordering::Relaxed)
    }

    pub fn get_completed_length(&self) -> u64 {
        self.completed_length.load(Ordering::Relaxed)
    }

    pub fn get_total_pieces(&self) -> i32 {
        self.total_pieces.load(Ordering::Relaxed)
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn storage_meta(&self) -> PeerTaskMetadata {
        PeerTaskMetadata {
            task_id: self.task_id.clone(),
            peer_id: self.request.peer_id.clone(),
        }
    }

    /// 取消整个任务
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    // ===========================================================================
    // 主流程
    // ===========================================================================

    pub(crate) fn start(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self) {
        // 注册本地存储
        let register = RegisterTaskRequest {
            meta: self.storage_meta(),
            destination: self.destination.clone(),
            content_length: -1,
            total_pieces: -1,
            piece_md5_sign: String::new(),
        };
        if let Err(e) = self.storage.register_task(register).await {
            self.fail(Code::ClientError, format!("注册本地存储失败: {}", e))
                .await;
            return;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => self.on_cancel().await,
            _ = self.main_flow() => {}
        }
    }

    async fn main_flow(&self) {
        let registration = match self.register_with_scheduler(false).await {
            Ok(r) => r,
            Err(e) => {
                self.fail(Code::SchedError, format!("调度器注册失败: {}", e))
                    .await;
                return;
            }
        };

        info!(
            "任务 [{}] 注册完成, scope: {:?}",
            self.task_id, registration.result.size_scope
        );
        match registration.result.direct_piece.clone() {
            Some(DirectPiece::PieceContent(content)) => {
                self.handle_tiny(content).await;
            }
            Some(DirectPiece::SinglePiece(single)) => {
                if !self.handle_small(&single).await {
                    // 小文件快路径失败，落回正常流程
                    self.run_normal(registration).await;
                }
            }
            None => {
                self.run_normal(registration).await;
            }
        }
    }

    /// 带退避的注册，供首次注册和迁移重连共用
    async fn register_with_scheduler(&self, migrating: bool) -> Result<Registration> {
        let mut request = self.request.clone();
        request.is_migrating = migrating;

        let mut attempt = 0usize;
        loop {
            match self.scheduler.register_peer_task(&request).await {
                Ok(registration) => return Ok(registration),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.scheduler_reconnect_limit() {
                        return Err(e);
                    }
                    warn!(
                        "任务 [{}] 注册失败(第 {} 次), 稍后重试: {}",
                        self.task_id, attempt, e
                    );
                    sleep(RECONNECT_BACKOFF * attempt as u32).await;
                }
            }
        }
    }

    /// Tiny：内容就在注册响应里，写盘即完成
    async fn handle_tiny(&self, content: Vec<u8>) {
        let piece = PieceInfo {
            piece_num: 0,
            range_start: 0,
            range_size: content.len() as u32,
            piece_md5: md5_hex(&content),
            piece_offset: 0,
            piece_style: PieceStyle::Last,
        };
        self.set_content_length(content.len() as i64);
        self.set_total_pieces(1);

        match self
            .storage
            .write_piece(&self.storage_meta(), &piece, &content)
            .await
        {
            Ok(n) => {
                self.add_traffic(n);
                self.publish_piece_info(0, n as u32);
                self.success().await;
            }
            Err(e) => {
                self.fail(Code::ClientError, format!("写入内联分片失败: {}", e))
                    .await;
            }
        }
    }

    /// Small：调度器指了一个 peer，拉单分片。成功返回 true
    async fn handle_small(&self, single: &SinglePiece) -> bool {
        self.set_content_length(single.piece_info.range_size as i64);
        self.set_total_pieces(1);

        let request = DownloadPieceRequest {
            piece: single.piece_info.clone(),
            candidates: vec![DestPeer {
                peer_id: single.dst_pid.clone(),
                addr: single.dst_addr,
            }],
        };
        match self.piece_manager.download_piece(self, &request).await {
            Ok(_) => {
                self.success().await;
                true
            }
            Err(e) => {
                warn!("任务 [{}] 小文件快路径失败, 回落普通流程: {}", self.task_id, e);
                false
            }
        }
    }

    /// Normal：把注册连接升级成双向流，跑收包和派发两个循环
    async fn run_normal(&self, registration: Registration) {
        let stream = registration.into_stream(self.cancel.child_token());
        *self.result_sender.write_pe() = Some(stream.sender());
        let _ = self.state_tx.send_if_modified(|s| {
            if matches!(s, TaskState::Init) {
                *s = TaskState::Running;
                true
            } else {
                false
            }
        });

        let mut handles = JoinSet::new();
        {
            let this = self.clone();
            handles.spawn(async move { this.receive_loop(stream).await });
        }
        {
            let this = self.clone();
            handles.spawn(async move { this.dispatch_loop().await });
        }
        while handles.join_next().await.is_some() {}
    }

    // ===========================================================================
    // 下行：收调度包
    // ===========================================================================

    async fn receive_loop(self, mut stream: SchedulerStream) {
        let mut state_rx = self.state_tx.subscribe();
        let mut reconnects = 0usize;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    stream.close().await;
                    return;
                }
                _ = state_rx.changed() => {
                    if self.state().is_terminal() {
                        stream.close().await;
                        return;
                    }
                }
                packet = stream.recv() => {
                    match packet {
                        Some(packet) => self.on_peer_packet(packet).await,
                        None => {
                            if self.state().is_terminal()
                                || matches!(self.state(), TaskState::BackSource)
                            {
                                return;
                            }
                            // 调度流断了，走迁移重连
                            reconnects += 1;
                            if reconnects > self.config.scheduler_reconnect_limit() {
                                self.fail(Code::SchedError, "调度流重连次数用尽".to_string())
                                    .await;
                                return;
                            }
                            warn!(
                                "任务 [{}] 调度流断开, 第 {} 次迁移重连",
                                self.task_id, reconnects
                            );
                            sleep(RECONNECT_BACKOFF * reconnects as u32).await;
                            match self.register_with_scheduler(true).await {
                                Ok(registration) => {
                                    let fresh = registration.into_stream(self.cancel.child_token());
                                    *self.result_sender.write_pe() = Some(fresh.sender());
                                    // 把最后一条上报补给新调度器，帮它恢复进度
                                    let last = self.last_piece_result.lock_pe().clone();
                                    if let Some(last) = last {
                                        let _ = fresh.send(last).await;
                                    }
                                    stream = fresh;
                                }
                                Err(e) => {
                                    self.fail(
                                        Code::SchedError,
                                        format!("迁移重注册失败: {}", e),
                                    )
                                    .await;
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn on_peer_packet(&self, packet: PeerPacket) {
        if packet.code == Code::SchedNeedBackSource {
            info!("任务 [{}] 调度器要求回源", self.task_id);
            self.enter_back_source().await;
            return;
        }
        if !packet.code.is_success() {
            debug!("任务 [{}] 收到错误调度包: {:?}", self.task_id, packet.code);
        }
        // send_replace 在没有订阅者时也落值，派发循环启动前到的包不会丢
        self.packet_tx.send_replace(Some(packet));
    }

    // ===========================================================================
    // 派发：问片、拉片
    // ===========================================================================

    async fn dispatch_loop(self) {
        let mut packet_rx = self.packet_tx.subscribe();
        let mut state_rx = self.state_tx.subscribe();
        let mut join_set: JoinSet<std::result::Result<i32, Option<PieceInfo>>> = JoinSet::new();

        loop {
            let state = self.state();
            if state.is_terminal() || matches!(state, TaskState::BackSource) {
                break;
            }

            let usable = packet_rx
                .borrow_and_update()
                .clone()
                .filter(|p| p.code.is_success() && p.main_peer.is_some());

            let Some(packet) = usable else {
                // 手里没有可用调度包：等新包、等在途任务，或者超时走备选
                tokio::select! {
                    _ = self.peer_cancel.cancelled() => break,
                    _ = state_rx.changed() => {}
                    result = join_set.join_next(), if !join_set.is_empty() => {
                        self.on_fetch_joined(result).await;
                    }
                    changed = packet_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(self.config.schedule_timeout()), if join_set.is_empty() => {
                        if !self.disable_back_source {
                            self.enter_back_source().await;
                        } else {
                            self.fail(
                                Code::ClientScheduleTimeout,
                                "等不到可用的调度包".to_string(),
                            )
                            .await;
                        }
                        break;
                    }
                }
                continue;
            };

            let main = packet.main_peer.clone().unwrap();
            let mut candidates = vec![main.clone()];
            candidates.extend(packet.steal_peers.iter().cloned());
            // 调度包没给并发度时用配置兜底
            let parallel = if packet.parallel_count > 0 {
                packet.parallel_count as usize
            } else {
                self.config.default_parallel_count().max(1)
            };

            // 凑一批要下的分片：失败重试的优先，再向 main peer 要新的
            let mut batch: Vec<PieceInfo> = std::mem::take(&mut *self.retry_pieces.lock_pe());
            if !batch.is_empty() {
                // 连败太多次就别在 P2P 上耗了
                if self.retry_rounds.load(Ordering::Relaxed) > MAX_PIECE_RETRIES {
                    if !self.disable_back_source {
                        self.enter_back_source().await;
                    } else {
                        self.fail(
                            Code::ClientPieceDownloadFail,
                            "分片重试次数用尽".to_string(),
                        )
                        .await;
                    }
                    break;
                }
                // 重试降速，顺便给新调度包一个到达的机会
                tokio::select! {
                    _ = self.peer_cancel.cancelled() => break,
                    _ = packet_rx.changed() => {}
                    _ = sleep(WAIT_PIECE_POLL) => {}
                }
            }
            let total = self.get_total_pieces();
            let cursor = self.next_piece_num.load(Ordering::Relaxed);
            let need_more = total < 0 || cursor < total;

            if batch.is_empty() && need_more {
                let request = PieceTaskRequest {
                    task_id: self.task_id.clone(),
                    src_pid: self.get_peer_id().to_string(),
                    dst_pid: main.peer_id.clone(),
                    start_num: cursor.max(0) as u32,
                    limit: self.config.piece_task_window(),
                };
                match peer::get_piece_tasks(main.addr, &request, self.config.rpc_timeout()).await {
                    Ok(piece_packet) => {
                        if piece_packet.total_piece >= 0 {
                            self.set_total_pieces(piece_packet.total_piece);
                        }
                        if piece_packet.content_length >= 0 {
                            self.set_content_length(piece_packet.content_length);
                        }
                        let mut nums: Vec<i32> = Vec::new();
                        for piece in piece_packet.piece_infos {
                            nums.push(piece.piece_num);
                            if self.requested.insert(piece.piece_num, ()).is_none() {
                                batch.push(piece);
                            }
                        }
                        // 游标推进到第一个缺口，对端补齐后还能问到
                        let mut next = cursor;
                        nums.sort_unstable();
                        for num in nums {
                            if num == next {
                                next += 1;
                            } else if num > next {
                                break;
                            }
                        }
                        self.next_piece_num.store(next, Ordering::Relaxed);

                        if batch.is_empty() {
                            // 对端暂时没有新分片，催一下调度器再小睡
                            self.send_wait_piece_ready().await;
                            tokio::select! {
                                _ = self.peer_cancel.cancelled() => break,
                                _ = state_rx.changed() => {}
                                result = join_set.join_next(), if !join_set.is_empty() => {
                                    self.on_fetch_joined(result).await;
                                }
                                changed = packet_rx.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                }
                                _ = sleep(WAIT_PIECE_POLL) => {}
                            }
                            continue;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "任务 [{}] 向 [{}] 问分片失败: {}",
                            self.task_id, main.peer_id, e
                        );
                        // 上报请求失败，请调度器换 peer，然后等新包
                        self.send_piece_request_failed(&main.peer_id).await;
                        tokio::select! {
                            _ = self.peer_cancel.cancelled() => break,
                            _ = state_rx.changed() => {}
                            changed = packet_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = sleep(self.config.schedule_timeout()) => {
                                if !self.disable_back_source {
                                    self.enter_back_source().await;
                                } else {
                                    self.fail(
                                        Code::ClientScheduleTimeout,
                                        "候选 peer 失效且等不到新调度包".to_string(),
                                    )
                                    .await;
                                }
                                break;
                            }
                        }
                        continue;
                    }
                }
            }

            if batch.is_empty() {
                // 没活可派，等在途完成或新包
                tokio::select! {
                    _ = self.peer_cancel.cancelled() => break,
                    _ = state_rx.changed() => {}
                    result = join_set.join_next(), if !join_set.is_empty() => {
                        self.on_fetch_joined(result).await;
                    }
                    changed = packet_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(WAIT_PIECE_POLL) => {}
                }
                continue;
            }

            // 受 parallel_count 约束地派发
            for piece in batch {
                while join_set.len() >= parallel {
                    let result = join_set.join_next().await;
                    self.on_fetch_joined(result).await;
                    if self.state().is_terminal() {
                        break;
                    }
                }
                if self.state().is_terminal() || self.peer_cancel.is_cancelled() {
                    break;
                }
                let this = self.clone();
                let piece_candidates = candidates.clone();
                join_set
                    .spawn(async move { this.fetch_piece(piece, piece_candidates).await });
            }
        }

        // 回源时砍掉在途的 P2P 拉取
        if matches!(self.state(), TaskState::BackSource) {
            join_set.abort_all();
        }
        while join_set.join_next().await.is_some() {}
    }

    /// 单个分片的拉取任务体。Ok(片号)；Err(Some(piece)) 要重试，Err(None) 已终局
    async fn fetch_piece(
        self,
        piece: PieceInfo,
        candidates: Vec<DestPeer>,
    ) -> std::result::Result<i32, Option<PieceInfo>> {
        let request = DownloadPieceRequest {
            piece: piece.clone(),
            candidates,
        };
        tokio::select! {
            _ = self.peer_cancel.cancelled() => Err(None),
            result = self.piece_manager.download_piece(&self, &request) => {
                match result {
                    Ok(_) => {
                        if piece.piece_style == PieceStyle::Last {
                            self.set_total_pieces(piece.piece_num + 1);
                        }
                        Ok(piece.piece_num)
                    }
                    Err(DownloadPieceError::AllCandidatesFailed) => Err(Some(piece)),
                    Err(DownloadPieceError::Canceled) => Err(None),
                    Err(DownloadPieceError::Storage(e)) => {
                        self.fail(Code::ClientError, format!("存储错误: {}", e)).await;
                        Err(None)
                    }
                }
            }
        }
    }

    async fn on_fetch_joined(
        &self,
        result: Option<std::result::Result<std::result::Result<i32, Option<PieceInfo>>, tokio::task::JoinError>>,
    ) {
        match result {
            Some(Ok(Ok(_))) => {
                self.retry_rounds.store(0, Ordering::Relaxed);
            }
            Some(Ok(Err(Some(piece)))) => {
                // 放回重试队列，下个调度包换批候选再来
                self.retry_rounds.fetch_add(1, Ordering::Relaxed);
                self.requested.remove(&piece.piece_num);
                self.retry_pieces.lock_pe().push(piece);
            }
            Some(Ok(Err(None))) => {}
            Some(Err(e)) => {
                if !e.is_cancelled() {
                    error!("任务 [{}] 分片拉取线程异常: {}", self.task_id, e);
                }
            }
            None => {}
        }
    }

    async fn send_wait_piece_ready(&self) {
        let result = PieceResult {
            task_id: self.task_id.clone(),
            src_pid: self.get_peer_id().to_string(),
            dst_pid: String::new(),
            piece_info: None,
            begin_time: now_millis(),
            end_time: now_millis(),
            success: false,
            code: Code::ClientWaitPieceReady,
            finished_count: self.finished_count.load(Ordering::Relaxed),
        };
        self.send_piece_result(result).await;
    }

    async fn send_piece_request_failed(&self, dst_pid: &str) {
        let result = PieceResult {
            task_id: self.task_id.clone(),
            src_pid: self.get_peer_id().to_string(),
            dst_pid: dst_pid.to_string(),
            piece_info: None,
            begin_time: now_millis(),
            end_time: now_millis(),
            success: false,
            code: Code::ClientPieceRequestFail,
            finished_count: -1,
        };
        self.send_piece_result(result).await;
    }

    async fn send_piece_result(&self, result: PieceResult) {
        *self.last_piece_result.lock_pe() = Some(result.clone());
        let sender = self.result_sender.read_pe().clone();
        if let Some(tx) = sender {
            let _ = tx.send(result).await;
        }
    }

    // ===========================================================================
    // 回源
    // ===========================================================================

    async fn enter_back_source(&self) {
        if self.disable_back_source {
            self.fail(
                Code::BackToSourceFailed,
                "需要回源但回源被禁用".to_string(),
            )
            .await;
            return;
        }
        let entered = self.state_tx.send_if_modified(|s| {
            if matches!(s, TaskState::Init | TaskState::Running) {
                *s = TaskState::BackSource;
                true
            } else {
                false
            }
        });
        if !entered {
            return;
        }

        info!("任务 [{}] 切回源下载", self.task_id);
        self.peer_cancel.cancel();
        let this = self.clone();
        tokio::spawn(async move {
            match this
                .piece_manager
                .download_source(&this, &this.request)
                .await
            {
                Ok(bytes) => {
                    debug!("任务 [{}] 回源完成, {} 字节", this.task_id, bytes);
                    this.success().await;
                }
                Err(e) => {
                    this.fail(Code::BackToSourceFailed, format!("回源失败: {}", e))
                        .await;
                }
            }
        });
    }

    // ===========================================================================
    // 终态
    // ===========================================================================

    async fn success(&self) {
        let entered = self.state_tx.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = TaskState::Success;
                true
            }
        });
        if !entered {
            return;
        }

        // 存储收尾：补全元数据并置 Done
        if let Some(store) = self.storage.load_task(&self.storage_meta()) {
            // 走到成功这一步长度一定落定了，没有声明值就用实收值
            let content_length = if self.get_content_length() >= 0 {
                self.get_content_length()
            } else {
                self.get_completed_length() as i64
            };
            let total = self.get_total_pieces();
            if let Err(e) = store
                .update_task(Some(content_length), Some(total), None)
                .await
            {
                warn!("任务 [{}] 更新元数据失败: {}", self.task_id, e);
            }
            match store.mark_done().await {
                Ok(true) => {}
                Ok(false) => debug!("任务 [{}] 存储已是 Done", self.task_id),
                Err(e) => warn!("任务 [{}] 标记 Done 失败: {}", self.task_id, e),
            }
        }

        info!(
            "任务 [{}] 下载成功, {} 字节 {} 个分片",
            self.task_id,
            self.get_completed_length(),
            self.get_total_pieces()
        );
        self.broker.close();
        self.report_peer_result(true, Code::Success).await;
    }

    async fn fail(&self, code: Code, msg: String) {
        let entered = self.state_tx.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = TaskState::Failed {
                    code,
                    msg: msg.clone(),
                };
                true
            }
        });
        if !entered {
            return;
        }

        error!("任务 [{}] 失败 [{:?}]: {}", self.task_id, code, msg);
        self.broker.close();
        self.report_peer_result(false, code).await;
        // 清理现场：残缺数据不留
        self.storage.delete_task(&self.storage_meta()).await;
    }

    async fn on_cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        // 尽力而为地通知调度器本 peer 退出
        let target = PeerTarget {
            task_id: self.task_id.clone(),
            peer_id: self.get_peer_id().to_string(),
        };
        if timeout(LEAVE_TASK_TIMEOUT, self.scheduler.leave_task(&target))
            .await
            .is_err()
        {
            warn!("任务 [{}] LeaveTask 上报超时", self.task_id);
        }
        self.fail(Code::ClientContextCanceled, "调用方取消".to_string())
            .await;
    }

    /// 任务结束后发一次结果。broker 先关，再上报
    async fn report_peer_result(&self, success: bool, code: Code) {
        let result = PeerResult {
            task_id: self.task_id.clone(),
            peer_id: self.get_peer_id().to_string(),
            src_ip: self.config.peer_ip().to_string(),
            url: self.request.url.clone(),
            success,
            code,
            total_piece_count: self.get_total_pieces(),
            content_length: self.get_content_length(),
            traffic: self.traffic.load(Ordering::Relaxed),
            cost: self.start_time.elapsed().as_millis() as u64,
        };
        if let Err(e) = self.scheduler.report_peer_result(&result).await {
            warn!("任务 [{}] 上报最终结果失败: {}", self.task_id, e);
        }
    }

    /// 总量齐了就收尾
    fn maybe_success(&self) {
        let total = self.get_total_pieces();
        if total >= 0 && self.finished_count.load(Ordering::Relaxed) >= total {
            let this = self.clone();
            tokio::spawn(async move { this.success().await });
        }
    }
}

#[async_trait]
impl PieceTask for PeerTaskConductor {
    fn task_id(&self) -> String {
        self.task_id.clone()
    }

    fn peer_id(&self) -> String {
        self.request.peer_id.clone()
    }

    fn set_content_length(&self, length: i64) {
        let _ = self.content_length.compare_exchange(
            -1,
            length,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn set_total_pieces(&self, total: i32) {
        // 总量只敲定一次
        if self
            .total_pieces
            .compare_exchange(-1, total, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.maybe_success();
        }
    }

    fn total_pieces(&self) -> i32 {
        self.get_total_pieces()
    }

    fn add_traffic(&self, bytes: u64) {
        self.traffic.fetch_add(bytes, Ordering::Relaxed);
    }

    fn publish_piece_info(&self, piece_num: i32, size: u32) {
        self.completed_length.fetch_add(size as u64, Ordering::Relaxed);
        self.finished_count.fetch_add(1, Ordering::Relaxed);
        self.requested.insert(piece_num, ());
        self.broker.publish(piece_num, size);
        self.maybe_success();
    }

    async fn report_piece_result(
        &self,
        piece: &PieceInfo,
        dst_pid: &str,
        begin_time: u64,
        end_time: u64,
        success: bool,
        code: Code,
    ) {
        let finished_count = if success {
            self.finished_count.load(Ordering::Relaxed)
        } else {
            -1
        };
        let result = PieceResult {
            task_id: self.task_id.clone(),
            src_pid: self.get_peer_id().to_string(),
            dst_pid: dst_pid.to_string(),
            piece_info: Some(piece.clone()),
            begin_time,
            end_time,
            success,
            code,
            finished_count,
        };
        self.send_piece_result(result).await;
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn rate_limiter(&self) -> RateLimiter {
        self.limiter.clone()
    }
}
