//! 任务管理器。文件 / 流式 / 种子三种入口都汇到
//! get_or_create_conductor：同一 task_id 全进程只有一个 conductor，
//! 后来的请求挂在同一个 broker 上共享进度

pub mod broker;
pub mod conductor;
mod file;
mod seed;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dfly_util::id;
use dfly_util::limit::RateLimiter;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, CHANNEL_BUFFER};
use crate::piece::PieceManager;
use crate::rpc::message::{Code, Pattern, PeerHost, PeerTaskRequest, UrlMeta};
use crate::rpc::scheduler::SchedulerClient;
use crate::source::SourceRegistry;
use crate::storage::{StorageManager, StoreRequest};
use self::conductor::PeerTaskConductor;

/// 一条任务进度
#[derive(Clone, Debug)]
pub struct TaskProgress {
    pub state: ProgressState,
    pub task_id: String,
    pub peer_id: String,
    pub content_length: i64,
    pub completed_length: u64,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct ProgressState {
    pub success: bool,
    pub code: Code,
    pub msg: String,
}

pub struct FileTaskRequest {
    pub url: String,
    pub output: PathBuf,
    pub url_meta: UrlMeta,
    pub pattern: Pattern,

    /// 任务级限速（字节/秒），0 不限
    pub limit: u64,

    pub disable_back_source: bool,
    pub callsystem: String,
}

pub struct StreamTaskRequest {
    pub url: String,
    pub url_meta: UrlMeta,
    pub limit: u64,
    pub disable_back_source: bool,
}

pub struct SeedTaskRequest {
    pub url: String,
    pub url_meta: UrlMeta,
    pub limit: u64,
}

/// 流式任务随 reader 一起交付的属性
#[derive(Clone, Debug)]
pub struct StreamTaskAttributes {
    pub task_id: String,
    pub peer_id: String,
    pub content_length: i64,
}

pub struct PeerTaskManager {
    config: Config,
    storage: Arc<StorageManager>,
    piece_manager: Arc<PieceManager>,
    scheduler: Arc<SchedulerClient>,

    /// 活跃 conductor，task_id 去重
    conductors: Arc<DashMap<String, PeerTaskConductor>>,

    cancel: CancellationToken,
}

impl PeerTaskManager {
    pub fn new(
        config: Config,
        storage: Arc<StorageManager>,
        scheduler: Arc<SchedulerClient>,
        sources: Arc<SourceRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let piece_manager = Arc::new(PieceManager::new(
            storage.clone(),
            sources,
            RateLimiter::new(config.total_rate_limit()),
            config.piece_download_timeout(),
        ));
        let manager = Arc::new(Self {
            config,
            storage: storage.clone(),
            piece_manager,
            scheduler,
            conductors: Arc::new(DashMap::new()),
            cancel,
        });

        // 存储被回收时，顺手清掉已终局的 conductor 映射
        let conductors = manager.conductors.clone();
        storage.set_gc_callback(Box::new(move |request| {
            conductors.remove_if(&request.task_id, |_, c| c.state().is_terminal());
        }));
        manager
    }

    pub fn compute_task_id(url: &str, url_meta: &UrlMeta) -> String {
        id::task_id(
            url,
            &url_meta.filter,
            &url_meta.header,
            &url_meta.range,
            &url_meta.digest,
            &url_meta.tag,
        )
    }

    fn build_peer_task_request(&self, url: &str, url_meta: &UrlMeta) -> PeerTaskRequest {
        PeerTaskRequest {
            url: url.to_string(),
            url_meta: url_meta.clone(),
            peer_id: id::gen_peer_id(self.config.peer_ip()),
            peer_host: PeerHost {
                ip: self.config.peer_ip().to_string(),
                port: self.config.peer_server_addr().port(),
            },
            is_migrating: false,
        }
    }

    /// 同一 task_id 只会有一个活的 conductor。
    /// 返回 (conductor, 是否新建)
    fn get_or_create_conductor(
        &self,
        task_id: String,
        url: &str,
        url_meta: &UrlMeta,
        destination: Option<PathBuf>,
        disable_back_source: bool,
        rate_limit: u64,
    ) -> (PeerTaskConductor, bool) {
        match self.conductors.entry(task_id.clone()) {
            Entry::Occupied(entry) => {
                debug!("任务 [{}] 已有 conductor, 共享订阅", task_id);
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                let request = self.build_peer_task_request(url, url_meta);
                let conductor = PeerTaskConductor::new(
                    task_id.clone(),
                    request,
                    destination,
                    disable_back_source,
                    rate_limit,
                    self.config.clone(),
                    self.storage.clone(),
                    self.piece_manager.clone(),
                    self.scheduler.clone(),
                    self.cancel.clone(),
                );
                entry.insert(conductor.clone());

                // 终局后摘掉映射，后续同 task 的请求走存储复用快路径
                let conductors = self.conductors.clone();
                let watched = conductor.clone();
                tokio::spawn(async move {
                    let mut state_rx = watched.state_receiver();
                    while !state_rx.borrow().is_terminal() {
                        if state_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    conductors.remove(watched.get_task_id());
                });
                (conductor, true)
            }
        }
    }

    /// 带 Range 的请求顺带预取整个对象。失败只记日志
    fn maybe_prefetch(self: &Arc<Self>, url: &str, url_meta: &UrlMeta) {
        if !self.config.enable_prefetch() || url_meta.range.is_empty() {
            return;
        }
        let mut full_meta = url_meta.clone();
        full_meta.range.clear();
        let this = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            info!("预取整个对象: {}", url);
            match this
                .start_seed_task(SeedTaskRequest {
                    url: url.clone(),
                    url_meta: full_meta,
                    limit: 0,
                })
                .await
            {
                Ok(mut progress) => {
                    while let Some(p) = progress.recv().await {
                        if p.done && !p.state.success {
                            warn!("预取 [{}] 失败: {}", url, p.state.msg);
                        }
                    }
                }
                Err(e) => warn!("预取 [{}] 启动失败: {}", url, e),
            }
        });
    }

    /// 下载到本地文件，进度流式返回
    pub async fn start_file_task(
        self: &Arc<Self>,
        request: FileTaskRequest,
    ) -> Result<mpsc::Receiver<TaskProgress>> {
        let task_id = Self::compute_task_id(&request.url, &request.url_meta);
        let (progress_tx, progress_rx) = mpsc::channel(CHANNEL_BUFFER);

        // 完成存储的快路径：直接从现有存储落位
        if let Some(reuse) = self.storage.find_completed_task(&task_id) {
            // 消费前复核 invalid，拿到复用项和消费之间存储可能被判废
            if !self.storage.is_invalid(&reuse.meta).unwrap_or(true) {
                info!("任务 [{}] 命中完成存储, 直接复用", task_id);
                let storage = self.storage.clone();
                let output = request.output.clone();
                tokio::spawn(async move {
                    let result = storage
                        .store(&StoreRequest {
                            meta: reuse.meta.clone(),
                            destination: output,
                            metadata_only: false,
                        })
                        .await;
                    let progress = match result {
                        Ok(_) => TaskProgress {
                            state: ProgressState {
                                success: true,
                                code: Code::Success,
                                msg: "reused".to_string(),
                            },
                            task_id: reuse.meta.task_id.clone(),
                            peer_id: reuse.meta.peer_id.clone(),
                            content_length: reuse.content_length,
                            completed_length: reuse.content_length.max(0) as u64,
                            done: true,
                        },
                        Err(e) => TaskProgress {
                            state: ProgressState {
                                success: false,
                                code: Code::ClientError,
                                msg: format!("复用存储落位失败: {}", e),
                            },
                            task_id: reuse.meta.task_id.clone(),
                            peer_id: reuse.meta.peer_id.clone(),
                            content_length: reuse.content_length,
                            completed_length: 0,
                            done: true,
                        },
                    };
                    let _ = progress_tx.send(progress).await;
                });
                return Ok(progress_rx);
            }
        }

        let (conductor, created) = self.get_or_create_conductor(
            task_id,
            &request.url,
            &request.url_meta,
            Some(request.output.clone()),
            request.disable_back_source,
            request.limit,
        );
        // 先订阅再启动，一条事件都不漏
        let (piece_rx, state_rx) = conductor.subscribe();
        if created {
            conductor.start();
        }
        self.maybe_prefetch(&request.url, &request.url_meta);

        tokio::spawn(file::run_file_task(
            conductor,
            piece_rx,
            state_rx,
            request.output,
            progress_tx,
        ));
        Ok(progress_rx)
    }

    /// 下载为一个按序输出的 reader（HTTP 代理路径）
    pub async fn start_stream_task(
        self: &Arc<Self>,
        request: StreamTaskRequest,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, StreamTaskAttributes)> {
        let task_id = Self::compute_task_id(&request.url, &request.url_meta);

        if let Some(reuse) = self.storage.find_completed_task(&task_id) {
            if !self.storage.is_invalid(&reuse.meta).unwrap_or(true) {
                info!("流式任务 [{}] 命中完成存储, 直接读", task_id);
                let reader = self.storage.read_all_pieces(&reuse.meta).await?;
                return Ok((
                    Box::new(reader),
                    StreamTaskAttributes {
                        task_id: reuse.meta.task_id,
                        peer_id: reuse.meta.peer_id,
                        content_length: reuse.content_length,
                    },
                ));
            }
        }

        let (conductor, created) = self.get_or_create_conductor(
            task_id.clone(),
            &request.url,
            &request.url_meta,
            None,
            request.disable_back_source,
            request.limit,
        );
        let (piece_rx, state_rx) = conductor.subscribe();
        if created {
            conductor.start();
        }
        self.maybe_prefetch(&request.url, &request.url_meta);

        let attributes = StreamTaskAttributes {
            task_id,
            peer_id: conductor.get_peer_id().to_string(),
            content_length: conductor.get_content_length(),
        };
        let reader = stream::spawn_stream_writer(conductor, piece_rx, state_rx);
        Ok((reader, attributes))
    }

    /// 只预热本地存储，不交付内容
    pub async fn start_seed_task(
        self: &Arc<Self>,
        request: SeedTaskRequest,
    ) -> Result<mpsc::Receiver<TaskProgress>> {
        let task_id = Self::compute_task_id(&request.url, &request.url_meta);
        let (progress_tx, progress_rx) = mpsc::channel(CHANNEL_BUFFER);

        if let Some(reuse) = self.storage.find_completed_task(&task_id) {
            if !self.storage.is_invalid(&reuse.meta).unwrap_or(true) {
                debug!("种子任务 [{}] 已有完成存储", task_id);
                let progress = TaskProgress {
                    state: ProgressState {
                        success: true,
                        code: Code::Success,
                        msg: "reused".to_string(),
                    },
                    task_id: reuse.meta.task_id,
                    peer_id: reuse.meta.peer_id,
                    content_length: reuse.content_length,
                    completed_length: reuse.content_length.max(0) as u64,
                    done: true,
                };
                let _ = progress_tx.send(progress).await;
                return Ok(progress_rx);
            }
        }

        let (conductor, created) = self.get_or_create_conductor(
            task_id,
            &request.url,
            &request.url_meta,
            None,
            // 种子任务的意义就是填存储，回源兜底保持可用
            false,
            request.limit,
        );
        let (piece_rx, state_rx) = conductor.subscribe();
        if created {
            conductor.start();
        }

        tokio::spawn(seed::run_seed_task(conductor, piece_rx, state_rx, progress_tx));
        Ok(progress_rx)
    }

    /// 活跃任务数
    pub fn running_count(&self) -> usize {
        self.conductors.len()
    }
}
