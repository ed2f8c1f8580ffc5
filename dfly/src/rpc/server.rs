//! peer server。对外服务两类客户端：
//! 远端 peer 来问片 / 拉片，本机 dfget 来发下载

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use dfly_util::sync::wait_join_handle_close;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::rpc::message::{
    Code, DownRequest, DownResult, Empty, ErrorReply, PieceContent, PieceDownloadRequest,
    PieceTaskRequest,
};
use crate::rpc::{codes, decode, read_frame, write_frame};
use crate::storage::{PeerTaskMetadata, StorageManager};
use crate::task::{FileTaskRequest, PeerTaskManager};

struct ConnInfo {
    join_handle: JoinHandle<()>,
}

pub struct PeerServer {
    addr: SocketAddr,

    /// bind 后的监听器，run 时取走
    listener: Option<TcpListener>,

    storage: Arc<StorageManager>,
    task_manager: Arc<PeerTaskManager>,
    cancel: CancellationToken,
    conns: Arc<DashMap<u64, ConnInfo>>,
    conn_id: AtomicU64,
}

impl PeerServer {
    pub fn new(
        addr: SocketAddr,
        storage: Arc<StorageManager>,
        task_manager: Arc<PeerTaskManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            listener: None,
            storage,
            task_manager,
            cancel,
            conns: Arc::new(DashMap::new()),
            conn_id: AtomicU64::new(0),
        }
    }

    /// 绑定并返回实际监听地址（端口 0 时有用）
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| anyhow!("peer server 绑定 {} 失败: {}", self.addr, e))?;
        let addr = listener.local_addr()?;
        self.addr = addr;
        self.listener = Some(listener);
        Ok(addr)
    }

    pub async fn run(mut self) {
        if self.listener.is_none() {
            if let Err(e) = self.bind().await {
                error!("{}", e);
                self.cancel.cancel();
                return;
            }
        }
        let listener = self.listener.take().unwrap();
        info!("peer server 正在监听 {}", self.addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    trace!("peer server 收到停机信号");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            trace!("peer server 接收到连接: {}", addr);
                            self.spawn_conn(socket);
                        }
                        Err(e) => {
                            warn!("peer server 接收连接错误: {}", e);
                        }
                    }
                }
            }
        }

        trace!("等待关闭的连接数量: {}", self.conns.len());
        for mut conn in self.conns.iter_mut() {
            wait_join_handle_close(&mut conn.join_handle).await;
        }
    }

    fn spawn_conn(&self, socket: TcpStream) {
        let id = self.conn_id.fetch_add(1, Ordering::Relaxed);
        let handler = ConnHandler {
            storage: self.storage.clone(),
            task_manager: self.task_manager.clone(),
            cancel: self.cancel.clone(),
        };
        let conns = self.conns.clone();
        let join_handle = tokio::spawn(async move {
            if let Err(e) = handler.serve(socket).await {
                debug!("连接处理结束: {}", e);
            }
            conns.remove(&id);
        });
        self.conns.insert(id, ConnInfo { join_handle });
    }
}

struct ConnHandler {
    storage: Arc<StorageManager>,
    task_manager: Arc<PeerTaskManager>,
    cancel: CancellationToken,
}

impl ConnHandler {
    async fn serve(&self, mut socket: TcpStream) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = read_frame(&mut socket) => frame?,
            };
            let Some((code, payload)) = frame else {
                return Ok(());
            };

            match code {
                codes::CHECK_HEALTH => {
                    write_frame(&mut socket, codes::EMPTY, &Empty {}).await?;
                }
                codes::GET_PIECE_TASKS => {
                    self.handle_get_piece_tasks(&mut socket, &payload).await?;
                }
                codes::DOWNLOAD_PIECE => {
                    self.handle_download_piece(&mut socket, &payload).await?;
                }
                codes::DOWNLOAD => {
                    self.handle_download(&mut socket, &payload).await?;
                }
                other => {
                    warn!("peer server 收到未知帧: {}", other);
                    reply_error(&mut socket, Code::ClientError, "unknown frame").await?;
                }
            }
        }
    }

    async fn handle_get_piece_tasks(
        &self,
        socket: &mut TcpStream,
        payload: &bytes::Bytes,
    ) -> Result<()> {
        let request: PieceTaskRequest = match decode(payload) {
            Ok(r) => r,
            Err(e) => return reply_error(socket, Code::ClientError, &e.to_string()).await,
        };
        if let Err(e) = request.validate() {
            return reply_error(socket, Code::ClientError, &e.to_string()).await;
        }
        match self.storage.get_pieces(&request) {
            Ok(packet) => write_frame(socket, codes::PIECE_PACKET, &packet).await,
            Err(e) => {
                debug!(
                    "问片失败 task: {} dst: {}: {}",
                    request.task_id, request.dst_pid, e
                );
                reply_error(socket, Code::PeerTaskNotFound, &e.to_string()).await
            }
        }
    }

    async fn handle_download_piece(
        &self,
        socket: &mut TcpStream,
        payload: &bytes::Bytes,
    ) -> Result<()> {
        let request: PieceDownloadRequest = match decode(payload) {
            Ok(r) => r,
            Err(e) => return reply_error(socket, Code::ClientError, &e.to_string()).await,
        };
        let meta = PeerTaskMetadata {
            task_id: request.task_id.clone(),
            peer_id: request.dst_pid.clone(),
        };
        match self.storage.read_piece_bytes(&meta, request.piece_num).await {
            Ok(data) => {
                write_frame(
                    socket,
                    codes::PIECE_CONTENT,
                    &PieceContent {
                        piece_num: request.piece_num,
                        data: data.to_vec(),
                    },
                )
                .await
            }
            Err(e) => {
                debug!(
                    "供片失败 task: {} piece: {}: {}",
                    request.task_id, request.piece_num, e
                );
                reply_error(socket, Code::PeerTaskNotFound, &e.to_string()).await
            }
        }
    }

    /// dfget 的下载入口，进度以 DownResult 帧流式回传
    async fn handle_download(&self, socket: &mut TcpStream, payload: &bytes::Bytes) -> Result<()> {
        let request: DownRequest = match decode(payload) {
            Ok(r) => r,
            Err(e) => return reply_error(socket, Code::ClientError, &e.to_string()).await,
        };
        if let Err(e) = request.validate() {
            return reply_error(socket, Code::ClientError, &e.to_string()).await;
        }

        let file_request = FileTaskRequest {
            url: request.url,
            output: PathBuf::from(request.output),
            url_meta: request.url_meta,
            pattern: request.pattern,
            limit: request.limit,
            disable_back_source: request.disable_back_source,
            callsystem: request.callsystem,
        };
        let mut progress = match self.task_manager.start_file_task(file_request).await {
            Ok(rx) => rx,
            Err(e) => return reply_error(socket, Code::ClientError, &e.to_string()).await,
        };

        while let Some(p) = progress.recv().await {
            let result = DownResult {
                task_id: p.task_id.clone(),
                peer_id: p.peer_id.clone(),
                completed_length: p.completed_length,
                done: p.done,
                code: p.state.code,
                msg: p.state.msg.clone(),
            };
            write_frame(socket, codes::DOWN_RESULT, &result).await?;
            if p.done {
                break;
            }
        }
        Ok(())
    }
}

async fn reply_error(socket: &mut TcpStream, code: Code, message: &str) -> Result<()> {
    write_frame(
        socket,
        codes::ERROR,
        &ErrorReply {
            code,
            message: message.to_string(),
        },
    )
    .await
}
