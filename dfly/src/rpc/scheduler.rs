//! 调度器客户端。
//! 注册 / 上报走一元交互；Normal 任务在注册连接上转成双向流：
//! 上行 PieceResult，下行 PeerPacket。流断了由 conductor 负责迁移重连

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::message::{
    ErrorReply, PeerPacket, PeerResult, PeerTarget, PeerTaskRequest, RegisterResult,
};
use crate::rpc::{codes, decode, read_frame, write_frame};

/// 流内部的 channel 容量，顺带起到对调度器的背压作用
const STREAM_BUFFER: usize = 64;

pub struct SchedulerClient {
    /// 调度器副本地址
    addrs: Vec<SocketAddr>,

    /// 轮询游标
    next: AtomicUsize,

    /// 一元交互超时
    rpc_timeout: Duration,
}

impl SchedulerClient {
    pub fn new(addrs: Vec<SocketAddr>, rpc_timeout: Duration) -> Self {
        Self {
            addrs,
            next: AtomicUsize::new(0),
            rpc_timeout,
        }
    }

    /// 轮询副本建连，全部失败才报错
    async fn connect(&self) -> Result<TcpStream> {
        if self.addrs.is_empty() {
            return Err(anyhow!("没有配置调度器地址"));
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.addrs.len() {
            let addr = self.addrs[(start + i) % self.addrs.len()];
            match timeout(self.rpc_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => warn!("连接调度器 [{}] 失败: {}", addr, e),
                Err(_) => warn!("连接调度器 [{}] 超时", addr),
            }
        }
        Err(anyhow!("所有调度器副本都连不上"))
    }

    /// 注册任务。返回的 Registration 持有这条连接，
    /// Normal 任务用它继续开双向流
    pub async fn register_peer_task(&self, request: &PeerTaskRequest) -> Result<Registration> {
        request.validate()?;
        let mut conn = self.connect().await?;
        write_frame(&mut conn, codes::REGISTER, request).await?;

        let frame = timeout(self.rpc_timeout, read_frame(&mut conn))
            .await
            .map_err(|_| anyhow!("等待注册响应超时"))??;
        match frame {
            Some((codes::REGISTER_RESULT, payload)) => {
                let result: RegisterResult = decode(&payload)?;
                Ok(Registration { result, conn })
            }
            Some((codes::ERROR, payload)) => {
                let reply: ErrorReply = decode(&payload)?;
                Err(anyhow!("注册被拒绝 [{:?}]: {}", reply.code, reply.message))
            }
            Some((code, _)) => Err(anyhow!("注册响应帧类型不对: {}", code)),
            None => Err(anyhow!("注册时调度器关闭了连接")),
        }
    }

    pub async fn report_peer_result(&self, result: &PeerResult) -> Result<()> {
        self.unary(codes::PEER_RESULT, result).await
    }

    pub async fn leave_task(&self, target: &PeerTarget) -> Result<()> {
        self.unary(codes::LEAVE_TASK, target).await
    }

    async fn unary<T: serde::Serialize>(&self, code: u32, msg: &T) -> Result<()> {
        let mut conn = self.connect().await?;
        write_frame(&mut conn, code, msg).await?;
        let frame = timeout(self.rpc_timeout, read_frame(&mut conn))
            .await
            .map_err(|_| anyhow!("等待调度器响应超时"))??;
        match frame {
            Some((codes::EMPTY, _)) => Ok(()),
            Some((codes::ERROR, payload)) => {
                let reply: ErrorReply = decode(&payload)?;
                Err(anyhow!("调度器返回错误 [{:?}]: {}", reply.code, reply.message))
            }
            Some((c, _)) => Err(anyhow!("响应帧类型不对: {}", c)),
            None => Err(anyhow!("调度器关闭了连接")),
        }
    }
}

pub struct Registration {
    pub result: RegisterResult,
    conn: TcpStream,
}

impl Registration {
    /// 把注册连接升级成双向流
    pub fn into_stream(self, cancel: CancellationToken) -> SchedulerStream {
        SchedulerStream::spawn(self.conn, cancel)
    }
}

/// 双向流的本端把手。send / recv 背后各是一个长驻任务
pub struct SchedulerStream {
    result_tx: mpsc::Sender<crate::rpc::message::PieceResult>,
    packet_rx: mpsc::Receiver<PeerPacket>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerStream {
    fn spawn(conn: TcpStream, cancel: CancellationToken) -> Self {
        let (mut read_half, mut write_half) = conn.into_split();
        let (result_tx, mut result_rx) =
            mpsc::channel::<crate::rpc::message::PieceResult>(STREAM_BUFFER);
        let (packet_tx, packet_rx) = mpsc::channel::<PeerPacket>(STREAM_BUFFER);

        let send_cancel = cancel.clone();
        let sender = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    result = result_rx.recv() => {
                        let Some(result) = result else { break };
                        if let Err(e) = write_frame(&mut write_half, codes::PIECE_RESULT, &result).await {
                            debug!("上报分片结果失败，流已断开: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let receiver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = read_frame(&mut read_half) => {
                        match frame {
                            Ok(Some((codes::PEER_PACKET, payload))) => {
                                match decode::<PeerPacket>(&payload) {
                                    Ok(packet) => {
                                        if packet_tx.send(packet).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("解析 PeerPacket 失败: {}", e);
                                        break;
                                    }
                                }
                            }
                            Ok(Some((code, _))) => {
                                warn!("调度流上出现意外帧: {}", code);
                            }
                            Ok(None) => {
                                debug!("调度器关闭了流");
                                break;
                            }
                            Err(e) => {
                                debug!("调度流读取失败: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            result_tx,
            packet_rx,
            handles: vec![sender, receiver],
        }
    }

    /// 上报一条分片结果。流断开时报错，由调用方走迁移
    pub async fn send(&self, result: crate::rpc::message::PieceResult) -> Result<()> {
        self.result_tx
            .send(result)
            .await
            .map_err(|_| anyhow!("调度流已断开"))
    }

    pub fn sender(&self) -> mpsc::Sender<crate::rpc::message::PieceResult> {
        self.result_tx.clone()
    }

    /// 收下一个调度包。流断开返回 None
    pub async fn recv(&mut self) -> Option<PeerPacket> {
        self.packet_rx.recv().await
    }

    pub async fn close(mut self) {
        for handle in self.handles.iter_mut() {
            dfly_util::sync::wait_join_handle_close(handle).await;
        }
    }
}

impl Drop for SchedulerStream {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
