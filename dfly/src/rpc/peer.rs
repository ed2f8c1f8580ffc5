//! 对端 daemon 的客户端。每次交互一条连接，用完即走

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::rpc::message::{
    Code, Empty, ErrorReply, PieceContent, PieceDownloadRequest, PiecePacket, PieceTaskRequest,
};
use crate::rpc::{codes, decode, read_frame, write_frame};

/// 对端以 ErrorReply 拒绝请求
#[derive(Debug)]
pub struct PeerReplyError {
    pub code: Code,
    pub message: String,
}

impl std::fmt::Display for PeerReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "peer replied [{:?}]: {}", self.code, self.message)
    }
}

impl std::error::Error for PeerReplyError {}

/// 问对端有哪些分片可取
pub async fn get_piece_tasks(
    addr: SocketAddr,
    request: &PieceTaskRequest,
    deadline: Duration,
) -> Result<PiecePacket> {
    request.validate()?;
    timeout(deadline, async {
        let mut conn = TcpStream::connect(addr).await?;
        write_frame(&mut conn, codes::GET_PIECE_TASKS, request).await?;
        match read_frame(&mut conn).await? {
            Some((codes::PIECE_PACKET, payload)) => Ok(decode::<PiecePacket>(&payload)?),
            Some((codes::ERROR, payload)) => {
                let reply: ErrorReply = decode(&payload)?;
                Err(PeerReplyError {
                    code: reply.code,
                    message: reply.message,
                }
                .into())
            }
            Some((code, _)) => Err(anyhow!("意外的响应帧: {}", code)),
            None => Err(anyhow!("对端 [{}] 关闭了连接", addr)),
        }
    })
    .await
    .map_err(|_| anyhow!("向 [{}] 询问分片超时", addr))?
}

/// 从对端拉一个分片的数据
pub async fn download_piece(
    addr: SocketAddr,
    request: &PieceDownloadRequest,
    deadline: Duration,
) -> Result<Vec<u8>> {
    timeout(deadline, async {
        let mut conn = TcpStream::connect(addr).await?;
        write_frame(&mut conn, codes::DOWNLOAD_PIECE, request).await?;
        match read_frame(&mut conn).await? {
            Some((codes::PIECE_CONTENT, payload)) => {
                let content: PieceContent = decode(&payload)?;
                if content.piece_num != request.piece_num {
                    return Err(anyhow!(
                        "对端答非所问: 要 {} 给 {}",
                        request.piece_num,
                        content.piece_num
                    ));
                }
                Ok(content.data)
            }
            Some((codes::ERROR, payload)) => {
                let reply: ErrorReply = decode(&payload)?;
                Err(PeerReplyError {
                    code: reply.code,
                    message: reply.message,
                }
                .into())
            }
            Some((code, _)) => Err(anyhow!("意外的响应帧: {}", code)),
            None => Err(anyhow!("对端 [{}] 关闭了连接", addr)),
        }
    })
    .await
    .map_err(|_| anyhow!("从 [{}] 拉分片超时", addr))?
}

/// 健康探测
pub async fn check_health(addr: SocketAddr, deadline: Duration) -> Result<()> {
    timeout(deadline, async {
        let mut conn = TcpStream::connect(addr).await?;
        write_frame(&mut conn, codes::CHECK_HEALTH, &Empty {}).await?;
        match read_frame(&mut conn).await? {
            Some((codes::EMPTY, _)) => Ok(()),
            _ => Err(anyhow!("健康检查响应不对")),
        }
    })
    .await
    .map_err(|_| anyhow!("健康检查 [{}] 超时", addr))?
}
