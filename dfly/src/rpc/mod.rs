//! 线上通信的帧编解码。
//! 帧格式：code(4 字节大端) + length(4 字节大端) + bincode 负载

pub mod message;
pub mod peer;
pub mod scheduler;
pub mod server;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// code 字段占用字节数
pub const CODE_SIZE: usize = 4;

/// length 字段占用字节数
pub const LENGTH_SIZE: usize = 4;

/// 单帧上限。分片最大 16MiB，留出元数据余量
pub const FRAME_LIMIT: usize = 24 << 20;

/// 帧 code 定义
pub mod codes {
    // 调度协议
    pub const REGISTER: u32 = 10;
    pub const REGISTER_RESULT: u32 = 11;
    pub const PIECE_RESULT: u32 = 12;
    pub const PEER_PACKET: u32 = 13;
    pub const PEER_RESULT: u32 = 14;
    pub const LEAVE_TASK: u32 = 15;
    pub const EMPTY: u32 = 16;
    pub const ERROR: u32 = 17;

    // daemon 协议
    pub const DOWNLOAD: u32 = 20;
    pub const DOWN_RESULT: u32 = 21;
    pub const GET_PIECE_TASKS: u32 = 22;
    pub const PIECE_PACKET: u32 = 23;
    pub const DOWNLOAD_PIECE: u32 = 24;
    pub const PIECE_CONTENT: u32 = 25;
    pub const CHECK_HEALTH: u32 = 26;
}

/// 写出一帧
pub async fn write_frame<W, T>(writer: &mut W, code: u32, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg)?;
    if payload.len() > FRAME_LIMIT {
        return Err(anyhow!("帧超限: {} bytes", payload.len()));
    }

    let mut packet = Vec::with_capacity(CODE_SIZE + LENGTH_SIZE + payload.len());
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    packet.extend_from_slice(&payload);
    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}

/// 读入一帧。对端干净关闭时返回 None
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(u32, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; CODE_SIZE + LENGTH_SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let code = u32::from_be_bytes(head[..CODE_SIZE].try_into().unwrap());
    let length = u32::from_be_bytes(head[CODE_SIZE..].try_into().unwrap()) as usize;
    if length > FRAME_LIMIT {
        return Err(anyhow!("帧超限: {} bytes", length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some((code, Bytes::from(payload))))
}

/// 解出帧负载
pub fn decode<T: DeserializeOwned>(payload: &Bytes) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}
