//! 与调度器 / 对端 daemon 往来的消息定义。
//! 字段布局是线上契约，改动要同时动两端

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// 合法的 peer 端口区间
pub const PORT_MIN: u16 = 1024;
pub const PORT_MAX: u16 = 65534;

/// 结果码。分组沿用原始实现：200 成功，4xxx 本端，
/// 5xxx 调度器，6xxx 远端 peer / CDN，7xxx 回源
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Code {
    Success = 200,

    ClientError = 4000,
    ClientPieceRequestFail = 4001,
    ClientScheduleTimeout = 4002,
    ClientContextCanceled = 4003,
    ClientWaitPieceReady = 4004,
    ClientPieceDownloadFail = 4005,

    SchedError = 5000,
    SchedNeedBackSource = 5001,
    SchedPeerGone = 5002,
    SchedPeerNotFound = 5004,

    CdnError = 6000,
    CdnTaskNotFound = 6001,
    CdnTaskDownloadFail = 6002,
    PeerTaskNotFound = 6404,

    BackToSourceFailed = 7001,
}

impl Code {
    pub fn is_success(&self) -> bool {
        *self == Code::Success
    }
}

/// 注册响应里的任务规模
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SizeScope {
    /// 极小文件，内容直接内联在注册响应里
    Tiny,

    /// 单分片文件，响应里指明去哪个 peer 拿
    Small,

    /// 正常走调度流
    Normal,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum PieceStyle {
    #[default]
    Plain,

    /// 末分片标记。源长度未知时靠它敲定总分片数
    Last,
}

/// 下载模式
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    #[default]
    P2p,
    Cdn,
    Source,
}

impl std::str::FromStr for Pattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p2p" => Ok(Pattern::P2p),
            "cdn" => Ok(Pattern::Cdn),
            "source" => Ok(Pattern::Source),
            other => Err(anyhow!("unknown pattern: {}", other)),
        }
    }
}

/// 资源元信息，参与 task_id 推导
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UrlMeta {
    /// 期望的整体摘要，形如 "md5:HEX"，可为空
    pub digest: String,

    /// 业务标记，不同 tag 不共享任务
    pub tag: String,

    /// 字节范围，形如 "0-1023"，可为空
    pub range: String,

    /// 推导 task_id 时要剔除的查询参数名，逗号分隔
    pub filter: String,

    /// 回源时带上的请求头
    pub header: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerHost {
    pub ip: String,
    pub port: u16,
}

/// 注册请求
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerTaskRequest {
    pub url: String,
    pub url_meta: UrlMeta,
    pub peer_id: String,
    pub peer_host: PeerHost,

    /// 调度流迁移重注册时置真
    pub is_migrating: bool,
}

impl PeerTaskRequest {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url).map_err(|e| anyhow!("非法 url [{}]: {}", self.url, e))?;
        if self.peer_id.is_empty() {
            return Err(anyhow!("peer_id 不能为空"));
        }
        self.peer_host
            .ip
            .parse::<std::net::IpAddr>()
            .map_err(|e| anyhow!("非法 peer ip [{}]: {}", self.peer_host.ip, e))?;
        if self.peer_host.port < PORT_MIN || self.peer_host.port > PORT_MAX {
            return Err(anyhow!("peer 端口越界: {}", self.peer_host.port));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub piece_num: i32,
    pub range_start: u64,
    pub range_size: u32,
    pub piece_md5: String,
    pub piece_offset: u64,
    pub piece_style: PieceStyle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinglePiece {
    pub dst_pid: String,
    pub dst_addr: SocketAddr,
    pub piece_info: PieceInfo,
}

/// 注册响应中的直传内容
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectPiece {
    /// Small：去指定 peer 拿这一个分片
    SinglePiece(SinglePiece),

    /// Tiny：内容直接内联
    PieceContent(Vec<u8>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResult {
    pub task_id: String,
    pub size_scope: SizeScope,
    pub direct_piece: Option<DirectPiece>,
}

/// 每次分片尝试（无论成败）都要上报一条
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceResult {
    pub task_id: String,
    pub src_pid: String,
    pub dst_pid: String,
    pub piece_info: Option<PieceInfo>,
    pub begin_time: u64,
    pub end_time: u64,
    pub success: bool,
    pub code: Code,

    /// 成功时是累计完成数，整体尝试失败时为 -1
    pub finished_count: i32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DestPeer {
    pub peer_id: String,
    pub addr: SocketAddr,
}

/// 调度器下发的候选集。后到的包整体取代先到的
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerPacket {
    pub task_id: String,
    pub src_pid: String,
    pub parallel_count: i32,
    pub main_peer: Option<DestPeer>,
    pub steal_peers: Vec<DestPeer>,
    pub code: Code,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerResult {
    pub task_id: String,
    pub peer_id: String,
    pub src_ip: String,
    pub url: String,
    pub success: bool,
    pub code: Code,
    pub total_piece_count: i32,
    pub content_length: i64,

    /// 本次任务实际传输的字节数
    pub traffic: u64,

    /// 耗时（毫秒）
    pub cost: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerTarget {
    pub task_id: String,
    pub peer_id: String,
}

// ===========================================================================
// daemon 间 / dfget 的消息
// ===========================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceTaskRequest {
    pub task_id: String,
    pub src_pid: String,
    pub dst_pid: String,

    /// 从这个分片号开始
    pub start_num: u32,

    /// 最多返回多少个
    pub limit: u32,
}

impl PieceTaskRequest {
    pub fn validate(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(anyhow!("task_id 不能为空"));
        }
        if self.dst_pid.is_empty() {
            return Err(anyhow!("dst_pid 不能为空"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PiecePacket {
    pub task_id: String,
    pub dst_pid: String,
    pub piece_infos: Vec<PieceInfo>,
    pub total_piece: i32,
    pub content_length: i64,
    pub piece_md5_sign: String,
}

/// 向对端要一个分片的数据
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceDownloadRequest {
    pub task_id: String,

    /// 对端的 peer id，用来定位它的本地存储
    pub dst_pid: String,

    pub piece_num: i32,
    pub range_start: u64,
    pub range_size: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceContent {
    pub piece_num: i32,
    pub data: Vec<u8>,
}

/// dfget 发给本机 daemon 的下载请求
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownRequest {
    pub url: String,
    pub output: String,
    pub url_meta: UrlMeta,
    pub pattern: Pattern,

    /// 单任务限速（字节/秒），0 不限
    pub limit: u64,

    pub disable_back_source: bool,
    pub callsystem: String,
}

impl DownRequest {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url).map_err(|e| anyhow!("非法 url [{}]: {}", self.url, e))?;
        if self.output.is_empty() {
            return Err(anyhow!("output 不能为空"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownResult {
    pub task_id: String,
    pub peer_id: String,
    pub completed_length: u64,
    pub done: bool,
    pub code: Code,
    pub msg: String,
}

/// 一元交互的错误回复
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: Code,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_task_request_validate() {
        let mut req = PeerTaskRequest {
            url: "http://example.com/blob".to_string(),
            url_meta: UrlMeta::default(),
            peer_id: "peer-1".to_string(),
            peer_host: PeerHost {
                ip: "127.0.0.1".to_string(),
                port: 65001,
            },
            is_migrating: false,
        };
        assert!(req.validate().is_ok());

        req.peer_host.port = 80;
        assert!(req.validate().is_err());
        req.peer_host.port = 65001;

        req.peer_id.clear();
        assert!(req.validate().is_err());
        req.peer_id = "peer-1".to_string();

        req.url = "not a url".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!("p2p".parse::<Pattern>().unwrap(), Pattern::P2p);
        assert_eq!("source".parse::<Pattern>().unwrap(), Pattern::Source);
        assert!("torrent".parse::<Pattern>().is_err());
    }

    #[test]
    fn test_message_roundtrip() {
        let packet = PeerPacket {
            task_id: "t".to_string(),
            src_pid: "p".to_string(),
            parallel_count: 4,
            main_peer: Some(DestPeer {
                peer_id: "main".to_string(),
                addr: "127.0.0.1:65002".parse().unwrap(),
            }),
            steal_peers: vec![],
            code: Code::Success,
        };
        let data = bincode::serialize(&packet).unwrap();
        let back: PeerPacket = bincode::deserialize(&data).unwrap();
        assert_eq!(back.parallel_count, 4);
        assert_eq!(back.main_peer.unwrap().peer_id, "main");
    }
}
