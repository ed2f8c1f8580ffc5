use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dfly_util::digest::md5_hex;
use dfly_util::limit::RateLimiter;
use dfly_util::sync::MutexExt;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::StoreStrategy;
use crate::rpc::message::{ErrorReply, PieceDownloadRequest, UrlMeta};
use crate::rpc::{codes, decode, read_frame, write_frame};
use crate::storage::{
    PeerTaskMetadata, RegisterTaskRequest, StorageManager, StorageOption,
};

// ===========================================================================
// 测试桩
// ===========================================================================

struct MockPieceTask {
    task_id: String,
    peer_id: String,
    content_length: AtomicI64,
    total_pieces: AtomicI32,
    traffic: AtomicU64,
    published: Mutex<Vec<(i32, u32)>>,
    reported: Mutex<Vec<(String, bool, Code)>>,
    cancel: CancellationToken,
    limiter: RateLimiter,
}

impl MockPieceTask {
    fn new(task_id: &str, peer_id: &str) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.to_string(),
            peer_id: peer_id.to_string(),
            content_length: AtomicI64::new(-1),
            total_pieces: AtomicI32::new(-1),
            traffic: AtomicU64::new(0),
            published: Mutex::new(Vec::new()),
            reported: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            limiter: RateLimiter::unlimited(),
        })
    }
}

#[async_trait]
impl PieceTask for MockPieceTask {
    fn task_id(&self) -> String {
        self.task_id.clone()
    }

    fn peer_id(&self) -> String {
        self.peer_id.clone()
    }

    fn set_content_length(&self, length: i64) {
        self.content_length.store(length, Ordering::SeqCst);
    }

    fn set_total_pieces(&self, total: i32) {
        self.total_pieces.store(total, Ordering::SeqCst);
    }

    fn total_pieces(&self) -> i32 {
        self.total_pieces.load(Ordering::SeqCst)
    }

    fn add_traffic(&self, bytes: u64) {
        self.traffic.fetch_add(bytes, Ordering::SeqCst);
    }

    fn publish_piece_info(&self, piece_num: i32, size: u32) {
        self.published.lock_pe().push((piece_num, size));
    }

    async fn report_piece_result(
        &self,
        _piece: &PieceInfo,
        dst_pid: &str,
        _begin_time: u64,
        _end_time: u64,
        success: bool,
        code: Code,
    ) {
        self.reported
            .lock_pe()
            .push((dst_pid.to_string(), success, code));
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn rate_limiter(&self) -> RateLimiter {
        self.limiter.clone()
    }
}

/// 极简 http 源站：返回固定内容，可选 Content-Length
async fn spawn_http_source(body: Vec<u8>, with_length: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let header = if with_length {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                } else {
                    "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string()
                };
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// 假对端 daemon：按 piece_num 供片，fail 为真时一律报错
async fn spawn_mock_peer(pieces: HashMap<i32, Vec<u8>>, fail: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let pieces = pieces.clone();
            tokio::spawn(async move {
                while let Ok(Some((code, payload))) = read_frame(&mut socket).await {
                    if code != codes::DOWNLOAD_PIECE {
                        break;
                    }
                    let request: PieceDownloadRequest = decode(&payload).unwrap();
                    if fail {
                        let _ = write_frame(
                            &mut socket,
                            codes::ERROR,
                            &ErrorReply {
                                code: Code::CdnTaskDownloadFail,
                                message: "boom".to_string(),
                            },
                        )
                        .await;
                        continue;
                    }
                    match pieces.get(&request.piece_num) {
                        Some(data) => {
                            let _ = write_frame(
                                &mut socket,
                                codes::PIECE_CONTENT,
                                &crate::rpc::message::PieceContent {
                                    piece_num: request.piece_num,
                                    data: data.clone(),
                                },
                            )
                            .await;
                        }
                        None => {
                            let _ = write_frame(
                                &mut socket,
                                codes::ERROR,
                                &ErrorReply {
                                    code: Code::PeerTaskNotFound,
                                    message: "no piece".to_string(),
                                },
                            )
                            .await;
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn new_storage(dir: &std::path::Path) -> Arc<StorageManager> {
    StorageManager::new(StorageOption {
        data_dir: dir.to_path_buf(),
        store_strategy: StoreStrategy::Simple,
        task_expire_time: Duration::from_secs(3600),
        gc_interval: Duration::from_secs(60),
        disk_gc_threshold: 0,
        disk_gc_threshold_percent: 0.0,
    })
    .await
    .unwrap()
}

fn new_piece_manager(storage: Arc<StorageManager>) -> PieceManager {
    let mut manager = PieceManager::new(
        storage,
        crate::source::SourceRegistry::with_http(),
        RateLimiter::unlimited(),
        Duration::from_secs(30),
    );
    // 测试用小分片
    manager.set_compute_piece_size(|_| 1024);
    manager
}

fn source_request(url: String, digest: String) -> PeerTaskRequest {
    PeerTaskRequest {
        url,
        url_meta: UrlMeta {
            digest,
            ..Default::default()
        },
        peer_id: "peer0".to_string(),
        peer_host: crate::rpc::message::PeerHost {
            ip: "127.0.0.1".to_string(),
            port: 65001,
        },
        is_migrating: false,
    }
}

async fn register_task(storage: &StorageManager, task: &MockPieceTask) {
    storage
        .register_task(RegisterTaskRequest {
            meta: PeerTaskMetadata {
                task_id: task.task_id.clone(),
                peer_id: task.peer_id.clone(),
            },
            destination: None,
            content_length: -1,
            total_pieces: -1,
            piece_md5_sign: String::new(),
        })
        .await
        .unwrap();
}

// ===========================================================================
// compute_piece_size
// ===========================================================================

#[test]
fn test_compute_piece_size() {
    // 未知长度固定 4MiB
    assert_eq!(compute_piece_size(-1), MIN_PIECE_SIZE as u32);
    assert_eq!(compute_piece_size(0), MIN_PIECE_SIZE as u32);
    // 小文件夹到下限
    assert_eq!(compute_piece_size(100 << 20), MIN_PIECE_SIZE as u32);
    // 600MiB / 100 = 6MiB -> 上取整 8MiB
    assert_eq!(compute_piece_size(600 << 20), 8 << 20);
    // 大文件夹到上限
    assert_eq!(compute_piece_size(10 << 30), MAX_PIECE_SIZE as u32);
}

#[test]
fn test_total_pieces_of() {
    assert_eq!(total_pieces_of(0, 1024), 0);
    assert_eq!(total_pieces_of(1, 1024), 1);
    assert_eq!(total_pieces_of(1024, 1024), 1);
    assert_eq!(total_pieces_of(1025, 1024), 2);
}

// ===========================================================================
// download_source（对照原始实现的测试矩阵）
// ===========================================================================

async fn run_download_source_case(size: usize, with_length: bool, check_digest: bool) {
    let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let digest = if check_digest {
        format!("md5:{}", md5_hex(&body))
    } else {
        String::new()
    };

    let dir = tempdir().unwrap();
    let storage = new_storage(dir.path()).await;
    let manager = new_piece_manager(storage.clone());
    let task = MockPieceTask::new("task0", "peer0");
    register_task(&storage, &task).await;

    let addr = spawn_http_source(body.clone(), with_length).await;
    let request = source_request(format!("http://{}/blob", addr), digest);

    let bytes = manager
        .download_source(task.as_ref(), &request)
        .await
        .unwrap();
    assert_eq!(bytes as usize, size);

    let expected_pieces = body.len().div_ceil(1024).max(0);
    assert_eq!(task.total_pieces(), expected_pieces as i32);
    assert_eq!(task.content_length.load(Ordering::SeqCst), size as i64);
    assert_eq!(task.published.lock_pe().len(), expected_pieces);
    assert_eq!(task.traffic.load(Ordering::SeqCst), size as u64);

    // 落位后内容逐字节一致
    let meta = PeerTaskMetadata {
        task_id: "task0".to_string(),
        peer_id: "peer0".to_string(),
    };
    storage.load_task(&meta).unwrap().mark_done().await.unwrap();
    let mut reader = storage.read_all_pieces(&meta).await.unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await.unwrap();
    content.truncate(size);
    assert_eq!(content, body);
}

#[tokio::test]
async fn test_download_source_multi_piece_with_length_and_digest() {
    run_download_source_case(4000, true, true).await;
}

#[tokio::test]
async fn test_download_source_multi_piece_without_length() {
    run_download_source_case(4000, false, false).await;
}

#[tokio::test]
async fn test_download_source_single_piece_exact() {
    run_download_source_case(1024, true, true).await;
}

#[tokio::test]
async fn test_download_source_smaller_than_piece() {
    run_download_source_case(100, false, true).await;
}

#[tokio::test]
async fn test_download_source_zero_byte() {
    run_download_source_case(0, true, false).await;
}

#[tokio::test]
async fn test_download_source_digest_mismatch() {
    let body = b"hello world\n".to_vec();
    let dir = tempdir().unwrap();
    let storage = new_storage(dir.path()).await;
    let manager = new_piece_manager(storage.clone());
    let task = MockPieceTask::new("task0", "peer0");
    register_task(&storage, &task).await;

    let addr = spawn_http_source(body, true).await;
    let request = source_request(
        format!("http://{}/blob", addr),
        format!("md5:{}", md5_hex(b"not the body")),
    );

    assert!(manager.download_source(task.as_ref(), &request).await.is_err());
    let meta = PeerTaskMetadata {
        task_id: "task0".to_string(),
        peer_id: "peer0".to_string(),
    };
    assert!(storage.is_invalid(&meta).unwrap());
}

// ===========================================================================
// download_piece：候选回退
// ===========================================================================

#[tokio::test]
async fn test_download_piece_falls_back_to_next_candidate() {
    let data = b"piece-0-data".to_vec();
    let mut pieces = HashMap::new();
    pieces.insert(0, data.clone());

    let bad = spawn_mock_peer(HashMap::new(), true).await;
    let good = spawn_mock_peer(pieces, false).await;

    let dir = tempdir().unwrap();
    let storage = new_storage(dir.path()).await;
    let manager = new_piece_manager(storage.clone());
    let task = MockPieceTask::new("task0", "peer0");
    register_task(&storage, &task).await;

    let piece = PieceInfo {
        piece_num: 0,
        range_start: 0,
        range_size: data.len() as u32,
        piece_md5: md5_hex(&data),
        piece_offset: 0,
        piece_style: PieceStyle::Plain,
    };
    let result = manager
        .download_piece(
            task.as_ref(),
            &DownloadPieceRequest {
                piece: piece.clone(),
                candidates: vec![
                    DestPeer {
                        peer_id: "bad-peer".to_string(),
                        addr: bad,
                    },
                    DestPeer {
                        peer_id: "good-peer".to_string(),
                        addr: good,
                    },
                ],
            },
        )
        .await
        .unwrap();
    assert_eq!(result.dst_pid, "good-peer");
    assert_eq!(result.size as usize, data.len());

    // 上报里只有一条成功，目标是 good-peer
    let reported = task.reported.lock_pe().clone();
    assert_eq!(reported, vec![("good-peer".to_string(), true, Code::Success)]);
    assert_eq!(task.published.lock_pe().clone(), vec![(0, data.len() as u32)]);
}

#[tokio::test]
async fn test_download_piece_all_candidates_failed() {
    let bad_a = spawn_mock_peer(HashMap::new(), true).await;
    let bad_b = spawn_mock_peer(HashMap::new(), true).await;

    let dir = tempdir().unwrap();
    let storage = new_storage(dir.path()).await;
    let manager = new_piece_manager(storage.clone());
    let task = MockPieceTask::new("task0", "peer0");
    register_task(&storage, &task).await;

    let data = b"whatever".to_vec();
    let piece = PieceInfo {
        piece_num: 0,
        range_start: 0,
        range_size: data.len() as u32,
        piece_md5: md5_hex(&data),
        piece_offset: 0,
        piece_style: PieceStyle::Plain,
    };
    let result = manager
        .download_piece(
            task.as_ref(),
            &DownloadPieceRequest {
                piece,
                candidates: vec![
                    DestPeer {
                        peer_id: "a".to_string(),
                        addr: bad_a,
                    },
                    DestPeer {
                        peer_id: "b".to_string(),
                        addr: bad_b,
                    },
                ],
            },
        )
        .await;
    assert!(matches!(result, Err(DownloadPieceError::AllCandidatesFailed)));

    // 失败也要上报，且没有发布事件
    let reported = task.reported.lock_pe().clone();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].1, false);
    assert!(task.published.lock_pe().is_empty());
}
