//! 流式任务消费者：分片乱序完成，这里按序拼回一个 reader。
//! 只有连续就绪的前缀才会被写出

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::task::broker::PieceNotice;
use crate::task::conductor::{PeerTaskConductor, TaskState};

/// 流式拼装的管道缓冲
const STREAM_PIPE_BUFFER: usize = 256 * 1024;

/// 起一个拼装线程，返回读端
pub(crate) fn spawn_stream_writer(
    conductor: PeerTaskConductor,
    piece_rx: mpsc::UnboundedReceiver<PieceNotice>,
    state_rx: watch::Receiver<TaskState>,
) -> Box<dyn AsyncRead + Send + Unpin> {
    let (reader, writer) = tokio::io::duplex(STREAM_PIPE_BUFFER);
    tokio::spawn(run_stream_writer(conductor, piece_rx, state_rx, writer));
    Box::new(reader)
}

async fn run_stream_writer(
    conductor: PeerTaskConductor,
    mut piece_rx: mpsc::UnboundedReceiver<PieceNotice>,
    mut state_rx: watch::Receiver<TaskState>,
    mut writer: DuplexStream,
) {
    let mut next: i32 = 0;

    loop {
        match piece_rx.recv().await {
            Some(notice) if !notice.finished => {
                if flush_ready(&conductor, &mut next, &mut writer).await.is_err() {
                    // 读端走了，没必要继续拼
                    debug!("流式任务 [{}] 读端已关闭", conductor.get_task_id());
                    return;
                }
            }
            _ => break,
        }
    }

    while !state_rx.borrow().is_terminal() {
        if state_rx.changed().await.is_err() {
            break;
        }
    }

    if conductor.state().is_success() {
        // 把尾巴上的分片补完
        let total = conductor.get_total_pieces();
        while next < total {
            if flush_ready(&conductor, &mut next, &mut writer).await.is_err() {
                return;
            }
        }
        let _ = writer.shutdown().await;
    } else {
        // 失败：直接丢掉写端，读端会在预期长度前碰到 EOF
        warn!("流式任务 [{}] 非正常结束, 提前断流", conductor.get_task_id());
    }
}

/// 把已就绪的连续分片写给读端。分片还没好就先返回
async fn flush_ready(
    conductor: &PeerTaskConductor,
    next: &mut i32,
    writer: &mut DuplexStream,
) -> std::io::Result<()> {
    let meta = conductor.storage_meta();
    loop {
        match conductor.storage().read_piece(&meta, *next).await {
            Ok((file, piece)) => {
                let mut reader = file.take(piece.range_size as u64);
                tokio::io::copy(&mut reader, writer).await?;
                *next += 1;
            }
            Err(crate::storage::Error::PieceNotFound(_)) => return Ok(()),
            Err(e) => {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
            }
        }
    }
}
