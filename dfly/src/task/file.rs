//! 文件任务消费者：转发进度，成功后把内容落到目标路径

use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::rpc::message::Code;
use crate::storage::StoreRequest;
use crate::task::broker::PieceNotice;
use crate::task::conductor::{PeerTaskConductor, TaskState};
use crate::task::{ProgressState, TaskProgress};

pub(crate) async fn run_file_task(
    conductor: PeerTaskConductor,
    mut piece_rx: mpsc::UnboundedReceiver<PieceNotice>,
    mut state_rx: watch::Receiver<TaskState>,
    output: PathBuf,
    progress_tx: mpsc::Sender<TaskProgress>,
) {
    // 广播结束前持续转发下载进度
    loop {
        match piece_rx.recv().await {
            Some(notice) if !notice.finished => {
                let progress = downloading_progress(&conductor);
                if progress_tx.send(progress).await.is_err() {
                    // 消费者不要进度了，安静等终态即可
                    debug!("任务 [{}] 进度消费者已离开", conductor.get_task_id());
                    break;
                }
            }
            _ => break,
        }
    }

    // 等 conductor 终局
    while !state_rx.borrow().is_terminal() {
        if state_rx.changed().await.is_err() {
            break;
        }
    }

    let final_progress = match conductor.state() {
        TaskState::Success => {
            match conductor
                .storage()
                .store(&StoreRequest {
                    meta: conductor.storage_meta(),
                    destination: output,
                    metadata_only: false,
                })
                .await
            {
                Ok(_) => done_progress(
                    &conductor,
                    ProgressState {
                        success: true,
                        code: Code::Success,
                        msg: "done".to_string(),
                    },
                ),
                Err(e) => {
                    warn!("任务 [{}] 落位失败: {}", conductor.get_task_id(), e);
                    done_progress(
                        &conductor,
                        ProgressState {
                            success: false,
                            code: Code::ClientError,
                            msg: format!("落位失败: {}", e),
                        },
                    )
                }
            }
        }
        TaskState::Failed { code, msg } => done_progress(
            &conductor,
            ProgressState {
                success: false,
                code,
                msg,
            },
        ),
        other => done_progress(
            &conductor,
            ProgressState {
                success: false,
                code: Code::ClientError,
                msg: format!("conductor 非正常退出: {:?}", other),
            },
        ),
    };
    let _ = progress_tx.send(final_progress).await;
}

fn downloading_progress(conductor: &PeerTaskConductor) -> TaskProgress {
    TaskProgress {
        state: ProgressState {
            success: true,
            code: Code::Success,
            msg: "downloading".to_string(),
        },
        task_id: conductor.get_task_id().to_string(),
        peer_id: conductor.get_peer_id().to_string(),
        content_length: conductor.get_content_length(),
        completed_length: conductor.get_completed_length(),
        done: false,
    }
}

fn done_progress(conductor: &PeerTaskConductor, state: ProgressState) -> TaskProgress {
    TaskProgress {
        state,
        task_id: conductor.get_task_id().to_string(),
        peer_id: conductor.get_peer_id().to_string(),
        content_length: conductor.get_content_length(),
        completed_length: conductor.get_completed_length(),
        done: true,
    }
}
