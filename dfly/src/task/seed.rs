//! 种子任务消费者：只为预热本地存储，不交付内容

use tokio::sync::{mpsc, watch};

use crate::rpc::message::Code;
use crate::task::broker::PieceNotice;
use crate::task::conductor::{PeerTaskConductor, TaskState};
use crate::task::{ProgressState, TaskProgress};

pub(crate) async fn run_seed_task(
    conductor: PeerTaskConductor,
    mut piece_rx: mpsc::UnboundedReceiver<PieceNotice>,
    mut state_rx: watch::Receiver<TaskState>,
    progress_tx: mpsc::Sender<TaskProgress>,
) {
    loop {
        match piece_rx.recv().await {
            Some(notice) if !notice.finished => {
                let progress = TaskProgress {
                    state: ProgressState {
                        success: true,
                        code: Code::Success,
                        msg: "seeding".to_string(),
                    },
                    task_id: conductor.get_task_id().to_string(),
                    peer_id: conductor.get_peer_id().to_string(),
                    content_length: conductor.get_content_length(),
                    completed_length: conductor.get_completed_length(),
                    done: false,
                };
                if progress_tx.send(progress).await.is_err() {
                    break;
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

    let state = match conductor.state() {
        TaskState::Success => ProgressState {
            success: true,
            code: Code::Success,
            msg: "done".to_string(),
        },
        TaskState::Failed { code, msg } => ProgressState {
            success: false,
            code,
            msg,
        },
        other => ProgressState {
            success: false,
            code: Code::ClientError,
            msg: format!("conductor 非正常退出: {:?}", other),
        },
    };
    let _ = progress_tx
        .send(TaskProgress {
            state,
            task_id: conductor.get_task_id().to_string(),
            peer_id: conductor.get_peer_id().to_string(),
            content_length: conductor.get_content_length(),
            completed_length: conductor.get_completed_length(),
            done: true,
        })
        .await;
}
