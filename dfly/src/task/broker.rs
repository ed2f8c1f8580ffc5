//! 任务内的分片事件扇出。
//! 订阅者各持一个无界队列，慢订阅者不会拖住发布方；
//! 事件按发布顺序投递，关闭时补一条 finished 哨兵

use std::sync::Mutex;

use dfly_util::sync::MutexExt;
use tokio::sync::mpsc;

/// 一条分片完成事件。finished 为真表示广播结束
#[derive(Clone, Copy, Debug)]
pub struct PieceNotice {
    pub piece_num: i32,
    pub size: u32,
    pub finished: bool,
}

impl PieceNotice {
    fn finished() -> Self {
        Self {
            piece_num: -1,
            size: 0,
            finished: true,
        }
    }
}

#[derive(Default)]
pub struct PieceBroker {
    inner: Mutex<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: Vec<mpsc::UnboundedSender<PieceNotice>>,
    closed: bool,
}

impl PieceBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅。broker 已关闭时拿到的队列里只有一条哨兵
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PieceNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock_pe();
        if inner.closed {
            let _ = tx.send(PieceNotice::finished());
        } else {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// 广播一条事件。挂掉的订阅者顺手清理
    pub fn publish(&self, piece_num: i32, size: u32) {
        let notice = PieceNotice {
            piece_num,
            size,
            finished: false,
        };
        let mut inner = self.inner.lock_pe();
        if inner.closed {
            return;
        }
        inner.subscribers.retain(|tx| tx.send(notice).is_ok());
    }

    /// 关闭并广播哨兵。幂等
    pub fn close(&self) {
        let mut inner = self.inner.lock_pe();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(PieceNotice::finished());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_pe().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_same_sequence() {
        let broker = PieceBroker::new();
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish(0, 10);
        broker.publish(1, 20);
        broker.close();

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            assert_eq!((first.piece_num, first.size, first.finished), (0, 10, false));
            let second = rx.recv().await.unwrap();
            assert_eq!(second.piece_num, 1);
            assert!(rx.recv().await.unwrap().finished);
            assert!(rx.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_sentinel() {
        let broker = PieceBroker::new();
        broker.publish(0, 10);
        broker.close();
        broker.close(); // 幂等

        let mut late = broker.subscribe();
        assert!(late.recv().await.unwrap().finished);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block() {
        let broker = PieceBroker::new();
        let rx = broker.subscribe();
        drop(rx);
        // 不 panic、不阻塞即可
        broker.publish(0, 10);
        broker.close();
    }
}
