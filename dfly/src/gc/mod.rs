//! 回收引擎。各个组件实现 [`Gc`] 注册进来，由一个定时器统一驱动。
//! 注册表按依赖注入传递，方便并行测试各建各的

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dfly_util::sync::MutexExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[async_trait]
pub trait Gc: Send + Sync {
    /// 跑一轮回收
    async fn try_gc(&self) -> Result<bool>;

    /// 无视阈值和宽限，全部回收
    async fn clean_up(&self);
}

#[derive(Clone, Default)]
pub struct GcRegistry {
    entries: Arc<Mutex<Vec<(String, Arc<dyn Gc>)>>>,
}

impl GcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, gc: Arc<dyn Gc>) {
        info!("注册 GC 组件: {}", name);
        self.entries.lock_pe().push((name.to_string(), gc));
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Gc>)> {
        self.entries.lock_pe().clone()
    }

    /// 定时驱动所有注册的回收器，直到停机
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval 的第一跳是立即的，跳过去
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("GC 驱动收到停机信号");
                    break;
                }
                _ = tick.tick() => {
                    for (name, gc) in self.snapshot() {
                        if let Err(e) = gc.try_gc().await {
                            error!("GC 组件 [{}] 执行失败: {}", name, e);
                        }
                    }
                }
            }
        }
    }

    /// 停机清理，全部强制回收
    pub async fn clean_up_all(&self) {
        for (name, gc) in self.snapshot() {
            debug!("强制回收: {}", name);
            gc.clean_up().await;
        }
    }
}
