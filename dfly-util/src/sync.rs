use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// 忽略毒化的锁扩展。锁内不会留下半更新状态，毒化时直接取回内部值
pub trait MutexExt<T> {
    fn lock_pe(&self) -> MutexGuard<T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_pe(&self) -> MutexGuard<T> {
        match self.lock() {
            Ok(mg) => mg,
            Err(pe) => {
                warn!("Mutex poisoned: {}", pe);
                pe.into_inner()
            }
        }
    }
}

pub trait RwLockExt<T> {
    fn read_pe(&self) -> RwLockReadGuard<T>;

    fn write_pe(&self) -> RwLockWriteGuard<T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_pe(&self) -> RwLockReadGuard<T> {
        match self.read() {
            Ok(g) => g,
            Err(pe) => {
                warn!("RwLock poisoned: {}", pe);
                pe.into_inner()
            }
        }
    }

    fn write_pe(&self) -> RwLockWriteGuard<T> {
        match self.write() {
            Ok(g) => g,
            Err(pe) => {
                warn!("RwLock poisoned: {}", pe);
                pe.into_inner()
            }
        }
    }
}

/// 中断并等待子线程退出，一般用于停机清理
pub async fn wait_join_handle_close(handle: &mut JoinHandle<()>) {
    handle.abort();
    if let Err(e) = handle.await {
        if e.is_panic() {
            error!("JoinHandle panicked: {}", e);
        }
    }
}
