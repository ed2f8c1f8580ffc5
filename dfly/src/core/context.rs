//! 全局上下文

use core::fmt::Formatter;
use std::sync::OnceLock;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::config::Config;

#[derive(Clone)]
pub struct Context {
    /// 全局配置信息
    config: Config,

    /// 全局停机监听
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context").finish()
    }
}

static CONTEXT: OnceLock<Context> = OnceLock::new();

impl Context {
    /// 实例化全局上下文
    pub fn init(config: Config) {
        CONTEXT
            .set(Self {
                config,
                cancel_token: CancellationToken::new(),
            })
            .unwrap();
    }

    pub fn global() -> &'static Self {
        CONTEXT.get().unwrap()
    }

    /// 返回全局配置信息
    pub fn get_config() -> &'static Config {
        &Context::global().config
    }

    /// 停机监听
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel_token.cancelled()
    }

    /// 停机令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 关机
    pub fn cancel(&self) {
        self.cancel_token.cancel()
    }

    /// 是否关机
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
