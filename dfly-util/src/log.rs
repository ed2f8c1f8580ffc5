//! 日志初始化

use std::sync::Once;
use tracing::Level;

static INIT: Once = Once::new();

/// 安装默认的 fmt 订阅器。重复调用是无害的
pub fn init(level: Level) {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// 在二进制 / 测试文件顶部展开一个进程启动时自动执行的日志初始化。
/// 用法：`default_logger!(Level::INFO);`
#[macro_export]
macro_rules! default_logger {
    ($level:expr) => {
        #[$crate::__ctor::ctor]
        fn __default_logger_init() {
            $crate::log::init($level);
        }
    };
}
