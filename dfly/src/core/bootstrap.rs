use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, trace};

use crate::config::Config;
use crate::context::Context;
use crate::gc::GcRegistry;
use crate::rpc::scheduler::SchedulerClient;
use crate::rpc::server::PeerServer;
use crate::source::SourceRegistry;
use crate::storage::{StorageManager, StorageOption};
use crate::task::PeerTaskManager;

/// 配置文件路径的环境变量
const CONFIG_ENV: &str = "DFLY_CONFIG";

#[rustfmt::skip]
pub async fn start() {
    info!("dfly 启动中...");

    trace!("初始化全局上下文");
    let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
    let config = match Config::load(config_path.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("加载配置失败: {}", e);
            return;
        }
    };
    Context::init(config.clone());

    trace!("初始化存储管理器");
    let storage = match StorageManager::new(StorageOption {
        data_dir: config.data_dir().clone(),
        store_strategy: config.store_strategy(),
        task_expire_time: config.task_expire_time(),
        gc_interval: config.gc_interval(),
        disk_gc_threshold: config.disk_gc_threshold(),
        disk_gc_threshold_percent: config.disk_gc_threshold_percent(),
    }).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("初始化存储失败: {}", e);
            return;
        }
    };

    trace!("启动 GC 引擎");
    let gc_registry = GcRegistry::new();
    gc_registry.register("StorageManager", storage.clone());
    let gc_handle = tokio::spawn(
        gc_registry.clone().run(config.gc_interval(), Context::global().cancel_token()),
    );

    trace!("初始化任务管理器");
    let scheduler = Arc::new(SchedulerClient::new(
        config.scheduler_addrs().to_vec(),
        config.rpc_timeout(),
    ));
    let sources = SourceRegistry::with_http();
    let task_manager = PeerTaskManager::new(
        config.clone(),
        storage.clone(),
        scheduler,
        sources,
        Context::global().cancel_token(),
    );

    trace!("启动 peer server");
    let server = PeerServer::new(
        config.peer_server_addr(),
        storage.clone(),
        task_manager,
        Context::global().cancel_token(),
    );
    let server_handle = tokio::spawn(server.run());

    // ctrl-c 触发全局停机
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到退出信号");
            Context::global().cancel();
        }
    });

    info!("dfly 运行中...");
    server_handle.await.unwrap();
    gc_handle.await.unwrap();

    // 停机前把能回收的回收掉
    gc_registry.clean_up_all().await;
    info!("资源已安全关闭，程序退出");
}
