use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dfly_util::digest::md5_hex;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;

use super::*;
use crate::gc::Gc;
use crate::rpc::message::{PieceInfo, PieceStyle, PieceTaskRequest};

fn option(data_dir: &Path, strategy: StoreStrategy, expire: Duration) -> StorageOption {
    StorageOption {
        data_dir: data_dir.to_path_buf(),
        store_strategy: strategy,
        task_expire_time: expire,
        gc_interval: Duration::from_secs(60),
        disk_gc_threshold: 0,
        // 测试机磁盘水位不可控，关掉使用率触发
        disk_gc_threshold_percent: 0.0,
    }
}

async fn new_manager(data_dir: &Path, expire: Duration) -> Arc<StorageManager> {
    StorageManager::new(option(data_dir, StoreStrategy::Simple, expire))
        .await
        .unwrap()
}

fn meta(task: &str, peer: &str) -> PeerTaskMetadata {
    PeerTaskMetadata {
        task_id: task.to_string(),
        peer_id: peer.to_string(),
    }
}

fn piece(num: i32, offset: u64, data: &[u8]) -> PieceInfo {
    PieceInfo {
        piece_num: num,
        range_start: offset,
        range_size: data.len() as u32,
        piece_md5: md5_hex(data),
        piece_offset: offset,
        piece_style: PieceStyle::Plain,
    }
}

async fn register(
    manager: &StorageManager,
    meta: &PeerTaskMetadata,
    content_length: i64,
) -> Arc<task_store::LocalTaskStore> {
    manager
        .register_task(RegisterTaskRequest {
            meta: meta.clone(),
            destination: None,
            content_length,
            total_pieces: -1,
            piece_md5_sign: String::new(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_register_task_idempotent() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");

    let a = register(&manager, &m, 10).await;
    let b = register(&manager, &m, 10).await;
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_write_out_of_order_then_read_all() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 10).await;

    // 乱序写，读出来必须有序
    store.write_piece(&piece(1, 5, b"world"), b"world").await.unwrap();
    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(10), Some(2), None).await.unwrap();
    assert!(store.mark_done().await.unwrap());

    let mut reader = store.read_all_pieces().await.unwrap();
    let mut content = String::new();
    reader.read_to_string(&mut content).await.unwrap();
    assert_eq!(content, "helloworld");
}

#[tokio::test]
async fn test_write_piece_dedup_and_done_readonly() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;

    let info = piece(0, 0, b"hello");
    assert_eq!(store.write_piece(&info, b"hello").await.unwrap(), 5);
    // 重复写同一个分片，直接复用结果
    assert_eq!(store.write_piece(&info, b"hello").await.unwrap(), 5);

    store.update_task(Some(5), Some(1), None).await.unwrap();
    assert!(store.mark_done().await.unwrap());
    // Done 只翻一次
    assert!(!store.mark_done().await.unwrap());
    // Done 之后只读
    let late = piece(1, 5, b"xx");
    assert!(matches!(
        store.write_piece(&late, b"xx").await,
        Err(Error::TaskDone)
    ));
}

#[tokio::test]
async fn test_write_piece_digest_mismatch_not_recorded() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;

    let mut bad = piece(0, 0, b"hello");
    bad.piece_md5 = md5_hex(b"other");
    assert!(matches!(
        store.write_piece(&bad, b"hello").await,
        Err(Error::InvalidDigest)
    ));
    // 坏数据没有被记录，重试成功
    assert!(matches!(
        store.read_piece(0).await,
        Err(Error::PieceNotFound(0))
    ));
    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    let (file, info) = store.read_piece(0).await.unwrap();
    let mut reader = file.take(info.range_size as u64);
    let mut content = String::new();
    reader.read_to_string(&mut content).await.unwrap();
    assert_eq!(content, "hello");
}

#[tokio::test]
async fn test_get_pieces_window() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 20).await;

    for num in 0..5i32 {
        let data = vec![num as u8; 4];
        store
            .write_piece(&piece(num, num as u64 * 4, &data), &data)
            .await
            .unwrap();
    }

    let packet = store
        .get_pieces(&PieceTaskRequest {
            task_id: "t1".to_string(),
            src_pid: "other".to_string(),
            dst_pid: "p1".to_string(),
            start_num: 2,
            limit: 2,
        })
        .unwrap();
    let nums: Vec<i32> = packet.piece_infos.iter().map(|p| p.piece_num).collect();
    assert_eq!(nums, vec![2, 3]);
}

#[tokio::test]
async fn test_store_to_destination_idempotent() {
    let dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;

    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(5), Some(1), None).await.unwrap();
    store.mark_done().await.unwrap();

    let dest = out_dir.path().join("out.bin");
    let request = StoreRequest {
        meta: m.clone(),
        destination: dest.clone(),
        metadata_only: false,
    };
    store.store(&request).await.unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
    // 再来一次是空操作
    store.store(&request).await.unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_store_requires_done() {
    let dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;

    let request = StoreRequest {
        meta: m.clone(),
        destination: out_dir.path().join("out.bin"),
        metadata_only: false,
    };
    assert!(matches!(store.store(&request).await, Err(Error::TaskNotDone)));
}

#[tokio::test]
async fn test_advance_strategy_links_and_stores() {
    let dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let manager = StorageManager::new(option(
        dir.path(),
        StoreStrategy::Advance,
        Duration::from_secs(3600),
    ))
    .await
    .unwrap();

    let m = meta("t1", "p1");
    let dest = out_dir.path().join("blob.bin");
    let store = manager
        .register_task(RegisterTaskRequest {
            meta: m.clone(),
            destination: Some(dest.clone()),
            content_length: 5,
            total_pieces: -1,
            piece_md5_sign: String::new(),
        })
        .await
        .unwrap();

    // dataDir 下要能顺着链接找到数据
    let link = dir.path().join("t1").join("p1").join(task_store::TASK_DATA);
    assert!(tokio::fs::symlink_metadata(&link).await.is_ok());

    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(5), Some(1), None).await.unwrap();
    store.mark_done().await.unwrap();
    store
        .store(&StoreRequest {
            meta: m.clone(),
            destination: dest.clone(),
            metadata_only: false,
        })
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_validate_digest_marks_invalid() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;

    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(5), Some(1), None).await.unwrap();
    store.mark_done().await.unwrap();

    store
        .validate_digest(&format!("md5:{}", md5_hex(b"hello")))
        .await
        .unwrap();
    assert!(!store.is_invalid());

    assert!(matches!(
        store.validate_digest(&format!("md5:{}", md5_hex(b"other"))).await,
        Err(Error::InvalidDigest)
    ));
    assert!(store.is_invalid());
    // invalid 的存储不再被复用
    assert!(manager.find_completed_task("t1").is_none());
}

#[tokio::test]
async fn test_find_completed_task_skips_not_done() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;

    assert!(manager.find_completed_task("t1").is_none());

    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(5), Some(1), None).await.unwrap();
    store.mark_done().await.unwrap();

    let reuse = manager.find_completed_task("t1").unwrap();
    assert_eq!(reuse.meta.peer_id, "p1");
    assert_eq!(reuse.content_length, 5);
    assert_eq!(reuse.total_pieces, 1);
}

#[tokio::test]
async fn test_reload_restores_completed_store() {
    let dir = tempdir().unwrap();
    {
        let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
        let m = meta("t1", "p1");
        let store = register(&manager, &m, 10).await;
        store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
        store.write_piece(&piece(1, 5, b"world"), b"world").await.unwrap();
        store.update_task(Some(10), Some(2), None).await.unwrap();
        store.mark_done().await.unwrap();
    }

    // 重启后从磁盘恢复
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let reuse = manager.find_completed_task("t1").unwrap();
    assert_eq!(reuse.content_length, 10);

    let mut reader = manager.read_all_pieces(&reuse.meta).await.unwrap();
    let mut content = String::new();
    reader.read_to_string(&mut content).await.unwrap();
    assert_eq!(content, "helloworld");
}

#[tokio::test]
async fn test_reload_removes_broken_store() {
    let dir = tempdir().unwrap();
    {
        let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
        let good = meta("good", "p1");
        let store = register(&manager, &good, 5).await;
        store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
        store.update_task(Some(5), Some(1), None).await.unwrap();
        store.mark_done().await.unwrap();
    }

    // 伪造一个元数据损坏的任务和一个空任务目录
    let broken_dir = dir.path().join("broken").join("p9");
    tokio::fs::create_dir_all(&broken_dir).await.unwrap();
    tokio::fs::write(broken_dir.join(task_store::TASK_METADATA), b"not json")
        .await
        .unwrap();
    tokio::fs::write(broken_dir.join(task_store::TASK_DATA), b"junk")
        .await
        .unwrap();
    tokio::fs::create_dir_all(dir.path().join("empty")).await.unwrap();

    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    // 好的还在，坏的和空的被清理，绝不留半状态
    assert!(manager.find_completed_task("good").is_some());
    assert!(manager.find_completed_task("broken").is_none());
    assert!(!dir.path().join("broken").join("p9").exists());
    assert!(!dir.path().join("empty").exists());
}

#[tokio::test]
async fn test_gc_expired_store_reclaimed_in_two_passes() {
    let dir = tempdir().unwrap();
    // 过期时间 0：所有任务立即可回收
    let manager = new_manager(dir.path(), Duration::from_millis(0)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;
    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(5), Some(1), None).await.unwrap();
    store.mark_done().await.unwrap();
    drop(store);

    // 第一轮只标记
    manager.try_gc().await.unwrap();
    assert!(dir.path().join("t1").exists());
    assert!(manager.find_completed_task("t1").is_none());

    // 第二轮真正删除
    manager.try_gc().await.unwrap();
    assert!(!dir.path().join("t1").exists());
}

#[tokio::test]
async fn test_gc_never_touches_recently_used_store() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    let m = meta("t1", "p1");
    let store = register(&manager, &m, 5).await;
    store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    store.update_task(Some(5), Some(1), None).await.unwrap();
    store.mark_done().await.unwrap();

    manager.try_gc().await.unwrap();
    manager.try_gc().await.unwrap();
    assert!(manager.find_completed_task("t1").is_some());
    assert!(dir.path().join("t1").exists());
}

#[tokio::test]
async fn test_gc_quota_reclaims_oldest_first() {
    let dir = tempdir().unwrap();
    let mut opt = option(dir.path(), StoreStrategy::Simple, Duration::from_secs(3600));
    opt.disk_gc_threshold = 500 * 1024;
    let manager = StorageManager::new(opt).await.unwrap();

    // 10 个各 100KiB 的任务，总量 1000KiB，配额 500KiB
    for i in 0..10 {
        let m = meta(&format!("t{}", i), "p1");
        let store = register(&manager, &m, 100 * 1024).await;
        let data = vec![i as u8; 1024];
        store.write_piece(&piece(0, 0, &data), &data).await.unwrap();
        store.update_task(Some(100 * 1024), Some(1), None).await.unwrap();
        store.mark_done().await.unwrap();
        // 拉开访问时间差
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.touch();
    }

    // 两轮之内，最旧的 5 个被回收
    manager.try_gc().await.unwrap();
    manager.try_gc().await.unwrap();

    for i in 0..5 {
        assert!(
            manager.find_completed_task(&format!("t{}", i)).is_none(),
            "t{} 应当被回收",
            i
        );
    }
    for i in 5..10 {
        assert!(
            manager.find_completed_task(&format!("t{}", i)).is_some(),
            "t{} 应当保留",
            i
        );
    }
}

#[tokio::test]
async fn test_clean_up_empties_data_root() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path(), Duration::from_secs(3600)).await;
    for i in 0..3 {
        let m = meta(&format!("t{}", i), "p1");
        let store = register(&manager, &m, 5).await;
        store.write_piece(&piece(0, 0, b"hello"), b"hello").await.unwrap();
    }

    manager.clean_up().await;

    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}
