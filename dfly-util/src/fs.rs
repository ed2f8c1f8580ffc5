use std::fs::{File as StdFile, OpenOptions as StdOpenOptions};
use std::future::Future;
use std::path::Path;
use tokio::fs;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// 为 OpenOptions 添加扩展方法
pub trait OpenOptionsExt {
    /// 打开文件，父目录不存在则创建
    fn open_with_parent_dirs<P: AsRef<Path>>(&self, path: P) -> std::io::Result<StdFile>;
}

/// 为 OpenOptions 添加扩展方法
pub trait AsyncOpenOptionsExt {
    /// 打开文件，父目录不存在则创建
    fn open_with_parent_dirs<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> impl Future<Output = std::io::Result<File>>;
}

impl AsyncOpenOptionsExt for OpenOptions {
    async fn open_with_parent_dirs<P: AsRef<Path>>(&self, path: P) -> std::io::Result<File> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        self.open(path).await
    }
}

impl OpenOptionsExt for StdOpenOptions {
    fn open_with_parent_dirs<P: AsRef<Path>>(&self, path: P) -> std::io::Result<StdFile> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        self.open(path)
    }
}

/// 原子写入：先写临时文件再 rename 覆盖。
/// rename 在同一目录内是原子的，读者要么看到旧内容要么看到新内容
pub async fn write_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad file name"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open_with_parent_dirs(&tmp)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    drop(file);

    fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open_with_parent_dirs(&path)
            .await;
        assert!(file.is_ok());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_write_atomic_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_atomic(&path, b"v1").await.unwrap();
        write_atomic(&path, b"v2-longer").await.unwrap();
        let data = fs::read(&path).await.unwrap();
        assert_eq!(data, b"v2-longer");
        // 临时文件不应残留
        assert!(!path.with_file_name(".meta.json.tmp").exists());
    }
}
