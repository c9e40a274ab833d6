use std::path::Path;

use crate::core::error::DownloadError;

/// 目录不存在则逐级创建
pub async fn mkdirs_if_non_exists(dir: &Path) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            DownloadError::NoSpaceLeftOnDevice
        } else {
            DownloadError::CreateDownloadDir(format!("{:?}: {}", dir, e))
        }
    })
}

/// 删除文件或整个目录, 目标不存在视为成功
pub async fn delete_file_or_dir(path: &Path) -> Result<(), DownloadError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(DownloadError::System(format!("{:?}: {}", path, e))),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::System(format!("{:?}: {}", path, e))),
    }
}

/// 文件存在则返回字节数
pub async fn file_length(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_mkdirs_and_delete() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let nested = dir.path().join("a/b/c");
        mkdirs_if_non_exists(&nested).await.expect("建目录失败");
        assert!(nested.is_dir());
        // 重复创建无害
        mkdirs_if_non_exists(&nested).await.expect("幂等建目录失败");

        std::fs::write(nested.join("x.tmp"), b"data").expect("写文件失败");
        delete_file_or_dir(&dir.path().join("a")).await.expect("删目录失败");
        assert!(!dir.path().join("a").exists());
        // 目标不存在视为成功
        delete_file_or_dir(&dir.path().join("a")).await.expect("幂等删除失败");
    }

    #[actix_rt::test]
    async fn test_file_length() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let path = dir.path().join("x.bin");
        assert_eq!(file_length(&path).await, None);
        std::fs::write(&path, b"hello").expect("写文件失败");
        assert_eq!(file_length(&path).await, Some(5));
        assert_eq!(file_length(dir.path()).await, None);
    }
}
