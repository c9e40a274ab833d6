use std::path::{Path, PathBuf};

use log::warn;

use crate::core::descriptor::{FileDescriptor, INFO_FILE_EXTENSION};
use crate::core::error::DownloadError;

/// info 文件仓库. 任务创建即落盘, 完成或取消时删除,
/// 因此文件是否存在就是任务能否恢复的唯一判据
#[derive(Debug, Clone)]
pub struct ResumeStore {
    config_dir: PathBuf,
}

impl ResumeStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub async fn save(&self, descriptor: &FileDescriptor) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| DownloadError::InfoFile(format!("创建配置目录失败: {}", e)))?;
        let json = serde_json::to_string_pretty(descriptor)
            .map_err(|e| DownloadError::InfoFile(format!("序列化任务信息失败: {}", e)))?;
        tokio::fs::write(descriptor.info_file_path(), json)
            .await
            .map_err(|e| DownloadError::InfoFile(format!("写入任务信息失败: {}", e)))
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<FileDescriptor>, DownloadError> {
        let path = self
            .config_dir
            .join(format!("{}{}", task_id, INFO_FILE_EXTENSION));
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DownloadError::InfoFile(format!("解析任务信息失败: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::InfoFile(format!("读取任务信息失败: {}", e))),
        }
    }

    /// 扫描配置目录恢复所有任务, 坏记录仅告警并跳过, 不阻断其余任务
    pub async fn load_all(&self) -> Result<Vec<FileDescriptor>, DownloadError> {
        let mut descriptors = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(descriptors),
            Err(e) => {
                return Err(DownloadError::InfoFile(format!(
                    "扫描配置目录失败: {}",
                    e
                )))
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("遍历配置目录出错: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if !path
                .to_string_lossy()
                .ends_with(INFO_FILE_EXTENSION)
            {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(json) => match serde_json::from_str::<FileDescriptor>(&json) {
                    Ok(descriptor) => descriptors.push(descriptor),
                    Err(e) => warn!("跳过损坏的任务信息 {:?}: {}", path, e),
                },
                Err(e) => warn!("跳过无法读取的任务信息 {:?}: {}", path, e),
            }
        }
        Ok(descriptors)
    }

    pub async fn delete(&self, task_id: &str) -> Result<(), DownloadError> {
        let path = self
            .config_dir
            .join(format!("{}{}", task_id, INFO_FILE_EXTENSION));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::InfoFile(format!("删除任务信息失败: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn descriptor(task_id: &str, config_dir: &Path) -> FileDescriptor {
        FileDescriptor {
            task_id: task_id.to_string(),
            download_url: "http://example.com/file.bin".to_string(),
            storage_dir: PathBuf::from("/tmp/repo"),
            filename: "file.bin".to_string(),
            config_dir: config_dir.to_path_buf(),
            chunk_count: 4,
            content_type: "application/octet-stream".to_string(),
            content_length: 1000,
            resumable: true,
            created_at: Utc::now(),
            attachment: None,
            computed: None,
        }
    }

    #[actix_rt::test]
    async fn test_save_load_delete_roundtrip() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let store = ResumeStore::new(dir.path());
        let mut d = descriptor("task1", dir.path());
        d.divide_chunks();
        store.save(&d).await.expect("保存失败");
        assert!(d.info_file_path().exists());

        let loaded = store.load("task1").await.expect("加载失败").expect("应存在");
        assert_eq!(loaded.task_id, d.task_id);
        assert_eq!(loaded.content_length, 1000);
        assert_eq!(loaded.chunk_plans(), d.chunk_plans());

        store.delete("task1").await.expect("删除失败");
        assert!(store.load("task1").await.expect("加载失败").is_none());
        // 重复删除不报错
        store.delete("task1").await.expect("幂等删除失败");
    }

    #[actix_rt::test]
    async fn test_load_all_skips_broken_records() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let store = ResumeStore::new(dir.path());
        store
            .save(&descriptor("good", dir.path()))
            .await
            .expect("保存失败");
        std::fs::write(dir.path().join("bad.info.json"), "{ not json").expect("写坏文件失败");
        std::fs::write(dir.path().join("unrelated.txt"), "x").expect("写无关文件失败");

        let all = store.load_all().await.expect("扫描失败");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].task_id, "good");
    }

    #[actix_rt::test]
    async fn test_load_all_missing_dir_is_empty() {
        let store = ResumeStore::new("/tmp/rangedown-does-not-exist-xyz");
        assert!(store.load_all().await.expect("扫描失败").is_empty());
    }
}
