use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务元数据文件的扩展名, 存在即代表任务可恢复
pub const INFO_FILE_EXTENSION: &str = ".info.json";
/// 块临时文件的扩展名
pub const CHUNK_FILE_EXTENSION: &str = ".tmp";

/// 一个下载块的字节区间, 创建任务时一次性划定.
/// `to` 为 -1 表示不发送 Range 头的整体下载(源不支持断点续传)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub index: usize,
    pub length: u64,
    pub from: u64,
    pub to: i64,
}

impl ChunkPlan {
    /// 是否为有界的 Range 区间
    pub fn ranged(&self) -> bool {
        self.to >= 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedPlans {
    pub chunk_plans: Vec<ChunkPlan>,
}

/// 单个下载任务的身份与计划, 同时也是 info 文件的持久化格式.
/// 字段名是磁盘契约的一部分, 改名等于破坏旧任务的恢复
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub task_id: String,
    pub download_url: String,
    pub storage_dir: PathBuf,
    pub filename: String,
    pub config_dir: PathBuf,
    pub chunk_count: usize,
    pub content_type: String,
    /// 字节数, 描述之前为 -1(未知)
    pub content_length: i64,
    pub resumable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedPlans>,
}

impl FileDescriptor {
    /// 按 chunk_count 把 [0, content_length) 均分为连续无缝的块区间,
    /// 余数全部归入最后一块; 不可续传的源强制单块且区间无界.
    /// 小文件会把实际块数收缩到不超过字节数, 避免出现空块
    pub fn divide_chunks(&mut self) {
        if !self.resumable || self.content_length <= 0 {
            self.chunk_count = 1;
            self.computed = Some(ComputedPlans {
                chunk_plans: vec![ChunkPlan {
                    index: 0,
                    length: self.content_length.max(0) as u64,
                    from: 0,
                    to: -1,
                }],
            });
            return;
        }
        let content_length = self.content_length as u64;
        let count = (self.chunk_count.max(1) as u64).min(content_length) as usize;
        self.chunk_count = count;
        let avg = content_length / count as u64;
        let mut chunk_plans = Vec::with_capacity(count);
        for index in 0..count {
            let from = avg * index as u64;
            let length = if index < count - 1 {
                avg
            } else {
                // 整除截断的余数由最后一块吸收
                content_length - avg * (count as u64 - 1)
            };
            chunk_plans.push(ChunkPlan {
                index,
                length,
                from,
                to: (from + length - 1) as i64,
            });
        }
        self.computed = Some(ComputedPlans { chunk_plans });
    }

    pub fn chunk_plans(&self) -> &[ChunkPlan] {
        self.computed
            .as_ref()
            .map(|c| c.chunk_plans.as_slice())
            .unwrap_or(&[])
    }

    /// 最终输出文件路径
    pub fn output_file_path(&self) -> PathBuf {
        self.storage_dir.join(&self.filename)
    }

    /// info 文件路径: {config_dir}/{task_id}.info.json
    pub fn info_file_path(&self) -> PathBuf {
        self.config_dir
            .join(format!("{}{}", self.task_id, INFO_FILE_EXTENSION))
    }

    /// 块 1..N-1 所在的任务工作目录
    pub fn task_dir(&self) -> PathBuf {
        self.storage_dir.join(&self.task_id)
    }

    /// 块文件路径. 块 0 的文件名直接内嵌 task_id 且与输出同目录,
    /// 合并完成后它会被原地重命名为输出文件; 其余块放在任务子目录里
    pub fn chunk_file_path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.storage_dir.join(format!(
                "{}_chunk_0{}",
                self.task_id, CHUNK_FILE_EXTENSION
            ))
        } else {
            self.task_dir()
                .join(format!("chunk_{}{}", index, CHUNK_FILE_EXTENSION))
        }
    }
}

/// 缩短 task_id 方便打日志
pub fn simple_task_id(task_id: &str) -> &str {
    if task_id.len() > 4 {
        &task_id[task_id.len() - 4..]
    } else {
        task_id
    }
}

/// 默认的任务 id 生成器: 由 URL+目标位置推导, 跨进程稳定,
/// 同一目标的重复提交会映射到同一个任务
pub fn default_task_id(
    download_url: &str,
    storage_dir: &Path,
    filename: Option<&str>,
) -> String {
    let mut seed = String::from(download_url);
    seed.push('|');
    seed.push_str(&storage_dir.to_string_lossy());
    if let Some(filename) = filename {
        seed.push('|');
        seed.push_str(filename);
    }
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
        .simple()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(content_length: i64, chunk_count: usize, resumable: bool) -> FileDescriptor {
        FileDescriptor {
            task_id: "deadbeef".to_string(),
            download_url: "http://example.com/file.bin".to_string(),
            storage_dir: PathBuf::from("/tmp/repo"),
            filename: "file.bin".to_string(),
            config_dir: PathBuf::from("/tmp/info"),
            chunk_count,
            content_type: "application/octet-stream".to_string(),
            content_length,
            resumable,
            created_at: Utc::now(),
            attachment: None,
            computed: None,
        }
    }

    #[test]
    fn test_partition_invariant() {
        // 任意长度与块数组合下, 区间必须连续、不重叠且恰好覆盖 [0, len)
        for &len in &[1i64, 2, 3, 10, 63, 64, 65, 999, 1000, 1001, 1 << 20] {
            for count in 1..=64usize {
                let mut d = descriptor(len, count, true);
                d.divide_chunks();
                let plans = d.chunk_plans();
                assert!(!plans.is_empty(), "len={} count={}", len, count);
                let mut expect_from = 0u64;
                let mut total = 0u64;
                for (i, plan) in plans.iter().enumerate() {
                    assert_eq!(plan.index, i);
                    assert_eq!(plan.from, expect_from, "len={} count={}", len, count);
                    assert!(plan.length > 0, "len={} count={}", len, count);
                    assert_eq!(plan.to, (plan.from + plan.length - 1) as i64);
                    expect_from = plan.from + plan.length;
                    total += plan.length;
                }
                assert_eq!(total, len as u64, "len={} count={}", len, count);
            }
        }
    }

    #[test]
    fn test_concrete_four_chunk_plan() {
        let mut d = descriptor(1000, 4, true);
        d.divide_chunks();
        let plans = d.chunk_plans();
        let expect = [
            (0usize, 250u64, 0u64, 249i64),
            (1, 250, 250, 499),
            (2, 250, 500, 749),
            (3, 250, 750, 999),
        ];
        assert_eq!(plans.len(), 4);
        for (plan, &(index, length, from, to)) in plans.iter().zip(expect.iter()) {
            assert_eq!(plan.index, index);
            assert_eq!(plan.length, length);
            assert_eq!(plan.from, from);
            assert_eq!(plan.to, to);
        }
    }

    #[test]
    fn test_remainder_goes_to_last_chunk() {
        let mut d = descriptor(1003, 4, true);
        d.divide_chunks();
        let plans = d.chunk_plans();
        assert_eq!(plans[0].length, 250);
        assert_eq!(plans[3].length, 253);
        assert_eq!(plans[3].to, 1002);
    }

    #[test]
    fn test_non_resumable_forces_single_unbounded_chunk() {
        let mut d = descriptor(1000, 8, false);
        d.divide_chunks();
        assert_eq!(d.chunk_count, 1);
        let plans = d.chunk_plans();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].from, 0);
        assert_eq!(plans[0].to, -1);
        assert!(!plans[0].ranged());
    }

    #[test]
    fn test_tiny_file_clamps_chunk_count() {
        let mut d = descriptor(3, 64, true);
        d.divide_chunks();
        assert_eq!(d.chunk_count, 3);
        assert_eq!(d.chunk_plans().len(), 3);
    }

    #[test]
    fn test_chunk_file_layout() {
        let d = descriptor(1000, 4, true);
        assert_eq!(
            d.chunk_file_path(0),
            PathBuf::from("/tmp/repo/deadbeef_chunk_0.tmp")
        );
        assert_eq!(
            d.chunk_file_path(2),
            PathBuf::from("/tmp/repo/deadbeef/chunk_2.tmp")
        );
        assert_eq!(
            d.info_file_path(),
            PathBuf::from("/tmp/info/deadbeef.info.json")
        );
        assert_eq!(d.output_file_path(), PathBuf::from("/tmp/repo/file.bin"));
    }

    #[test]
    fn test_task_id_stable_and_distinct() {
        let a = default_task_id("http://a.com/x.zip", Path::new("/tmp"), None);
        let b = default_task_id("http://a.com/x.zip", Path::new("/tmp"), None);
        let c = default_task_id("http://a.com/y.zip", Path::new("/tmp"), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_simple_task_id() {
        assert_eq!(simple_task_id("deadbeef"), "beef");
        assert_eq!(simple_task_id("ab"), "ab");
    }
}
