use std::cell::RefCell;
use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::core::task::TaskProgress;

// 结构体：ProgressManager
// 每个任务一条进度条, 由任务事件驱动更新
pub struct ProgressManager {
    multi: MultiProgress,
    bars: RefCell<HashMap<String, ProgressBar>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        ProgressManager {
            multi: MultiProgress::new(),
            bars: RefCell::new(HashMap::new()),
        }
    }

    /// 为一个任务挂一条进度条
    pub fn add_task(&self, task_id: &str, filename: &str, total: i64) {
        let pb = self.multi.add(ProgressBar::new(total.max(0) as u64));
        pb.set_style(
            ProgressStyle::with_template(
                "{prefix:.bold} [{bar:36.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        pb.set_prefix(filename.to_string());
        self.bars.borrow_mut().insert(task_id.to_string(), pb);
    }

    // 方法：更新下载进度
    pub fn update_progress(&self, task_id: &str, progress: &TaskProgress) {
        if let Some(pb) = self.bars.borrow().get(task_id) {
            if progress.content_length > 0 {
                pb.set_length(progress.content_length as u64);
            }
            pb.set_position(progress.total_bytes);

            let speed = progress.speed;
            let speed_str = if speed > 1024 * 1024 {
                format!("{:.2} MB/s", speed as f64 / (1024.0 * 1024.0))
            } else if speed > 1024 {
                format!("{:.2} KB/s", speed as f64 / 1024.0)
            } else {
                format!("{} B/s", speed)
            };

            // 计算剩余时间
            let total = progress.content_length.max(0) as u64;
            let eta = if speed > 0 && total > progress.total_bytes {
                let seconds = (total - progress.total_bytes) / speed;
                if seconds > 3600 {
                    format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
                } else if seconds > 60 {
                    format!("{}m{}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}s", seconds)
                }
            } else {
                "未知".to_string()
            };

            pb.set_message(format!("{} | ETA:{}", speed_str, eta));
        }
    }

    pub fn set_message(&self, task_id: &str, message: &str) {
        if let Some(pb) = self.bars.borrow().get(task_id) {
            pb.set_message(message.to_string());
        }
    }

    pub fn finish_task(&self, task_id: &str, message: &str) {
        if let Some(pb) = self.bars.borrow_mut().remove(task_id) {
            pb.finish_with_message(message.to_string());
        }
    }

    pub fn abandon_task(&self, task_id: &str, message: &str) {
        if let Some(pb) = self.bars.borrow_mut().remove(task_id) {
            pb.abandon_with_message(message.to_string());
        }
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
