use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// 下载状态, Task 与 Worker 共用同一套状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadStatus {
    Init,
    Started,
    Downloading,
    Stopped,
    Merging,
    Finished,
    Canceled,
    Renaming,
    Error,
}

/// 状态转换的纯函数: 返回 Some(next) 表示允许转换, None 表示拒绝
///
/// 规则:
/// - force 为 true 时无条件接受
/// - 前后状态相同时, 由 reentrant 决定是否允许重入
/// - 未设置状态时只接受 Init
/// - 其余按禁止表判断, 表中未列出的转换一律合法
pub fn transition(
    current: Option<DownloadStatus>,
    next: DownloadStatus,
    reentrant: bool,
    force: bool,
) -> Option<DownloadStatus> {
    use DownloadStatus::*;
    if force {
        return Some(next);
    }
    let current = match current {
        None => {
            // 状态未设置时, 只可以转为 Init
            return if next == Init { Some(next) } else { None };
        }
        Some(c) => c,
    };
    if current == next {
        return if reentrant { Some(next) } else { None };
    }
    let forbidden: &[DownloadStatus] = match next {
        // 任何已有状态都不能回到 Init
        Init => return None,
        Started => &[Finished, Merging, Renaming, Canceled],
        Downloading => &[Error, Finished, Merging, Renaming, Canceled],
        Stopped => &[Init, Merging, Renaming, Finished, Canceled, Error],
        Merging => &[Renaming, Finished, Canceled],
        // 只有 Init/Merging 可以进入 Renaming
        Renaming => &[Started, Downloading, Stopped, Error, Finished, Canceled],
        Finished => &[Error, Canceled],
        // 用户意图优先, 任何状态都可以取消
        Canceled => &[],
        Error => &[Stopped, Finished, Canceled],
    };
    if forbidden.contains(&current) {
        None
    } else {
        Some(next)
    }
}

/// 状态管理器: Task/Worker 各持有一份, 以 CAS 语义保证
/// 并发/重复信号下各种副作用(中止请求、删除文件、发送事件)只执行一次
#[derive(Debug, Default)]
pub struct StatusHolder {
    status: Mutex<Option<DownloadStatus>>,
}

impl StatusHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<DownloadStatus> {
        *self.status.lock().unwrap()
    }

    pub fn is(&self, status: DownloadStatus) -> bool {
        self.status() == Some(status)
    }

    /// CAS: 返回 false 代表重复/非法的状态设置, 调用方必须放弃对应的副作用.
    /// 下载 write 回调很频繁, 不加控制的话 ERROR 之类的回调会触发上百次
    pub fn compare_and_swap(&self, next: DownloadStatus, reentrant: bool, force: bool) -> bool {
        let mut guard = self.status.lock().unwrap();
        match transition(*guard, next, reentrant, force) {
            Some(next) => {
                *guard = Some(next);
                true
            }
            None => false,
        }
    }
}
