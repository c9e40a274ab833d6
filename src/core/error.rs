use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别, 决定传播策略: Retry 由 worker 内部消化, Fatal 由注册表广播给所有任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// 未分类的系统性错误
    Generic,
    /// 瞬时错误, 值得重试(超时、服务器不可用)
    Retry,
    /// 请求本身不合法(未知协议等)
    Request,
    /// 文件系统错误(目录创建、块文件读写、追加/重命名输出)
    File,
    /// 任务编排失败(描述文件信息失败、重启失败)
    Task,
    /// 不可恢复的环境错误(磁盘满), 广播给所有活动任务
    Fatal,
}

#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("获取文件描述信息失败: {0}")]
    DescribeFile(String),

    #[error("请求超时: {0}")]
    RequestTimeout(String),

    #[error("不支持的协议: {0}")]
    UnknownProtocol(String),

    #[error("服务器不可用: {0}")]
    ServerUnavailable(String),

    #[error("响应状态码错误: {0}")]
    ResponseStatus(u16),

    #[error("下载目录创建失败: {0}")]
    CreateDownloadDir(String),

    #[error("读取块文件出错: {0}")]
    ReadChunkFile(String),

    #[error("写入块文件出错: {0}")]
    WriteChunkFile(String),

    #[error("追加目标文件出错: {0}")]
    AppendTargetFile(String),

    #[error("重命名合并文件出错: {0}")]
    RenameMergedFile(String),

    #[error("info 文件读写出错: {0}")]
    InfoFile(String),

    #[error("任务重启失败: {0}")]
    TaskRestart(String),

    #[error("磁盘空间不足")]
    NoSpaceLeftOnDevice,

    #[error("系统错误: {0}")]
    System(String),
}

impl DownloadError {
    /// 稳定的错误码, 会随事件暴露给调用方, 不要改动已有编号
    pub fn code(&self) -> u16 {
        match self {
            DownloadError::DescribeFile(_) => 1000,
            DownloadError::RequestTimeout(_) => 1001,
            DownloadError::UnknownProtocol(_) => 1002,
            DownloadError::ServerUnavailable(_) => 1003,
            DownloadError::CreateDownloadDir(_) => 1004,
            DownloadError::ReadChunkFile(_) => 1005,
            DownloadError::WriteChunkFile(_) => 1006,
            DownloadError::AppendTargetFile(_) => 1007,
            DownloadError::RenameMergedFile(_) => 1008,
            DownloadError::ResponseStatus(_) => 1009,
            DownloadError::InfoFile(_) => 1010,
            DownloadError::TaskRestart(_) => 1011,
            DownloadError::NoSpaceLeftOnDevice => 1012,
            DownloadError::System(_) => 1013,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DownloadError::RequestTimeout(_) | DownloadError::ServerUnavailable(_) => {
                ErrorCategory::Retry
            }
            DownloadError::UnknownProtocol(_) => ErrorCategory::Request,
            DownloadError::CreateDownloadDir(_)
            | DownloadError::ReadChunkFile(_)
            | DownloadError::WriteChunkFile(_)
            | DownloadError::AppendTargetFile(_)
            | DownloadError::RenameMergedFile(_)
            | DownloadError::InfoFile(_) => ErrorCategory::File,
            DownloadError::DescribeFile(_) | DownloadError::TaskRestart(_) => ErrorCategory::Task,
            DownloadError::NoSpaceLeftOnDevice => ErrorCategory::Fatal,
            DownloadError::ResponseStatus(_) | DownloadError::System(_) => ErrorCategory::Generic,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Retry
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

/// 随事件传播的结构化错误, 带稳定错误码与归属任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct ErrorMessage {
    pub code: u16,
    pub category: ErrorCategory,
    pub message: String,
    pub task_id: Option<String>,
}

impl ErrorMessage {
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Retry
    }

    /// worker 已经放弃重试后上浮到任务层的错误不再是"可重试"的
    pub fn reclassify_for_task(mut self) -> Self {
        if self.category == ErrorCategory::Retry {
            self.category = ErrorCategory::Generic;
        }
        self
    }
}

impl From<DownloadError> for ErrorMessage {
    fn from(e: DownloadError) -> Self {
        ErrorMessage {
            code: e.code(),
            category: e.category(),
            message: e.to_string(),
            task_id: None,
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
