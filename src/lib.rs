pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;

pub use crate::core::error::{DownloadError, ErrorCategory, ErrorMessage};
pub use crate::core::group::{DownloadTaskGroup, DownloadTaskGroupBuilder};
pub use crate::core::status::DownloadStatus;
pub use crate::core::task::{DownloadEvent, DownloadTask, TaskOptions, TaskProgress};
