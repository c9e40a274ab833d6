//! CLI: 命令行接口和参数解析模块
//!
//! ## 支持的命令
//!
//! - 基本下载：`rangedown <url>`
//! - 批量下载：`rangedown -f urls.txt`
//! - 编辑配置：`rangedown -e`
//! - 指定配置：`rangedown -c config.conf <url>`
//! - 指定分块：`rangedown -n 8 <url>`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/rangedown/rangedown.conf`
//! - macOS: `~/Library/Application Support/rangedown/rangedown.conf`
//! - Linux: `~/.config/rangedown/rangedown.conf`

use std::env;
use std::fs;

use clap::Parser;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/rangedown/rangedown.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/rangedown/rangedown.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/rangedown/rangedown.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// 获取平台默认下载目录（当前工作目录）
fn get_default_download_dir() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

/// rangedown 命令行参数
///
/// 示例用法：
///   rangedown https://example.com/file.zip
///   rangedown -e  # 编辑配置文件
///   rangedown -n 8 https://example.com/file.zip
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "rangedown",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "一个用 Rust 编写的可断点续传的分块下载器",
    long_about = "支持分块并发下载、断点续传和实时进度显示的下载器。\n\n示例：\n  rangedown https://example.com/file.zip\n  rangedown -e\n  rangedown -c /path/to/config.conf https://example.com/file.zip\n  rangedown -n 8 https://example.com/file.zip\n"
)]
pub struct Args {
    /// 要下载的URL列表（可同时指定多个）
    #[arg(required = false, help = "要下载的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 每个任务的分块数
    #[arg(short = 'n', long, help = "每个任务的分块数，覆盖配置文件中的设置。")]
    pub chunk_count: Option<usize>,

    /// 指定下载目录（默认：当前工作目录）
    #[arg(long, short = 'd', default_value_t = get_default_download_dir(), help = "指定下载目录，覆盖配置文件中的设置，默认当前工作目录。")]
    pub download_dir: String,

    /// 保存为指定文件名（只对单个URL有效）
    #[arg(short = 'o', long, help = "保存为指定文件名，只在下载单个URL时有效。")]
    pub output: Option<String>,

    /// 不自动恢复上次未完成的任务
    #[arg(long, help = "跳过启动时的历史任务恢复。")]
    pub no_resume: bool,
}

impl Args {
    /// 解析命令行并叠加配置文件, 返回(参数, 生效配置)
    pub fn parse_args() -> Result<(Args, Config), DownloadError> {
        let args = Args::parse();
        let mut config = Config::load(&args.config)?;
        args.merge_into(&mut config);
        config.validate()?;
        Ok((args, config))
    }

    /// 命令行覆盖配置文件
    fn merge_into(&self, config: &mut Config) {
        if let Some(chunk_count) = self.chunk_count {
            config.chunk_count = chunk_count;
        }
        if !self.download_dir.is_empty() {
            config.download_dir = self.download_dir.clone();
        }
        if self.no_resume {
            config.auto_resume_on_startup = false;
        }
    }

    /// 汇总命令行与文件里的URL列表
    pub fn get_urls(&self) -> Result<Vec<String>, DownloadError> {
        let mut urls = self.urls.clone();
        if let Some(file) = &self.file {
            let content = fs::read_to_string(file)
                .map_err(|e| DownloadError::System(format!("读取URL文件失败: {}", e)))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    urls.push(line.to_string());
                }
            }
        }
        validator::validate_urls(&urls)
            .map_err(|e| DownloadError::System(e.to_string()))?;
        Ok(urls)
    }
}
