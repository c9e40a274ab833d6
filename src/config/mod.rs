use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::DownloadError;
use crate::core::retry::RetryStrategy;
use crate::core::task::TaskOptions;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 恢复信息存放目录
    pub config_dir: String,
    /// 每个任务的分块数
    pub chunk_count: usize,
    /// 网络超时时间（秒）
    pub timeout: u64,
    /// 进度心跳间隔（毫秒）
    pub ticktock_millis: u64,
    /// User-Agent
    pub user_agent: String,
    /// 重试次数
    pub retry_count: u32,
    /// 首次重试延迟（毫秒）
    pub retry_delay_millis: u64,
    /// 最大重试延迟（毫秒）
    pub retry_max_delay_millis: u64,
    /// 启动时自动恢复未完成的下载
    pub auto_resume_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            config_dir: "./downloads/.rangedown".to_string(),
            chunk_count: 4,
            timeout: 30,
            ticktock_millis: 500,
            user_agent: format!("rangedown/{}", env!("CARGO_PKG_VERSION")),
            retry_count: 10,
            retry_delay_millis: 500,
            retry_max_delay_millis: 30_000,
            auto_resume_on_startup: true,
        }
    }
}

impl Config {
    /// 加载配置文件, 不存在或格式损坏时落一份带教程的默认配置
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| DownloadError::System(format!("读取配置文件失败: {}", e)))?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    eprintln!("配置文件格式错误: {}，将使用默认配置", e);
                    let config = Config::default();
                    config.save_with_tutorial(path)?;
                    Ok(config)
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DownloadError::System(format!("创建配置目录失败: {}", e)))?;
        }
        let tutorial_content = Config::generate_tutorial_content();
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::System(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n\n{}", tutorial_content, config_content);
        fs::write(path, full_content)
            .map_err(|e| DownloadError::System(format!("写入配置文件失败: {}", e)))?;
        Ok(())
    }

    /// 生成配置文件教程内容（静态方法）
    fn generate_tutorial_content() -> String {
        r#"# rangedown 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件，用于配置 rangedown 下载器的行为。
# 你可以根据需要修改这些设置，然后保存文件。
#
# 配置文件位置：
# - Windows: %APPDATA%/rangedown/rangedown.conf
# - macOS: ~/Library/Application Support/rangedown/rangedown.conf
# - Linux: ~/.config/rangedown/rangedown.conf
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   rangedown https://example.com/file.zip                       # 使用默认配置
#   rangedown -n 8 https://example.com/file.zip                  # 分 8 块下载
#   rangedown -d /path/to/downloads https://example.com/file.zip # 指定下载目录
#
# ==================== 下载设置 ====================
#
# download_dir        默认下载目录，支持相对路径和绝对路径
# config_dir          恢复信息(.info.json)存放目录，删除里面的文件即放弃续传
# chunk_count         每个任务的分块数，建议 2-16；服务端不支持 Range 时自动退化为 1
#
# ==================== 网络设置 ====================
#
# timeout             网络超时时间（秒），连接静默超过该时长会重建连接
# user_agent          某些服务器可能需要特定的 User-Agent
# ticktock_millis     进度心跳间隔（毫秒），也是僵死探测的步长
#
# ==================== 重试设置 ====================
#
# retry_count             单块的网络错误重试次数，耗尽后任务报错
# retry_delay_millis      第一次重试前的等待时间（毫秒）
# retry_max_delay_millis  重试延迟的最大值（使用指数退避）
#
# ==================== 启动设置 ====================
#
# auto_resume_on_startup  启动时自动恢复上次未下完的任务
#
# ==================== 故障排除 ====================
#
# 问题：经常下载失败
# 解决：增加 retry_count 或 timeout 值
#
# 问题：大文件下载中断后从头开始
# 解决：确认服务端返回 accept-ranges: bytes，且 config_dir 里的恢复信息未被删除
"#
        .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.chunk_count == 0 || self.chunk_count > 64 {
            return Err(DownloadError::System("分块数必须在 1-64 之间".to_string()));
        }
        if self.timeout == 0 {
            return Err(DownloadError::System("超时时间必须大于0".to_string()));
        }
        if self.ticktock_millis == 0 {
            return Err(DownloadError::System("心跳间隔必须大于0".to_string()));
        }
        if self.download_dir.is_empty() {
            return Err(DownloadError::System("下载目录不能为空".to_string()));
        }
        if self.retry_delay_millis > self.retry_max_delay_millis {
            return Err(DownloadError::System(
                "重试延迟不能超过最大重试延迟".to_string(),
            ));
        }
        Ok(())
    }

    /// 配置摘要, 启动时打印
    pub fn get_summary(&self) -> String {
        format!(
            "下载目录: {}\n分块数: {}\n超时: {}s\n重试次数: {}\n自动恢复: {}",
            self.download_dir,
            self.chunk_count,
            self.timeout,
            self.retry_count,
            self.auto_resume_on_startup
        )
    }

    /// 折算为任务参数
    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            chunk_count: self.chunk_count,
            ticktock_millis: self.ticktock_millis,
            http_timeout: Duration::from_secs(self.timeout),
            retry_strategy: RetryStrategy {
                max_retries: self.retry_count,
                base_delay: Duration::from_millis(self.retry_delay_millis),
                max_delay: Duration::from_millis(self.retry_max_delay_millis),
                ..RetryStrategy::default()
            },
        }
    }
}
