use std::rc::Rc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::core::descriptor::FileDescriptor;
use crate::core::error::DownloadError;

/// 发请求前的最后修饰点, 用于注入鉴权头、UA 等.
/// 参数依次为: 请求、task_id、块序号、块起点(含已写字节)、块终点、已写字节
pub type HttpRequestOptionsBuilder =
    dyn Fn(awc::ClientRequest, &str, usize, u64, i64, u64) -> awc::ClientRequest;

/// 探测下载目标的元信息: 字节数、类型、是否支持断点续传、建议文件名.
/// 自定义实现可以跳过网络探测直接填入已知信息
#[async_trait(?Send)]
pub trait FileInformationDescriptor {
    async fn describe(&self, descriptor: &mut FileDescriptor) -> Result<(), DownloadError>;
}

/// 默认实现: 发 HEAD 请求读取响应头
pub struct HeadFileInformationDescriptor {
    client: awc::Client,
    options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
}

impl HeadFileInformationDescriptor {
    pub fn new(options_builder: Option<Rc<HttpRequestOptionsBuilder>>) -> Self {
        Self {
            client: awc::Client::default(),
            options_builder,
        }
    }
}

#[async_trait(?Send)]
impl FileInformationDescriptor for HeadFileInformationDescriptor {
    async fn describe(&self, descriptor: &mut FileDescriptor) -> Result<(), DownloadError> {
        let mut request = self.client.head(descriptor.download_url.as_str());
        if let Some(builder) = &self.options_builder {
            request = builder(request, &descriptor.task_id, 0, 0, -1, 0);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::DescribeFile(format!("HEAD 请求失败: {}", e)))?;
        if !response.status().is_success() {
            return Err(DownloadError::DescribeFile(format!(
                "HEAD 响应异常: {}",
                response.status()
            )));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        descriptor.content_length = header("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);
        if let Some(content_type) = header("content-type") {
            descriptor.content_type = content_type;
        }
        // 不声明 accept-ranges: bytes 的一律按不可续传处理
        descriptor.resumable = descriptor.content_length > 0
            && header("accept-ranges")
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);

        if descriptor.filename.is_empty() {
            descriptor.filename = header("content-disposition")
                .and_then(|v| parse_disposition_filename(&v))
                .or_else(|| filename_from_url(&descriptor.download_url))
                .ok_or_else(|| {
                    DownloadError::DescribeFile("无法从响应或 URL 推断文件名".to_string())
                })?;
            debug!("推断文件名: {}", descriptor.filename);
        }
        if !descriptor.resumable {
            warn!(
                "服务端不支持 Range, 任务 {} 退化为单块下载",
                descriptor.task_id
            );
        }
        Ok(())
    }
}

/// 从 Content-Disposition 里取 filename, 兼容带引号与不带引号两种写法
fn parse_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let name = rest.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// 兜底用 URL 路径的最后一段当文件名
fn filename_from_url(download_url: &str) -> Option<String> {
    let parsed = url::Url::parse(download_url).ok()?;
    let name = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// 跳过网络探测, 直接使用预先给定的元信息
pub struct FixedFileInformationDescriptor {
    pub content_length: i64,
    pub content_type: String,
    pub resumable: bool,
}

#[async_trait(?Send)]
impl FileInformationDescriptor for FixedFileInformationDescriptor {
    async fn describe(&self, descriptor: &mut FileDescriptor) -> Result<(), DownloadError> {
        descriptor.content_length = self.content_length;
        descriptor.content_type = self.content_type.clone();
        descriptor.resumable = self.resumable;
        if descriptor.filename.is_empty() {
            descriptor.filename = filename_from_url(&descriptor.download_url)
                .ok_or_else(|| {
                    DownloadError::DescribeFile("无法从 URL 推断文件名".to_string())
                })?;
        }
        Ok(())
    }
}
