use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::descriptor::{simple_task_id, ChunkPlan, FileDescriptor};
use crate::core::describe::HttpRequestOptionsBuilder;
use crate::core::error::{DownloadError, ErrorMessage};
use crate::core::retry::RetryStrategy;
use crate::core::status::{DownloadStatus, StatusHolder};
use crate::utils::fsx;

/// worker 上行给 task 的状态通告, 发送即入队, 由 task 串行消费
#[derive(Debug, Clone)]
pub enum WorkerSignal {
    Started(usize),
    Stopped(usize),
    Canceled(usize),
    Merging(usize),
    Error(usize, ErrorMessage),
}

/// 单块的进度快照, 随任务进度事件一起对外发布
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProgress {
    pub index: usize,
    pub planned: u64,
    pub written: u64,
    pub retry_count: u32,
}

/// 负责一个块区间的下载执行体. 自身持有与任务同构的状态机,
/// Retry 类错误在预算内自行消化, 其余错误经信号上抛给任务
pub struct ChunkWorker {
    task_id: String,
    plan: ChunkPlan,
    chunk_file_path: PathBuf,
    download_url: String,
    status: StatusHolder,
    progress: AtomicU64,
    progress_at_tick: AtomicU64,
    no_response_millis: AtomicU64,
    retry_count: AtomicU32,
    retry_strategy: RetryStrategy,
    http_timeout: Duration,
    signals: UnboundedSender<WorkerSignal>,
    inflight: Mutex<Option<AbortHandle>>,
    options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
}

impl ChunkWorker {
    pub fn new(
        descriptor: &FileDescriptor,
        plan: ChunkPlan,
        retry_strategy: RetryStrategy,
        http_timeout: Duration,
        signals: UnboundedSender<WorkerSignal>,
        options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
    ) -> Rc<Self> {
        let chunk_file_path = descriptor.chunk_file_path(plan.index);
        Rc::new(Self {
            task_id: descriptor.task_id.clone(),
            plan,
            chunk_file_path,
            download_url: descriptor.download_url.clone(),
            status: StatusHolder::new(),
            progress: AtomicU64::new(0),
            progress_at_tick: AtomicU64::new(0),
            no_response_millis: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
            retry_strategy,
            http_timeout,
            signals,
            inflight: Mutex::new(None),
            options_builder,
        })
    }

    pub fn index(&self) -> usize {
        self.plan.index
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn chunk_file_path(&self) -> &Path {
        &self.chunk_file_path
    }

    pub fn status(&self) -> Option<DownloadStatus> {
        self.status.status()
    }

    pub fn written(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    /// 是否已进入可参与合并的终态
    pub fn is_mergeable(&self) -> bool {
        matches!(
            self.status.status(),
            Some(DownloadStatus::Merging) | Some(DownloadStatus::Finished)
        )
    }

    pub fn progress_snapshot(&self) -> WorkerProgress {
        WorkerProgress {
            index: self.plan.index,
            planned: self.plan.length,
            written: self.written(),
            retry_count: self.retry_count.load(Ordering::SeqCst),
        }
    }

    /// 进入 Init 并用磁盘上已有的块文件长度恢复进度.
    /// 无界区间无法续传, 进度一律归零重下
    pub async fn try_init(&self) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Init, false, false) {
            return false;
        }
        let written = if self.plan.ranged() {
            fsx::file_length(&self.chunk_file_path)
                .await
                .unwrap_or(0)
                .min(self.plan.length)
        } else {
            0
        };
        self.progress.store(written, Ordering::SeqCst);
        self.progress_at_tick.store(written, Ordering::SeqCst);
        if written > 0 {
            debug!(
                "[{}] 块{} 续传自 {} 字节",
                simple_task_id(&self.task_id),
                self.plan.index,
                written
            );
        }
        true
    }

    pub fn try_start(&self) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Started, false, false) {
            return false;
        }
        self.retry_count.store(0, Ordering::SeqCst);
        self.no_response_millis.store(0, Ordering::SeqCst);
        let _ = self.signals.send(WorkerSignal::Started(self.plan.index));
        true
    }

    /// 进入(或重入) Downloading 并拉起流式下载.
    /// 计划已写满的块直接转入 Merging, 不再发请求
    pub fn try_resume(self: Rc<Self>) -> bool {
        if self.plan.ranged() && self.written() >= self.plan.length {
            return self.try_merge();
        }
        if !self.status.compare_and_swap(DownloadStatus::Downloading, true, false) {
            return false;
        }
        self.spawn_stream();
        true
    }

    pub fn try_stop(&self) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Stopped, false, false) {
            return false;
        }
        self.abort_inflight();
        let _ = self.signals.send(WorkerSignal::Stopped(self.plan.index));
        true
    }

    /// 取消并清理本块的临时文件
    pub async fn try_cancel(&self) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Canceled, false, false) {
            return false;
        }
        self.abort_inflight();
        if let Err(e) = fsx::delete_file_or_dir(&self.chunk_file_path).await {
            warn!(
                "[{}] 块{} 清理临时文件失败: {}",
                simple_task_id(&self.task_id),
                self.plan.index,
                e
            );
        }
        let _ = self.signals.send(WorkerSignal::Canceled(self.plan.index));
        true
    }

    /// 错误处理入口. 可重试且预算未耗尽时退避后自动重入下载,
    /// 返回 true; 否则转入 Error 并向任务上报, 返回 false
    pub fn try_error(self: Rc<Self>, error: ErrorMessage) -> bool {
        let retry_count = self.retry_count.load(Ordering::SeqCst);
        if error.is_retryable()
            && self
                .retry_strategy
                .should_retry(error.category, retry_count)
        {
            let count = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.retry_strategy.delay(retry_count);
            info!(
                "[{}] 块{} 第{}次重试, {}ms 后继续: {}",
                simple_task_id(&self.task_id),
                self.plan.index,
                count,
                delay.as_millis(),
                error
            );
            self.abort_inflight();
            actix_rt::spawn(async move {
                actix_rt::time::sleep(delay).await;
                // 等待期间可能被停止或取消, 只有仍在下载中才续
                if self.status.is(DownloadStatus::Downloading) {
                    self.spawn_stream();
                }
            });
            return true;
        }
        if !self.status.compare_and_swap(DownloadStatus::Error, false, false) {
            return false;
        }
        self.abort_inflight();
        let _ = self
            .signals
            .send(WorkerSignal::Error(self.plan.index, error));
        false
    }

    /// 本块数据齐备, 停流转入 Merging 等待任务合并
    pub fn try_merge(&self) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Merging, false, false) {
            return false;
        }
        self.abort_inflight();
        let _ = self.signals.send(WorkerSignal::Merging(self.plan.index));
        true
    }

    pub fn try_finish(&self) -> bool {
        self.status.compare_and_swap(DownloadStatus::Finished, false, false)
    }

    /// 任务心跳驱动的看门狗: 一个探测周期内字节数未变则累计静默时长,
    /// 超过 http_timeout 判定连接僵死, 走可重试错误重建连接
    pub fn on_tick(self: Rc<Self>, tick_millis: u64) -> WorkerProgress {
        if self.status.is(DownloadStatus::Downloading) {
            let current = self.written();
            let previous = self.progress_at_tick.swap(current, Ordering::SeqCst);
            if current == previous {
                let silent = self
                    .no_response_millis
                    .fetch_add(tick_millis, Ordering::SeqCst)
                    + tick_millis;
                if silent >= self.http_timeout.as_millis() as u64 {
                    self.no_response_millis.store(0, Ordering::SeqCst);
                    warn!(
                        "[{}] 块{} 已 {}ms 无数据, 重建连接",
                        simple_task_id(&self.task_id),
                        self.plan.index,
                        silent
                    );
                    self.clone().try_error(
                        DownloadError::RequestTimeout(format!(
                            "块{} 连接静默超过 {}ms",
                            self.plan.index, silent
                        ))
                        .into(),
                    );
                }
            } else {
                self.no_response_millis.store(0, Ordering::SeqCst);
            }
        }
        self.progress_snapshot()
    }

    fn abort_inflight(&self) {
        if let Some(handle) = self
            .inflight
            .lock()
            .expect("inflight 锁中毒")
            .take()
        {
            handle.abort();
        }
    }

    fn spawn_stream(self: Rc<Self>) {
        let (handle, registration) = AbortHandle::new_pair();
        {
            let mut inflight = self.inflight.lock().expect("inflight 锁中毒");
            if let Some(old) = inflight.take() {
                old.abort();
            }
            *inflight = Some(handle);
        }
        actix_rt::spawn(async move {
            let run = Abortable::new(self.run_stream(), registration);
            let _ = run.await;
        });
    }

    async fn run_stream(self: Rc<Self>) {
        match self.stream_chunk().await {
            Ok(()) => {
                // 停止或取消会让流提前退出, 只有下载态的正常收尾才算齐备
                if self.status.is(DownloadStatus::Downloading) {
                    self.try_merge();
                }
            }
            Err(e) => {
                self.try_error(e.into());
            }
        }
    }

    async fn stream_chunk(&self) -> Result<(), DownloadError> {
        let parsed = url::Url::parse(&self.download_url)
            .map_err(|e| DownloadError::UnknownProtocol(format!("{}: {}", self.download_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::UnknownProtocol(parsed.scheme().to_string()));
        }

        let written = self.written();
        let client = awc::Client::default();
        let mut request = client
            .get(self.download_url.as_str())
            .timeout(self.http_timeout);
        if self.plan.ranged() {
            request = request.insert_header((
                "Range",
                format!("bytes={}-{}", self.plan.from + written, self.plan.to),
            ));
        }
        if let Some(builder) = &self.options_builder {
            request = builder(
                request,
                &self.task_id,
                self.plan.index,
                self.plan.from + written,
                self.plan.to,
                written,
            );
        }

        let mut response = request.send().await.map_err(|e| match e {
            awc::error::SendRequestError::Timeout => {
                DownloadError::RequestTimeout(format!("块{} 请求超时", self.plan.index))
            }
            other => DownloadError::ServerUnavailable(format!(
                "块{} 请求失败: {}",
                self.plan.index, other
            )),
        })?;
        if !response.status().is_success() {
            return Err(DownloadError::ResponseStatus(response.status().as_u16()));
        }

        let mut options = tokio::fs::OpenOptions::new();
        if written > 0 {
            options.append(true).create(true);
        } else {
            options.write(true).truncate(true).create(true);
        }
        let mut file = options
            .open(&self.chunk_file_path)
            .await
            .map_err(|e| map_write_error(&self.chunk_file_path, e))?;

        while let Some(item) = response.next().await {
            // 每收一包都复核状态, 停止/取消后丢弃后续数据
            if !self.status.is(DownloadStatus::Downloading) {
                return Ok(());
            }
            let buf: bytes::Bytes = item.map_err(|e| {
                DownloadError::ServerUnavailable(format!(
                    "块{} 读取响应流失败: {}",
                    self.plan.index, e
                ))
            })?;
            file.write_all(&buf)
                .await
                .map_err(|e| map_write_error(&self.chunk_file_path, e))?;
            let total = self.progress.fetch_add(buf.len() as u64, Ordering::SeqCst)
                + buf.len() as u64;
            if self.plan.ranged() && total >= self.plan.length {
                break;
            }
        }
        file.flush()
            .await
            .map_err(|e| map_write_error(&self.chunk_file_path, e))?;

        // 有界区间未写满就断流, 按服务端异常走重试
        if self.plan.ranged() && self.written() < self.plan.length {
            return Err(DownloadError::ServerUnavailable(format!(
                "块{} 响应流提前结束, 已写 {}/{}",
                self.plan.index,
                self.written(),
                self.plan.length
            )));
        }
        Ok(())
    }
}

fn map_write_error(path: &Path, e: std::io::Error) -> DownloadError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        DownloadError::NoSpaceLeftOnDevice
    } else {
        DownloadError::WriteChunkFile(format!("{:?}: {}", path, e))
    }
}
