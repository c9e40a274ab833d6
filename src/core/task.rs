use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::future::{AbortHandle, Abortable};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::core::describe::{FileInformationDescriptor, HttpRequestOptionsBuilder};
use crate::core::descriptor::{simple_task_id, FileDescriptor};
use crate::core::error::{DownloadError, ErrorMessage};
use crate::core::retry::RetryStrategy;
use crate::core::status::{DownloadStatus, StatusHolder};
use crate::core::store::ResumeStore;
use crate::core::worker::{ChunkWorker, WorkerProgress, WorkerSignal};
use crate::utils::fsx;

/// 合并时单次搬运的缓冲区大小
const MERGE_BUF_SIZE: usize = 256 * 1024;

/// 任务对外广播的事件. 发布即入队, 订阅方异步消费
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Initialized(FileDescriptor),
    Started(FileDescriptor),
    Downloading,
    Progress(TaskProgress),
    Stopped,
    Merge,
    Finished(FileDescriptor),
    Canceled(FileDescriptor),
    Error(ErrorMessage),
}

/// 一次心跳聚合出的任务级进度
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub content_length: i64,
    pub total_bytes: u64,
    /// 字节每秒
    pub speed: u64,
    pub ticktock_millis: u64,
    pub chunks: Vec<WorkerProgress>,
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub chunk_count: usize,
    pub ticktock_millis: u64,
    pub http_timeout: Duration,
    pub retry_strategy: RetryStrategy,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            chunk_count: 4,
            ticktock_millis: 500,
            http_timeout: Duration::from_secs(30),
            retry_strategy: RetryStrategy::default(),
        }
    }
}

/// 一个下载任务: 驱动一组块 worker, 聚合其状态与进度,
/// 负责探测、分块、落盘恢复信息、合并与重命名的全流程.
/// 运行在单线程运行时上, 通过 Rc 共享
pub struct DownloadTask {
    descriptor: RefCell<FileDescriptor>,
    status: StatusHolder,
    options: TaskOptions,
    workers: RefCell<Vec<Rc<ChunkWorker>>>,
    describer: Rc<dyn FileInformationDescriptor>,
    request_options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
    store: ResumeStore,
    listeners: RefCell<Vec<UnboundedSender<DownloadEvent>>>,
    signals_tx: UnboundedSender<WorkerSignal>,
    signals_rx: RefCell<Option<UnboundedReceiver<WorkerSignal>>>,
    ticker: RefCell<Option<AbortHandle>>,
    prev_total: Cell<u64>,
}

impl DownloadTask {
    pub fn new(
        descriptor: FileDescriptor,
        options: TaskOptions,
        describer: Rc<dyn FileInformationDescriptor>,
        store: ResumeStore,
        request_options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
    ) -> Rc<Self> {
        let (signals_tx, signals_rx) = unbounded_channel();
        Rc::new(Self {
            descriptor: RefCell::new(descriptor),
            status: StatusHolder::new(),
            options,
            workers: RefCell::new(Vec::new()),
            describer,
            request_options_builder,
            store,
            listeners: RefCell::new(Vec::new()),
            signals_tx,
            signals_rx: RefCell::new(Some(signals_rx)),
            ticker: RefCell::new(None),
            prev_total: Cell::new(0),
        })
    }

    pub fn task_id(&self) -> String {
        self.descriptor.borrow().task_id.clone()
    }

    pub fn descriptor(&self) -> FileDescriptor {
        self.descriptor.borrow().clone()
    }

    pub fn status(&self) -> Option<DownloadStatus> {
        self.status.status()
    }

    pub fn total_written(&self) -> u64 {
        self.workers.borrow().iter().map(|w| w.written()).sum()
    }

    /// 订阅任务事件, 返回接收端. 可多路订阅
    pub fn subscribe(&self) -> UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = unbounded_channel();
        self.listeners.borrow_mut().push(tx);
        rx
    }

    fn emit(&self, event: DownloadEvent) {
        self.listeners
            .borrow_mut()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// 带状态快照的发布: 事件计算完成后状态已变则整条丢弃,
    /// 保证订阅方看到的事件序列与状态机一致
    fn emit_if(&self, snapshot: DownloadStatus, event: DownloadEvent) {
        if self.status.is(snapshot) {
            self.emit(event);
        }
    }

    /// 启动(或从停止/错误中重启)任务.
    /// 首次启动会探测目标并落盘恢复信息; 重启只重建未完成的块
    pub async fn start(self: Rc<Self>) -> bool {
        if self.status.status().is_none() {
            self.status.compare_and_swap(DownloadStatus::Init, false, false);
        }
        if !self.status.compare_and_swap(DownloadStatus::Started, false, false) {
            debug!("[{}] start 被状态机拒绝", simple_task_id(&self.task_id()));
            return false;
        }
        self.clone().ensure_signal_loop();

        let first_time = self.descriptor.borrow().computed.is_none();
        if first_time {
            let mut d = self.descriptor.borrow().clone();
            if let Err(e) = self.describer.describe(&mut d).await {
                self.clone().try_error(-1, e.into()).await;
                return false;
            }
            d.divide_chunks();
            *self.descriptor.borrow_mut() = d.clone();
            if let Err(e) = self.store.save(&d).await {
                self.clone().try_error(-1, e.into()).await;
                return false;
            }
            info!(
                "[{}] 任务建立: {} -> {:?}, {} 字节 {} 块",
                simple_task_id(&d.task_id),
                d.download_url,
                d.output_file_path(),
                d.content_length,
                d.chunk_plans().len()
            );
        }
        if let Err(e) = self.prepare_dirs().await {
            self.clone().try_error(-1, e.into()).await;
            return false;
        }
        if self.workers.borrow().is_empty() {
            self.dispatch_workers().await;
        }
        if first_time {
            self.emit_if(
                DownloadStatus::Started,
                DownloadEvent::Initialized(self.descriptor()),
            );
        }
        self.emit_if(
            DownloadStatus::Started,
            DownloadEvent::Started(self.descriptor()),
        );
        self.clone().try_resume().await
    }

    async fn prepare_dirs(&self) -> Result<(), DownloadError> {
        let d = self.descriptor();
        fsx::mkdirs_if_non_exists(&d.storage_dir).await?;
        if d.chunk_plans().len() > 1 {
            fsx::mkdirs_if_non_exists(&d.task_dir()).await?;
        }
        Ok(())
    }

    /// 按分块计划建立 worker 并用磁盘现状初始化进度
    async fn dispatch_workers(&self) {
        let d = self.descriptor();
        let mut workers = Vec::with_capacity(d.chunk_plans().len());
        for plan in d.chunk_plans() {
            let worker = ChunkWorker::new(
                &d,
                plan.clone(),
                self.options.retry_strategy.clone(),
                self.options.http_timeout,
                self.signals_tx.clone(),
                self.request_options_builder.clone(),
            );
            worker.try_init().await;
            workers.push(worker);
        }
        self.prev_total.set(workers.iter().map(|w| w.written()).sum());
        *self.workers.borrow_mut() = workers;
    }

    /// 进入(或重入)下载态, 拉起全部 worker 与进度心跳.
    /// 全部块已齐备时跳过 worker 直接合并, 重启一个停在合并阶段的任务也走这里
    async fn try_resume(self: Rc<Self>) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Downloading, true, false) {
            return false;
        }
        if self.all_workers_mergeable() {
            return self.try_merge().await;
        }
        let workers: Vec<_> = self.workers.borrow().clone();
        for worker in workers {
            worker.try_start();
            worker.try_resume();
        }
        self.clone().start_ticker();
        self.emit_if(DownloadStatus::Downloading, DownloadEvent::Downloading);
        true
    }

    /// 暂停任务, 块文件与恢复信息原样保留
    pub fn stop(&self) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Stopped, false, false) {
            debug!("[{}] stop 被状态机拒绝", simple_task_id(&self.task_id()));
            return false;
        }
        self.stop_ticker();
        for worker in self.workers.borrow().iter() {
            worker.try_stop();
        }
        info!("[{}] 任务已停止", simple_task_id(&self.task_id()));
        self.emit_if(DownloadStatus::Stopped, DownloadEvent::Stopped);
        true
    }

    /// 取消任务并清理一切落盘痕迹, 不可恢复
    pub async fn cancel(self: Rc<Self>) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Canceled, false, false) {
            return false;
        }
        self.stop_ticker();
        let workers: Vec<_> = self.workers.borrow().clone();
        for worker in workers {
            worker.try_cancel().await;
        }
        let d = self.descriptor();
        if let Err(e) = self.store.delete(&d.task_id).await {
            warn!("[{}] 删除恢复信息失败: {}", simple_task_id(&d.task_id), e);
        }
        if let Err(e) = fsx::delete_file_or_dir(&d.task_dir()).await {
            warn!("[{}] 清理任务目录失败: {}", simple_task_id(&d.task_id), e);
        }
        if let Err(e) = fsx::delete_file_or_dir(&d.chunk_file_path(0)).await {
            warn!("[{}] 清理块文件失败: {}", simple_task_id(&d.task_id), e);
        }
        // 探测前 filename 还是空串, 此时输出路径会落在存储目录自身上, 不能删
        if !d.filename.is_empty() {
            if let Err(e) = fsx::delete_file_or_dir(&d.output_file_path()).await {
                warn!("[{}] 清理输出文件失败: {}", simple_task_id(&d.task_id), e);
            }
        }
        info!("[{}] 任务已取消", simple_task_id(&d.task_id));
        self.emit_if(DownloadStatus::Canceled, DownloadEvent::Canceled(d));
        true
    }

    /// 任务级错误处理. chunk_index 为肇事块序号, -1 表示任务自身.
    /// worker 已耗尽重试预算才会上抛, 因此这里把 Retry 降级为 Generic,
    /// 并顺带停掉其余还在跑的块
    pub async fn try_error(self: Rc<Self>, chunk_index: i64, error: ErrorMessage) -> bool {
        let error = error.reclassify_for_task().with_task_id(self.task_id());
        if !self.status.compare_and_swap(DownloadStatus::Error, false, false) {
            debug!(
                "[{}] 错误到达时任务已不在可报错状态, 丢弃: {}",
                simple_task_id(&self.task_id()),
                error
            );
            return false;
        }
        self.stop_ticker();
        for worker in self.workers.borrow().iter() {
            if worker.index() as i64 != chunk_index {
                worker.try_stop();
            }
        }
        warn!("[{}] 任务出错: {}", simple_task_id(&self.task_id()), error);
        self.emit_if(DownloadStatus::Error, DownloadEvent::Error(error));
        true
    }

    fn all_workers_mergeable(&self) -> bool {
        let workers = self.workers.borrow();
        !workers.is_empty() && workers.iter().all(|w| w.is_mergeable())
    }

    /// 全部块齐备后把数据归拢成最终文件.
    /// 块 1..N 依次追加进块 0 的文件, 再把它重命名为目标文件;
    /// 单块或块 0 已含全量数据时跳过追加, 两条路径在重命名处汇合
    pub async fn try_merge(self: Rc<Self>) -> bool {
        // 只有下载态的任务接受合并; 出错或停止后, 队列里残留的
        // worker 信号不得再次触发合并
        if !self.status.is(DownloadStatus::Downloading) {
            return false;
        }
        if !self.all_workers_mergeable() {
            return false;
        }
        if !self.status.compare_and_swap(DownloadStatus::Merging, false, false) {
            return false;
        }
        self.stop_ticker();
        info!("[{}] 开始合并", simple_task_id(&self.task_id()));
        self.emit_if(DownloadStatus::Merging, DownloadEvent::Merge);
        match self.merge_chunks().await {
            Ok(()) => self.try_rename().await,
            Err(e) => {
                self.clone().try_error(-1, e.into()).await;
                false
            }
        }
    }

    async fn merge_chunks(&self) -> Result<(), DownloadError> {
        let d = self.descriptor();
        let plans = d.chunk_plans().to_vec();
        let chunk0 = d.chunk_file_path(0);
        let chunk0_len = fsx::file_length(&chunk0).await.unwrap_or(0);
        // 单块任务或块 0 已是完整文件, 无需搬运
        if plans.len() <= 1
            || (d.content_length > 0 && chunk0_len >= d.content_length as u64)
        {
            return Ok(());
        }
        let mut output = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&chunk0)
            .await
            .map_err(|e| DownloadError::AppendTargetFile(format!("{:?}: {}", chunk0, e)))?;
        // 上一次合并中断会在块 0 里留下追加到一半的数据,
        // 先退回块 0 自身的边界再从头追加
        if chunk0_len > plans[0].length {
            output
                .set_len(plans[0].length)
                .await
                .map_err(|e| DownloadError::AppendTargetFile(format!("{:?}: {}", chunk0, e)))?;
        }
        let mut buf = vec![0u8; MERGE_BUF_SIZE];
        for plan in &plans[1..] {
            let path = d.chunk_file_path(plan.index);
            let mut input = tokio::fs::File::open(&path)
                .await
                .map_err(|e| DownloadError::ReadChunkFile(format!("{:?}: {}", path, e)))?;
            loop {
                // 合并期间被取消则立即放手
                if !self.status.is(DownloadStatus::Merging) {
                    return Err(DownloadError::System("合并被中止".to_string()));
                }
                let n = input
                    .read(&mut buf)
                    .await
                    .map_err(|e| DownloadError::ReadChunkFile(format!("{:?}: {}", path, e)))?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n]).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::StorageFull {
                        DownloadError::NoSpaceLeftOnDevice
                    } else {
                        DownloadError::AppendTargetFile(format!("{:?}: {}", chunk0, e))
                    }
                })?;
            }
            // 块文件要等 try_finish 收尾时才删, 中途崩溃还能按块边界重来
            drop(input);
        }
        output
            .flush()
            .await
            .map_err(|e| DownloadError::AppendTargetFile(format!("{:?}: {}", chunk0, e)))?;
        Ok(())
    }

    async fn try_rename(self: Rc<Self>) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Renaming, false, false) {
            return false;
        }
        let d = self.descriptor();
        let from = d.chunk_file_path(0);
        let to = d.output_file_path();
        if let Err(e) = tokio::fs::rename(&from, &to).await {
            self.clone()
                .try_error(
                    -1,
                    DownloadError::RenameMergedFile(format!(
                        "{:?} -> {:?}: {}",
                        from, to, e
                    ))
                    .into(),
                )
                .await;
            return false;
        }
        self.try_finish().await
    }

    /// 终点: 删除恢复信息与任务目录, 此后任务不可再操作
    async fn try_finish(self: Rc<Self>) -> bool {
        if !self.status.compare_and_swap(DownloadStatus::Finished, false, false) {
            return false;
        }
        for worker in self.workers.borrow().iter() {
            worker.try_finish();
        }
        let d = self.descriptor();
        if let Err(e) = self.store.delete(&d.task_id).await {
            warn!("[{}] 删除恢复信息失败: {}", simple_task_id(&d.task_id), e);
        }
        if let Err(e) = fsx::delete_file_or_dir(&d.task_dir()).await {
            warn!("[{}] 清理任务目录失败: {}", simple_task_id(&d.task_id), e);
        }
        info!(
            "[{}] 下载完成: {:?}",
            simple_task_id(&d.task_id),
            d.output_file_path()
        );
        self.emit_if(DownloadStatus::Finished, DownloadEvent::Finished(d));
        true
    }

    /// worker 信号的串行消费循环, 任务生命周期内只拉起一次
    fn ensure_signal_loop(self: Rc<Self>) {
        let rx = self.signals_rx.borrow_mut().take();
        let Some(mut rx) = rx else { return };
        actix_rt::spawn(async move {
            while let Some(signal) = rx.recv().await {
                match signal {
                    WorkerSignal::Started(_) => {}
                    WorkerSignal::Stopped(_) => {}
                    WorkerSignal::Canceled(_) => {}
                    WorkerSignal::Merging(index) => {
                        debug!(
                            "[{}] 块{} 数据齐备",
                            simple_task_id(&self.task_id()),
                            index
                        );
                        self.clone().try_merge().await;
                    }
                    WorkerSignal::Error(index, error) => {
                        self.clone().try_error(index as i64, error).await;
                    }
                }
                if matches!(
                    self.status(),
                    Some(DownloadStatus::Finished) | Some(DownloadStatus::Canceled)
                ) {
                    break;
                }
            }
        });
    }

    /// 进度心跳: 聚合各块进度、测速、驱动僵死看门狗
    fn start_ticker(self: Rc<Self>) {
        if self.ticker.borrow().is_some() {
            return;
        }
        let (handle, registration) = AbortHandle::new_pair();
        *self.ticker.borrow_mut() = Some(handle);
        let tick = self.options.ticktock_millis;
        actix_rt::spawn(async move {
            let run = Abortable::new(
                async {
                    loop {
                        actix_rt::time::sleep(Duration::from_millis(tick)).await;
                        if !self.status.is(DownloadStatus::Downloading) {
                            continue;
                        }
                        let workers: Vec<_> = self.workers.borrow().clone();
                        let chunks: Vec<WorkerProgress> =
                            workers.into_iter().map(|w| w.on_tick(tick)).collect();
                        let total: u64 = chunks.iter().map(|c| c.written).sum();
                        let prev = self.prev_total.replace(total);
                        let speed = total.saturating_sub(prev) * 1000 / tick.max(1);
                        self.emit_if(
                            DownloadStatus::Downloading,
                            DownloadEvent::Progress(TaskProgress {
                                content_length: self.descriptor.borrow().content_length,
                                total_bytes: total,
                                speed,
                                ticktock_millis: tick,
                                chunks,
                            }),
                        );
                    }
                },
                registration,
            );
            let _ = run.await;
        });
    }

    fn stop_ticker(&self) {
        if let Some(handle) = self.ticker.borrow_mut().take() {
            handle.abort();
        }
    }
}
