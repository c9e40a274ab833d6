use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::core::describe::{
    FileInformationDescriptor, HeadFileInformationDescriptor, HttpRequestOptionsBuilder,
};
use crate::core::descriptor::{default_task_id, simple_task_id, FileDescriptor};
use crate::core::error::{DownloadError, ErrorMessage};
use crate::core::store::ResumeStore;
use crate::core::task::{DownloadEvent, DownloadTask, TaskOptions};

pub type TaskIdGenerator = dyn Fn(&str, &Path, Option<&str>) -> String;

type TaskMap = Rc<RefCell<HashMap<String, Rc<DownloadTask>>>>;

/// 任务组的装配器, config_* 链式设置后 build
pub struct DownloadTaskGroupBuilder {
    config_dir: PathBuf,
    options: TaskOptions,
    describer: Option<Rc<dyn FileInformationDescriptor>>,
    task_id_generator: Option<Rc<TaskIdGenerator>>,
    request_options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
}

impl DownloadTaskGroupBuilder {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            options: TaskOptions::default(),
            describer: None,
            task_id_generator: None,
            request_options_builder: None,
        }
    }

    pub fn config_chunk_count(mut self, chunk_count: usize) -> Self {
        self.options.chunk_count = chunk_count;
        self
    }

    pub fn config_ticktock_millis(mut self, ticktock_millis: u64) -> Self {
        self.options.ticktock_millis = ticktock_millis;
        self
    }

    pub fn config_http_timeout(mut self, http_timeout: Duration) -> Self {
        self.options.http_timeout = http_timeout;
        self
    }

    pub fn config_retry_times(mut self, retry_times: u32) -> Self {
        self.options.retry_strategy.max_retries = retry_times;
        self
    }

    /// 替换目标探测实现, 默认发 HEAD 请求
    pub fn config_describer(mut self, describer: Rc<dyn FileInformationDescriptor>) -> Self {
        self.describer = Some(describer);
        self
    }

    /// 替换任务 id 生成器, 默认由 URL+目标位置推导
    pub fn config_task_id_generator(mut self, generator: Rc<TaskIdGenerator>) -> Self {
        self.task_id_generator = Some(generator);
        self
    }

    pub fn config_request_options_builder(
        mut self,
        builder: Rc<HttpRequestOptionsBuilder>,
    ) -> Self {
        self.request_options_builder = Some(builder);
        self
    }

    pub fn build(self) -> Rc<DownloadTaskGroup> {
        let describer = self.describer.unwrap_or_else(|| {
            Rc::new(HeadFileInformationDescriptor::new(
                self.request_options_builder.clone(),
            ))
        });
        let task_id_generator = self
            .task_id_generator
            .unwrap_or_else(|| Rc::new(|url: &str, dir: &Path, name: Option<&str>| {
                default_task_id(url, dir, name)
            }));
        let (fault_tx, mut fault_rx) = unbounded_channel::<ErrorMessage>();
        let tasks: TaskMap = Rc::new(RefCell::new(HashMap::new()));

        // 进程级故障广播: 收到一条就打到全部在册任务上
        let fault_tasks = tasks.clone();
        actix_rt::spawn(async move {
            while let Some(error) = fault_rx.recv().await {
                warn!("收到进程级故障广播: {}", error);
                let snapshot: Vec<_> = fault_tasks.borrow().values().cloned().collect();
                for task in snapshot {
                    task.try_error(-1, error.clone()).await;
                }
            }
        });

        Rc::new(DownloadTaskGroup {
            config_dir: self.config_dir,
            options: self.options,
            describer,
            task_id_generator,
            request_options_builder: self.request_options_builder,
            tasks,
            fault_tx,
        })
    }
}

/// 任务注册表: 同一目标只保留一个任务实例,
/// 终结(完成或取消)的任务自动摘除
pub struct DownloadTaskGroup {
    config_dir: PathBuf,
    options: TaskOptions,
    describer: Rc<dyn FileInformationDescriptor>,
    task_id_generator: Rc<TaskIdGenerator>,
    request_options_builder: Option<Rc<HttpRequestOptionsBuilder>>,
    tasks: TaskMap,
    fault_tx: UnboundedSender<ErrorMessage>,
}

impl DownloadTaskGroup {
    /// 建立(或取回)一个任务. 同一 URL+目标位置映射到同一 task_id,
    /// 重复提交返回已有实例; 配置目录里有恢复信息则续用
    pub async fn new_task(
        &self,
        download_url: &str,
        storage_dir: impl Into<PathBuf>,
        filename: Option<String>,
        attachment: Option<serde_json::Value>,
    ) -> Result<Rc<DownloadTask>, DownloadError> {
        let storage_dir = storage_dir.into();
        let task_id = (self.task_id_generator)(download_url, &storage_dir, filename.as_deref());
        if let Some(existing) = self.tasks.borrow().get(&task_id) {
            return Ok(existing.clone());
        }
        let store = ResumeStore::new(&self.config_dir);
        let descriptor = match store.load(&task_id).await? {
            Some(d) => {
                info!("[{}] 从恢复信息续建任务", simple_task_id(&task_id));
                d
            }
            None => FileDescriptor {
                task_id: task_id.clone(),
                download_url: download_url.to_string(),
                storage_dir,
                filename: filename.unwrap_or_default(),
                config_dir: self.config_dir.clone(),
                chunk_count: self.options.chunk_count,
                content_type: String::new(),
                content_length: -1,
                resumable: false,
                created_at: Utc::now(),
                attachment,
                computed: None,
            },
        };
        let task = DownloadTask::new(
            descriptor,
            self.options.clone(),
            self.describer.clone(),
            store,
            self.request_options_builder.clone(),
        );
        self.tasks.borrow_mut().insert(task_id, task.clone());
        self.watch_task(task.clone());
        Ok(task)
    }

    /// 扫描配置目录, 把上次进程留下的任务全部重建(不自动启动).
    /// 返回重建数量
    pub async fn load_persisted(&self) -> Result<usize, DownloadError> {
        let store = ResumeStore::new(&self.config_dir);
        let mut loaded = 0;
        for descriptor in store.load_all().await? {
            if self.tasks.borrow().contains_key(&descriptor.task_id) {
                continue;
            }
            let task_id = descriptor.task_id.clone();
            let task = DownloadTask::new(
                descriptor,
                self.options.clone(),
                self.describer.clone(),
                ResumeStore::new(&self.config_dir),
                self.request_options_builder.clone(),
            );
            self.tasks.borrow_mut().insert(task_id.clone(), task.clone());
            self.watch_task(task);
            info!("[{}] 恢复历史任务", simple_task_id(&task_id));
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn task(&self, task_id: &str) -> Option<Rc<DownloadTask>> {
        self.tasks.borrow().get(task_id).cloned()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.borrow().keys().cloned().collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub async fn start_task(&self, task_id: &str) -> bool {
        match self.task(task_id) {
            Some(task) => task.start().await,
            None => {
                warn!("start: 未知任务 {}", task_id);
                false
            }
        }
    }

    pub fn stop_task(&self, task_id: &str) -> bool {
        match self.task(task_id) {
            Some(task) => task.stop(),
            None => {
                warn!("stop: 未知任务 {}", task_id);
                false
            }
        }
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        match self.task(task_id) {
            Some(task) => task.cancel().await,
            None => {
                warn!("cancel: 未知任务 {}", task_id);
                false
            }
        }
    }

    /// 同步上下文(如 panic 钩子)可用的故障入口
    pub fn fault_sender(&self) -> UnboundedSender<ErrorMessage> {
        self.fault_tx.clone()
    }

    /// 把一个进程级故障打到全部在册任务上
    pub async fn broadcast_fault(&self, error: ErrorMessage) {
        let snapshot: Vec<_> = self.tasks.borrow().values().cloned().collect();
        for task in snapshot {
            task.try_error(-1, error.clone()).await;
        }
    }

    /// 盯着任务事件流, 终结时从注册表摘除
    fn watch_task(&self, task: Rc<DownloadTask>) {
        let tasks = self.tasks.clone();
        let task_id = task.task_id();
        let mut rx = task.subscribe();
        actix_rt::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DownloadEvent::Finished(_) | DownloadEvent::Canceled(_) => {
                        tasks.borrow_mut().remove(&task_id);
                        break;
                    }
                    _ => {}
                }
            }
        });
    }
}
