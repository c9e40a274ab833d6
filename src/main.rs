use std::rc::Rc;
use std::time::Instant;

use log::info;

use rangedown::cli;
use rangedown::config::Config;
use rangedown::core::describe::HttpRequestOptionsBuilder;
use rangedown::ui::{self, ProgressManager};
use rangedown::{DownloadEvent, DownloadTask, DownloadTaskGroup, DownloadTaskGroupBuilder};

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!(
        "rangedown {} (构建于 {})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_BUILD_TIMESTAMP")
    );

    // 解析参数和配置
    let (args, config) = match cli::Args::parse_args() {
        Ok((args, config)) => (args, config),
        Err(e) => {
            eprintln!("参数解析失败: {}", e);
            std::process::exit(1);
        }
    };

    if args.edit_config {
        cli::open_config_in_editor(&args.config);
        return Ok(());
    }

    let urls = if args.urls.is_empty() && args.file.is_none() {
        Vec::new()
    } else {
        match args.get_urls() {
            Ok(urls) => urls,
            Err(e) => {
                eprintln!("获取URL列表失败: {}", e);
                std::process::exit(1);
            }
        }
    };

    println!("{}", config.get_summary());

    let group = build_group(&config);

    // 先重建历史任务, 再登记本次命令行给的目标
    if config.auto_resume_on_startup {
        let restored = group.load_persisted().await?;
        if restored > 0 {
            println!("恢复了 {} 个未完成的任务", restored);
        }
    }
    let mut tasks = Vec::new();
    for task_id in group.task_ids() {
        if let Some(task) = group.task(&task_id) {
            tasks.push(task);
        }
    }
    for url in &urls {
        let filename = if urls.len() == 1 { args.output.clone() } else { None };
        let task = group
            .new_task(url, &config.download_dir, filename, None)
            .await?;
        if !tasks.iter().any(|t| t.task_id() == task.task_id()) {
            tasks.push(task);
        }
    }
    if tasks.is_empty() {
        eprintln!("没有可下载的任务");
        return Ok(());
    }

    // 未捕获的 panic 也广播给所有任务, 让它们体面落盘
    std::panic::set_hook({
        let fault = group.fault_sender();
        let default_hook = std::panic::take_hook();
        Box::new(move |panic_info| {
            let _ = fault.send(
                rangedown::DownloadError::System(format!("未捕获的异常: {}", panic_info)).into(),
            );
            default_hook(panic_info);
        })
    });

    println!("开始下载 {} 个任务...", tasks.len());
    let started_at = Instant::now();
    let progress = Rc::new(ProgressManager::new());

    let mut waiters = Vec::new();
    for task in &tasks {
        waiters.push(drive_task(task.clone(), &group, progress.clone()));
    }
    let outcomes = futures::future::join_all(waiters).await;

    let success_count = outcomes.iter().filter(|o| o.is_ok()).count();
    let total_size: u64 = outcomes.iter().filter_map(|o| o.as_ref().ok()).copied().sum();
    let summary = ui::DownloadSummary {
        total_files: tasks.len(),
        total_size,
        elapsed_time: started_at.elapsed(),
        success_count,
        failed_count: tasks.len() - success_count,
    };
    println!("{}", summary);
    if success_count < tasks.len() {
        std::process::exit(1);
    }
    Ok(())
}

fn build_group(config: &Config) -> Rc<DownloadTaskGroup> {
    let user_agent = config.user_agent.clone();
    let options_builder: Rc<HttpRequestOptionsBuilder> =
        Rc::new(move |request, _task_id, _index, _from, _to, _written| {
            request.insert_header(("User-Agent", user_agent.as_str()))
        });
    let options = config.task_options();
    DownloadTaskGroupBuilder::new(&config.config_dir)
        .config_chunk_count(options.chunk_count)
        .config_ticktock_millis(options.ticktock_millis)
        .config_http_timeout(options.http_timeout)
        .config_retry_times(options.retry_strategy.max_retries)
        .config_request_options_builder(options_builder)
        .build()
}

/// 启动一个任务并盯完它的事件流, 成功时返回落盘字节数
async fn drive_task(
    task: Rc<DownloadTask>,
    group: &DownloadTaskGroup,
    progress: Rc<ProgressManager>,
) -> Result<u64, ()> {
    let task_id = task.task_id();
    let mut events = task.subscribe();
    if !group.start_task(&task_id).await {
        ui::print_error(&format!("任务 {} 启动失败", task_id));
        return Err(());
    }
    let mut bar_added = false;
    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::Initialized(d) | DownloadEvent::Started(d) => {
                if !bar_added {
                    progress.add_task(&task_id, &d.filename, d.content_length);
                    bar_added = true;
                }
            }
            DownloadEvent::Progress(p) => progress.update_progress(&task_id, &p),
            DownloadEvent::Merge => progress.set_message(&task_id, "合并中..."),
            DownloadEvent::Finished(d) => {
                progress.finish_task(&task_id, "完成");
                ui::print_success(&format!(
                    "{} ({})",
                    d.output_file_path().display(),
                    ui::format_size(d.content_length.max(0) as u64)
                ));
                return Ok(d.content_length.max(0) as u64);
            }
            DownloadEvent::Canceled(d) => {
                progress.abandon_task(&task_id, "已取消");
                ui::print_error(&format!("{} 已取消", d.download_url));
                return Err(());
            }
            DownloadEvent::Error(e) => {
                progress.abandon_task(&task_id, "出错");
                ui::print_error(&format!("下载失败: {}", e));
                return Err(());
            }
            DownloadEvent::Downloading | DownloadEvent::Stopped => {}
        }
    }
    Err(())
}
