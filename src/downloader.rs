//! 下载器入口与用户侧句柄。

use crate::coordinator::{Coordinator, Tuning};
use crate::meta::MetaFile;
use crate::probe::{probe, ResourceInfo};
use crate::scheduler::PieceTable;
use crate::storage::{open_storage, spawn_writer, StorageFactory, StorageTarget};
use crate::types::{
    ControlRequest, DownloadInfo, DownloadSummary, Result, Settings, SystemCommand, SystemEvent,
};
use faststr::FastStr;
use log::{debug, info, warn};
use reqwest::ClientBuilder;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// 多连接下载器, 系统的入口。
///
/// 构造后调用 [`Downloader::open`] 进行同步探测并启动协调器,
/// 或直接用 [`Downloader::run`] 一步跑到结束。
pub struct Downloader<F>
where
    F: Fn() -> ClientBuilder,
{
    url: FastStr,
    output_path: FastStr,
    settings: Settings,
    client_builder: F,
}

impl<F> Downloader<F>
where
    F: Fn() -> ClientBuilder + Send + Sync + 'static,
{
    /// 创建一个新的 `Downloader` 实例。
    ///
    /// # 参数
    ///
    /// * `url`: 要下载的资源 URL。
    /// * `output_path`: 保存文件的本地路径。
    /// * `settings`: 下载设置, 见 [`Settings`]。
    /// * `client_builder`: 返回 `reqwest::ClientBuilder` 的闭包, 用于
    ///   定制 HTTP 客户端（代理、UA、超时等）。
    pub fn new(
        url: impl Into<FastStr>,
        output_path: impl Into<FastStr>,
        settings: Settings,
        client_builder: F,
    ) -> Self {
        Self {
            url: url.into(),
            output_path: output_path.into(),
            settings,
            client_builder,
        }
    }

    /// 探测服务器能力并启动下载。
    ///
    /// 本方法完成同步探测、分片表与续传状态的构建、存储与写入 Actor
    /// 的创建, 随后把协调器派生为独立任务并立即返回; 此后的一切进展
    /// 都由事件驱动, 通过返回的 [`DownloadHandle`] 观察和控制。
    ///
    /// `storage_factory` 为 `None` 时使用默认的本地文件存储。
    pub async fn open(self, storage_factory: Option<StorageFactory>) -> Result<DownloadHandle> {
        info!("打开下载: '{}' -> '{}'", self.url, self.output_path);

        // 1. 同步探测。失败直接返回错误, 不创建任何状态。
        let client = (self.client_builder)().build()?;
        let resource = probe(&client, self.url.as_str()).await?;
        let tuning = Tuning::from_settings(&self.settings, &resource, self.output_path.as_str());

        // 2. 构建分片表。支持分段且大小已知时进入多连接模式;
        //    只知道大小时退化为单分片; 大小未知时没有分片表。
        let mut table = match (resource.multi(), resource.total_size) {
            (true, Some(total)) => Some(PieceTable::new(total, tuning.piece_size)),
            (false, Some(total)) => Some(PieceTable::single(total)),
            (_, None) => None,
        };

        // 3. 加载兼容的元数据文件, 采纳其完成位图作为续传起点。
        if let (Some(path), Some(table)) = (&tuning.meta_path, table.as_mut()) {
            if let Some(meta) = MetaFile::load(path).await {
                if meta.matches(
                    resource.final_url.as_str(),
                    table.total_size,
                    table.piece_size,
                    table.piece_count,
                ) {
                    info!(
                        "发现可用的续传状态: {}/{} 分片已完成",
                        meta.bitmap.popcount(),
                        table.piece_count
                    );
                    table.adopt_completed(meta.bitmap);
                } else {
                    warn!("元数据与本次探测不匹配, 已丢弃, 从头开始下载");
                }
            }
        }

        // 4. 打开存储并启动写入 Actor。
        let storage = open_storage(
            storage_factory,
            StorageTarget {
                path: self.output_path.clone(),
                total_size: resource.total_size,
            },
        )
        .await?;

        // 5. 创建信道, 派生写入 Actor 与协调器。
        let (event_tx, event_rx) = mpsc::channel::<SystemEvent>(self.settings.channel_capacity);
        let (cmd_tx, _) = broadcast::channel::<SystemCommand>(self.settings.channel_capacity);
        let (info_tx, _) = broadcast::channel::<DownloadInfo>(self.settings.channel_capacity);
        let (ctrl_tx, ctrl_rx) = mpsc::channel::<ControlRequest>(8);

        let (writer_tx, writer_handle) = spawn_writer(
            storage,
            self.settings.writer_queue_capacity,
            event_tx.clone(),
        );

        let coordinator = Coordinator::new(
            tuning,
            resource.clone(),
            client,
            table,
            cmd_tx,
            writer_tx,
            event_tx,
            info_tx.clone(),
        );
        let task = tokio::spawn(coordinator.run(event_rx, ctrl_rx, writer_handle));
        debug!("[Downloader] 协调器已启动。");

        Ok(DownloadHandle {
            ctrl_tx,
            info_tx,
            task,
            resource,
        })
    }

    /// 启动下载并等待其结束的便捷方法。
    ///
    /// # 参数
    ///
    /// * `progress_handler`: 一个异步闭包, 接收文件总大小和进度事件的
    ///   广播接收端, 会被派生为独立任务处理进度更新。
    pub async fn run<P, Fut>(self, progress_handler: P) -> Result<DownloadSummary>
    where
        P: FnOnce(Option<u64>, broadcast::Receiver<DownloadInfo>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.open(None).await?;
        tokio::spawn(progress_handler(handle.total_size(), handle.subscribe()));
        handle.wait().await
    }
}

/// 一次进行中的下载的句柄。
///
/// 句柄本身不驱动下载（协调器在自己的任务里运行）, 只用于订阅进度、
/// 下发控制命令和等待结果。
pub struct DownloadHandle {
    ctrl_tx: mpsc::Sender<ControlRequest>,
    info_tx: broadcast::Sender<DownloadInfo>,
    task: JoinHandle<Result<DownloadSummary>>,
    resource: ResourceInfo,
}

impl DownloadHandle {
    /// 订阅进度与状态事件。
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadInfo> {
        self.info_tx.subscribe()
    }

    /// 中止下载。协调器会取消所有在途请求、落盘续传状态后退出,
    /// 随后 [`DownloadHandle::wait`] 返回 `completed = false` 的汇总。
    pub async fn close(&self) {
        let _ = self.ctrl_tx.send(ControlRequest::Close).await;
    }

    /// 更新快速读取模式的读取位置, 调度器将优先下载该偏移之后的分片。
    /// 其它模式下调用无副作用。
    pub async fn set_reader_cursor(&self, offset: u64) {
        let _ = self
            .ctrl_tx
            .send(ControlRequest::SetReaderCursor(offset))
            .await;
    }

    /// 等待下载结束并取回汇总信息。
    ///
    /// 通过可变借用等待, 便于在 `tokio::time::timeout` 之类的包装里
    /// 周期性醒来做别的事（例如推进读取位置）后继续等待。结果只会
    /// 产生一次, 取回后不应再次调用。
    pub async fn wait(&mut self) -> Result<DownloadSummary> {
        (&mut self.task).await?
    }

    /// 探测得到的文件总大小。
    pub fn total_size(&self) -> Option<u64> {
        self.resource.total_size
    }

    /// 跳转后的最终 URL。
    pub fn final_url(&self) -> &str {
        self.resource.final_url.as_str()
    }

    /// 服务器是否支持分段请求。
    pub fn accepts_ranges(&self) -> bool {
        self.resource.accepts_ranges
    }

    /// 服务器是否声明了长连接。连接复用由 HTTP 客户端的连接池负责,
    /// 这里仅透出探测结果。
    pub fn keep_alive(&self) -> bool {
        self.resource.keep_alive
    }
}
