//! 定义库中使用的公共类型、错误、配置和内部消息。

use bytes::Bytes;
use faststr::FastStr;
use std::io;
use thiserror::Error;

// --- 公共类型 ---

/// 连接槽位索引的类型别名, 槽位在池中的编号固定不变。
pub type SlotIndex = usize;

/// 分片索引的类型别名。
pub type PieceIndex = u64;

/// 库中通用的 `Result` 类型别名, 错误类型为 `DownloadError`。
pub type Result<T> = std::result::Result<T, DownloadError>;

/// 定义了库中可能发生的所有公共错误类型。
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 网络请求失败, 包装了来自 `reqwest` 的错误。
    #[error("网络请求失败: {0}")]
    Request(#[from] reqwest::Error),
    /// 文件 I/O 错误, 例如创建或写入文件失败。
    #[error("文件 I/O 错误: {0}")]
    Io(#[from] io::Error),
    /// 并发任务执行失败（例如, 任务 panic）。
    #[error("并发任务执行失败: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// 存储后端写入失败, 属于致命错误, 会中止整个下载。
    #[error("存储写入失败: {0}")]
    Storage(String),
    /// 所有连接槽位均已永久失效, 但仍有分片未完成。
    #[error("所有连接均已失效, 仍有 {0} 个分片未完成")]
    AllSlotsRetired(u64),
}

/// 分片分配模式, 决定空闲连接下一次请求哪一段数据。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// 紧凑模式: 从文件头开始, 一片紧接着一片, 连续不断地下载,
    /// 写入局部性最好。
    Compact,
    /// 松散模式: 将文件按连接数平分为 N 个区域, 每个连接负责自己的
    /// 区域, 区域耗尽后再去剩余最多的区域“偷”分片。
    Dispersion,
    /// 快速读取模式: 根据用户读取数据的位置优先下载, 尽快响应
    /// 读取端需要的数据。
    QuickRead,
}

/// 默认连接数限制。
pub const DEFAULT_CONNECTIONS_LIMIT: i32 = 5;
/// 默认分片大小（字节）。
pub const DEFAULT_PIECE_SIZE: i32 = 32768;
/// 默认超时断开时间（秒）。
pub const DEFAULT_TIME_OUT: u64 = 11;
/// 单次请求最多携带的连续分片数。
pub const DEFAULT_REQUEST_PIECES: u32 = 10;

/// 下载设置。
///
/// 数值字段沿用 `-1 表示默认` 的约定, 在 `open` 时统一归一化。
#[derive(Debug, Clone)]
pub struct Settings {
    /// 下载速率限制（字节/秒）, -1 为无限制。仅作为分片调度器的
    /// 粗粒度提示, 以 1 秒为检查周期。
    pub download_rate_limit: i64,
    /// 连接数限制, -1 为默认（5）。
    pub connections_limit: i32,
    /// 分片大小, -1 为默认（文件大小已知时为 32768）。
    pub piece_size: i32,
    /// 超时断开时间（秒）, 一个槽位超过该时长没有任何数据到达即被重置。
    pub time_out: u64,
    /// 分片分配模式, 默认为松散模式。
    pub download_mode: DownloadMode,
    /// 断点续传元数据文件路径, `None` 时默认为输出文件同级的 `.meta` 文件。
    pub meta_file: Option<FastStr>,
    /// 单次分配给一个连接的最大连续分片数。
    pub request_pieces: u32,
    /// 内部通信信道的容量。
    pub channel_capacity: usize,
    /// 写入 Actor 的任务队列容量。
    pub writer_queue_capacity: usize,
}

impl Default for Settings {
    /// 提供一组合理的默认配置。
    fn default() -> Self {
        Self {
            download_rate_limit: -1,
            connections_limit: -1,
            piece_size: -1,
            time_out: DEFAULT_TIME_OUT,
            download_mode: DownloadMode::Dispersion,
            meta_file: None,
            request_pieces: DEFAULT_REQUEST_PIECES,
            channel_capacity: 1024,
            writer_queue_capacity: 128,
        }
    }
}

/// 连接槽位当前所处的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// 空闲, 没有分配任何数据段。
    Idle,
    /// 正在建立连接并发出请求。
    Opening,
    /// 请求已被服务器接受, 等待第一个数据块。
    Requesting,
    /// 正在接收数据流。
    Streaming,
    /// 数据流已结束, 等待存储落盘回执。
    Draining,
    /// 出错或超时后等待重新分配。
    Resetting,
    /// 永久失效, 不再参与调度。
    Retired,
}

/// 面向用户的状态和进度信息消息。
///
/// 用户通过 `DownloadHandle::subscribe` 获得的广播信道接收这些消息。
#[derive(Clone, Debug)]
pub enum DownloadInfo {
    /// 每个心跳周期发送一次的聚合进度更新。
    MonitorUpdate {
        /// 文件总大小（字节）, 服务器未给出时为 `None`。
        total_size: Option<u64>,
        /// 已写入存储的总字节数。
        total_downloaded: u64,
        /// 指数滑动平均后的总下载速度（字节/秒）。
        total_speed: f64,
        /// 已完成的分片数。
        pieces_completed: u64,
        /// 分片总数, 单连接模式下为 1, 大小未知时为 0。
        piece_count: u64,
        /// 每个槽位的详细信息。
        /// 元组内容: `(槽位索引, 阶段, 累计下载字节, 速度)`。
        slot_details: Vec<(SlotIndex, SlotPhase, u64, f64)>,
    },
    /// 一个槽位的阶段发生了变化（例如进入重置）。
    SlotStatusChanged {
        /// 阶段发生改变的槽位索引。
        slot: SlotIndex,
        /// 新的阶段。
        phase: SlotPhase,
        /// 描述变更原因的可选消息。
        message: Option<String>,
    },
}

/// 下载结束后的汇总信息, 由 `DownloadHandle::wait` 返回。
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    /// 已写入存储的总字节数。
    pub total_downloaded: u64,
    /// 文件总大小, 服务器未给出时为 `None`（此时 `completed` 为真即表示
    /// 流式下载读到了 EOF）。
    pub total_size: Option<u64>,
    /// 已完成的分片数。
    pub pieces_completed: u64,
    /// 分片总数。
    pub piece_count: u64,
    /// 是否全部下载完成。用户中止时为假。
    pub completed: bool,
}

// --- 内部 Actor 系统消息 ---

/// 槽位任务和写入 Actor 发送给协调器的事件。
///
/// 每条与槽位相关的事件都携带 `generation`: 槽位每次重置时代数递增,
/// 协调器据此丢弃被取代的旧任务发来的迟到事件, 无须任何锁。
#[derive(Debug)]
pub(crate) enum SystemEvent {
    /// 服务器接受了本次数据请求（状态码检查通过）。
    RequestAccepted { slot: SlotIndex, generation: u64 },
    /// 写入 Actor 已将一段数据写入存储。`completed` 位图只根据
    /// 这个回执推进, 保证位图不会跑在存储前面。
    BytesWritten {
        slot: SlotIndex,
        generation: u64,
        offset: u64,
        len: u64,
    },
    /// 槽位任务的数据流已经结束, `bytes_sent` 为本次请求实际转发的字节数。
    StreamEof {
        slot: SlotIndex,
        generation: u64,
        bytes_sent: u64,
    },
    /// 槽位任务失败。`permanent` 为真表示不可恢复（例如探测成功后
    /// 分段请求却返回 4xx）, 槽位将被退役。
    SlotFailed {
        slot: SlotIndex,
        generation: u64,
        permanent: bool,
        error: String,
    },
    /// 存储后端写入失败, 致命错误。
    StorageFailed { error: String },
}

/// 由协调器发出的指令, 经广播信道发给槽位任务, 经 mpsc 发给写入 Actor。
#[derive(Debug, Clone)]
pub(crate) enum SystemCommand {
    /// 指示写入 Actor 将数据写入存储的指定偏移。
    WriteFile {
        slot: SlotIndex,
        generation: u64,
        offset: u64,
        data: Bytes,
    },
    /// 取消指定代数的槽位任务, 旧任务收到后安静退出。
    CancelSlot { slot: SlotIndex, generation: u64 },
    /// 指示所有槽位任务终止。
    TerminateAll,
}

/// 用户通过 `DownloadHandle` 发给协调器的控制请求。
#[derive(Debug)]
pub(crate) enum ControlRequest {
    /// 中止下载, 协调器置位 abort 标志后进入收尾流程。
    Close,
    /// 更新快速读取模式的读取位置（字节偏移）。
    SetReaderCursor(u64),
}
