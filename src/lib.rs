//! 一个支持多连接、断点续传和多种分片分配策略的 HTTP 分段下载器库。
//!
//! # 核心特性
//!
//! - **多连接下载**: 对支持 `Range` 请求的服务器, 将文件切成分片,
//!   由持久的连接池并行拉取, 榨干单连接吃不满的链路。
//! - **断点续传**: 完成位图随下载持续写入元数据文件, 中断后可从
//!   上次的位置继续; 校验失败或与服务器信息不符时自动从头开始。
//! - **三种分配模式**: 紧凑（顺序写入局部性）、松散（全文件铺开）、
//!   快速读取（优先下载读取位置之后的数据）。
//! - **故障自愈**: 超时或出错的连接被整体重置, 其未完成的分片整片
//!   重新分配给其它连接。
//! - **异步 IO**: 完全基于 `tokio` 构建; 所有可变状态由单个协调器
//!   任务独占, 全程无锁。
//! - **自定义客户端与存储**: 允许通过 `reqwest::ClientBuilder` 定制
//!   HTTP 客户端, 通过 [`Storage`] trait 接入自定义存储后端。
//!
//! # 架构
//!
//! 系统由一组经信道通信的任务构成, 不共享任何可变内存:
//!
//! - **`Downloader`**: 入口。执行同步探测, 装配其余组件。
//! - **协调器**: 中心任务, 独占分片表与连接池簿记, 消费所有事件,
//!   按 1 Hz 心跳做超时检测、速度统计与元数据落盘。
//! - **槽位任务**: 每个连接一个, 把一段字节从 HTTP 流搬运到写入
//!   Actor, 自身无状态。
//! - **写入 Actor**: 独占存储后端, 串行执行随机偏移写入并逐条回执,
//!   完成位图只依据回执推进。

mod coordinator;
mod downloader;
mod meta;
mod probe;
mod rangefield;
mod scheduler;
mod slot;
mod storage;
#[cfg(test)]
mod testserver;
mod types;

// --- 公共 API 导出 ---

// 核心入口与句柄。
pub use downloader::{DownloadHandle, Downloader};
// 可插拔存储接口及默认实现。
pub use storage::{FileStorage, Storage, StorageFactory, StorageTarget};
// 断点续传元数据格式, 便于外部工具检查。
pub use meta::MetaFile;
// 分片位图。
pub use rangefield::RangeField;
// 重新导出 `reqwest`, 允许用户提供自定义的 `ClientBuilder`。
pub use reqwest;
// 公共类型, 方便用户在类型注解和模式匹配中使用。
pub use types::{
    DownloadError, DownloadInfo, DownloadMode, DownloadSummary, PieceIndex, Result, Settings,
    SlotIndex, SlotPhase,
};
