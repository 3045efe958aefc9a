//! 单个连接槽位的数据传输任务。
//!
//! 任务只负责把一段字节从 HTTP 流搬运到写入 Actor, 自身不持有任何
//! 协调器状态; 进度、完成与失败都以事件形式发回协调器, 由协调器在
//! 自己的任务里统一处理。

use crate::types::{SlotIndex, SystemCommand, SystemEvent};
use bytes::Bytes;
use futures_util::StreamExt;
use log::{trace, warn};
use reqwest::header::RANGE;
use reqwest::{RequestBuilder, StatusCode};
use tokio::sync::{broadcast, mpsc};

/// 转发给写入 Actor 的单次写入上限, 与下载缓冲的尺寸一致。
pub(crate) const WRITE_CHUNK_SIZE: usize = 2048;

/// 槽位任务的执行参数。
pub(crate) struct SlotTask {
    pub slot: SlotIndex,
    pub generation: u64,
    /// 请求的字节范围 `[lo, hi)`; `None` 表示开区间的整资源请求,
    /// 不携带 Range 头。
    pub range: Option<(u64, u64)>,
    pub writer_tx: mpsc::Sender<SystemCommand>,
    pub cmd_rx: broadcast::Receiver<SystemCommand>,
    pub event_tx: mpsc::Sender<SystemEvent>,
}

/// 槽位任务主体: 发出（可能带 Range 的）GET, 把响应体切成不超过
/// [`WRITE_CHUNK_SIZE`] 的写入命令交给写入 Actor。
pub(crate) async fn slot_run(task: SlotTask, rb: RequestBuilder) {
    let SlotTask {
        slot,
        generation,
        range,
        writer_tx,
        mut cmd_rx,
        event_tx,
    } = task;

    // 零长度的分配没有字节可取, 直接报告空流结束, 不访问网络
    // (也避免 `hi - 1` 在空区间上回绕)。
    if let Some((lo, hi)) = range {
        if hi <= lo {
            let _ = event_tx
                .send(SystemEvent::StreamEof {
                    slot,
                    generation,
                    bytes_sent: 0,
                })
                .await;
            return;
        }
    }

    let rb = match range {
        Some((lo, hi)) => rb.header(RANGE, format!("bytes={}-{}", lo, hi - 1)),
        None => rb,
    };

    let response = match rb.send().await {
        Ok(resp) => resp,
        Err(e) => {
            let _ = event_tx
                .send(SystemEvent::SlotFailed {
                    slot,
                    generation,
                    permanent: false,
                    error: format!("{e}"),
                })
                .await;
            return;
        }
    };

    let status = response.status();
    if status.is_client_error() {
        // 探测阶段成功而分段请求返回 4xx, 视为该槽位不可恢复。
        warn!("[Slot {slot}] 请求被服务器拒绝: {status}");
        let _ = event_tx
            .send(SystemEvent::SlotFailed {
                slot,
                generation,
                permanent: true,
                error: format!("服务器返回 {status}"),
            })
            .await;
        return;
    }
    if !status.is_success() {
        let _ = event_tx
            .send(SystemEvent::SlotFailed {
                slot,
                generation,
                permanent: false,
                error: format!("服务器返回 {status}"),
            })
            .await;
        return;
    }
    if range.is_some() && status != StatusCode::PARTIAL_CONTENT {
        // 服务器在探测时承诺过分段, 这里却整体返回, 重置后再试。
        let _ = event_tx
            .send(SystemEvent::SlotFailed {
                slot,
                generation,
                permanent: false,
                error: format!("分段请求未返回 206, 而是 {status}"),
            })
            .await;
        return;
    }

    if event_tx
        .send(SystemEvent::RequestAccepted { slot, generation })
        .await
        .is_err()
    {
        return;
    }

    let (lo, hi) = match range {
        Some((lo, hi)) => (lo, Some(hi)),
        None => (0, None),
    };
    let mut offset = lo;
    let mut stream = response.bytes_stream();

    loop {
        tokio::select! {
            // `biased` 确保控制命令优先于数据, 取消和终止都能及时生效。
            biased;

            Ok(cmd) = cmd_rx.recv() => match cmd {
                SystemCommand::CancelSlot { slot: s, generation: g }
                    if s == slot && g == generation =>
                {
                    trace!("[Slot {slot}] 第 {generation} 代任务被取消");
                    return;
                }
                SystemCommand::TerminateAll => return,
                _ => {}
            },

            chunk = stream.next() => match chunk {
                Some(Ok(mut chunk)) => {
                    // 裁掉超出请求范围的数据。
                    if let Some(hi) = hi {
                        let allowed = hi.saturating_sub(offset);
                        if allowed == 0 {
                            break;
                        }
                        if chunk.len() as u64 > allowed {
                            chunk.truncate(allowed as usize);
                        }
                    }
                    // 按写入缓冲上限切分后交给写入 Actor。
                    while !chunk.is_empty() {
                        let take = chunk.len().min(WRITE_CHUNK_SIZE);
                        let part: Bytes = chunk.split_to(take);
                        if writer_tx
                            .send(SystemCommand::WriteFile {
                                slot,
                                generation,
                                offset,
                                data: part,
                            })
                            .await
                            .is_err()
                        {
                            // 写入信道关闭说明系统正在收尾。
                            return;
                        }
                        offset += take as u64;
                    }
                    if hi == Some(offset) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = event_tx
                        .send(SystemEvent::SlotFailed {
                            slot,
                            generation,
                            permanent: false,
                            error: format!("下载流错误: {e}"),
                        })
                        .await;
                    return;
                }
                // 流结束。
                None => break,
            },

            else => return,
        }
    }

    let _ = event_tx
        .send(SystemEvent::StreamEof {
            slot,
            generation,
            bytes_sent: offset - lo,
        })
        .await;
}
