//! 多连接下载协调器: 独占全部可变状态的中心任务。
//!
//! 协调器运行在单个任务上, 分片表、槽位簿记和速度统计只在这里被
//! 修改; 槽位任务与写入 Actor 的一切进展都以事件形式汇入, 两次
//! `await` 之间看到的状态始终一致, 因此全程不需要锁。

use crate::meta::MetaFile;
use crate::probe::ResourceInfo;
use crate::scheduler::{Assignment, PieceRun, PieceScheduler, PieceTable};
use crate::slot::{slot_run, SlotTask};
use crate::types::{
    ControlRequest, DownloadError, DownloadInfo, DownloadMode, DownloadSummary, PieceIndex,
    Result, Settings, SlotIndex, SlotPhase, SystemCommand, SystemEvent,
    DEFAULT_CONNECTIONS_LIMIT, DEFAULT_PIECE_SIZE,
};
use log::{debug, error, info, warn};
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

/// 速度计算的平滑因子, 防止速度因瞬时网络波动而剧烈变化。
const SMOOTHING_FACTOR: f64 = 0.15;
/// 失败的槽位重新加入调度前的等待时长。
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// 归一化之后的运行参数, `-1` 约定在这里展开成具体数值。
#[derive(Debug, Clone)]
pub(crate) struct Tuning {
    pub connections: usize,
    pub piece_size: u64,
    pub time_out: Duration,
    pub rate_limit: Option<u64>,
    pub mode: DownloadMode,
    pub request_pieces: u64,
    /// 元数据文件路径, 非多连接模式下禁用（无法分段续传）。
    pub meta_path: Option<PathBuf>,
}

impl Tuning {
    pub fn from_settings(settings: &Settings, info: &ResourceInfo, output_path: &str) -> Self {
        let connections = if settings.connections_limit < 0 {
            DEFAULT_CONNECTIONS_LIMIT as usize
        } else {
            (settings.connections_limit as usize).max(1)
        };
        let piece_size = if settings.piece_size < 0 {
            DEFAULT_PIECE_SIZE as u64
        } else {
            (settings.piece_size as u64).max(1)
        };
        let meta_path = if info.multi() {
            Some(match &settings.meta_file {
                Some(path) => PathBuf::from(path.as_str()),
                None => PathBuf::from(format!("{output_path}.meta")),
            })
        } else {
            None
        };
        Self {
            connections,
            piece_size,
            time_out: Duration::from_secs(settings.time_out.max(1)),
            rate_limit: (settings.download_rate_limit >= 0)
                .then_some(settings.download_rate_limit as u64),
            mode: settings.download_mode,
            request_pieces: settings.request_pieces.max(1) as u64,
            meta_path,
        }
    }
}

/// 协调器侧的槽位簿记。真正的传输发生在独立任务里, 这里只记录
/// 其分配、落盘水位和活跃时间。
#[derive(Debug)]
struct Slot {
    /// 代数: 每次重置递增, 用于丢弃旧任务的迟到事件。
    generation: u64,
    phase: SlotPhase,
    assignment: Option<Assignment>,
    /// 已确认写入存储的绝对偏移。
    watermark: u64,
    /// 当前分配中下一个待标记完成的分片。
    next_complete: PieceIndex,
    /// 数据流结束位置（绝对偏移）, 尚未结束时为 `None`。
    eof_at: Option<u64>,
    /// 槽位生命周期内累计下载的字节。
    total_downloaded: u64,
    bytes_this_tick: u64,
    speed: f64,
    last_activity: Instant,
    /// 重置后允许重新调度的时间点。
    retry_at: Option<Instant>,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            generation: 1,
            phase: SlotPhase::Idle,
            assignment: None,
            watermark: 0,
            next_complete: 0,
            eof_at: None,
            total_downloaded: 0,
            bytes_this_tick: 0,
            speed: 0.0,
            last_activity: now,
            retry_at: None,
        }
    }
}

pub(crate) struct Coordinator {
    tuning: Tuning,
    info: ResourceInfo,
    client: Client,
    table: Option<PieceTable>,
    scheduler: PieceScheduler,
    slots: Vec<Slot>,
    cmd_tx: broadcast::Sender<SystemCommand>,
    writer_tx: mpsc::Sender<SystemCommand>,
    event_tx: mpsc::Sender<SystemEvent>,
    info_tx: broadcast::Sender<DownloadInfo>,
    abort: bool,
    fatal: Option<DownloadError>,
    /// 单连接模式下整条流是否已成功收尾。
    stream_done: bool,
    total_downloaded: u64,
    bytes_this_tick: u64,
    total_speed: f64,
    meta_disabled: bool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tuning: Tuning,
        info: ResourceInfo,
        client: Client,
        table: Option<PieceTable>,
        cmd_tx: broadcast::Sender<SystemCommand>,
        writer_tx: mpsc::Sender<SystemCommand>,
        event_tx: mpsc::Sender<SystemEvent>,
        info_tx: broadcast::Sender<DownloadInfo>,
    ) -> Self {
        let scheduler = PieceScheduler::new(
            tuning.mode,
            tuning.connections,
            tuning.request_pieces,
            info.multi(),
        );
        let now = Instant::now();
        let slots = (0..tuning.connections).map(|_| Slot::new(now)).collect();
        Self {
            tuning,
            info,
            client,
            table,
            scheduler,
            slots,
            cmd_tx,
            writer_tx,
            event_tx,
            info_tx,
            abort: false,
            fatal: None,
            stream_done: false,
            total_downloaded: 0,
            bytes_this_tick: 0,
            total_speed: 0.0,
            meta_disabled: false,
        }
    }

    /// 运行协调器的主事件循环, 直到下载完成、发生致命错误或被用户中止。
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<SystemEvent>,
        mut ctrl_rx: mpsc::Receiver<ControlRequest>,
        writer_handle: JoinHandle<()>,
    ) -> Result<DownloadSummary> {
        info!(
            "[Coordinator] 开始下载: {} (大小: {:?}, 多连接: {})",
            self.info.final_url,
            self.info.total_size,
            self.info.multi()
        );

        // 初始分配: 给每个槽位一次领取任务的机会。续传状态已覆盖全部
        // 分片或资源本身为空时, 没有任何工作可发。
        if !self.transfer_complete() {
            for slot in 0..self.slots.len() {
                self.dispatch(slot);
            }
        }

        // 定时器锚定在绝对期限上, 每次从上一个期限顺延 1 秒, 抵抗漂移。
        let mut ticker = interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let mut last_tick = Instant::now();

        while !self.done() {
            tokio::select! {
                // `biased` 确保优先处理完成事件和用户命令, 而不是定时器。
                biased;

                Some(req) = ctrl_rx.recv() => self.handle_control(req),

                Some(event) = event_rx.recv() => self.handle_event(event),

                _ = ticker.tick() => {
                    let now = Instant::now();
                    let elapsed = (now - last_tick).as_secs_f64();
                    last_tick = now;
                    self.handle_tick(elapsed).await;
                }

                else => break,
            }
        }

        self.teardown(event_rx, writer_handle).await
    }

    fn done(&self) -> bool {
        self.abort || self.fatal.is_some() || self.transfer_complete()
    }

    fn transfer_complete(&self) -> bool {
        match &self.table {
            Some(table) => table.completed.is_full(),
            None => self.stream_done,
        }
    }

    fn handle_control(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Close => {
                info!("[Coordinator] 收到中止请求。");
                self.abort = true;
            }
            ControlRequest::SetReaderCursor(offset) => {
                self.scheduler.set_reader_cursor(offset);
            }
        }
    }

    /// 事件是否来自该槽位当前这一代任务。
    fn current(&self, slot: SlotIndex, generation: u64) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.generation == generation)
    }

    fn handle_event(&mut self, event: SystemEvent) {
        if self.abort {
            return;
        }
        match event {
            SystemEvent::RequestAccepted { slot, generation } => {
                if !self.current(slot, generation) {
                    return;
                }
                let s = &mut self.slots[slot];
                if s.phase == SlotPhase::Opening {
                    s.phase = SlotPhase::Requesting;
                }
                s.last_activity = Instant::now();
            }
            SystemEvent::BytesWritten {
                slot,
                generation,
                offset,
                len,
            } => {
                if !self.current(slot, generation) {
                    return;
                }
                self.on_bytes_written(slot, offset, len);
            }
            SystemEvent::StreamEof {
                slot,
                generation,
                bytes_sent,
            } => {
                if !self.current(slot, generation) {
                    return;
                }
                self.on_stream_eof(slot, bytes_sent);
            }
            SystemEvent::SlotFailed {
                slot,
                generation,
                permanent,
                error,
            } => {
                if !self.current(slot, generation) {
                    return;
                }
                if permanent {
                    self.retire_slot(slot, error);
                } else {
                    self.reset_slot(slot, error, RETRY_DELAY);
                }
            }
            SystemEvent::StorageFailed { error } => {
                error!("[Coordinator] 存储写入失败, 中止下载: {error}");
                self.fatal = Some(DownloadError::Storage(error));
            }
        }
    }

    /// 写入 Actor 的落盘回执: 推进水位, 按分片边界标记完成。
    fn on_bytes_written(&mut self, slot: SlotIndex, offset: u64, len: u64) {
        let s = &mut self.slots[slot];
        debug_assert_eq!(offset, s.watermark, "同一分配内的写入必须连续");
        s.watermark = offset + len;
        s.total_downloaded += len;
        s.bytes_this_tick += len;
        s.last_activity = Instant::now();
        if s.phase == SlotPhase::Requesting {
            s.phase = SlotPhase::Streaming;
        }
        self.total_downloaded += len;
        self.bytes_this_tick += len;

        match self.slots[slot].assignment {
            Some(Assignment::Pieces(run)) => {
                // 水位越过分片上边界即可把该分片标记为完成。
                self.drain_completed(slot, run);
                let s = &self.slots[slot];
                if s.watermark == run.hi && s.eof_at.is_some() {
                    self.finish_assignment(slot);
                }
            }
            Some(Assignment::Unbounded) => {
                let s = &self.slots[slot];
                if s.eof_at == Some(s.watermark) {
                    self.finish_unbounded(slot);
                }
            }
            None => {}
        }
    }

    /// 槽位任务报告数据流结束。短于请求范围视作传输故障。
    fn on_stream_eof(&mut self, slot: SlotIndex, bytes_sent: u64) {
        match self.slots[slot].assignment {
            Some(Assignment::Pieces(run)) => {
                if bytes_sent < run.hi - run.lo {
                    self.reset_slot(
                        slot,
                        format!(
                            "数据流提前结束: 收到 {bytes_sent} 字节, 预期 {}",
                            run.hi - run.lo
                        ),
                        RETRY_DELAY,
                    );
                    return;
                }
                let s = &mut self.slots[slot];
                s.eof_at = Some(run.hi);
                if s.watermark == run.hi {
                    self.finish_assignment(slot);
                } else {
                    s.phase = SlotPhase::Draining;
                }
            }
            Some(Assignment::Unbounded) => {
                // 大小已知（仅不支持分段）时, 短流同样是故障。
                if let Some(table) = &self.table {
                    if bytes_sent < table.total_size {
                        self.reset_slot(
                            slot,
                            format!(
                                "数据流提前结束: 收到 {bytes_sent} 字节, 预期 {}",
                                table.total_size
                            ),
                            RETRY_DELAY,
                        );
                        return;
                    }
                }
                let s = &mut self.slots[slot];
                s.eof_at = Some(bytes_sent);
                if s.watermark == bytes_sent {
                    self.finish_unbounded(slot);
                } else {
                    s.phase = SlotPhase::Draining;
                }
            }
            None => {}
        }
    }

    /// 把槽位当前分配中水位已越过上边界的分片标记为完成。
    fn drain_completed(&mut self, slot: SlotIndex, run: PieceRun) {
        if let Some(table) = &mut self.table {
            let watermark = self.slots[slot].watermark;
            let mut next = self.slots[slot].next_complete;
            while next < run.first + run.count && table.piece_end(next) <= watermark {
                table.complete(next);
                next += 1;
            }
            self.slots[slot].next_complete = next;
        }
    }

    /// 一段分片分配全部落盘, 槽位回到空闲并立刻领取下一段。
    fn finish_assignment(&mut self, slot: SlotIndex) {
        // 零长度分片不产生写入回执, 在这里补记完成。
        if let Some(Assignment::Pieces(run)) = self.slots[slot].assignment {
            self.drain_completed(slot, run);
        }
        let s = &mut self.slots[slot];
        debug!(
            "[Coordinator] 槽位 {slot} 完成分配, 水位 {}",
            s.watermark
        );
        s.assignment = None;
        s.eof_at = None;
        s.phase = SlotPhase::Idle;
        if self.transfer_complete() {
            return;
        }
        self.dispatch(slot);
    }

    /// 单连接模式的整条流成功收尾。
    fn finish_unbounded(&mut self, slot: SlotIndex) {
        let s = &mut self.slots[slot];
        info!(
            "[Coordinator] 流式下载结束, 共 {} 字节",
            s.watermark
        );
        s.assignment = None;
        s.eof_at = None;
        s.phase = SlotPhase::Idle;
        if let Some(table) = &mut self.table {
            for i in 0..table.piece_count {
                table.complete(i);
            }
        }
        self.stream_done = true;
    }

    /// 瞬时故障或超时: 取消当前任务, 整片释放未完成的分片,
    /// 等待 `delay` 后重新加入调度。
    fn reset_slot(&mut self, slot: SlotIndex, reason: String, delay: Duration) {
        warn!("[Coordinator] 槽位 {slot} 重置: {reason}");
        let old_generation = self.slots[slot].generation;
        let _ = self.cmd_tx.send(SystemCommand::CancelSlot {
            slot,
            generation: old_generation,
        });
        self.release_assignment(slot);
        let s = &mut self.slots[slot];
        s.generation += 1;
        s.phase = SlotPhase::Resetting;
        s.watermark = 0;
        s.eof_at = None;
        s.last_activity = Instant::now();
        s.retry_at = Some(Instant::now() + delay);
        let _ = self.info_tx.send(DownloadInfo::SlotStatusChanged {
            slot,
            phase: SlotPhase::Resetting,
            message: Some(reason),
        });
    }

    /// 不可恢复的槽位故障: 释放其分配并永久移出调度。
    fn retire_slot(&mut self, slot: SlotIndex, reason: String) {
        error!("[Coordinator] 槽位 {slot} 退役: {reason}");
        self.release_assignment(slot);
        let s = &mut self.slots[slot];
        s.generation += 1;
        s.phase = SlotPhase::Retired;
        let _ = self.info_tx.send(DownloadInfo::SlotStatusChanged {
            slot,
            phase: SlotPhase::Retired,
            message: Some(reason),
        });

        // 所有槽位都退役（或单连接模式下 0 号退役）而任务未完成时,
        // 下载不可能再推进, 向用户报告致命错误。
        let stuck = self
            .slots
            .iter()
            .all(|s| s.phase == SlotPhase::Retired)
            || (!self.info.multi() && slot == 0);
        if stuck && !self.transfer_complete() {
            let remaining = self.table.as_ref().map_or(1, |t| t.remaining());
            self.fatal = Some(DownloadError::AllSlotsRetired(remaining));
        }
    }

    /// 释放槽位当前分配占用的分片（保留已完成的位）。
    fn release_assignment(&mut self, slot: SlotIndex) {
        match self.slots[slot].assignment.take() {
            Some(Assignment::Pieces(run)) => {
                if let Some(table) = &mut self.table {
                    table.release(run.first, run.count);
                }
            }
            Some(Assignment::Unbounded) => {
                if let Some(table) = &mut self.table {
                    table.release(0, table.piece_count);
                }
                self.scheduler.release_tail();
            }
            None => {}
        }
    }

    /// 向调度器领取下一段数据并启动传输任务。
    fn dispatch(&mut self, slot: SlotIndex) {
        if self.abort || self.slots[slot].phase == SlotPhase::Retired {
            return;
        }
        let assignment = self
            .scheduler
            .next_assignment(self.table.as_mut(), slot);
        let s = &mut self.slots[slot];
        let Some(assignment) = assignment else {
            s.phase = SlotPhase::Idle;
            s.assignment = None;
            s.retry_at = None;
            return;
        };

        let range = match assignment {
            Assignment::Pieces(run) => {
                s.watermark = run.lo;
                s.next_complete = run.first;
                Some((run.lo, run.hi))
            }
            Assignment::Unbounded => {
                s.watermark = 0;
                s.next_complete = 0;
                None
            }
        };
        s.assignment = Some(assignment);
        s.eof_at = None;
        s.phase = SlotPhase::Opening;
        s.last_activity = Instant::now();
        s.retry_at = None;
        let generation = s.generation;

        debug!(
            "[Coordinator] 槽位 {slot} (第 {generation} 代) 领取范围 {range:?}"
        );

        let task = SlotTask {
            slot,
            generation,
            range,
            writer_tx: self.writer_tx.clone(),
            cmd_rx: self.cmd_tx.subscribe(),
            event_tx: self.event_tx.clone(),
        };
        let rb = self.client.get(self.info.final_url.as_str());
        tokio::spawn(slot_run(task, rb));
    }

    /// 1 Hz 心跳: 超时检测、速度统计、重新调度与元数据落盘。
    async fn handle_tick(&mut self, elapsed_secs: f64) {
        if self.abort || elapsed_secs <= 0.0 {
            return;
        }

        // 超时检测: 超过 time_out 没有任何数据到达的活跃槽位立即重置,
        // 不附加重试延迟。
        let now = Instant::now();
        let timed_out: Vec<SlotIndex> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(
                    s.phase,
                    SlotPhase::Opening
                        | SlotPhase::Requesting
                        | SlotPhase::Streaming
                        | SlotPhase::Draining
                ) && now.duration_since(s.last_activity) > self.tuning.time_out
            })
            .map(|(i, _)| i)
            .collect();
        for slot in timed_out {
            self.reset_slot(
                slot,
                format!("超过 {:?} 未收到数据", self.tuning.time_out),
                Duration::ZERO,
            );
        }

        // 吞吐统计与限速提示: 先根据本周期字节数更新, 再清零计数。
        let instant_rate = self.bytes_this_tick as f64 / elapsed_secs;
        self.total_speed =
            self.total_speed * (1.0 - SMOOTHING_FACTOR) + instant_rate * SMOOTHING_FACTOR;
        for s in &mut self.slots {
            let rate = s.bytes_this_tick as f64 / elapsed_secs;
            s.speed = s.speed * (1.0 - SMOOTHING_FACTOR) + rate * SMOOTHING_FACTOR;
            s.bytes_this_tick = 0;
        }
        let throttled = self
            .tuning
            .rate_limit
            .is_some_and(|limit| instant_rate as u64 > limit);
        self.scheduler.set_throttled(throttled);
        self.bytes_this_tick = 0;

        // 到期的重置槽位与空闲槽位重新领取任务。
        for slot in 0..self.slots.len() {
            let s = &self.slots[slot];
            let ready = match s.phase {
                SlotPhase::Resetting => s
                    .retry_at
                    .is_none_or(|at| now >= at),
                SlotPhase::Idle => s.assignment.is_none(),
                _ => false,
            };
            if ready {
                self.dispatch(slot);
            }
        }

        // 元数据落盘, 出错时放弃本会话的续传能力但不中断下载。
        self.flush_meta().await;

        self.send_monitor_update();
    }

    async fn flush_meta(&mut self) {
        if self.meta_disabled {
            return;
        }
        let (Some(path), Some(meta)) = (&self.tuning.meta_path, self.snapshot_meta()) else {
            return;
        };
        if let Err(e) = meta.store(path).await {
            warn!("[Coordinator] 写入元数据失败, 本次会话禁用续传: {e}");
            self.meta_disabled = true;
        }
    }

    fn snapshot_meta(&self) -> Option<MetaFile> {
        let table = self.table.as_ref()?;
        Some(MetaFile {
            url: self.info.final_url.clone(),
            total_size: table.total_size as i64,
            piece_size: table.piece_size as i32,
            piece_count: table.piece_count as i32,
            bitmap: table.completed.clone(),
        })
    }

    fn send_monitor_update(&self) {
        let slot_details = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.phase, s.total_downloaded, s.speed))
            .collect();
        let _ = self.info_tx.send(DownloadInfo::MonitorUpdate {
            total_size: self.info.total_size,
            total_downloaded: self.total_downloaded,
            total_speed: self.total_speed,
            pieces_completed: self.table.as_ref().map_or(0, |t| t.completed.popcount()),
            piece_count: self.table.as_ref().map_or(0, |t| t.piece_count),
            slot_details,
        });
    }

    /// 收尾: 终止所有任务, 等待写入 Actor 落盘退出, 处理元数据残留。
    async fn teardown(
        mut self,
        mut event_rx: mpsc::Receiver<SystemEvent>,
        mut writer_handle: JoinHandle<()>,
    ) -> Result<DownloadSummary> {
        info!("[Coordinator] 进入收尾流程。");
        let _ = self.cmd_tx.send(SystemCommand::TerminateAll);

        let completed = self.transfer_complete();
        let summary = DownloadSummary {
            total_downloaded: self.total_downloaded,
            total_size: self.info.total_size,
            pieces_completed: self.table.as_ref().map_or(0, |t| t.completed.popcount()),
            piece_count: self.table.as_ref().map_or(0, |t| t.piece_count),
            completed,
        };
        let meta = self.snapshot_meta();
        let meta_path = self.tuning.meta_path.clone();
        let meta_enabled = !self.meta_disabled;
        let fatal = self.fatal.take();

        // 关闭写入信道后, 写入 Actor 会排空队列、刷新存储并退出。
        // 等待期间继续丢弃迟到事件, 防止回执信道塞满造成相互等待。
        drop(self.writer_tx);
        loop {
            tokio::select! {
                res = &mut writer_handle => {
                    if let Err(e) = res {
                        error!("[Coordinator] 写入 Actor 异常退出: {e}");
                    }
                    break;
                }
                Some(_) = event_rx.recv() => {}
            }
        }

        if let Some(path) = meta_path {
            if completed {
                // 下载完成后清理元数据文件。
                let _ = tokio::fs::remove_file(&path).await;
            } else if meta_enabled {
                if let Some(meta) = meta {
                    if let Err(e) = meta.store(&path).await {
                        warn!("[Coordinator] 收尾时写入元数据失败: {e}");
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            "[Coordinator] 收尾完成: 已下载 {} 字节, completed={completed}",
            summary.total_downloaded
        );
        Ok(summary)
    }
}
