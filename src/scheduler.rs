//! 分片表与分片调度器: 决定空闲连接下一次请求哪一段字节。

use crate::rangefield::RangeField;
use crate::types::{DownloadMode, PieceIndex, SlotIndex};
use log::{debug, trace};

/// 分片表: 以分片为粒度记录完成与占用状态。
///
/// 只被协调器任务持有和修改, 两张位图在每个心跳边界满足
/// `completed ∧ in_flight = ∅`。
#[derive(Debug)]
pub(crate) struct PieceTable {
    /// 文件总大小。
    pub total_size: u64,
    /// 分片大小, 打开后不再变化。
    pub piece_size: u64,
    /// 分片总数 `⌈total_size / piece_size⌉`。
    pub piece_count: u64,
    /// 已完全写入存储的分片。
    pub completed: RangeField,
    /// 正在被某个连接下载的分片。
    pub in_flight: RangeField,
}

impl PieceTable {
    pub fn new(total_size: u64, piece_size: u64) -> Self {
        debug_assert!(piece_size > 0);
        // 空资源没有分片, 空位图视作已满, 下载开箱即完成。
        let piece_count = total_size.div_ceil(piece_size);
        Self {
            total_size,
            piece_size,
            piece_count,
            completed: RangeField::new(piece_count),
            in_flight: RangeField::new(piece_count),
        }
    }

    /// 单连接模式的退化分片表: 整个文件视作一个分片, 空文件没有分片。
    pub fn single(total_size: u64) -> Self {
        Self::new(total_size, total_size.max(1))
    }

    /// 分片 i 的起始字节。
    pub fn piece_start(&self, i: PieceIndex) -> u64 {
        i * self.piece_size
    }

    /// 分片 i 的字节长度, 末尾分片可能偏短。
    pub fn piece_len(&self, i: PieceIndex) -> u64 {
        if i + 1 == self.piece_count {
            self.total_size - (self.piece_count - 1) * self.piece_size
        } else {
            self.piece_size
        }
    }

    /// 分片 i 的结束字节（不含）。
    pub fn piece_end(&self, i: PieceIndex) -> u64 {
        self.piece_start(i) + self.piece_len(i)
    }

    /// 采纳元数据文件中的完成位图作为续传起点。
    pub fn adopt_completed(&mut self, bitmap: RangeField) {
        debug_assert_eq!(bitmap.len(), self.piece_count);
        self.completed = bitmap;
    }

    /// 占用 `[first, first+count)` 的分片。
    pub fn claim(&mut self, first: PieceIndex, count: u64) {
        for i in first..first + count {
            debug_assert!(!self.completed.test(i));
            self.in_flight.mark(i);
        }
    }

    /// 将分片标记为完成并解除占用。
    pub fn complete(&mut self, i: PieceIndex) {
        self.in_flight.clear(i);
        self.completed.mark(i);
    }

    /// 释放 `[first, first+count)` 中尚未完成的分片, 供调度器重新分配。
    pub fn release(&mut self, first: PieceIndex, count: u64) {
        for i in first..(first + count).min(self.piece_count) {
            if !self.completed.test(i) {
                self.in_flight.clear(i);
            }
        }
    }

    /// 尚未完成的分片数。
    pub fn remaining(&self) -> u64 {
        self.piece_count - self.completed.popcount()
    }

    /// 分片 i 当前是否可被分配。
    fn eligible(&self, i: PieceIndex) -> bool {
        !self.completed.test(i) && !self.in_flight.test(i)
    }
}

/// 一次分配出去的连续分片段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PieceRun {
    /// 第一个分片索引。
    pub first: PieceIndex,
    /// 连续分片数。
    pub count: u64,
    /// 起始字节（含）。
    pub lo: u64,
    /// 结束字节（不含）。
    pub hi: u64,
}

/// 分配给一个槽位的下载任务。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Assignment {
    /// 多连接模式下的一段连续分片。
    Pieces(PieceRun),
    /// 单连接模式下的开区间 `[0, ∞)`, 只会分配一次。
    Unbounded,
}

/// 分片调度器。
///
/// 多连接模式下按配置的分配策略挑选“未完成且未被占用”的分片段;
/// 服务器不支持分段或大小未知时, 只向 0 号槽位发放一次开区间任务。
#[derive(Debug)]
pub(crate) struct PieceScheduler {
    mode: DownloadMode,
    connections: usize,
    request_pieces: u64,
    multi: bool,
    /// 快速读取模式的读取位置（字节偏移）, 由用户随时更新。
    reader_cursor: u64,
    /// 上个心跳周期的吞吐超过速率限制时置位, 本周期不再发放任务。
    throttled: bool,
    tail_claimed: bool,
}

impl PieceScheduler {
    pub fn new(mode: DownloadMode, connections: usize, request_pieces: u64, multi: bool) -> Self {
        debug!(
            "调度器已创建: 模式={mode:?}, 连接数={connections}, 单次分片数={request_pieces}, 多连接={multi}"
        );
        Self {
            mode,
            connections: connections.max(1),
            request_pieces: request_pieces.max(1),
            multi,
            reader_cursor: 0,
            throttled: false,
            tail_claimed: false,
        }
    }

    pub fn set_reader_cursor(&mut self, offset: u64) {
        self.reader_cursor = offset;
    }

    pub fn set_throttled(&mut self, throttled: bool) {
        self.throttled = throttled;
    }

    /// 单连接模式下的任务被重置后, 允许重新发放开区间任务。
    pub fn release_tail(&mut self) {
        self.tail_claimed = false;
    }

    /// 为 `slot` 挑选下一段数据。返回 `None` 表示当前没有可分配的工作。
    pub fn next_assignment(
        &mut self,
        table: Option<&mut PieceTable>,
        slot: SlotIndex,
    ) -> Option<Assignment> {
        if !self.multi {
            // 退化为单连接: 仅 0 号槽位, 整个资源一次性分配。
            if slot == 0 && !self.tail_claimed {
                self.tail_claimed = true;
                if let Some(table) = table {
                    table.claim(0, table.piece_count);
                }
                return Some(Assignment::Unbounded);
            }
            return None;
        }
        if self.throttled {
            trace!("速率超限, 本周期不向槽位 {slot} 发放任务");
            return None;
        }
        let table = table?;

        let (first, limit) = match self.mode {
            DownloadMode::Compact => (
                RangeField::first_clear_both_in(
                    &table.completed,
                    &table.in_flight,
                    0,
                    table.piece_count,
                )?,
                table.piece_count,
            ),
            DownloadMode::Dispersion => self.pick_dispersion(table, slot)?,
            DownloadMode::QuickRead => (self.pick_quick_read(table)?, table.piece_count),
        };

        // 从 first 起向后延伸连续的可分配分片, 不超过单次上限和区域边界。
        let mut count = 1u64;
        while count < self.request_pieces && first + count < limit && table.eligible(first + count)
        {
            count += 1;
        }
        table.claim(first, count);

        let run = PieceRun {
            first,
            count,
            lo: table.piece_start(first),
            hi: table.piece_end(first + count - 1),
        };
        trace!(
            "槽位 {slot} 分得分片 [{}, {}), 字节 [{}, {})",
            run.first,
            run.first + run.count,
            run.lo,
            run.hi
        );
        Some(Assignment::Pieces(run))
    }

    /// 松散模式: 先找自己的区域, 区域耗尽后偷剩余最多的区域。
    /// 返回 `(起始分片, 区域上界)`。
    fn pick_dispersion(
        &self,
        table: &PieceTable,
        slot: SlotIndex,
    ) -> Option<(PieceIndex, PieceIndex)> {
        let region_len = table.piece_count.div_ceil(self.connections as u64).max(1);
        let region = |k: u64| -> (u64, u64) {
            let lo = k * region_len;
            (lo.min(table.piece_count), ((k + 1) * region_len).min(table.piece_count))
        };

        let (own_lo, own_hi) = region(slot as u64);
        if let Some(first) =
            RangeField::first_clear_both_in(&table.completed, &table.in_flight, own_lo, own_hi)
        {
            return Some((first, own_hi));
        }

        // 自己的区域已经没有可分配的分片, 从剩余工作最多的区域偷。
        let mut best: Option<(u64, u64, u64)> = None; // (剩余数, 区域lo, 区域hi)
        for k in 0..self.connections as u64 {
            let (lo, hi) = region(k);
            let left = RangeField::count_clear_both_in(&table.completed, &table.in_flight, lo, hi);
            if left > 0 && best.map_or(true, |(b, ..)| left > b) {
                best = Some((left, lo, hi));
            }
        }
        let (_, lo, hi) = best?;
        let first = RangeField::first_clear_both_in(&table.completed, &table.in_flight, lo, hi)?;
        Some((first, hi))
    }

    /// 快速读取模式: 从读取位置所在的分片向后找, 尾部耗尽后回绕到文件头。
    fn pick_quick_read(&self, table: &PieceTable) -> Option<PieceIndex> {
        let cursor_piece = (self.reader_cursor / table.piece_size).min(table.piece_count);
        RangeField::first_clear_both_in(
            &table.completed,
            &table.in_flight,
            cursor_piece,
            table.piece_count,
        )
        .or_else(|| {
            RangeField::first_clear_both_in(&table.completed, &table.in_flight, 0, cursor_piece)
        })
    }
}
