//! 可插拔的存储后端与串行化写入 Actor。
//!
//! 存储对象只被写入 Actor 一个任务持有, 所有槽位的数据经 mpsc 汇入,
//! 天然串行, 不需要任何锁。每次写入成功后 Actor 向协调器发送
//! `BytesWritten` 回执, 完成位图只根据回执推进。

use crate::types::{Result, SystemCommand, SystemEvent};
use async_trait::async_trait;
use faststr::FastStr;
use futures_util::future::BoxFuture;
use log::{debug, error, info, trace};
use std::io::{self, SeekFrom};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 下载数据的存储后端。
///
/// 协调器假定实现支持稀疏的随机偏移写入; 分片间的写入顺序不保证,
/// 单个分片内部严格顺序。
#[async_trait]
pub trait Storage: Send + 'static {
    /// 将 `data` 写入绝对偏移 `offset`。
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// 从绝对偏移 `offset` 读取 `len` 字节, 用于校验或续传检查。
    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// 刷新并关闭后端。
    async fn close(&mut self) -> io::Result<()>;
}

/// 打开存储后端的目标描述。
#[derive(Debug, Clone)]
pub struct StorageTarget {
    /// 输出路径。
    pub path: FastStr,
    /// 探测得到的文件总大小, 未知时为 `None`。
    pub total_size: Option<u64>,
}

/// 存储构造回调, 在探测完成后被调用一次。`None` 时使用 [`FileStorage`]。
pub type StorageFactory =
    Box<dyn FnOnce(StorageTarget) -> BoxFuture<'static, io::Result<Box<dyn Storage>>> + Send>;

/// 默认的本地文件存储。
pub struct FileStorage {
    file: tokio::fs::File,
}

impl FileStorage {
    /// 打开（或创建）目标文件。不截断已有内容, 以便续传时保留已
    /// 下载的数据; 大小已知且文件偏小时预分配到完整长度。
    pub async fn open(target: &StorageTarget) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(target.path.as_str())
            .await?;
        if let Some(size) = target.total_size {
            if file.metadata().await?.len() < size {
                file.set_len(size).await?;
            }
        }
        debug!("[FileStorage] 已打开 {}", target.path);
        Ok(Self { file })
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

/// 创建并运行写入 Actor。
///
/// Actor 监听 `WriteFile` 命令, 逐条写入存储并向协调器回执。信道的
/// 全部发送端关闭后排空队列、刷新存储并退出, 协调器收尾时等待返回的
/// `JoinHandle` 即可确认数据已落盘。
pub(crate) fn spawn_writer(
    mut storage: Box<dyn Storage>,
    queue_capacity: usize,
    event_tx: mpsc::Sender<SystemEvent>,
) -> (mpsc::Sender<SystemCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SystemCommand>(queue_capacity);

    let handle = spawn(async move {
        info!("[WriterActor] 进入主写入循环。");
        while let Some(command) = rx.recv().await {
            match command {
                SystemCommand::WriteFile {
                    slot,
                    generation,
                    offset,
                    data,
                } => {
                    trace!(
                        "[WriterActor] 收到 WriteFile, 槽位: {}, 偏移: {}, 大小: {}。",
                        slot,
                        offset,
                        data.len()
                    );
                    if let Err(e) = storage.write_at(offset, &data).await {
                        error!("[WriterActor] 写入存储失败: {e}, 循环终止。");
                        let _ = event_tx
                            .send(SystemEvent::StorageFailed {
                                error: e.to_string(),
                            })
                            .await;
                        break;
                    }
                    // 回执发送失败说明协调器已经收尾, 安静退出即可。
                    if event_tx
                        .send(SystemEvent::BytesWritten {
                            slot,
                            generation,
                            offset,
                            len: data.len() as u64,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ => {}
            }
        }
        info!("[WriterActor] 正在刷新存储并退出任务。");
        if let Err(e) = storage.close().await {
            error!("[WriterActor] 关闭存储失败: {e}");
        }
    });

    (tx, handle)
}

/// 打开默认或用户定制的存储后端。
pub(crate) async fn open_storage(
    factory: Option<StorageFactory>,
    target: StorageTarget,
) -> Result<Box<dyn Storage>> {
    let storage = match factory {
        Some(f) => f(target).await?,
        None => Box::new(FileStorage::open(&target).await?) as Box<dyn Storage>,
    };
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn target(dir: &tempfile::TempDir, name: &str, size: Option<u64>) -> StorageTarget {
        StorageTarget {
            path: FastStr::new(dir.path().join(name).to_string_lossy()),
            total_size: size,
        }
    }

    #[tokio::test]
    async fn test_file_storage_sparse_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(&target(&dir, "out.bin", Some(1024)))
            .await
            .unwrap();

        // 乱序的随机偏移写入。
        storage.write_at(512, b"world").await.unwrap();
        storage.write_at(0, b"hello").await.unwrap();
        storage.close().await.unwrap();

        assert_eq!(storage.read_at(0, 5).await.unwrap(), b"hello");
        assert_eq!(storage.read_at(512, 5).await.unwrap(), b"world");
        // 预分配后空洞读出为 0。
        assert_eq!(storage.read_at(100, 4).await.unwrap(), vec![0u8; 4]);
    }

    #[tokio::test]
    async fn test_file_storage_preallocates() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(&dir, "out.bin", Some(4096));
        let storage = FileStorage::open(&t).await.unwrap();
        drop(storage);
        let len = std::fs::metadata(t.path.as_str()).unwrap().len();
        assert_eq!(len, 4096);
    }

    #[tokio::test]
    async fn test_file_storage_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(&dir, "out.bin", Some(8));
        std::fs::write(t.path.as_str(), b"resumed!").unwrap();
        let mut storage = FileStorage::open(&t).await.unwrap();
        assert_eq!(storage.read_at(0, 8).await.unwrap(), b"resumed!");
    }

    #[tokio::test]
    async fn test_writer_actor_acks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(&dir, "out.bin", Some(16));
        let storage = Box::new(FileStorage::open(&t).await.unwrap());
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (writer_tx, handle) = spawn_writer(storage, 8, event_tx);

        for (i, part) in [b"abcd" as &[u8], b"efgh"].iter().enumerate() {
            writer_tx
                .send(SystemCommand::WriteFile {
                    slot: 0,
                    generation: 1,
                    offset: (i * 4) as u64,
                    data: Bytes::copy_from_slice(part),
                })
                .await
                .unwrap();
        }
        drop(writer_tx);

        // 回执按写入顺序到达。
        for expect_offset in [0u64, 4] {
            match event_rx.recv().await.unwrap() {
                SystemEvent::BytesWritten { offset, len, .. } => {
                    assert_eq!(offset, expect_offset);
                    assert_eq!(len, 4);
                }
                other => panic!("意外的事件: {other:?}"),
            }
        }
        handle.await.unwrap();

        let content = std::fs::read(t.path.as_str()).unwrap();
        assert_eq!(&content[..8], b"abcdefgh");
    }
}
