//! 快速读取模式演示: 模拟一个边下边读的消费者, 周期性把读取位置
//! 告知调度器, 调度器优先下载读取位置之后的分片。

use multiget::{DownloadInfo, DownloadMode, Downloader, Settings, reqwest::ClientBuilder};
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let url = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("用法: quick_read <url>");
        std::process::exit(1);
    });

    let settings = Settings {
        connections_limit: 4,
        download_mode: DownloadMode::QuickRead,
        ..Settings::default()
    };

    let mut handle = match Downloader::new(url, "quick_read.bin", settings, ClientBuilder::new)
        .open(None)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("打开失败: {e}");
            return;
        }
    };

    // 打印进度的独立任务。
    let mut info_rx = handle.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(info) = info_rx.recv().await {
            if let DownloadInfo::MonitorUpdate {
                total_downloaded,
                total_speed,
                pieces_completed,
                piece_count,
                ..
            } = info
            {
                println!(
                    "已下载 {:.2} MB | 速度 {:.2} MB/s | 分片 {}/{}",
                    total_downloaded as f64 / 1024.0 / 1024.0,
                    total_speed / 1024.0 / 1024.0,
                    pieces_completed,
                    piece_count
                );
            }
        }
    });

    // 模拟读取端: 每 500ms 把读取位置向前推一格, 下载结束后退出。
    let step = handle.total_size().map(|t| t / 20).unwrap_or(0).max(64 * 1024);
    let mut cursor = 0u64;
    let summary = loop {
        match tokio::time::timeout(Duration::from_millis(500), handle.wait()).await {
            Ok(result) => break result,
            Err(_) => {
                cursor += step;
                println!("读取位置前进到 {cursor}");
                handle.set_reader_cursor(cursor).await;
            }
        }
    };
    progress.abort();

    match summary {
        Ok(s) if s.completed => println!("下载成功！共 {} 字节", s.total_downloaded),
        Ok(_) => println!("下载被中止"),
        Err(e) => eprintln!("下载失败: {e}"),
    }
}
