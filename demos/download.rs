use multiget::{DownloadInfo, DownloadMode, Downloader, Settings, reqwest::ClientBuilder};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| {
        eprintln!("用法: download <url> [输出路径]");
        std::process::exit(1);
    });
    let output = args.next().unwrap_or_else(|| {
        url.rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download.bin")
            .to_string()
    });

    let settings = Settings {
        connections_limit: 8,                       // 连接数
        download_mode: DownloadMode::Dispersion,    // 分配模式
        ..Settings::default()
    };

    let downloader = Downloader::new(url, output, settings, ClientBuilder::new);

    // 定义一个处理下载进度的闭包
    let progress_handler =
        |total_size: Option<u64>, mut info_rx: broadcast::Receiver<DownloadInfo>| async move {
            match total_size {
                Some(size) => println!("文件总大小: {:.2} MB", size as f64 / 1024.0 / 1024.0),
                None => println!("文件大小未知, 单连接流式下载"),
            }

            // 循环接收并打印进度信息
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
                        "已下载: {:.2} MB | 速度: {:.2} MB/s | 分片: {}/{}",
                        total_downloaded as f64 / 1024.0 / 1024.0,
                        total_speed / 1024.0 / 1024.0,
                        pieces_completed,
                        piece_count
                    );
                }
            }
        };

    // 启动下载！
    match downloader.run(progress_handler).await {
        Ok(summary) if summary.completed => {
            println!("下载成功！共 {} 字节", summary.total_downloaded)
        }
        Ok(_) => println!("下载被中止"),
        Err(e) => eprintln!("下载失败: {e}"),
    }
}
