//! 仅用于测试的本地 HTTP 桩服务器。
//!
//! 在 127.0.0.1 的随机端口上监听, 每个连接处理一个请求后即关闭
//! (`Connection: close`), 并把收到的 Range 头记录下来供断言使用。
//! 可以配置为支持分段、普通 200、无 Content-Length 的流式响应,
//! 以及对指定偏移的前几次请求“卡住不发数据”来模拟停滞的源站。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// 模拟停滞: 对起始偏移为 `offset` 的前 `times` 次有界 Range 请求,
/// 发送响应头后挂起 `hold` 时长再断开。探测用的开区间 `bytes=0-`
/// 不受影响。
#[derive(Debug, Clone)]
pub(crate) struct Stall {
    pub offset: u64,
    pub times: u32,
    pub hold: Duration,
}

/// 桩服务器提供的“文件”。
#[derive(Debug, Clone)]
pub(crate) struct StubFile {
    pub body: Vec<u8>,
    pub ranged: bool,
    pub content_length: bool,
    pub status: u16,
    pub stall: Option<Stall>,
}

impl StubFile {
    /// 支持 Range 的源: 对带 Range 的请求返回 206。
    pub fn ranged(body: Vec<u8>) -> Self {
        Self {
            body,
            ranged: true,
            content_length: true,
            status: 200,
            stall: None,
        }
    }

    /// 不支持 Range 但给出 Content-Length 的源。
    pub fn plain(body: Vec<u8>) -> Self {
        Self {
            body,
            ranged: false,
            content_length: true,
            status: 200,
            stall: None,
        }
    }

    /// 既不支持 Range 也不给出大小的源, 以连接关闭界定响应体。
    pub fn unknown_size(body: Vec<u8>) -> Self {
        Self {
            body,
            ranged: false,
            content_length: false,
            status: 200,
            stall: None,
        }
    }

    /// 一律返回 404。
    pub fn not_found() -> Self {
        Self {
            body: Vec::new(),
            ranged: false,
            content_length: true,
            status: 404,
            stall: None,
        }
    }

    /// 在 [`StubFile::ranged`] 的基础上附加停滞规则。
    pub fn with_stall(mut self, offset: u64, times: u32, hold: Duration) -> Self {
        self.stall = Some(Stall {
            offset,
            times,
            hold,
        });
        self
    }
}

/// 记录下来的一次请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoggedRequest {
    /// 解析后的 Range: `(起始, 结束)`（含端点）, 开区间结尾为 `None`,
    /// 无 Range 头时整体为 `None`。
    pub range: Option<(u64, Option<u64>)>,
}

pub(crate) struct StubServer {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<LoggedRequest>>>,
}

impl StubServer {
    pub async fn start(file: StubFile) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Arc<Mutex<Vec<LoggedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let file = Arc::new(file);
        let stall_hits: Arc<Mutex<HashMap<u64, u32>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_log = log.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_conn(
                    stream,
                    file.clone(),
                    accept_log.clone(),
                    stall_hits.clone(),
                ));
            }
        });

        Self { addr, log }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.log.lock().unwrap().clone()
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    file: Arc<StubFile>,
    log: Arc<Mutex<Vec<LoggedRequest>>>,
    stall_hits: Arc<Mutex<HashMap<u64, u32>>>,
) {
    // 读完请求头即可, GET 没有请求体。
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let range = parse_range(&head);
    log.lock().unwrap().push(LoggedRequest { range });

    if file.status == 404 {
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;
        return;
    }

    let total = file.body.len() as u64;
    if file.ranged {
        if let Some((lo, hi_opt)) = range {
            if total == 0 {
                // 空资源: 返回 206 和零长度响应体。
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 206 Partial Content\r\nContent-Length: 0\r\nContent-Range: bytes 0-0/0\r\nConnection: close\r\n\r\n",
                    )
                    .await;
                return;
            }
            let hi = hi_opt.unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1));
            if lo > hi {
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    )
                    .await;
                return;
            }
            let len = hi - lo + 1;
            let header = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {len}\r\nContent-Range: bytes {lo}-{hi}/{total}\r\nConnection: close\r\n\r\n"
            );
            if stream.write_all(header.as_bytes()).await.is_err() {
                return;
            }
            if let Some(stall) = &file.stall {
                let should_stall = {
                    let mut hits = stall_hits.lock().unwrap();
                    if stall.offset == lo && hi_opt.is_some() {
                        let hit = hits.entry(lo).or_insert(0);
                        *hit += 1;
                        *hit <= stall.times
                    } else {
                        false
                    }
                };
                if should_stall {
                    tokio::time::sleep(stall.hold).await;
                    return;
                }
            }
            let _ = stream
                .write_all(&file.body[lo as usize..=(hi as usize)])
                .await;
            return;
        }
    }

    // 普通 200。
    if file.content_length {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
        );
        if stream.write_all(header.as_bytes()).await.is_err() {
            return;
        }
    } else if stream
        .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }
    let _ = stream.write_all(&file.body).await;
}

fn parse_range(head: &str) -> Option<(u64, Option<u64>)> {
    let line = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("range:"))?;
    let value = line.split(':').nth(1)?.trim();
    let value = value.strip_prefix("bytes=")?;
    let (lo, hi) = value.split_once('-')?;
    let lo = lo.trim().parse::<u64>().ok()?;
    let hi = hi.trim();
    let hi = if hi.is_empty() {
        None
    } else {
        Some(hi.parse::<u64>().ok()?)
    };
    Some((lo, hi))
}
