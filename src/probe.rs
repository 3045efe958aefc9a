//! 打开前的同步探测: 确认服务器的分段能力、文件大小与长连接支持。

use crate::types::Result;
use faststr::FastStr;
use log::{debug, info};
use reqwest::header::{CONNECTION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};

/// 探测得到的资源描述, 此后不再改变。
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// 跟随全部跳转之后的最终 URL, 后续所有分段请求都发往这里。
    pub final_url: FastStr,
    /// 文件总大小, 服务器未给出时为 `None`, 此时退化为单连接流式下载。
    pub total_size: Option<u64>,
    /// 服务器是否对 `Range: bytes=0-` 返回了 206。
    pub accepts_ranges: bool,
    /// 响应头是否声明了 `Connection: keep-alive`。
    pub keep_alive: bool,
}

impl ResourceInfo {
    /// 是否可以进入多连接模式: 既支持分段又知道大小。
    pub fn multi(&self) -> bool {
        self.accepts_ranges && self.total_size.is_some()
    }
}

/// 发出一次带 `Range: bytes=0-` 的探测请求并解析响应头。
///
/// 响应体在函数返回时被丢弃, 正式的数据请求由各槽位自行发起
/// （reqwest 没有“排空后复用”的原语, 其连接池会在长连接下复用底层
/// 套接字, 所以不把探测连接转作 0 号槽位）。
pub(crate) async fn probe(client: &Client, url: &str) -> Result<ResourceInfo> {
    info!("开始探测: {url}");

    let resp = client
        .get(url)
        .header(RANGE, "bytes=0-")
        .header(CONNECTION, "keep-alive")
        .send()
        .await?
        .error_for_status()?;

    let final_url = FastStr::new(resp.url().as_str());
    let accepts_ranges = resp.status() == StatusCode::PARTIAL_CONTENT;

    // 对 bytes=0- 的 206 响应, Content-Length 即完整大小; 没有时再从
    // Content-Range 的分母里取。普通 200 则只看 Content-Length。
    let headers = resp.headers();
    let mut total_size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if total_size.is_none() && accepts_ranges {
        total_size = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.trim().parse::<u64>().ok());
    }

    let keep_alive = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim().eq_ignore_ascii_case("keep-alive"));

    debug!(
        "探测结果: url={final_url}, 大小={total_size:?}, 支持分段={accepts_ranges}, 长连接={keep_alive}"
    );

    Ok(ResourceInfo {
        final_url,
        total_size,
        accepts_ranges,
        keep_alive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testserver::{StubFile, StubServer};

    #[tokio::test]
    async fn test_probe_ranged_server() {
        let server = StubServer::start(StubFile::ranged(vec![7u8; 4096])).await;
        let client = Client::new();
        let info = probe(&client, &server.url("/file.bin")).await.unwrap();
        assert!(info.accepts_ranges);
        assert_eq!(info.total_size, Some(4096));
        assert!(info.multi());
        assert!(info.final_url.ends_with("/file.bin"));
    }

    #[tokio::test]
    async fn test_probe_plain_server() {
        let server = StubServer::start(StubFile::plain(b"hello world\n".to_vec())).await;
        let client = Client::new();
        let info = probe(&client, &server.url("/file.bin")).await.unwrap();
        assert!(!info.accepts_ranges);
        assert_eq!(info.total_size, Some(12));
        assert!(!info.multi());
    }

    #[tokio::test]
    async fn test_probe_unknown_size() {
        let server = StubServer::start(StubFile::unknown_size(b"streaming".to_vec())).await;
        let client = Client::new();
        let info = probe(&client, &server.url("/file.bin")).await.unwrap();
        assert!(!info.accepts_ranges);
        assert_eq!(info.total_size, None);
        assert!(!info.multi());
    }

    #[tokio::test]
    async fn test_probe_error_status() {
        let server = StubServer::start(StubFile::not_found()).await;
        let client = Client::new();
        assert!(probe(&client, &server.url("/absent")).await.is_err());
    }
}
