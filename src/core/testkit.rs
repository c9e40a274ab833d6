//! 测试专用的微型 HTTP 服务, 支持 HEAD 与带 Range 的 GET,
//! 并记录收到的每个请求供断言

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

#[derive(Clone)]
pub struct ServerOptions {
    /// 是否声明 accept-ranges: bytes
    pub resumable: bool,
    /// 每写出 n 字节暂停一下, 用来制造慢速下载窗口
    pub throttle: Option<(usize, Duration)>,
    /// GET 一律回这个状态码(制造失败场景)
    pub fail_get_status: Option<u16>,
    pub content_disposition: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            resumable: true,
            throttle: None,
            fail_get_status: None,
            content_disposition: None,
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl TestServer {
    pub async fn serve(body: Vec<u8>) -> Self {
        Self::serve_with(body, ServerOptions::default()).await
    }

    pub async fn serve_with(body: Vec<u8>, options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("绑定测试端口失败");
        let addr = listener.local_addr().expect("读取测试端口失败");
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);
        let recorded = requests.clone();
        actix_rt::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let body = body.clone();
                let options = options.clone();
                let recorded = recorded.clone();
                actix_rt::spawn(async move {
                    let _ = handle_connection(stream, body, options, recorded).await;
                });
            }
        });
        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("请求记录锁中毒").clone()
    }

    pub fn get_ranges(&self) -> Vec<Option<String>> {
        self.recorded()
            .iter()
            .filter(|r| r.method == "GET")
            .map(|r| r.range.clone())
            .collect()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    body: Arc<Vec<u8>>,
    options: ServerOptions,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    // 读到头部结束为止, 测试请求没有 body
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if raw.len() > 64 * 1024 {
            return Ok(());
        }
    }
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let mut range = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    recorded.lock().expect("请求记录锁中毒").push(RecordedRequest {
        method: method.clone(),
        path,
        range: range.clone(),
    });

    let total = body.len();
    let mut headers = String::new();
    let mut payload: &[u8] = &[];

    if method == "HEAD" {
        headers.push_str("HTTP/1.1 200 OK\r\n");
        headers.push_str(&format!("content-length: {}\r\n", total));
        headers.push_str("content-type: application/octet-stream\r\n");
        if options.resumable {
            headers.push_str("accept-ranges: bytes\r\n");
        }
        if let Some(cd) = &options.content_disposition {
            headers.push_str(&format!("content-disposition: {}\r\n", cd));
        }
    } else if let Some(status) = options.fail_get_status {
        headers.push_str(&format!("HTTP/1.1 {} Oops\r\n", status));
        headers.push_str("content-length: 0\r\n");
    } else if let Some(range) = range.as_deref().filter(|_| options.resumable) {
        let (from, to) = parse_range(range, total);
        payload = &body[from..=to];
        headers.push_str("HTTP/1.1 206 Partial Content\r\n");
        headers.push_str(&format!("content-length: {}\r\n", payload.len()));
        headers.push_str(&format!("content-range: bytes {}-{}/{}\r\n", from, to, total));
        headers.push_str("content-type: application/octet-stream\r\n");
    } else {
        payload = &body[..];
        headers.push_str("HTTP/1.1 200 OK\r\n");
        headers.push_str(&format!("content-length: {}\r\n", total));
        headers.push_str("content-type: application/octet-stream\r\n");
    }
    headers.push_str("connection: close\r\n\r\n");
    stream.write_all(headers.as_bytes()).await?;

    if method != "HEAD" {
        match options.throttle {
            Some((step, pause)) => {
                for piece in payload.chunks(step.max(1)) {
                    stream.write_all(piece).await?;
                    stream.flush().await?;
                    actix_rt::time::sleep(pause).await;
                }
            }
            None => stream.write_all(payload).await?,
        }
    }
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// 仅支持 bytes=a-b 与 bytes=a- 两种写法, 测试足够
fn parse_range(range: &str, total: usize) -> (usize, usize) {
    let value = range.trim_start_matches("bytes=");
    let (from, to) = value.split_once('-').unwrap_or((value, ""));
    let from = from.parse::<usize>().unwrap_or(0).min(total.saturating_sub(1));
    let to = to
        .parse::<usize>()
        .unwrap_or(total.saturating_sub(1))
        .min(total.saturating_sub(1));
    (from, to)
}
