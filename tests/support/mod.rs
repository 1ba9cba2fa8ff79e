#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Route {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: r#"{"msg":"refused"}"#.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct Shared {
    routes: HashMap<String, Route>,
    requests: Vec<String>,
}

/// Canned HTTP/1.1 responder on a loopback port. Routes match on the path without
/// the query string; every request target is recorded.
pub struct MockHttp {
    base_url: String,
    shared: Arc<Mutex<Shared>>,
    accept_task: JoinHandle<()>,
}

impl MockHttp {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let address = listener.local_addr().expect("local addr");
        let shared = Arc::new(Mutex::new(Shared::default()));
        let accept_shared = Arc::clone(&shared);

        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, Arc::clone(&accept_shared)));
            }
        });

        Self {
            base_url: format!("http://{address}"),
            shared,
            accept_task,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn route(&self, path: &str, route: Route) {
        self.shared.lock().routes.insert(path.to_string(), route);
    }

    pub fn requests(&self) -> Vec<String> {
        self.shared.lock().requests.clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.shared
            .lock()
            .requests
            .iter()
            .filter(|target| target.split('?').next() == Some(path))
            .count()
    }
}

impl Drop for MockHttp {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(mut socket: TcpStream, shared: Arc<Mutex<Shared>>) {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 1024];
    loop {
        match socket.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(read) => request.extend_from_slice(&buffer[..read]),
        }
        if request.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&request);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let path = target.split('?').next().unwrap_or("/").to_string();

    let route = {
        let mut guard = shared.lock();
        guard.requests.push(target);
        guard.routes.get(&path).cloned()
    };
    let route = route.unwrap_or_else(|| Route::status(404));

    if !route.delay.is_zero() {
        tokio::time::sleep(route.delay).await;
    }

    let response = format!(
        "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        route.status,
        route.body.len(),
        route.body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

pub fn kline_rows(closes: &[(i64, &str)]) -> String {
    let rows: Vec<String> = closes
        .iter()
        .map(|(open_time, close)| {
            format!(r#"[{open_time},"1.0","2.0","0.5","{close}","12.5",{},"0",1,"0","0","0"]"#, open_time + 59_999)
        })
        .collect();
    format!("[{}]", rows.join(","))
}
