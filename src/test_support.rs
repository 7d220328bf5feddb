//! Minimal HTTP/1.1 stub server for exercising the pool, adapter and broadcaster.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub(crate) enum StubReply {
    Json(u16, String),
    /// Keep the socket open and never answer.
    Hang,
    /// Answer after a delay.
    Delayed(Duration, u16, String),
}

pub(crate) struct StubServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl StubServer {
    /// `respond` gets the 0-based request index and the raw request text.
    pub(crate) async fn start<F>(respond: F) -> Self
    where
        F: Fn(usize, &str) -> StubReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);
        let counter = hits.clone();
        let handle = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let respond = respond.clone();
                tokio::spawn(async move {
                    handle_conn(sock, n, respond.as_ref()).await;
                });
            }
        });
        Self { addr, hits, handle }
    }

    pub(crate) fn host(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_conn<F>(mut sock: TcpStream, n: usize, respond: &F)
where
    F: Fn(usize, &str) -> StubReply,
{
    let request = read_request(&mut sock).await;
    let (status, body) = match respond(n, &request) {
        StubReply::Json(status, body) => (status, body),
        StubReply::Hang => {
            tokio::time::sleep(Duration::from_secs(300)).await;
            return;
        }
        StubReply::Delayed(delay, status, body) => {
            tokio::time::sleep(delay).await;
            (status, body)
        }
    };
    let response = format!(
        "HTTP/1.1 {status} STUB\r\ncontent-type: application/json\r\n\
         content-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = sock.write_all(response.as_bytes()).await;
    let _ = sock.shutdown().await;
}

async fn read_request(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = sock.read(&mut chunk).await else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let body_len = text[..end]
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// An address nothing is listening on.
pub(crate) async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind scratch listener");
    let addr = listener.local_addr().expect("scratch addr");
    drop(listener);
    addr
}
