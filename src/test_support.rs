//! Throwaway HTTP/1.1 server for exercising the reqwest-backed clients.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum Canned {
    Reply(u16, String),
    /// Accept the request and never answer.
    Hang,
}

impl Canned {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self::Reply(status, body.into())
    }
}

pub struct CannedServer {
    pub base_url: String,
    requests: mpsc::UnboundedReceiver<String>,
}

impl CannedServer {
    /// Serves one canned response per accepted connection, in order.
    pub async fn start(responses: Vec<Canned>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let address = listener.local_addr().expect("local addr");
        let (sender, requests) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for canned in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                let _ = sender.send(request);
                match canned {
                    Canned::Reply(status, body) => {
                        let response = format!(
                            "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    }
                    Canned::Hang => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            requests,
        }
    }

    /// Next raw request (head and body) seen by the server.
    pub async fn next_request(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("request within timeout")
            .expect("server still running")
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let read = stream.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        let Some(head_end) = find_head_end(&buffer) else {
            continue;
        };
        let head = String::from_utf8_lossy(&buffer[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buffer.len() >= head_end + 4 + content_length {
            break;
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Address nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{address}")
}
