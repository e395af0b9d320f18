//! Shared helpers for tests that need a live generate endpoint.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Spawn a one-shot fake Ollama server and return its base URL.
///
/// Serves a single connection: answers any request with a chunked NDJSON
/// body containing `lines`, one per chunk, pausing `delay` between them.
/// With `truncate` set the connection is dropped without the terminating
/// zero chunk, which the client sees as a mid-stream disconnect.
pub async fn spawn_fake_ollama(lines: Vec<String>, delay: Duration, truncate: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };

        // The request fits a single read and its contents don't matter.
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;

        let header = "HTTP/1.1 200 OK\r\n\
                      Content-Type: application/x-ndjson\r\n\
                      Transfer-Encoding: chunked\r\n\r\n";
        if socket.write_all(header.as_bytes()).await.is_err() {
            return;
        }

        for line in lines {
            let data = format!("{line}\n");
            let chunk = format!("{:x}\r\n{data}\r\n", data.len());
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        if !truncate {
            let _ = socket.write_all(b"0\r\n\r\n").await;
            let _ = socket.flush().await;
        }
    });

    format!("http://{addr}")
}
