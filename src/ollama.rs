use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::stream::{StreamToken, decode_line};

/// What the transport layer reports for one generate request
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One successfully decoded chunk
    Token(StreamToken),
    /// Connection-level failure (refused, timeout, mid-stream
    /// disconnect). Fatal to the stream; no more events follow.
    Failed(String),
}

/// Client for the local Ollama generate endpoint
#[derive(Clone)]
pub struct OllamaClient {
    config: Config,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { config, client })
    }

    /// POST the prompt and stream decoded tokens over a channel.
    ///
    /// Returns immediately; a spawned task owns the blocking network
    /// read. The channel closes after a final token, a graceful stream
    /// end, or a `Failed` event.
    pub fn generate(&self, prompt: String) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(64);

        let client = self.client.clone();
        let url = self.config.generate_url();
        let model = self.config.model.clone();

        let tx_err = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_generate(client, url, model, prompt, tx).await {
                let _ = tx_err.send(TransportEvent::Failed(e.to_string())).await;
            }
        });

        rx
    }

    async fn stream_generate(
        client: reqwest::Client,
        url: String,
        model: String,
        prompt: String,
        tx: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": true,
        });

        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("server returned {}", response.status());
        }
        debug!(%url, "generate stream opened");

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete lines
            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].to_string();
                buffer = buffer[newline_pos + 1..].to_string();
                if !Self::forward_line(&line, &tx).await {
                    return Ok(());
                }
            }
        }

        // Flush a trailing line that arrived without a newline
        if !Self::forward_line(&buffer, &tx).await {
            return Ok(());
        }

        debug!("generate stream closed without a final chunk");
        Ok(())
    }

    /// Decode and forward one line. Returns false once the stream should
    /// stop: after a final token, or when the receiver went away.
    async fn forward_line(line: &str, tx: &mpsc::Sender<TransportEvent>) -> bool {
        match decode_line(line) {
            Ok(None) => true,
            Ok(Some(token)) => {
                let done = token.done;
                if tx.send(TransportEvent::Token(token)).await.is_err() {
                    return false;
                }
                !done
            }
            Err(e) => {
                // Malformed chunks are dropped; the stream goes on.
                warn!(error = %e, "dropping malformed stream chunk");
                true
            }
        }
    }
}
