//! SCPI over TCP client for Red Pitaya.
//!
//! One client owns one TCP stream. The backend that holds it is itself owned
//! by a single worker, so operations take `&mut self` and need no lock.

use anyhow::{Context, Result};
use pitaya_core::config::ScpiSettings;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default SCPI port for Red Pitaya
pub const DEFAULT_PORT: u16 = 5000;

/// Pause after each write so the device can apply it.
const WRITE_SETTLE: Duration = Duration::from_millis(2);

/// Async SCPI client.
pub struct ScpiClient {
    stream: BufReader<TcpStream>,
    io_timeout: Duration,
    peer: String,
}

impl ScpiClient {
    /// Connect to `host:port`.
    ///
    /// `host` may be a name or an IP address; name resolution goes through
    /// the system resolver.
    pub async fn connect(host: &str, port: u16, settings: &ScpiSettings) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let stream = timeout(settings.connect_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Connection timeout to {peer}"))?
            .with_context(|| format!("Failed to connect to {peer}"))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        tracing::info!(peer = %peer, "Connected to Red Pitaya");

        Ok(Self {
            stream: BufReader::new(stream),
            io_timeout: settings.io_timeout,
            peer,
        })
    }

    /// `host:port` of the device.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send a command without expecting a response.
    pub async fn write(&mut self, command: &str) -> Result<()> {
        tracing::debug!(peer = %self.peer, "SCPI write: {:?}", command);
        self.send_line(command).await?;
        tokio::time::sleep(WRITE_SETTLE).await;
        Ok(())
    }

    /// Send a query and read the single-line response, trimmed.
    pub async fn query(&mut self, query: &str) -> Result<String> {
        self.flush_input_buffer();

        tracing::debug!(peer = %self.peer, "SCPI query: {:?}", query);
        self.send_line(query).await?;

        let mut response = String::new();
        match timeout(self.io_timeout, self.stream.read_line(&mut response)).await {
            Ok(Ok(0)) => anyhow::bail!("Connection closed by device"),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::trace!("SCPI response: {:?}", trimmed);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => anyhow::bail!("Timeout waiting for response to: {query}"),
        }
    }

    /// Query a floating-point value.
    pub async fn query_f64(&mut self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        parse_f64(&response)
            .with_context(|| format!("Failed to parse '{response}' as f64 from query: {query}"))
    }

    /// Query a comma separated pair such as `0.1,0.2`.
    pub async fn query_pair(&mut self, query: &str) -> Result<(f64, f64)> {
        let values = self.query_list(query).await?;
        match values.as_slice() {
            [a, b] => Ok((*a, *b)),
            _ => anyhow::bail!(
                "Expected two values from query {query}, got {}",
                values.len()
            ),
        }
    }

    /// Query a data block such as `{0.1,0.2,0.3}`.
    pub async fn query_list(&mut self, query: &str) -> Result<Vec<f64>> {
        let response = self.query(query).await?;
        parse_list(&response).with_context(|| format!("Malformed data block from query: {query}"))
    }

    /// Close the write half; the device sees end of stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .get_mut()
            .shutdown()
            .await
            .context("Failed to shut down stream")
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .with_context(|| format!("Failed to write: {line}"))?;
        stream.flush().await.context("Failed to flush stream")?;
        Ok(())
    }

    /// Drop stale bytes left over from an earlier, abandoned exchange.
    fn flush_input_buffer(&mut self) {
        let buffered = self.stream.buffer().len();
        if buffered > 0 {
            tracing::debug!("Flushing {} bytes from buffer", buffered);
            self.stream.consume(buffered);
        }

        let mut discard = [0u8; 256];
        loop {
            match self.stream.get_mut().try_read(&mut discard) {
                Ok(0) => break,
                Ok(n) => tracing::debug!("Flushed {} stale bytes from stream", n),
                Err(_) => break,
            }
        }
    }
}

fn parse_f64(text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .with_context(|| format!("'{text}' is not a number"))
}

/// Parse `{a,b,c}` or `a,b,c`.
pub fn parse_list(text: &str) -> Result<Vec<f64>> {
    let inner = text
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner.split(',').map(parse_f64).collect()
}
