//! In-process SCPI device that echoes writes back on queries.
//!
//! Stands in for an instrument when exercising the real-hardware code path
//! without one: every `PATH VALUE` write is stored and returned verbatim by
//! a later `PATH?` query. Unwritten paths read as `0`, the trigger reports
//! `TD` immediately and data blocks are all zeros. Replies to chosen paths
//! can be held back to imitate a slow instrument.

use pitaya_core::module::TRACE_LENGTH;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Identity reported by the loopback device.
pub const LOOPBACK_IDN: &str = "REDPITAYA,LOOPBACK,0,1.0";

#[derive(Default)]
struct DeviceState {
    registers: HashMap<String, String>,
    writes: Vec<String>,
    connections: usize,
    hold_trigger: bool,
    reply_delays: HashMap<String, Duration>,
}

/// Running loopback device; the server stops when this is dropped.
pub struct LoopbackDevice {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    task: JoinHandle<()>,
}

impl LoopbackDevice {
    /// Bind to an ephemeral port on localhost and start serving.
    pub async fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(DeviceState::default()));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_state.lock().await.connections += 1;
                tokio::spawn(serve(socket, Arc::clone(&accept_state)));
            }
        });

        tracing::debug!(%addr, "Loopback SCPI device listening");
        Ok(Self { addr, state, task })
    }

    /// `host:port` to use as a backend address.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every write received so far, in order.
    pub async fn writes(&self) -> Vec<String> {
        self.state.lock().await.writes.clone()
    }

    /// Stored value of `path`, if written.
    pub async fn value(&self, path: &str) -> Option<String> {
        self.state.lock().await.registers.get(path).cloned()
    }

    /// Connections accepted so far.
    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }

    /// Keep the trigger status at `WAIT` so acquisitions never complete.
    pub async fn hold_trigger(&self, hold: bool) {
        self.state.lock().await.hold_trigger = hold;
    }

    /// Answer queries of `path` only after `delay`; zero removes the delay.
    pub async fn delay_reply(&self, path: &str, delay: Duration) {
        let mut state = self.state.lock().await;
        if delay.is_zero() {
            state.reply_delays.remove(path);
        } else {
            state.reply_delays.insert(path.to_string(), delay);
        }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, state: Arc<Mutex<DeviceState>>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = handle_line(line, &state).await;
        if let Some((reply, delay)) = reply {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if write
                .write_all(format!("{reply}\r\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

async fn handle_line(line: &str, state: &Mutex<DeviceState>) -> Option<(String, Duration)> {
    let mut state = state.lock().await;
    let Some(path) = line.strip_suffix('?') else {
        state.writes.push(line.to_string());
        if let Some((path, value)) = line.split_once(' ') {
            state
                .registers
                .insert(path.to_string(), value.trim().to_string());
        }
        return None;
    };

    let reply = match path {
        "*IDN" => LOOPBACK_IDN.to_string(),
        "ACQ:TRIG:STAT" if state.hold_trigger => "WAIT".to_string(),
        "ACQ:TRIG:STAT" => "TD".to_string(),
        "ACQ:SOUR1:DATA" | "ACQ:SOUR2:DATA" => {
            format!("{{{}}}", vec!["0"; TRACE_LENGTH].join(","))
        }
        p if p.ends_with(":QUAD") => "0,0".to_string(),
        p if p.starts_with("SAMP:") => "0".to_string(),
        p => state
            .registers
            .get(p)
            .cloned()
            .unwrap_or_else(|| "0".to_string()),
    };
    let delay = state.reply_delays.get(path).copied().unwrap_or_default();
    Some((reply, delay))
}
