//! Terminal multiplexer
//!
//! Brokers a WebSocket/PTY byte pipe per terminal. The PTY runs the
//! external SSH helper (`virtctl ssh`) into the target VM. One record may
//! outlive many connections: a disconnect clears the active flag but keeps
//! the record until explicit close or idle expiry.
//!
//! Wire format on the WebSocket:
//! - client→server binary frame with `b[0] == 1` and `len >= 5` is a resize:
//!   `cols = u16be(b[1..3])`, `rows = u16be(b[3..5])`
//! - any other client frame is raw stdin bytes
//! - server→client binary frames are raw PTY output in ~4 KiB chunks

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cks_model::VmTarget;
use futures::{SinkExt, StreamExt};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::{Notify, RwLock, broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::vm::ssh_terminal_args;

const IDLE_TTL: Duration = Duration::from_secs(30 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const PTY_CHUNK: usize = 4096;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("terminal '{0}' not found")]
    NotFound(String),
    #[error("terminal '{0}' already has an active connection")]
    Busy(String),
    #[error("pty error: {0}")]
    Pty(String),
}

struct Conn {
    active: bool,
    resize_tx: Option<mpsc::UnboundedSender<(u16, u16)>>,
}

pub struct TerminalRecord {
    pub terminal_id: String,
    pub session_id: String,
    pub vm_name: String,
    pub namespace: String,
    pub created: DateTime<Utc>,
    last_used: StdMutex<DateTime<Utc>>,
    conn: StdMutex<Conn>,
    closed: Notify,
    closed_flag: AtomicBool,
}

impl TerminalRecord {
    fn new(terminal_id: String, session_id: &str, namespace: &str, vm_name: &str) -> Self {
        TerminalRecord {
            terminal_id,
            session_id: session_id.to_string(),
            vm_name: vm_name.to_string(),
            namespace: namespace.to_string(),
            created: Utc::now(),
            last_used: StdMutex::new(Utc::now()),
            conn: StdMutex::new(Conn {
                active: false,
                resize_tx: None,
            }),
            closed: Notify::new(),
            closed_flag: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Utc::now();
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.conn.lock().unwrap().active
    }

    fn clear_active(&self) {
        let mut conn = self.conn.lock().unwrap();
        conn.active = false;
        conn.resize_tx = None;
    }

    fn request_close(&self) {
        self.closed_flag.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn set_last_used(&self, t: DateTime<Utc>) {
        *self.last_used.lock().unwrap() = t;
    }
}

/// Holds the single-writer slot for one connection; dropping it releases the
/// slot even when the WebSocket upgrade never completes.
pub struct AttachPermit {
    record: Arc<TerminalRecord>,
    resize_rx: Option<mpsc::UnboundedReceiver<(u16, u16)>>,
}

impl Drop for AttachPermit {
    fn drop(&mut self) {
        self.record.clear_active();
        self.record.touch();
    }
}

#[derive(Clone)]
pub struct TerminalMux {
    records: Arc<RwLock<HashMap<String, Arc<TerminalRecord>>>>,
    ssh_user: String,
}

impl TerminalMux {
    pub fn new(ssh_user: &str) -> Self {
        TerminalMux {
            records: Arc::new(RwLock::new(HashMap::new())),
            ssh_user: ssh_user.to_string(),
        }
    }

    /// Create the record only; the PTY opens on attach.
    pub async fn create(
        &self,
        session_id: &str,
        target: VmTarget,
        namespace: &str,
        vm_name: &str,
    ) -> String {
        let id = terminal_id(session_id, target, Utc::now().timestamp());
        let record = Arc::new(TerminalRecord::new(id.clone(), session_id, namespace, vm_name));
        self.records.write().await.insert(id.clone(), record);
        info!(terminal = %id, vm = %vm_name, "terminal created");
        id
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TerminalRecord>> {
        self.records.read().await.get(id).cloned()
    }

    /// Claim the single-writer slot. A second claim while one is live gets
    /// `Busy`, which the REST layer surfaces as 409.
    pub async fn begin_attach(&self, id: &str) -> Result<AttachPermit, TerminalError> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;

        let resize_rx = {
            let mut conn = record.conn.lock().unwrap();
            if conn.active {
                return Err(TerminalError::Busy(id.to_string()));
            }
            conn.active = true;
            let (tx, rx) = mpsc::unbounded_channel();
            conn.resize_tx = Some(tx);
            rx
        };
        record.touch();
        Ok(AttachPermit {
            record,
            resize_rx: Some(resize_rx),
        })
    }

    /// Out-of-band resize; forwarded to the PTY while a connection is active.
    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), TerminalError> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;
        let conn = record.conn.lock().unwrap();
        if let Some(tx) = &conn.resize_tx {
            let _ = tx.send((rows, cols));
        }
        Ok(())
    }

    /// Remove the record; an in-flight attach observes the close and exits.
    pub async fn close(&self, id: &str) -> Result<(), TerminalError> {
        let record = self
            .records
            .write()
            .await
            .remove(id)
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;
        record.request_close();
        info!(terminal = %id, "terminal closed");
        Ok(())
    }

    pub async fn close_for_session(&self, session_id: &str) {
        let mut records = self.records.write().await;
        records.retain(|_, record| {
            if record.session_id == session_id {
                record.request_close();
                false
            } else {
                true
            }
        });
    }

    pub fn start_sweeper(&self, mut shutdown: broadcast::Receiver<()>) {
        let mux = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            tick.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = tick.tick() => mux.sweep_idle().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    pub async fn sweep_idle(&self) {
        let now = Utc::now();
        let mut records = self.records.write().await;
        records.retain(|id, record| {
            let keep = record.is_active() || !is_idle(record.last_used(), now);
            if !keep {
                info!(terminal = %id, "removing idle terminal");
                record.request_close();
            }
            keep
        });
    }

    /// Serve one attached connection: spawn the SSH helper on a fresh PTY and
    /// pump bytes both ways until either side terminates.
    pub async fn serve(&self, mut permit: AttachPermit, socket: WebSocket) {
        let record = Arc::clone(&permit.record);
        let Some(mut resize_rx) = permit.resize_rx.take() else {
            return;
        };

        info!(terminal = %record.terminal_id, vm = %record.vm_name, "terminal attached");

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(e) => {
                error!(terminal = %record.terminal_id, error = %e, "pty allocation failed");
                close_with_error(socket, "failed to allocate terminal").await;
                return;
            }
        };

        let mut cmd = CommandBuilder::new("virtctl");
        for arg in ssh_terminal_args(&record.vm_name, &record.namespace, &self.ssh_user) {
            cmd.arg(arg);
        }

        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => {
                error!(terminal = %record.terminal_id, error = %e, "ssh helper spawn failed");
                close_with_error(socket, "failed to reach the VM").await;
                return;
            }
        };
        drop(pair.slave);

        let master = pair.master;
        let mut writer = match master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                error!(terminal = %record.terminal_id, error = %e, "pty writer unavailable");
                let _ = child.kill();
                close_with_error(socket, "terminal setup failed").await;
                return;
            }
        };
        let reader = match master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                error!(terminal = %record.terminal_id, error = %e, "pty reader unavailable");
                let _ = child.kill();
                close_with_error(socket, "terminal setup failed").await;
                return;
            }
        };

        // pty -> channel on a blocking thread; EOF ends the channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; PTY_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (mut ws_tx, mut ws_rx) = socket.split();

        // register close interest before pumping so close() cannot slip by
        let closed = record.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        if !record.is_closed() {
            loop {
                tokio::select! {
                    chunk = out_rx.recv() => match chunk {
                        Some(chunk) => {
                            record.touch();
                            if ws_tx.send(Message::Binary(Bytes::from(chunk))).await.is_err() {
                                break;
                            }
                        }
                        // pty EOF is normal termination
                        None => break,
                    },
                    msg = ws_rx.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Some((cols, rows)) = parse_resize_frame(&data) {
                                debug!(terminal = %record.terminal_id, rows, cols, "resize frame");
                                let _ = master.resize(PtySize {
                                    rows,
                                    cols,
                                    pixel_width: 0,
                                    pixel_height: 0,
                                });
                            } else {
                                record.touch();
                                if write_all(&mut writer, &data).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            record.touch();
                            if write_all(&mut writer, text.as_str().as_bytes()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    resize = resize_rx.recv() => {
                        if let Some((rows, cols)) = resize {
                            let _ = master.resize(PtySize {
                                rows,
                                cols,
                                pixel_width: 0,
                                pixel_height: 0,
                            });
                        }
                    }
                    _ = &mut closed => break,
                }
            }
        }

        let _ = child.kill();
        let _ = ws_tx.send(Message::Close(None)).await;
        info!(terminal = %record.terminal_id, "terminal detached");
        // the permit drop releases the single-writer slot
    }
}

fn write_all(writer: &mut Box<dyn Write + Send>, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data)?;
    writer.flush()
}

async fn close_with_error(socket: WebSocket, message: &str) {
    let mut socket = socket;
    let _ = socket.send(Message::Text(message.to_string().into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

pub fn terminal_id(session_id: &str, target: VmTarget, epoch_seconds: i64) -> String {
    format!("{session_id}-{}-{epoch_seconds}", target.as_str())
}

/// Detect a resize frame: binary, `len >= 5`, first byte 1. Returns
/// `(cols, rows)` in wire order.
pub fn parse_resize_frame(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() >= 5 && data[0] == 1 {
        let cols = u16::from_be_bytes([data[1], data[2]]);
        let rows = u16::from_be_bytes([data[3], data[4]]);
        Some((cols, rows))
    } else {
        None
    }
}

fn is_idle(last_used: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_used)
        .to_std()
        .map(|d| d > IDLE_TTL)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_frame_parsing() {
        // cols=80, rows=24
        assert_eq!(parse_resize_frame(&[1, 0, 0x50, 0, 0x18]), Some((80, 24)));
        // trailing bytes are tolerated
        assert_eq!(parse_resize_frame(&[1, 0, 0x50, 0, 0x18, 9]), Some((80, 24)));
        // too short
        assert_eq!(parse_resize_frame(&[1, 0, 0x50, 0]), None);
        // wrong marker byte
        assert_eq!(parse_resize_frame(&[0, 0, 0x50, 0, 0x18]), None);
        // plain stdin must never look like a resize
        assert_eq!(parse_resize_frame(b"ls\n"), None);
        assert_eq!(parse_resize_frame(b"top -d 1\n"), None);
    }

    #[test]
    fn test_terminal_id_shape() {
        let id = terminal_id("deadbeef", VmTarget::ControlPlane, 1_700_000_000);
        assert_eq!(id, "deadbeef-control-plane-1700000000");
    }

    #[test]
    fn test_idle_detection() {
        let now = Utc::now();
        assert!(!is_idle(now, now));
        assert!(!is_idle(now - chrono::Duration::minutes(29), now));
        assert!(is_idle(now - chrono::Duration::minutes(31), now));
        // clock skew: a future last_used is not idle
        assert!(!is_idle(now + chrono::Duration::minutes(5), now));
    }

    #[tokio::test]
    async fn test_single_writer_enforced() {
        let mux = TerminalMux::new("suporte");
        let id = mux
            .create("deadbeef", VmTarget::ControlPlane, "cluster1", "cp-cluster1")
            .await;

        let permit = mux.begin_attach(&id).await.unwrap();
        assert!(mux.get(&id).await.unwrap().is_active());

        // second attach is rejected without disturbing the first
        match mux.begin_attach(&id).await {
            Err(TerminalError::Busy(_)) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }
        assert!(mux.get(&id).await.unwrap().is_active());

        // releasing the permit frees the slot for a new connection
        drop(permit);
        assert!(!mux.get(&id).await.unwrap().is_active());
        assert!(mux.begin_attach(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_unknown_terminal() {
        let mux = TerminalMux::new("suporte");
        assert!(matches!(
            mux.begin_attach("missing").await,
            Err(TerminalError::NotFound(_))
        ));
        assert!(matches!(
            mux.resize("missing", 24, 80).await,
            Err(TerminalError::NotFound(_))
        ));
        assert!(matches!(
            mux.close("missing").await,
            Err(TerminalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_band_resize_reaches_active_connection() {
        let mux = TerminalMux::new("suporte");
        let id = mux
            .create("deadbeef", VmTarget::WorkerNode, "cluster2", "wk-cluster2")
            .await;

        let mut permit = mux.begin_attach(&id).await.unwrap();
        let mut rx = permit.resize_rx.take().unwrap();

        mux.resize(&id, 50, 132).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), (50, 132));

        // with no active connection the resize is a no-op, not an error
        drop(permit);
        assert!(mux.resize(&id, 24, 80).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_and_session_cleanup() {
        let mux = TerminalMux::new("suporte");
        let t1 = mux.create("aaaa0000", VmTarget::ControlPlane, "cluster1", "cp-cluster1").await;
        let t2 = mux.create("aaaa0000", VmTarget::WorkerNode, "cluster1", "wk-cluster1").await;
        let t3 = mux.create("bbbb1111", VmTarget::ControlPlane, "cluster2", "cp-cluster2").await;

        mux.close(&t1).await.unwrap();
        assert!(mux.get(&t1).await.is_none());

        mux.close_for_session("aaaa0000").await;
        assert!(mux.get(&t2).await.is_none());
        assert!(mux.get(&t3).await.is_some());
    }

    #[tokio::test]
    async fn test_idle_sweep_spares_active_records() {
        let mux = TerminalMux::new("suporte");
        let idle = mux.create("aaaa0000", VmTarget::ControlPlane, "cluster1", "cp-cluster1").await;
        let busy = mux.create("bbbb1111", VmTarget::ControlPlane, "cluster2", "cp-cluster2").await;

        let old = Utc::now() - chrono::Duration::hours(2);
        mux.get(&idle).await.unwrap().set_last_used(old);
        mux.get(&busy).await.unwrap().set_last_used(old);
        let _permit = mux.begin_attach(&busy).await.unwrap();
        mux.get(&busy).await.unwrap().set_last_used(old);

        mux.sweep_idle().await;
        assert!(mux.get(&idle).await.is_none());
        assert!(mux.get(&busy).await.is_some());
    }
}
