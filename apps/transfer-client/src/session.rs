//! Plumbing shared by the sender and receiver state machines
//!
//! A session's network work runs in one spawned task. Everything that task
//! owns and that `cancel()` must be able to tear down (the task itself, the
//! peer channel, the relay connection) is registered here. Every session run
//! gets a generation number; a cancel bumps it, so a task that is still
//! unwinding cannot publish status for a session that no longer exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use net_transport::{ChannelEvent, PeerChannel};
use parking_lot::Mutex;
use serde::Serialize;
use shared_protocol::{ClientEvent, FileMeta, SessionCode, TransferState};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::signaling::RelayHandle;
use crate::{ClientError, ClientResult};

/// Observable state of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub state: TransferState,
    /// 0..=100, never decreases within a session
    pub progress: u8,
    /// Plaintext bytes sent or decrypted
    pub bytes: u64,
    /// Chunks sent or decrypted
    pub chunks: u64,
    pub code: Option<SessionCode>,
    pub file_meta: Option<FileMeta>,
    /// User-facing cause of an `Error` state
    pub error: Option<String>,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self {
            state: TransferState::Idle,
            progress: 0,
            bytes: 0,
            chunks: 0,
            code: None,
            file_meta: None,
            error: None,
        }
    }
}

/// Monotonic percentage of `total` bytes
#[derive(Debug, Clone)]
pub struct Progress {
    total: u64,
    done: u64,
    percent: u8,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            done: 0,
            percent: 0,
        }
    }

    /// Account for `bytes` more and return the new percentage
    pub fn advance(&mut self, bytes: u64) -> u8 {
        self.done = self.done.saturating_add(bytes);
        let percent = if self.total == 0 {
            100
        } else {
            (u128::from(self.done) * 100 / u128::from(self.total)).min(100) as u8
        };
        self.percent = self.percent.max(percent);
        self.percent
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

/// What the sender streams
pub enum FileSource {
    /// A file on disk; the content type defaults to `application/octet-stream`
    Path {
        path: PathBuf,
        content_type: Option<String>,
    },
    /// An in-memory buffer
    Bytes {
        name: String,
        content_type: String,
        data: Bytes,
    },
    /// Any async reader producing exactly `meta.size` bytes
    Reader {
        meta: FileMeta,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
}

impl FileSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path {
            path: path.into(),
            content_type: None,
        }
    }

    pub fn bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::Bytes {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Metadata plus a reader positioned at the start
    pub(crate) async fn open(self) -> ClientResult<(FileMeta, Box<dyn AsyncRead + Send + Unpin>)> {
        match self {
            Self::Path { path, content_type } => {
                let file = tokio::fs::File::open(&path).await?;
                let size = file.metadata().await?.len();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        ClientError::Io(std::io::Error::other("path has no file name"))
                    })?;
                let content_type =
                    content_type.unwrap_or_else(|| "application/octet-stream".to_string());
                Ok((FileMeta::new(name, size, content_type), Box::new(file)))
            }
            Self::Bytes {
                name,
                content_type,
                data,
            } => {
                let meta = FileMeta::new(name, data.len() as u64, content_type);
                Ok((meta, Box::new(std::io::Cursor::new(data))))
            }
            Self::Reader { meta, reader } => Ok((meta, reader)),
        }
    }
}

/// A completely received and decrypted file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub data: Vec<u8>,
}

impl ReceivedFile {
    /// Name to save under: the sender's name reduced to a bare file name
    pub fn safe_name(&self) -> String {
        sanitize_file_name(&self.meta.name)
    }

    /// Write into `dir`, returning the full path
    pub async fn save_to(&self, dir: &Path) -> ClientResult<PathBuf> {
        let path = dir.join(self.safe_name());
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// Strip directories and characters that are unsafe in file names
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "received-file".to_string()
    } else {
        cleaned
    }
}

#[derive(Default)]
struct Resources {
    task: Option<JoinHandle<()>>,
    channel: Option<Arc<dyn PeerChannel>>,
    relay: Option<RelayHandle>,
    /// Sent on the relay right before a cancel disconnects it
    farewell: Option<ClientEvent>,
    delivered: Option<ReceivedFile>,
}

struct Inner {
    generation: u64,
    resources: Resources,
}

/// Status channel and teardown registry for one sender or receiver
pub(crate) struct Shared {
    status: watch::Sender<TransferStatus>,
    inner: Mutex<Inner>,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        let (status, _) = watch::channel(TransferStatus::default());
        Arc::new(Self {
            status,
            inner: Mutex::new(Inner {
                generation: 0,
                resources: Resources::default(),
            }),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    /// Start a new run; refused while one is in flight
    pub fn begin(&self) -> ClientResult<u64> {
        let mut inner = self.inner.lock();
        let state = self.status.borrow().state;
        if !matches!(state, TransferState::Idle) && !state.is_terminal() {
            return Err(ClientError::Busy);
        }

        let old = std::mem::take(&mut inner.resources);
        inner.generation += 1;
        teardown(old, false);

        self.status.send_replace(TransferStatus {
            state: TransferState::Waiting,
            ..Default::default()
        });
        Ok(inner.generation)
    }

    /// Apply `f` to the status if `generation` is still current
    pub fn update(&self, generation: u64, f: impl FnOnce(&mut TransferStatus)) -> bool {
        let inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        self.status.send_modify(f);
        true
    }

    pub fn set_state(&self, generation: u64, state: TransferState) {
        self.update(generation, |status| status.state = state);
    }

    pub fn attach_task(&self, generation: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.resources.task = Some(task);
        } else {
            task.abort();
        }
    }

    pub fn attach_channel(&self, generation: u64, channel: Arc<dyn PeerChannel>) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.resources.channel = Some(channel);
        } else {
            channel.close();
        }
    }

    pub fn attach_relay(&self, generation: u64, relay: RelayHandle) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.resources.relay = Some(relay);
        } else {
            relay.disconnect();
        }
    }

    pub fn set_farewell(&self, generation: u64, event: ClientEvent) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.resources.farewell = Some(event);
        }
    }

    /// Hand a received file to the caller and mark the run completed
    pub fn deliver(&self, generation: u64, file: ReceivedFile) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.resources.delivered = Some(file);
        self.status.send_modify(|status| {
            status.state = TransferState::Completed;
            status.progress = 100;
        });
    }

    pub fn take_delivered(&self) -> Option<ReceivedFile> {
        self.inner.lock().resources.delivered.take()
    }

    /// Terminal failure: record the cause and release network resources
    pub fn fail(&self, generation: u64, error: &ClientError) {
        warn!("Transfer failed: {}", error);
        let message = error.user_message();
        if self.update(generation, |status| {
            status.state = TransferState::Error;
            status.error = Some(message);
        }) {
            self.release(generation);
        }
    }

    /// Lifetime elapsed: mark expired and release network resources
    pub fn expire(&self, generation: u64) {
        if self.update(generation, |status| status.state = TransferState::Expired) {
            self.release(generation);
        }
    }

    /// Close channel and relay from inside the run; the task itself is left alone
    pub fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        let resources = &mut inner.resources;
        resources.farewell = None;
        if let Some(channel) = resources.channel.take() {
            channel.close();
        }
        if let Some(relay) = resources.relay.take() {
            relay.disconnect();
        }
    }

    /// Synchronous teardown from any state, back to `Idle`
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let old = std::mem::take(&mut inner.resources);
        teardown(old, true);
        self.status.send_replace(TransferStatus::default());
        debug!("Session cancelled");
    }
}

fn teardown(resources: Resources, send_farewell: bool) {
    let Resources {
        task,
        channel,
        relay,
        farewell,
        delivered: _,
    } = resources;

    if let Some(channel) = channel {
        channel.close();
    }
    if let Some(relay) = relay {
        if let (true, Some(event)) = (send_farewell, farewell) {
            relay.try_send(event);
        }
        relay.disconnect();
    }
    if let Some(task) = task {
        task.abort();
    }
}

/// Aborts the wrapped task when dropped
pub(crate) struct AbortOnDrop<T>(pub JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Result of an optional task; pending forever when there is none
pub(crate) async fn join_task<T>(
    task: &mut Option<AbortOnDrop<T>>,
) -> Result<T, tokio::task::JoinError> {
    match task {
        Some(task) => (&mut task.0).await,
        None => std::future::pending().await,
    }
}

/// Next event of an optional channel; pending forever when there is none
pub(crate) async fn next_event(
    events: &mut Option<mpsc::Receiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until `deadline`, or forever when unset
pub(crate) async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
