//! Remote session backend
//!
//! Listens on a Unix socket. Each connection is one remote session:
//!
//! 1. The daemon sends `{"type": "name"}`
//! 2. The session replies `{"type": "name", "name": "..."}`, which opens its
//!    [`LinkGate`] and binds its post-lookup table
//! 3. Every key action is then sent as a `{"type": "key", ...}` line, filtered
//!    and remapped by the gate
//!
//! Key actions reach the per-session tasks over bounded queues, so
//! [`KeySink::send_key`] never waits on a socket. A session whose queue is
//! full is not keeping up with its socket and gets disconnected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;

use super::KeySink;
use crate::action::KeyAction;
use crate::error::BackendError;
use crate::keymap::MapChanges;
use crate::link::LinkGate;
use crate::lock;
use crate::post_lookup::PostLookupStore;
use crate::protocol::{clamp_name, ClientMessage, KeyMessage, ServerMessage};

/// Most sessions connected at once; further connections are closed at once
pub const MAX_SESSIONS: usize = 32;

/// Commands buffered per session before it is dropped as stalled
pub const SESSION_QUEUE: usize = 64;

#[derive(Debug, Clone)]
enum SessionCommand {
    Key(KeyMessage),
    /// The post-lookup table of the named session changed
    Reload(Arc<str>),
}

struct SessionLink {
    commands: mpsc::Sender<SessionCommand>,
    task: AbortHandle,
}

#[derive(Default)]
struct Sessions {
    next_id: u64,
    links: HashMap<u64, SessionLink>,
}

impl Sessions {
    /// Send `command` to every session, dropping those that went away or
    /// stopped draining their queue
    fn broadcast(&mut self, command: &SessionCommand) {
        self.links.retain(|id, link| match link.commands.try_send(command.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Session {} stalled with {} queued commands, disconnecting", id, SESSION_QUEUE);
                link.task.abort();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

/// Unix socket backend serving remote sessions
pub struct SessionBackend {
    socket_path: PathBuf,
    runtime: Handle,
    post_lookups: Arc<PostLookupStore>,
    sessions: Arc<Mutex<Sessions>>,
    accept_task: Mutex<Option<AbortHandle>>,
}

impl SessionBackend {
    pub fn new(socket_path: &Path, runtime: Handle, post_lookups: Arc<PostLookupStore>) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            runtime,
            post_lookups,
            sessions: Arc::new(Mutex::new(Sessions::default())),
            accept_task: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connected sessions, identified or not
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).links.len()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.accept_task).is_some()
    }

    fn open_failed(&self, source: std::io::Error) -> BackendError {
        BackendError::OpenFailed {
            locator: self.socket_path.display().to_string(),
            source,
        }
    }
}

impl KeySink for SessionBackend {
    fn open(&self) -> Result<(), BackendError> {
        let mut accept_task = lock(&self.accept_task);
        if accept_task.is_some() {
            return Ok(());
        }

        // Remove stale socket if it exists
        if self.socket_path.exists() {
            tracing::debug!("Removing stale socket at {}", self.socket_path.display());
            std::fs::remove_file(&self.socket_path).map_err(|e| self.open_failed(e))?;
        }

        let listener = {
            let _runtime = self.runtime.enter();
            UnixListener::bind(&self.socket_path).map_err(|e| self.open_failed(e))?
        };

        tracing::info!("Session socket listening on {}", self.socket_path.display());

        let task = self.runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.sessions),
            Arc::clone(&self.post_lookups),
        ));
        *accept_task = Some(task.abort_handle());

        Ok(())
    }

    fn close(&self) -> Result<(), BackendError> {
        let Some(task) = lock(&self.accept_task).take() else {
            return Ok(());
        };
        task.abort();

        // Dropping the senders ends every session task
        lock(&self.sessions).links.clear();

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        tracing::info!("Session socket {} closed", self.socket_path.display());
        Ok(())
    }

    fn send_key(&self, action: KeyAction, code: u32) -> Result<(), BackendError> {
        if !self.is_open() {
            return Err(BackendError::NotOpen);
        }

        lock(&self.sessions).broadcast(&SessionCommand::Key(KeyMessage { action, code }));
        Ok(())
    }

    fn map_changes(&self, changes: &MapChanges) {
        tracing::trace!("Ignoring {} reference change(s)", changes.len());
    }

    fn lookup_changes(&self, session: &str) {
        lock(&self.sessions).broadcast(&SessionCommand::Reload(Arc::from(session)));
    }
}

impl Drop for SessionBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to remove socket file: {}", e);
        }
    }
}

async fn accept_loop(listener: UnixListener, sessions: Arc<Mutex<Sessions>>, post_lookups: Arc<PostLookupStore>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!("Failed to accept session connection: {}", e);
                continue;
            }
        };

        let id = {
            let mut sessions = lock(&sessions);
            if sessions.links.len() >= MAX_SESSIONS {
                tracing::warn!("Session limit ({}) reached, rejecting connection", MAX_SESSIONS);
                continue;
            }
            sessions.next_id += 1;
            sessions.next_id
        };

        tracing::debug!("Session {} connected", id);

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let task = {
            let sessions = Arc::clone(&sessions);
            let post_lookups = Arc::clone(&post_lookups);
            tokio::spawn(async move {
                if let Err(e) = run_session(stream, rx, &post_lookups).await {
                    tracing::debug!("Session {} ended with error: {:#}", id, e);
                }
                lock(&sessions).links.remove(&id);
                tracing::debug!("Session {} disconnected", id);
            })
        };

        lock(&sessions).links.insert(
            id,
            SessionLink {
                commands: tx,
                task: task.abort_handle(),
            },
        );
    }
}

async fn run_session(
    stream: UnixStream,
    mut commands: mpsc::Receiver<SessionCommand>,
    post_lookups: &PostLookupStore,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut gate = LinkGate::new();

    write_message(&mut writer, &ServerMessage::Name).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from session")? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&line) {
                    Ok(ClientMessage::Name { .. }) if gate.is_enabled() => {
                        tracing::warn!("Session '{}' sent a second name, ignored", gate.name());
                    }
                    Ok(ClientMessage::Name { name }) => gate.identify(&clamp_name(&name), post_lookups),
                    Err(e) => tracing::warn!("Invalid session message: {}", e),
                }
            }
            command = commands.recv() => {
                match command {
                    None => return Ok(()),
                    Some(SessionCommand::Key(message)) => {
                        if let Some(&out) = gate.filter(&message) {
                            write_message(&mut writer, &ServerMessage::Key(out)).await?;
                        }
                    }
                    Some(SessionCommand::Reload(name)) => {
                        if gate.is_enabled() && gate.name() == &*name {
                            gate.reload(post_lookups);
                        }
                    }
                }
            }
        }
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &ServerMessage) -> Result<()> {
    let mut json = serde_json::to_string(message).context("Failed to serialize message")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write to session")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::composite;
    use std::time::Duration;
    use tokio::io::Lines;
    use tokio::net::unix::OwnedReadHalf;
    use virtual_input_config::{Conversion, KeySpec, Modifier, ModifierMask, PostLookupDocument};

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn next(&mut self) -> Option<ServerMessage> {
            let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for session message")
                .unwrap()?;
            Some(serde_json::from_str(&line).unwrap())
        }

        async fn identify(&mut self, name: &str) {
            assert_eq!(self.next().await, Some(ServerMessage::Name));
            let reply = serde_json::to_string(&ClientMessage::Name {
                name: name.to_string(),
            })
            .unwrap();
            self.writer
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            // Let the session task process the reply
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn backend(dir: &tempfile::TempDir) -> (SessionBackend, Arc<PostLookupStore>) {
        let store = Arc::new(PostLookupStore::new());
        let backend = SessionBackend::new(&dir.path().join("keyhandler"), Handle::current(), store.clone());
        backend.open().unwrap();
        (backend, store)
    }

    fn key(action: KeyAction, code: u32) -> Option<ServerMessage> {
        Some(ServerMessage::Key(KeyMessage { action, code }))
    }

    fn single_conversion(from: (u16, ModifierMask), to: u16) -> PostLookupDocument {
        PostLookupDocument {
            conversions: vec![Conversion {
                input: KeySpec {
                    code: from.0,
                    mods: from.1,
                },
                output: KeySpec {
                    code: to,
                    mods: ModifierMask::NONE,
                },
            }],
            skipped: 0,
        }
    }

    #[tokio::test]
    async fn test_identified_session_receives_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _store) = backend(&dir);

        let mut client = Client::connect(backend.socket_path()).await;
        client.identify("web").await;

        backend.send_key(KeyAction::Pressed, 30).unwrap();
        backend.send_key(KeyAction::Released, 30).unwrap();

        assert_eq!(client.next().await, key(KeyAction::Pressed, 30));
        assert_eq!(client.next().await, key(KeyAction::Released, 30));
    }

    #[tokio::test]
    async fn test_gate_closed_before_name_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _store) = backend(&dir);

        let mut client = Client::connect(backend.socket_path()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.session_count(), 1);

        // Not identified yet: dropped
        backend.send_key(KeyAction::Pressed, 1).unwrap();
        client.identify("web").await;
        backend.send_key(KeyAction::Pressed, 2).unwrap();

        assert_eq!(client.next().await, key(KeyAction::Pressed, 2));
    }

    #[tokio::test]
    async fn test_post_lookup_remaps_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, store) = backend(&dir);
        let shift: ModifierMask = Modifier::LeftShift.into();
        store.reload("netflix", &single_conversion((10, shift), 99));

        let mut client = Client::connect(backend.socket_path()).await;
        client.identify("netflix").await;

        backend.send_key(KeyAction::Pressed, composite(10, shift)).unwrap();
        backend.send_key(KeyAction::Pressed, 11).unwrap();
        assert_eq!(client.next().await, key(KeyAction::Pressed, composite(99, shift)));
        assert_eq!(client.next().await, key(KeyAction::Pressed, 11));

        store.reload("netflix", &single_conversion((11, ModifierMask::NONE), 12));
        backend.lookup_changes("netflix");
        tokio::time::sleep(Duration::from_millis(50)).await;

        backend.send_key(KeyAction::Pressed, 11).unwrap();
        assert_eq!(client.next().await, key(KeyAction::Pressed, 12));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _store) = backend(&dir);

        let mut clients = Vec::new();
        for _ in 0..MAX_SESSIONS {
            let mut client = Client::connect(backend.socket_path()).await;
            assert_eq!(client.next().await, Some(ServerMessage::Name));
            clients.push(client);
        }

        let mut rejected = Client::connect(backend.socket_path()).await;
        assert_eq!(rejected.next().await, None);
        assert_eq!(backend.session_count(), MAX_SESSIONS);
    }

    #[tokio::test]
    async fn test_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyhandler");
        std::fs::write(&path, "stale").unwrap();

        let backend = SessionBackend::new(&path, Handle::current(), Arc::new(PostLookupStore::new()));
        backend.open().unwrap();
        assert!(backend.is_open());

        backend.close().unwrap();
        assert!(!path.exists());
        assert!(!backend.is_open());
        assert!(matches!(
            backend.send_key(KeyAction::Pressed, 1),
            Err(BackendError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_stalled_session_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _store) = backend(&dir);

        // Identifies, then never reads again
        let mut client = Client::connect(backend.socket_path()).await;
        client.identify("web").await;
        assert_eq!(backend.session_count(), 1);

        let mut sent = 0;
        while backend.session_count() > 0 && sent < 50_000 {
            backend.send_key(KeyAction::Repeat, 30).unwrap();
            sent += 1;
            if sent % SESSION_QUEUE == 0 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(backend.session_count(), 0);
        // Sending to nobody still succeeds
        backend.send_key(KeyAction::Released, 30).unwrap();
        drop(client);
    }
}
