//! Session manager: connection lifecycle and single-flight command execution.
//!
//! All transport access happens on one worker task. Requests reach it over
//! an unbounded FIFO channel and are answered on a oneshot, so callers see a
//! plain `async fn` while the board only ever sees one raw REPL exchange at
//! a time.

use std::{
    ffi::OsStr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use pyboard_core::{
    BaudRate, ControllerConfig, ControllerError, DeviceConnector, DeviceError, DeviceLink,
    OutputRouter, ProtectedFiles,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    fs::{RemoteFileEntry, decode_read, list_snippet, parse_listing, read_snippet},
    operation::{Operation, OperationOutput},
    session::{Session, SessionStatus},
};

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

enum Command {
    Connect {
        port: String,
        baud: BaudRate,
        reply: Reply<SessionStatus>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Execute {
        op: Operation,
        reply: Reply<OperationOutput>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the session worker.
///
/// Cheap to clone; every clone feeds the same FIFO queue.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    listing: watch::Receiver<Vec<RemoteFileEntry>>,
    router: OutputRouter,
    protected: ProtectedFiles,
    read_chunk_size: usize,
}

impl SessionManager {
    /// Spawn the worker task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new<C>(connector: C, router: OutputRouter, config: &ControllerConfig) -> Self
    where
        C: DeviceConnector + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let (listing_tx, listing) = watch::channel(Vec::new());

        let worker = Worker {
            connector: Arc::new(connector),
            router: router.clone(),
            handshake_timeout: config.handshake_timeout(),
            session: None,
            status: status_tx,
            listing: listing_tx,
        };
        tokio::spawn(worker.run(rx));

        Self {
            commands,
            status,
            listing,
            router,
            protected: config.protected(),
            read_chunk_size: config.read_chunk_size,
        }
    }

    /// Current session status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Receiver holding the most recent root listing.
    #[must_use]
    pub fn listing(&self) -> watch::Receiver<Vec<RemoteFileEntry>> {
        self.listing.clone()
    }

    #[must_use]
    pub const fn router(&self) -> &OutputRouter {
        &self.router
    }

    #[must_use]
    pub const fn protected_files(&self) -> &ProtectedFiles {
        &self.protected
    }

    /// Open a session on `port` and list the root directory.
    ///
    /// # Errors
    /// Returns `PortUnavailable`, `HandshakeTimeout`, `Protocol` or
    /// `AlreadyConnected`.
    pub async fn connect(&self, port: &str, baud: BaudRate) -> Result<SessionStatus, ControllerError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Connect {
            port: port.to_string(),
            baud,
            reply,
        };
        let result = self.request(command, rx).await;
        if let Err(e) = &result {
            self.router.error(format!("Unable to connect to {port}: {e}"));
        }
        result
    }

    /// Close the session, if any. Never fails.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Close the session and stop the worker.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Queue `op` behind every earlier request and wait for its result.
    ///
    /// Protected-file and connection checks happen here, before anything
    /// reaches the transport.
    ///
    /// # Errors
    /// Returns the typed failure of the operation; see [`ControllerError`].
    pub async fn submit(&self, op: Operation) -> Result<OperationOutput, ControllerError> {
        let label = op.to_string();
        let result = self.submit_inner(op).await;
        match &result {
            Ok(_) => tracing::debug!(op = %label, "Operation completed"),
            Err(e) => self.router.error(format!("{label} failed: {e}")),
        }
        result
    }

    async fn submit_inner(&self, op: Operation) -> Result<OperationOutput, ControllerError> {
        if let Some((name, allow)) = op.protected_target() {
            self.protected.check(name, allow)?;
        }
        if !self.status.borrow().is_connected() {
            return Err(ControllerError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.request(Command::Execute { op, reply }, rx).await
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, ControllerError>>,
    ) -> Result<T, ControllerError> {
        self.commands
            .send(command)
            .map_err(|_| ControllerError::NotConnected)?;
        // A dropped reply means the worker has shut down.
        rx.await.unwrap_or(Err(ControllerError::NotConnected))
    }

    /// List `path`; `""` is the root directory.
    ///
    /// # Errors
    /// See [`Self::submit`].
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteFileEntry>, ControllerError> {
        match self
            .submit(Operation::List {
                path: path.to_string(),
            })
            .await?
        {
            OperationOutput::Listing(entries) => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    /// Read `path` using the configured chunk size.
    ///
    /// # Errors
    /// See [`Self::submit`].
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, ControllerError> {
        self.read_chunked(path, self.read_chunk_size).await
    }

    /// Read `path` in `chunk_size` pieces.
    ///
    /// # Errors
    /// See [`Self::submit`].
    pub async fn read_chunked(&self, path: &str, chunk_size: usize) -> Result<Vec<u8>, ControllerError> {
        match self
            .submit(Operation::Read {
                path: path.to_string(),
                chunk_size: chunk_size.max(1),
            })
            .await?
        {
            OperationOutput::Content(bytes) => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    /// Read `path` as UTF-8 text.
    ///
    /// # Errors
    /// Returns `Encoding` if the content is not valid UTF-8; the session
    /// stays usable.
    pub async fn read_text(&self, path: &str) -> Result<String, ControllerError> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|e| {
            let err = ControllerError::from(e);
            self.router.error(format!("read {path} failed: {err}"));
            err
        })
    }

    /// Store `data` as `remote_name`, then refresh the listing.
    ///
    /// # Errors
    /// Returns `ProtectedFile` without touching the board when `remote_name`
    /// is protected and `allow_protected_override` is false.
    pub async fn write(
        &self,
        data: Vec<u8>,
        remote_name: &str,
        allow_protected_override: bool,
    ) -> Result<(), ControllerError> {
        let len = data.len();
        self.submit(Operation::Write {
            data,
            remote_name: remote_name.to_string(),
            allow_protected_override,
        })
        .await?;
        self.router.info(format!("Wrote {remote_name} ({len} bytes)"));
        Ok(())
    }

    /// Remove `remote_name`, then refresh the listing.
    ///
    /// # Errors
    /// Same protection rule as [`Self::write`].
    pub async fn delete(
        &self,
        remote_name: &str,
        allow_protected_override: bool,
    ) -> Result<(), ControllerError> {
        self.submit(Operation::Delete {
            remote_name: remote_name.to_string(),
            allow_protected_override,
        })
        .await?;
        self.router.info(format!("Deleted {remote_name}"));
        Ok(())
    }

    /// Run `code`, streaming its output to the device console.
    ///
    /// # Errors
    /// See [`Self::submit`].
    pub async fn run_snippet(&self, code: &str) -> Result<Vec<u8>, ControllerError> {
        match self
            .submit(Operation::RunSnippet {
                code: code.to_string(),
            })
            .await?
        {
            OperationOutput::Output(bytes) => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    /// Echo `text` to the device console and run it, streaming output.
    ///
    /// # Errors
    /// See [`Self::submit`].
    pub async fn run_free_text(&self, text: &str) -> Result<Vec<u8>, ControllerError> {
        match self
            .submit(Operation::RunFreeText {
                text: text.to_string(),
            })
            .await?
        {
            OperationOutput::Output(bytes) => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    /// Upload a host file under its basename.
    ///
    /// # Errors
    /// Returns `HostIo` if the file cannot be read, otherwise as
    /// [`Self::write`].
    pub async fn upload_file(
        &self,
        local_path: &Path,
        allow_protected_override: bool,
    ) -> Result<String, ControllerError> {
        let name = local_path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| {
                ControllerError::HostIo(format!("{} has no file name", local_path.display()))
            })
            .inspect_err(|e| self.router.error(e.to_string()))?
            .to_string();
        self.protected
            .check(&name, allow_protected_override)
            .inspect_err(|e| self.router.error(format!("upload failed: {e}")))?;
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| ControllerError::HostIo(format!("{}: {e}", local_path.display())))
            .inspect_err(|e| self.router.error(format!("upload failed: {e}")))?;
        self.write(data, &name, allow_protected_override).await?;
        Ok(name)
    }

    /// Run a host file on the board, then refresh the listing.
    ///
    /// # Errors
    /// Returns `HostIo` if the file cannot be read as text, otherwise as
    /// [`Self::run_snippet`].
    pub async fn run_file(&self, local_path: &Path) -> Result<Vec<u8>, ControllerError> {
        let code = tokio::fs::read_to_string(local_path)
            .await
            .map_err(|e| ControllerError::HostIo(format!("{}: {e}", local_path.display())))
            .inspect_err(|e| self.router.error(format!("run failed: {e}")))?;
        let output = self.run_snippet(&code).await?;
        // Scripts may create or delete files.
        let _ = self.list("").await;
        Ok(output)
    }
}

fn unexpected(output: &OperationOutput) -> ControllerError {
    ControllerError::MalformedResponse(format!("unexpected result {output:?}"))
}

/// Owns the session and the transport.
struct Worker {
    connector: Arc<dyn DeviceConnector>,
    router: OutputRouter,
    handshake_timeout: Duration,
    session: Option<Session>,
    status: watch::Sender<SessionStatus>,
    listing: watch::Sender<Vec<RemoteFileEntry>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let lost = self.session.as_ref().map(|s| s.lost.clone());
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Connect { port, baud, reply } => {
                            let _ = reply.send(self.connect(port, baud).await);
                        }
                        Command::Disconnect { reply } => {
                            self.disconnect().await;
                            let _ = reply.send(());
                        }
                        Command::Execute { op, reply } => {
                            let _ = reply.send(self.execute(op).await);
                        }
                        Command::Shutdown { reply } => {
                            self.disconnect().await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
                () = wait_lost(lost) => {
                    self.teardown("port vanished").await;
                }
            }
        }
        self.disconnect().await;
        tracing::debug!("Session worker stopped");
    }

    async fn connect(&mut self, port: String, baud: BaudRate) -> Result<SessionStatus, ControllerError> {
        if let Some(session) = &self.session {
            return Err(ControllerError::AlreadyConnected(session.port.clone()));
        }
        self.status.send_replace(SessionStatus::connecting(&port, baud));

        let session = match self.open_session(port, baud).await {
            Ok(session) => session,
            Err(e) => {
                self.status.send_replace(SessionStatus::default());
                return Err(e);
            }
        };

        let status = session.status();
        tracing::info!(session = %session.id, port = %session.port, %baud, "Board connected");
        self.router
            .info(format!("Board connected on {} at {baud} baud", session.port));
        self.session = Some(session);
        self.status.send_replace(status.clone());

        if let Err(e) = self.refresh_listing().await {
            self.router.error(format!("Initial listing failed: {e}"));
        }
        Ok(status)
    }

    async fn open_session(&mut self, port: String, baud: BaudRate) -> Result<Session, ControllerError> {
        let mut link = self.connector.open(&port, baud).await.map_err(|e| {
            ControllerError::PortUnavailable {
                port: port.clone(),
                reason: e.to_string(),
            }
        })?;

        let probe = tokio::time::timeout(self.handshake_timeout, probe(link.as_mut())).await;
        let err = match probe {
            Ok(Ok(())) => return Ok(Session::new(port, baud, link)),
            Ok(Err(DeviceError::Timeout)) | Err(_) => ControllerError::HandshakeTimeout { port },
            Ok(Err(e)) => ControllerError::Protocol(format!("raw REPL probe failed: {e}")),
        };
        close_link(link, &self.router).await;
        Err(err)
    }

    async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::info!(session = %session.id, port = %session.port, "Disconnecting");
        close_link(session.link, &self.router).await;
        self.router
            .info(format!("Board on {} disconnected", session.port));
        self.status.send_replace(SessionStatus::default());
        self.listing.send_replace(Vec::new());
    }

    async fn teardown(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.lost.cancel();
        tracing::warn!(session = %session.id, port = %session.port, reason, "Session torn down");
        self.router
            .error(format!("Session on {} closed: {reason}", session.port));
        close_link(session.link, &self.router).await;
        self.status.send_replace(SessionStatus::default());
        self.listing.send_replace(Vec::new());
    }

    async fn execute(&mut self, op: Operation) -> Result<OperationOutput, ControllerError> {
        let output = self.run_op(&op).await?;
        match (&op, &output) {
            (Operation::List { path }, OperationOutput::Listing(entries)) if path.is_empty() => {
                self.listing.send_replace(entries.clone());
            }
            _ if op.refreshes_listing() => {
                if let Err(e) = self.refresh_listing().await {
                    self.router.error(format!("Listing refresh failed: {e}"));
                }
            }
            _ => {}
        }
        Ok(output)
    }

    async fn refresh_listing(&mut self) -> Result<(), ControllerError> {
        let op = Operation::List {
            path: String::new(),
        };
        if let OperationOutput::Listing(entries) = self.run_op(&op).await? {
            self.listing.send_replace(entries);
        }
        Ok(())
    }

    async fn run_op(&mut self, op: &Operation) -> Result<OperationOutput, ControllerError> {
        let Some(session) = self.session.as_mut() else {
            return Err(ControllerError::NotConnected);
        };
        let lost = session.lost.clone();
        let port = session.port.clone();

        let result = tokio::select! {
            biased;
            () = lost.cancelled() => {
                Err(ControllerError::TransportLost(format!("{port} vanished")))
            }
            result = framed(session.link.as_mut(), op, &self.router) => result,
        };

        if let Err(e) = &result {
            if e.forces_disconnect() {
                self.teardown(&e.to_string()).await;
            }
        }
        result
    }
}

async fn wait_lost(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn probe(link: &mut dyn DeviceLink) -> Result<(), DeviceError> {
    link.enter_raw_repl().await?;
    link.exit_raw_repl().await
}

async fn close_link(mut link: Box<dyn DeviceLink>, router: &OutputRouter) {
    if let Err(e) = link.close().await {
        tracing::warn!("Failed to close device link: {e}");
        router.warn(format!("Error while closing port: {e}"));
    }
}

/// Run `op` between raw REPL entry and exit.
///
/// Exit is attempted whatever happened before it.
async fn framed(
    link: &mut dyn DeviceLink,
    op: &Operation,
    router: &OutputRouter,
) -> Result<OperationOutput, ControllerError> {
    tracing::debug!(%op, "Entering raw REPL");
    let body = match link.enter_raw_repl().await {
        Ok(()) => body(link, op, router).await,
        Err(e) => Err(ControllerError::Protocol(format!("could not enter raw REPL: {e}"))),
    };
    let exit = link.exit_raw_repl().await;
    tracing::debug!(%op, ok = body.is_ok(), "Exited raw REPL");

    match (body, exit) {
        (Ok(output), Ok(())) => Ok(output),
        (Ok(_), Err(e)) => Err(ControllerError::Protocol(format!(
            "could not exit raw REPL: {e}"
        ))),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(_)) if e.forces_disconnect() => Err(e),
        (Err(e), Err(exit)) => Err(ControllerError::Protocol(format!(
            "{e}; could not exit raw REPL: {exit}"
        ))),
    }
}

async fn body(
    link: &mut dyn DeviceLink,
    op: &Operation,
    router: &OutputRouter,
) -> Result<OperationOutput, ControllerError> {
    match op {
        Operation::List { path } => {
            let output = link
                .execute(&list_snippet(path), &|_| {})
                .await
                .map_err(ControllerError::from_device)?;
            let text = String::from_utf8(output)
                .map_err(|e| ControllerError::MalformedResponse(e.to_string()))?;
            parse_listing(&text).map(OperationOutput::Listing)
        }
        Operation::Read { path, chunk_size } => {
            let output = link
                .execute(&read_snippet(path, *chunk_size), &|_| {})
                .await
                .map_err(ControllerError::from_device)?;
            decode_read(&output).map(OperationOutput::Content)
        }
        Operation::Write {
            data, remote_name, ..
        } => {
            link.put_file(data, remote_name)
                .await
                .map_err(ControllerError::from_device)?;
            Ok(OperationOutput::Done)
        }
        Operation::Delete { remote_name, .. } => {
            link.remove_file(remote_name)
                .await
                .map_err(ControllerError::from_device)?;
            Ok(OperationOutput::Done)
        }
        Operation::RunSnippet { code } => run_streaming(link, code, router).await,
        Operation::RunFreeText { text } => {
            router.echo(text);
            run_streaming(link, text, router).await
        }
    }
}

async fn run_streaming(
    link: &mut dyn DeviceLink,
    code: &str,
    router: &OutputRouter,
) -> Result<OperationOutput, ControllerError> {
    match link.execute(code, &|chunk| router.console(chunk)).await {
        Ok(output) => Ok(OperationOutput::Output(output)),
        Err(DeviceError::Remote(traceback)) => {
            router.console(traceback.as_bytes());
            Err(ControllerError::RemoteExecution(traceback))
        }
        Err(e) => Err(ControllerError::from_device(e)),
    }
}
