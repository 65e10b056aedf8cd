//! `DeviceConnector` / `DeviceLink` over a real serial port.
//!
//! The port is driven synchronously on the blocking pool; output fragments
//! are forwarded to the async side over a channel as they arrive.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use pyboard_core::{BaudRate, ChunkCallback, DeviceConnector, DeviceError, DeviceLink};
use serialport::SerialPort;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::raw_repl::{REPLY_TIMEOUT, RawRepl};

/// Read timeout of the underlying port; bounds how long a blocked read
/// takes to notice an abort.
pub const READ_POLL: Duration = Duration::from_millis(20);

type Repl = RawRepl<Box<dyn SerialPort>>;

/// Opens serial links with the raw REPL protocol.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    reply_timeout: Duration,
}

impl SerialConnector {
    /// Connector whose links wait `reply_timeout` for banners and prompts.
    ///
    /// Pass the handshake timeout so a silent board surfaces as a timeout
    /// within the same bound.
    #[must_use]
    pub const fn new(reply_timeout: Duration) -> Self {
        Self { reply_timeout }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(REPLY_TIMEOUT)
    }
}

#[async_trait]
impl DeviceConnector for SerialConnector {
    async fn open(&self, port: &str, baud: BaudRate) -> Result<Box<dyn DeviceLink>, DeviceError> {
        let name = port.to_string();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(name, baud.as_u32())
                .timeout(READ_POLL)
                .open()
        })
        .await
        .map_err(join_error)?;

        let serial = opened.map_err(|e| DeviceError::Open {
            port: port.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(port, %baud, "Serial port opened");
        Ok(Box::new(SerialLink::new(port, serial, self.reply_timeout)))
    }
}

pub struct SerialLink {
    port: String,
    repl: Arc<Mutex<Option<Repl>>>,
    abort: Arc<AtomicBool>,
}

impl SerialLink {
    fn new(port: &str, serial: Box<dyn SerialPort>, reply_timeout: Duration) -> Self {
        let repl = RawRepl::new(serial).with_reply_timeout(reply_timeout);
        let abort = repl.abort_handle();
        Self {
            port: port.to_string(),
            repl: Arc::new(Mutex::new(Some(repl))),
            abort,
        }
    }

    /// Run `f` against the port on the blocking pool.
    fn spawn<R, F>(&self, f: F) -> JoinHandle<Result<R, DeviceError>>
    where
        F: FnOnce(&mut Repl) -> Result<R, DeviceError> + Send + 'static,
        R: Send + 'static,
    {
        let repl = Arc::clone(&self.repl);
        tokio::task::spawn_blocking(move || {
            let mut guard = repl.lock().unwrap_or_else(PoisonError::into_inner);
            let repl = guard.as_mut().ok_or(DeviceError::Disconnected)?;
            f(repl)
        })
    }

    async fn run<R, F>(&self, f: F) -> Result<R, DeviceError>
    where
        F: FnOnce(&mut Repl) -> Result<R, DeviceError> + Send + 'static,
        R: Send + 'static,
    {
        self.spawn(f).await.map_err(join_error)?
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn enter_raw_repl(&mut self) -> Result<(), DeviceError> {
        self.run(Repl::enter).await
    }

    async fn exit_raw_repl(&mut self) -> Result<(), DeviceError> {
        self.run(Repl::exit).await
    }

    async fn execute(
        &mut self,
        code: &str,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<Vec<u8>, DeviceError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let code = code.as_bytes().to_vec();
        let task = self.spawn(move |repl| {
            repl.exec(&code, &|chunk| {
                let _ = tx.send(chunk.to_vec());
            })
        });

        while let Some(chunk) = rx.recv().await {
            on_chunk(&chunk);
        }
        task.await.map_err(join_error)?
    }

    async fn put_file(&mut self, data: &[u8], remote_name: &str) -> Result<(), DeviceError> {
        let data = data.to_vec();
        let name = remote_name.to_string();
        self.run(move |repl| repl.put_file(&data, &name)).await
    }

    async fn remove_file(&mut self, remote_name: &str) -> Result<(), DeviceError> {
        let name = remote_name.to_string();
        self.run(move |repl| repl.remove_file(&name)).await
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.abort.store(true, Ordering::Relaxed);
        let repl = Arc::clone(&self.repl);
        tokio::task::spawn_blocking(move || {
            repl.lock().unwrap_or_else(PoisonError::into_inner).take();
        })
        .await
        .map_err(join_error)?;
        tracing::info!(port = %self.port, "Serial port closed");
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> DeviceError {
    DeviceError::Io(io::Error::other(e))
}
