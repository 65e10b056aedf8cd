//! In-memory simulated board.
//!
//! Implements [`DeviceConnector`], [`DeviceLink`] and [`PortLister`] over a
//! fake filesystem so the controller can be driven without hardware. Every
//! adapter call is recorded in order, and faults can be injected to exercise
//! the failure paths.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;

use crate::traits::{BaudRate, ChunkCallback, DeviceConnector, DeviceError, DeviceLink, PortLister};

const ENOENT: &str = "Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n";

/// Chunk size assumed when a read snippet names none.
const DEFAULT_READ_CHUNK: usize = 256;

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Open { port: String, baud: BaudRate },
    EnterRawRepl,
    ExitRawRepl,
    Execute(String),
    PutFile { name: String, len: usize },
    RemoveFile(String),
    Close,
}

/// Injectable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `open` fails.
    OpenFails,
    /// `enter_raw_repl` never completes.
    Unresponsive,
    /// `enter_raw_repl` fails.
    EnterFails,
    /// `enter_raw_repl` gives up waiting for the banner.
    EnterTimesOut,
    /// `exit_raw_repl` fails.
    ExitFails,
    /// `close` fails.
    CloseFails,
}

#[derive(Debug, Clone)]
enum Script {
    Output(Vec<u8>),
    Raise(String),
}

#[derive(Debug)]
struct SimState {
    ports: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    scripts: HashMap<String, Script>,
    calls: Vec<DeviceCall>,
    faults: HashSet<Fault>,
    exec_delay: Duration,
    stream_chunk: usize,
    open_links: usize,
}

/// Simulated board shared between the connector, its links and the tests.
#[derive(Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// Empty board with no visible ports.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                ports: Vec::new(),
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                scripts: HashMap::new(),
                calls: Vec::new(),
                faults: HashSet::new(),
                exec_delay: Duration::ZERO,
                stream_chunk: 64,
                open_links: 0,
            })),
        }
    }

    /// Empty board reachable on `ports`.
    #[must_use]
    pub fn with_ports<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let board = Self::new();
        board.lock().ports = ports.into_iter().map(Into::into).collect();
        board
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `port` visible.
    pub fn plug(&self, port: impl Into<String>) {
        let port = port.into();
        let mut state = self.lock();
        if !state.ports.contains(&port) {
            state.ports.push(port);
        }
    }

    /// Make `port` disappear, as if the cable were pulled.
    pub fn unplug(&self, port: &str) {
        self.lock().ports.retain(|p| p != port);
    }

    /// Store a file on the board.
    pub fn add_file(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.lock().files.insert(normalize(name), data.into());
    }

    /// Create a directory on the board.
    pub fn add_dir(&self, name: &str) {
        self.lock().dirs.insert(normalize(name));
    }

    /// Content of a board file.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(name)).cloned()
    }

    /// Reply to exactly `code` with `output`.
    pub fn script_output(&self, code: impl Into<String>, output: impl Into<Vec<u8>>) {
        self.lock()
            .scripts
            .insert(code.into(), Script::Output(output.into()));
    }

    /// Reply to exactly `code` with a remote exception.
    pub fn script_error(&self, code: impl Into<String>, traceback: impl Into<String>) {
        self.lock()
            .scripts
            .insert(code.into(), Script::Raise(traceback.into()));
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.insert(fault);
    }

    pub fn clear_fault(&self, fault: Fault) {
        self.lock().faults.remove(&fault);
    }

    /// Pause before each streamed output fragment.
    pub fn set_exec_delay(&self, delay: Duration) {
        self.lock().exec_delay = delay;
    }

    /// Size of streamed output fragments.
    pub fn set_stream_chunk(&self, size: usize) {
        self.lock().stream_chunk = size.max(1);
    }

    /// Calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Links opened and not yet closed.
    #[must_use]
    pub fn open_links(&self) -> usize {
        self.lock().open_links
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.lock().faults.contains(&fault)
    }

    fn record(&self, call: DeviceCall) {
        self.lock().calls.push(call);
    }

    fn is_present(&self, port: &str) -> bool {
        self.lock().ports.iter().any(|p| p == port)
    }

    /// Produce the output `code` would print, or the exception it raises.
    fn evaluate(&self, code: &str) -> Result<Vec<u8>, String> {
        let state = self.lock();
        if let Some(script) = state.scripts.get(code) {
            return match script {
                Script::Output(out) => Ok(out.clone()),
                Script::Raise(tb) => Err(tb.clone()),
            };
        }
        if let Some(rest) = after(code, "os.ilistdir(") {
            let dir = if rest.starts_with(')') {
                String::new()
            } else {
                parse_py_str(rest).map(|(s, _)| normalize(&s)).ok_or(ENOENT)?
            };
            return state.listing(&dir).ok_or_else(|| ENOENT.to_string());
        }
        if let Some(rest) = after(code, "with open(") {
            let (path, rest) = parse_py_str(rest).ok_or(ENOENT)?;
            let data = state.files.get(&normalize(&path)).ok_or(ENOENT)?;
            let chunk_size = after(rest, "f.read(")
                .and_then(|n| n.split(')').next())
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_READ_CHUNK);
            let mut out = Vec::new();
            for chunk in data.chunks(chunk_size) {
                out.extend(hex::encode(chunk).into_bytes());
                out.extend(b"\r\n");
            }
            return Ok(out);
        }
        Ok(Vec::new())
    }
}

impl SimState {
    fn listing(&self, dir: &str) -> Option<Vec<u8>> {
        if !dir.is_empty() && !self.dirs.contains(dir) {
            return None;
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let child = |path: &str| -> Option<String> {
            let name = path.strip_prefix(prefix.as_str())?;
            (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
        };

        let mut out = String::new();
        for d in &self.dirs {
            if let Some(name) = child(d) {
                out.push_str(&format!("{:>12} {name}/\r\n", 0));
            }
        }
        for (path, data) in &self.files {
            if let Some(name) = child(path) {
                out.push_str(&format!("{:>12} {name}\r\n", data.len()));
            }
        }
        Some(out.into_bytes())
    }
}

#[async_trait]
impl DeviceConnector for SimulatedBoard {
    async fn open(&self, port: &str, baud: BaudRate) -> Result<Box<dyn DeviceLink>, DeviceError> {
        self.record(DeviceCall::Open {
            port: port.to_string(),
            baud,
        });
        if self.has_fault(Fault::OpenFails) || !self.is_present(port) {
            return Err(DeviceError::Open {
                port: port.to_string(),
                reason: "could not open port".to_string(),
            });
        }
        self.lock().open_links += 1;
        Ok(Box::new(SimLink {
            board: self.clone(),
            port: port.to_string(),
            raw: false,
            closed: false,
        }))
    }
}

#[async_trait]
impl PortLister for SimulatedBoard {
    async fn list_ports(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self.lock().ports.clone())
    }
}

struct SimLink {
    board: SimulatedBoard,
    port: String,
    raw: bool,
    closed: bool,
}

impl SimLink {
    fn ensure_raw(&self) -> Result<(), DeviceError> {
        if self.closed || !self.board.is_present(&self.port) {
            return Err(DeviceError::Disconnected);
        }
        if self.raw {
            Ok(())
        } else {
            Err(DeviceError::RawRepl("not in raw REPL".to_string()))
        }
    }
}

#[async_trait]
impl DeviceLink for SimLink {
    async fn enter_raw_repl(&mut self) -> Result<(), DeviceError> {
        self.board.record(DeviceCall::EnterRawRepl);
        if self.closed || !self.board.is_present(&self.port) {
            return Err(DeviceError::Disconnected);
        }
        if self.board.has_fault(Fault::Unresponsive) {
            std::future::pending::<()>().await;
        }
        if self.board.has_fault(Fault::EnterTimesOut) {
            return Err(DeviceError::Timeout);
        }
        if self.board.has_fault(Fault::EnterFails) {
            return Err(DeviceError::RawRepl("could not enter raw REPL".to_string()));
        }
        if self.raw {
            return Err(DeviceError::RawRepl("already in raw REPL".to_string()));
        }
        self.raw = true;
        Ok(())
    }

    async fn exit_raw_repl(&mut self) -> Result<(), DeviceError> {
        self.board.record(DeviceCall::ExitRawRepl);
        self.raw = false;
        if self.board.has_fault(Fault::ExitFails) {
            return Err(DeviceError::RawRepl("could not exit raw REPL".to_string()));
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        code: &str,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<Vec<u8>, DeviceError> {
        self.board.record(DeviceCall::Execute(code.to_string()));
        self.ensure_raw()?;

        let result = self.board.evaluate(code);
        let (delay, chunk) = {
            let state = self.board.lock();
            (state.exec_delay, state.stream_chunk)
        };
        let output = match &result {
            Ok(out) => out.clone(),
            Err(_) => Vec::new(),
        };

        for piece in output.chunks(chunk) {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.board.is_present(&self.port) {
                return Err(DeviceError::Disconnected);
            }
            on_chunk(piece);
        }
        if output.is_empty() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        result.map_err(DeviceError::Remote)
    }

    async fn put_file(&mut self, data: &[u8], remote_name: &str) -> Result<(), DeviceError> {
        self.board.record(DeviceCall::PutFile {
            name: remote_name.to_string(),
            len: data.len(),
        });
        self.ensure_raw()?;
        self.board.add_file(remote_name, data);
        Ok(())
    }

    async fn remove_file(&mut self, remote_name: &str) -> Result<(), DeviceError> {
        self.board
            .record(DeviceCall::RemoveFile(remote_name.to_string()));
        self.ensure_raw()?;
        self.board
            .lock()
            .files
            .remove(&normalize(remote_name))
            .map(|_| ())
            .ok_or_else(|| DeviceError::Remote(ENOENT.to_string()))
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.board.record(DeviceCall::Close);
        if !self.closed {
            self.closed = true;
            let mut state = self.board.lock();
            state.open_links = state.open_links.saturating_sub(1);
        }
        if self.board.has_fault(Fault::CloseFails) {
            return Err(DeviceError::Io(std::io::Error::other("close failed")));
        }
        Ok(())
    }
}

fn normalize(name: &str) -> String {
    name.trim_matches('/').to_string()
}

fn after<'a>(code: &'a str, marker: &str) -> Option<&'a str> {
    code.find(marker).map(|idx| &code[idx + marker.len()..])
}

/// Parse a single-quoted Python string literal at the start of `input`.
///
/// Returns the decoded value and the remaining input.
fn parse_py_str(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('\'')?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\'' => return Some((out, &body[idx + 1..])),
            '\\' => {
                let (_, esc) = chars.next()?;
                match esc {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    'x' => {
                        let hi = chars.next()?.1;
                        let lo = chars.next()?.1;
                        let code = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
                        out.push(char::from(code));
                    }
                    other => out.push(other),
                }
            }
            other => out.push(other),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    async fn raw_link(board: &SimulatedBoard) -> Box<dyn DeviceLink> {
        let mut link = board.open("COM3", BaudRate::B115200).await.unwrap();
        link.enter_raw_repl().await.unwrap();
        link
    }

    #[test]
    fn parses_escaped_literals() {
        let (s, rest) = parse_py_str(r"'it\'s\\a\x41',1)").unwrap();
        assert_eq!(s, "it's\\aA");
        assert_eq!(rest, ",1)");
        assert!(parse_py_str("'unterminated").is_none());
    }

    #[tokio::test]
    async fn open_requires_visible_port() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        assert!(board.open("COM4", BaudRate::B9600).await.is_err());
        assert!(board.open("COM3", BaudRate::B9600).await.is_ok());
        assert_eq!(board.open_links(), 1);
    }

    #[tokio::test]
    async fn execute_requires_raw_mode() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        let mut link = board.open("COM3", BaudRate::B115200).await.unwrap();
        let err = link.execute("print(1)", &|_| {}).await.unwrap_err();
        assert!(matches!(err, DeviceError::RawRepl(_)));
    }

    #[tokio::test]
    async fn double_enter_is_rejected() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        let mut link = raw_link(&board).await;
        assert!(link.enter_raw_repl().await.is_err());
    }

    #[tokio::test]
    async fn lists_nested_directories() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        board.add_dir("lib");
        board.add_file("lib/util.py", b"x=1".to_vec());
        board.add_file("main.py", b"print(1)".to_vec());
        let mut link = raw_link(&board).await;

        let top = link
            .execute("import os\nfor f in os.ilistdir():\n pass", &|_| {})
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(top).unwrap(),
            "           0 lib/\r\n           8 main.py\r\n"
        );

        let nested = link
            .execute("for f in os.ilistdir('lib'):", &|_| {})
            .await
            .unwrap();
        assert_eq!(String::from_utf8(nested).unwrap(), "           3 util.py\r\n");
    }

    #[tokio::test]
    async fn file_reads_answer_one_hex_line_per_chunk() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        board.add_file("fw.mpy", vec![b'M', 0x06, 0x04, 0x1f, 0x00]);
        let mut link = raw_link(&board).await;

        let out = link
            .execute("with open('fw.mpy','rb') as f:\n  b=f.read(2)", &|_| {})
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "4d06\r\n041f\r\n00\r\n");
    }

    #[tokio::test]
    async fn streams_output_in_fragments() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        board.script_output("print('hello')", b"hello\r\n".to_vec());
        board.set_stream_chunk(2);
        let mut link = raw_link(&board).await;

        let seen = StdMutex::new(Vec::new());
        let out = link
            .execute("print('hello')", &|b| seen.lock().unwrap().push(b.to_vec()))
            .await
            .unwrap();

        assert_eq!(out, b"hello\r\n");
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn remove_missing_file_raises() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        let mut link = raw_link(&board).await;
        assert!(matches!(
            link.remove_file("nope.py").await,
            Err(DeviceError::Remote(_))
        ));
    }

    #[tokio::test]
    async fn unplugged_port_disconnects_link() {
        let board = SimulatedBoard::with_ports(["COM3"]);
        let mut link = raw_link(&board).await;
        board.unplug("COM3");
        assert!(matches!(
            link.put_file(b"x", "x.py").await,
            Err(DeviceError::Disconnected)
        ));
    }
}
