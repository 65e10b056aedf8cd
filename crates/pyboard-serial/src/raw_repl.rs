//! MicroPython raw REPL framing over a blocking byte stream.
//!
//! Entry interrupts whatever is running with two Ctrl-C, discards pending
//! input, then sends Ctrl-A and waits for the raw REPL banner. Each
//! execution waits for the `>` prompt, writes the code in bursts, sends
//! Ctrl-D and expects `OK`; the device then returns stdout and stderr, each
//! terminated by Ctrl-D.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use pyboard_core::{
    ChunkCallback, DeviceError,
    literal::{py_bytes, py_str},
};

const CTRL_A: u8 = 0x01;
const CTRL_B: u8 = 0x02;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";
const PROMPT: &[u8] = b">";
const EXEC_ACK: &[u8; 2] = b"OK";

/// Bytes per write burst; the device input buffer is small.
pub const WRITE_CHUNK: usize = 256;

/// Pause between write bursts.
const BURST_PAUSE: Duration = Duration::from_millis(10);

/// Default wait for banners, prompts and acknowledgements.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUF: usize = 512;

pub struct RawRepl<T> {
    port: T,
    pending: VecDeque<u8>,
    abort: Arc<AtomicBool>,
    reply_timeout: Duration,
}

impl<T: Read + Write> RawRepl<T> {
    #[must_use]
    pub fn new(port: T) -> Self {
        Self {
            port,
            pending: VecDeque::new(),
            abort: Arc::new(AtomicBool::new(false)),
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Flag that makes any blocked read give up with `Disconnected`.
    #[must_use]
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Enter raw REPL mode.
    ///
    /// # Errors
    /// Returns `Timeout` if the banner does not arrive within the reply
    /// timeout.
    pub fn enter(&mut self) -> Result<(), DeviceError> {
        self.port.write_all(&[b'\r', CTRL_C, CTRL_C])?;
        self.drain()?;
        self.port.write_all(&[b'\r', CTRL_A])?;
        self.port.flush()?;
        self.read_until(RAW_BANNER, Some(self.reply_timeout), &|_| {})?;
        Ok(())
    }

    /// Return to the friendly REPL.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub fn exit(&mut self) -> Result<(), DeviceError> {
        self.port.write_all(&[b'\r', CTRL_B])?;
        self.port.flush()?;
        Ok(())
    }

    /// Run `code`, passing stdout fragments to `on_chunk` as they arrive.
    ///
    /// Waits for the program to finish however long it takes.
    ///
    /// # Errors
    /// Returns `Remote` with the traceback if the code raised.
    pub fn exec(&mut self, code: &[u8], on_chunk: ChunkCallback<'_>) -> Result<Vec<u8>, DeviceError> {
        self.read_until(PROMPT, Some(self.reply_timeout), &|_| {})
            .map_err(|e| expected("raw REPL prompt", e))?;

        for burst in code.chunks(WRITE_CHUNK) {
            self.port.write_all(burst)?;
            self.port.flush()?;
            thread::sleep(BURST_PAUSE);
        }
        self.port.write_all(&[CTRL_D])?;
        self.port.flush()?;

        let deadline = Instant::now() + self.reply_timeout;
        let ack = [self.next_byte(Some(deadline))?, self.next_byte(Some(deadline))?];
        if &ack != EXEC_ACK {
            return Err(DeviceError::RawRepl(format!(
                "could not exec command (response: {:?})",
                String::from_utf8_lossy(&ack)
            )));
        }

        let output = self.read_until(&[CTRL_D], None, on_chunk)?;
        let error = self.read_until(&[CTRL_D], Some(self.reply_timeout), &|_| {})?;
        if error.is_empty() {
            Ok(output)
        } else {
            Err(DeviceError::Remote(String::from_utf8_lossy(&error).into_owned()))
        }
    }

    /// Write `data` to `remote_name`, one burst per statement.
    ///
    /// The remote file is closed even when a chunk fails.
    ///
    /// # Errors
    /// Returns the first failing step.
    pub fn put_file(&mut self, data: &[u8], remote_name: &str) -> Result<(), DeviceError> {
        let open = format!("f=open({},'wb')\nw=f.write", py_str(remote_name));
        self.exec(open.as_bytes(), &|_| {})?;
        let written = data.chunks(WRITE_CHUNK).try_for_each(|chunk| {
            let code = format!("w({})", py_bytes(chunk));
            self.exec(code.as_bytes(), &|_| {}).map(drop)
        });
        let closed = self.exec(b"f.close()", &|_| {});
        written?;
        closed?;
        Ok(())
    }

    /// Remove `remote_name`.
    ///
    /// # Errors
    /// Returns `Remote` if the file does not exist.
    pub fn remove_file(&mut self, remote_name: &str) -> Result<(), DeviceError> {
        let code = format!("import os\nos.remove({})", py_str(remote_name));
        self.exec(code.as_bytes(), &|_| {})?;
        Ok(())
    }

    /// Read until `ending`, which is consumed but not returned.
    ///
    /// Fragments are handed to `on_chunk` whenever the input runs dry,
    /// holding back any bytes that could be the start of `ending`.
    fn read_until(
        &mut self,
        ending: &[u8],
        timeout: Option<Duration>,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<Vec<u8>, DeviceError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let hold = ending.len().saturating_sub(1);
        let mut data = Vec::new();
        let mut emitted = 0;

        loop {
            while let Some(byte) = self.pending.pop_front() {
                data.push(byte);
                if data.ends_with(ending) {
                    data.truncate(data.len() - ending.len());
                    if data.len() > emitted {
                        on_chunk(&data[emitted..]);
                    }
                    return Ok(data);
                }
            }
            let ready = data.len().saturating_sub(hold);
            if ready > emitted {
                on_chunk(&data[emitted..ready]);
                emitted = ready;
            }
            self.fill(deadline)?;
        }
    }

    fn next_byte(&mut self, deadline: Option<Instant>) -> Result<u8, DeviceError> {
        loop {
            if let Some(byte) = self.pending.pop_front() {
                return Ok(byte);
            }
            self.fill(deadline)?;
        }
    }

    /// Block until at least one byte is pending.
    fn fill(&mut self, deadline: Option<Instant>) -> Result<(), DeviceError> {
        let mut buf = [0u8; READ_BUF];
        loop {
            if self.abort.load(Ordering::Relaxed) {
                return Err(DeviceError::Disconnected);
            }
            match self.port.read(&mut buf) {
                Ok(0) => return Err(DeviceError::Disconnected),
                Ok(n) => {
                    self.pending.extend(&buf[..n]);
                    return Ok(());
                }
                Err(e) if is_idle(&e) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(DeviceError::Timeout);
                    }
                }
                Err(e) => return Err(DeviceError::Io(e)),
            }
        }
    }

    /// Discard everything the device sends until the line goes quiet.
    fn drain(&mut self) -> Result<(), DeviceError> {
        self.pending.clear();
        loop {
            match self.fill(Some(Instant::now())) {
                Ok(()) => self.pending.clear(),
                Err(DeviceError::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn expected(what: &str, err: DeviceError) -> DeviceError {
    match err {
        DeviceError::Timeout => DeviceError::RawRepl(format!("timed out waiting for {what}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pyboard_session::fs::{decode_read, read_snippet};

    use super::*;

    type Responder = Box<dyn FnMut(&str) -> (Vec<u8>, Vec<u8>) + Send>;

    /// Minimal raw REPL device driven by the bytes written to it.
    struct FakeDevice {
        outbox: VecDeque<u8>,
        code: Vec<u8>,
        raw: bool,
        silent: bool,
        execs: Vec<String>,
        respond: Responder,
    }

    impl FakeDevice {
        fn new(respond: impl FnMut(&str) -> (Vec<u8>, Vec<u8>) + Send + 'static) -> Self {
            Self {
                outbox: VecDeque::new(),
                code: Vec::new(),
                raw: false,
                silent: false,
                execs: Vec::new(),
                respond: Box::new(respond),
            }
        }

        fn quiet() -> Self {
            Self::new(|_| (Vec::new(), Vec::new()))
        }
    }

    impl Write for FakeDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for &b in buf {
                match b {
                    CTRL_A if !self.silent => {
                        self.raw = true;
                        self.outbox.extend(b"\r\nraw REPL; CTRL-B to exit\r\n>");
                    }
                    CTRL_B => {
                        self.raw = false;
                        self.outbox.extend(b"\r\nMicroPython v1.22\r\n>>> ");
                    }
                    CTRL_C => {
                        self.code.clear();
                        self.outbox.extend(b"\r\n>>> ");
                    }
                    CTRL_D if self.raw => {
                        let code = String::from_utf8_lossy(&std::mem::take(&mut self.code)).into_owned();
                        let (out, err) = (self.respond)(&code);
                        self.execs.push(code);
                        self.outbox.extend(b"OK");
                        self.outbox.extend(out);
                        self.outbox.push_back(CTRL_D);
                        self.outbox.extend(err);
                        self.outbox.push_back(CTRL_D);
                        self.outbox.push_back(b'>');
                    }
                    b'\r' if !self.raw => {}
                    b => self.code.push(b),
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.outbox.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            // Trickle a few bytes at a time to exercise reassembly.
            let n = buf.len().min(self.outbox.len()).min(3);
            for slot in &mut buf[..n] {
                *slot = self.outbox.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn repl(device: FakeDevice) -> RawRepl<FakeDevice> {
        RawRepl::new(device).with_reply_timeout(Duration::from_millis(100))
    }

    #[test]
    fn exec_streams_stdout() {
        let mut repl = repl(FakeDevice::new(|code| {
            assert_eq!(code, "print('hello')");
            (b"hello\r\n".to_vec(), Vec::new())
        }));
        repl.enter().unwrap();

        let seen = Mutex::new(Vec::new());
        let out = repl
            .exec(b"print('hello')", &|chunk| {
                seen.lock().unwrap().extend_from_slice(chunk);
            })
            .unwrap();
        assert_eq!(out, b"hello\r\n");
        assert_eq!(seen.into_inner().unwrap(), b"hello\r\n");

        repl.exit().unwrap();
        assert!(!repl.port.raw);
    }

    #[test]
    fn consecutive_execs_share_one_raw_session() {
        let mut repl = repl(FakeDevice::new(|code| (code.as_bytes().to_vec(), Vec::new())));
        repl.enter().unwrap();
        assert_eq!(repl.exec(b"a", &|_| {}).unwrap(), b"a");
        assert_eq!(repl.exec(b"b", &|_| {}).unwrap(), b"b");
        assert_eq!(repl.port.execs, vec!["a", "b"]);
    }

    #[test]
    fn stderr_becomes_remote_error() {
        let tb = b"Traceback (most recent call last):\r\nNameError: name 'x' isn't defined\r\n";
        let mut repl = repl(FakeDevice::new(move |_| (Vec::new(), tb.to_vec())));
        repl.enter().unwrap();
        match repl.exec(b"x", &|_| {}) {
            Err(DeviceError::Remote(text)) => assert!(text.contains("NameError")),
            other => panic!("expected remote error, got {other:?}"),
        }
        // The device is back at the prompt.
        assert!(repl.exec(b"pass", &|_| {}).is_ok());
    }

    #[test]
    fn missing_banner_is_timeout() {
        let mut device = FakeDevice::quiet();
        device.silent = true;
        let mut repl = repl(device);
        assert!(matches!(repl.enter(), Err(DeviceError::Timeout)));
    }

    #[test]
    fn file_read_survives_terminator_bytes() {
        let content = vec![b'M', 0x06, 0x04, 0x1f, 0x00, b'x', 0x04];
        let expected_code = read_snippet("fw.mpy", 3);
        let served = content.clone();
        let mut repl = repl(FakeDevice::new(move |code| {
            assert_eq!(code, expected_code);
            let mut out = Vec::new();
            for chunk in served.chunks(3) {
                out.extend(hex::encode(chunk).into_bytes());
                out.extend(b"\r\n");
            }
            (out, Vec::new())
        }));
        repl.enter().unwrap();

        let out = repl
            .exec(read_snippet("fw.mpy", 3).as_bytes(), &|_| {})
            .unwrap();
        assert_eq!(out, b"4d0604\r\n1f0078\r\n04\r\n");
        assert_eq!(decode_read(&out).unwrap(), content);
    }

    #[test]
    fn put_file_closes_after_failed_chunk() {
        let mut repl = repl(FakeDevice::new(|code| {
            if code.starts_with("w(") {
                (Vec::new(), b"OSError: [Errno 28] ENOSPC\r\n".to_vec())
            } else {
                (Vec::new(), Vec::new())
            }
        }));
        repl.enter().unwrap();

        let err = repl.put_file(&vec![b'x'; WRITE_CHUNK * 2], "t.py").unwrap_err();
        assert!(matches!(err, DeviceError::Remote(ref tb) if tb.contains("ENOSPC")));
        let execs = &repl.port.execs;
        assert_eq!(execs.len(), 3);
        assert_eq!(execs[2], "f.close()");
    }

    #[test]
    fn put_file_writes_in_bursts() {
        let mut repl = repl(FakeDevice::quiet());
        repl.enter().unwrap();
        let data = vec![b'x'; WRITE_CHUNK * 2 + 1];
        repl.put_file(&data, "t.py").unwrap();

        let execs = &repl.port.execs;
        assert_eq!(execs.len(), 5);
        assert_eq!(execs[0], "f=open('t.py','wb')\nw=f.write");
        assert_eq!(execs[1], format!("w(b'{}')", "x".repeat(WRITE_CHUNK)));
        assert_eq!(execs[3], "w(b'x')");
        assert_eq!(execs[4], "f.close()");
    }

    #[test]
    fn remove_file_uses_os_remove() {
        let mut repl = repl(FakeDevice::quiet());
        repl.enter().unwrap();
        repl.remove_file("old.py").unwrap();
        assert_eq!(repl.port.execs, vec!["import os\nos.remove('old.py')"]);
    }

    #[test]
    fn abort_unblocks_reads() {
        let mut repl = repl(FakeDevice::quiet());
        repl.abort_handle().store(true, Ordering::Relaxed);
        assert!(matches!(repl.enter(), Err(DeviceError::Disconnected)));
    }

    #[test]
    fn multi_byte_ending_is_never_split_into_output() {
        let mut repl = repl(FakeDevice::quiet());
        repl.port.outbox.extend(b"boot output\r\nraw REPL; CTRL-B to exit\r\n");
        let seen = Mutex::new(Vec::new());
        let data = repl
            .read_until(RAW_BANNER, Some(Duration::from_millis(100)), &|chunk| {
                seen.lock().unwrap().extend_from_slice(chunk);
            })
            .unwrap();
        assert_eq!(data, b"boot output\r\n");
        assert_eq!(seen.into_inner().unwrap(), b"boot output\r\n");
    }
}
