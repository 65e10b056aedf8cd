//! Remote filesystem snippets and listing parser.

use pyboard_core::{ControllerError, literal::py_str};

/// Entry type flag for directories in `os.ilistdir` tuples.
const DIR_FLAG: u32 = 0x4000;

/// Width of the size column in listing output.
const SIZE_WIDTH: usize = 12;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub name: String,
    pub size_bytes: u64,
    pub is_directory: bool,
}

impl RemoteFileEntry {
    #[must_use]
    pub fn file(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            is_directory: false,
        }
    }

    #[must_use]
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes: 0,
            is_directory: true,
        }
    }
}

/// Snippet printing one `<size> <name>[/]` line per entry of `path`.
///
/// An empty `path` lists the current directory.
#[must_use]
pub fn list_snippet(path: &str) -> String {
    let arg = if path.is_empty() {
        String::new()
    } else {
        py_str(path)
    };
    format!(
        "import os\nfor f in os.ilistdir({arg}):\n print('{{:{SIZE_WIDTH}}} {{}}{{}}'.format(f[3]if len(f)>3 else 0,f[0],'/'if f[1]&{DIR_FLAG:#x} else ''))"
    )
}

/// Snippet printing `path` as hex, one line per `chunk_size` bytes.
///
/// Hex keeps the raw REPL terminator (`0x04`) out of the stream.
#[must_use]
pub fn read_snippet(path: &str, chunk_size: usize) -> String {
    format!(
        "import ubinascii\nwith open({},'rb') as f:\n while 1:\n  b=f.read({chunk_size})\n  if not b:break\n  print(ubinascii.hexlify(b).decode())",
        py_str(path)
    )
}

/// Decode the output of [`read_snippet`] back into file content.
///
/// # Errors
/// Returns `MalformedResponse` if a line is not valid hex.
pub fn decode_read(output: &[u8]) -> Result<Vec<u8>, ControllerError> {
    let text = std::str::from_utf8(output)
        .map_err(|e| ControllerError::MalformedResponse(format!("read output: {e}")))?;
    let mut content = Vec::with_capacity(text.len() / 2);
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let chunk = hex::decode(line)
            .map_err(|e| ControllerError::MalformedResponse(format!("read chunk {line:?}: {e}")))?;
        content.extend(chunk);
    }
    Ok(content)
}

/// Parse listing output into entries.
///
/// Each non-blank line is split at its first run of whitespace into size and
/// name; a trailing `/` on the name marks a directory.
///
/// # Errors
/// Returns `MalformedResponse` if a line has no name or a non-numeric size.
pub fn parse_listing(output: &str) -> Result<Vec<RemoteFileEntry>, ControllerError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<RemoteFileEntry, ControllerError> {
    let (size, name) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| ControllerError::MalformedResponse(format!("listing line {line:?}")))?;
    let size_bytes = size
        .parse::<u64>()
        .map_err(|_| ControllerError::MalformedResponse(format!("listing size {size:?}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ControllerError::MalformedResponse(format!(
            "listing line {line:?}"
        )));
    }

    Ok(match name.strip_suffix('/') {
        Some(dir) => RemoteFileEntry {
            name: dir.to_string(),
            size_bytes,
            is_directory: true,
        },
        None => RemoteFileEntry::file(name, size_bytes),
    })
}
