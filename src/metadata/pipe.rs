//! Named-pipe metadata sink
//!
//! Writes one XML fragment per package to a FIFO. Readers may come and go:
//! the pipe is opened lazily on first use, `ENXIO` (no reader at the other
//! end) is tolerated, and a write failure closes the pipe so the next item
//! retries the open.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::{MetadataPackage, SinkReceiver};

/// Input bytes per base64 output line (57 bytes encode to 76 characters).
const BASE64_LINE_INPUT: usize = 57;

/// Render one package as its pipe fragment.
pub(crate) fn format_item(package: &MetadataPackage) -> Vec<u8> {
    let mut out = format!(
        "<item><type>{:x}</type><code>{:x}</code><length>{}</length>",
        package.mtype,
        package.code,
        package.data.len()
    )
    .into_bytes();

    if package.data.is_empty() {
        out.extend_from_slice(b"</item>\n");
    } else {
        out.extend_from_slice(b"\n<data encoding=\"base64\">\n");
        for chunk in package.data.chunks(BASE64_LINE_INPUT) {
            out.extend_from_slice(BASE64.encode(chunk).as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(b"</data></item>\n");
    }

    out
}

/// Create the FIFO if it does not already exist.
fn create_fifo(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pipe path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EEXIST) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Open the FIFO for writing without blocking on a reader.
fn try_open(path: &Path) -> Option<File> {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => Some(file),
        // ENXIO just means nobody has the FIFO open for reading right now
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => None,
        Err(e) => {
            tracing::warn!("can not open metadata pipe {path:?}: {e}");
            None
        }
    }
}

struct PipeSink {
    path: PathBuf,
    file: Option<File>,
}

impl PipeSink {
    fn deliver(&mut self, package: &MetadataPackage) {
        if self.file.is_none() {
            self.file = try_open(&self.path);
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(&format_item(package)) {
            tracing::debug!("metadata pipe write failed: {e}");
            self.file = None;
        }
    }
}

/// Consumer loop for the pipe sink.
pub(crate) async fn run(mut rx: SinkReceiver, path: PathBuf) {
    if let Err(e) = create_fifo(&path) {
        tracing::warn!("could not create metadata pipe {path:?}: {e}");
        return;
    }
    tracing::debug!("metadata pipe name is {path:?}");

    let mut sink = PipeSink {
        file: try_open(&path),
        path,
    };

    while let Some(package) = rx.take().await {
        tracing::debug!(
            "pipe: type {:x}, code {:x}, length {}",
            package.mtype,
            package.code,
            package.data.len()
        );
        sink.deliver(&package);
    }
}
