use std::ffi::{c_void, CString};
use std::fmt::{self, Display, Formatter};
use std::io;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::{c_char, c_int};

use crate::config::TracerConfig;
use crate::diag;
use crate::modules::ModuleIndex;

// Upper bound for a single atomic pipe write; the record buffer is sized to
// it so one record normally commits in one write.
const RECORD_BUFFER: usize = libc::PIPE_BUF;

/// Errors that can occur while opening the event pipeline.
#[derive(Debug)]
pub enum PipelineError {
  Output(io::Error),
  Preamble(io::Error),
}

impl Display for PipelineError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Output(err) => write!(f, "failed to open event stream output: {err}"),
      Self::Preamble(err) => write!(f, "failed to write event stream preamble: {err}"),
    }
  }
}

impl std::error::Error for PipelineError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Output(err) => Some(err),
      Self::Preamble(err) => Some(err),
    }
  }
}

impl From<io::Error> for PipelineError {
  fn from(value: io::Error) -> Self {
    Self::Output(value)
  }
}

/// Framed binary encoder over the compressor pipe (or the raw output file).
///
/// Each record is assembled in a pipe-sized buffer and committed with a
/// single write, so records from different producer threads never
/// interleave. The descriptor is deliberately never closed: late
/// destructors in the host process may still allocate after ours ran.
pub struct EventWriter {
  buf: [u8; RECORD_BUFFER],
  fd: c_int,
  len: usize,
}

impl EventWriter {
  /// Open the stream according to `config` and emit the pointer-width
  /// preamble.
  ///
  /// # Errors
  ///
  /// Returns an error if the output file cannot be created or the preamble
  /// write fails. A compressor fork failure is not an error; it degrades to
  /// the uncompressed file with a warning.
  pub fn open(config: &TracerConfig) -> Result<Self, PipelineError> {
    let path = output_path(&config.output)?;

    let fd = if config.compress {
      match spawn_compressor(&path) {
        Ok(fd) => fd,
        Err(err) => {
          diag::line(format_args!(
            "warning: could not fork compressor ({err}), writing uncompressed"
          ));
          open_output(&path)?
        }
      }
    } else {
      open_output(&path)?
    };

    let mut writer = Self {
      buf: [0; RECORD_BUFFER],
      fd,
      len: 0,
    };

    writer.push(&[size_of::<*const c_void>() as u8]);
    writer.try_commit().map_err(PipelineError::Preamble)?;

    Ok(writer)
  }

  /// Emit one allocation record, interning previously unseen module names
  /// into the stream.
  pub fn alloc_event(
    &mut self,
    index: &mut ModuleIndex,
    payload: usize,
    size: usize,
    frames: &[usize],
  ) {
    self.push_usize(payload);
    self.push_isize(size as isize);
    self.push(&[frames.len() as u8]);

    for &address in frames {
      let located = index.locate(address);

      self.push_usize(address);
      self.push_usize(located.offset);
      self.push(&[located.ordinal]);

      if located.first_seen {
        let name = index.name_bytes(located.ordinal);
        self.push_usize(name.len());
        self.push(name);
      }
    }

    self.commit();
  }

  /// Emit one deallocation record.
  pub fn free_event(&mut self, payload: usize, size: isize) {
    self.push_usize(payload);
    self.push_isize(-size);
    self.commit();
  }

  /// Emit the snapshot sentinel (null pointer, zero delta).
  pub fn snapshot_event(&mut self) {
    self.push_usize(0);
    self.push_isize(0);
    self.commit();
  }

  fn commit(&mut self) {
    if let Err(err) = self.try_commit() {
      // A short or failed write leaves the stream unframed; there is no
      // way to continue.
      diag::line(format_args!("error: event stream write failed: {err}"));
      std::process::abort();
    }
  }

  fn push(&mut self, bytes: &[u8]) {
    // Oversized fields (a record introducing many long module names) give
    // up single-write atomicity rather than truncate.
    for chunk in bytes.chunks(RECORD_BUFFER) {
      if self.len + chunk.len() > RECORD_BUFFER {
        self.commit();
      }

      self.buf[self.len..self.len + chunk.len()].copy_from_slice(chunk);
      self.len += chunk.len();
    }
  }

  fn push_isize(&mut self, value: isize) {
    self.push(&value.to_ne_bytes());
  }

  fn push_usize(&mut self, value: usize) {
    self.push(&value.to_ne_bytes());
  }

  fn try_commit(&mut self) -> io::Result<()> {
    if self.len == 0 {
      return Ok(());
    }

    // SAFETY: the buffer holds `len` initialized bytes.
    let written = unsafe {
      libc::write(self.fd, self.buf.as_ptr() as *const c_void, self.len)
    };

    if written != self.len as isize {
      return Err(io::Error::last_os_error());
    }

    self.len = 0;
    Ok(())
  }
}

fn output_path(path: &Path) -> Result<CString, PipelineError> {
  CString::new(path.as_os_str().as_bytes())
    .map_err(|_| PipelineError::Output(io::Error::from(io::ErrorKind::InvalidInput)))
}

fn open_output(path: &CString) -> Result<c_int, PipelineError> {
  // SAFETY: `path` is NUL-terminated; the mode is only read on create.
  let fd = unsafe {
    libc::open(
      path.as_ptr(),
      libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
      0o644 as libc::c_uint,
    )
  };

  if fd < 0 {
    return Err(PipelineError::Output(io::Error::last_os_error()));
  }

  Ok(fd)
}

/// Fork a `gzip --fast` child reading the returned pipe and writing the
/// output file. The child clears `LD_PRELOAD` before exec so it is not
/// itself traced, and may outlive the traced process.
fn spawn_compressor(path: &CString) -> io::Result<c_int> {
  let mut fds: [c_int; 2] = [0; 2];

  // SAFETY: plain pipe/fork/dup2/exec plumbing; the child execs immediately
  // after rewiring its descriptors.
  unsafe {
    if libc::pipe(fds.as_mut_ptr()) != 0 {
      return Err(io::Error::last_os_error());
    }

    match libc::fork() {
      -1 => {
        let err = io::Error::last_os_error();
        libc::close(fds[0]);
        libc::close(fds[1]);
        Err(err)
      }
      0 => {
        // Child: stdin from the pipe, stdout into the output file.
        let out = libc::open(
          path.as_ptr(),
          libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
          0o644 as libc::c_uint,
        );
        if out < 0 {
          libc::_exit(127);
        }

        if libc::dup2(fds[0], libc::STDIN_FILENO) == -1 {
          libc::_exit(127);
        }
        if libc::dup2(out, libc::STDOUT_FILENO) == -1 {
          libc::_exit(127);
        }

        libc::close(fds[0]);
        libc::close(fds[1]);
        libc::close(out);

        libc::unsetenv(b"LD_PRELOAD\0".as_ptr() as *const c_char);

        let gzip = b"gzip\0".as_ptr() as *const c_char;
        let fast = b"--fast\0".as_ptr() as *const c_char;
        let argv: [*const c_char; 3] = [gzip, fast, std::ptr::null()];
        libc::execvp(gzip, argv.as_ptr());

        libc::_exit(127);
      }
      _ => {
        libc::close(fds[0]);
        Ok(fds[1])
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod decode {
  //! Framing-exact reader used by the tests: consumes precisely the framed
  //! bytes of each record and nothing else.

  const WORD: usize = std::mem::size_of::<usize>();

  #[derive(Debug, Clone, PartialEq, Eq)]
  pub(crate) enum Record {
    Alloc {
      payload: usize,
      size: isize,
      frames: Vec<Frame>,
    },
    Free {
      payload: usize,
      size: isize,
    },
    Snapshot,
  }

  #[derive(Debug, Clone, PartialEq, Eq)]
  pub(crate) struct Frame {
    pub(crate) address: usize,
    pub(crate) offset: usize,
    pub(crate) ordinal: u8,
    pub(crate) name: Option<Vec<u8>>,
  }

  pub(crate) fn decode_stream(bytes: &[u8]) -> Vec<Record> {
    let mut cursor = 0;

    assert_eq!(take(bytes, &mut cursor, 1)[0] as usize, WORD, "preamble");

    let mut records = Vec::new();
    let mut known_modules = 0u8;

    while cursor < bytes.len() {
      let payload = take_usize(bytes, &mut cursor);
      let size = take_usize(bytes, &mut cursor) as isize;

      if size > 0 {
        let depth = take(bytes, &mut cursor, 1)[0] as usize;
        let mut frames = Vec::with_capacity(depth);

        for _ in 0..depth {
          let address = take_usize(bytes, &mut cursor);
          let offset = take_usize(bytes, &mut cursor);
          let ordinal = take(bytes, &mut cursor, 1)[0];

          let name = if ordinal > known_modules {
            known_modules = ordinal;
            let len = take_usize(bytes, &mut cursor);
            Some(take(bytes, &mut cursor, len).to_vec())
          } else {
            None
          };

          frames.push(Frame {
            address,
            offset,
            ordinal,
            name,
          });
        }

        records.push(Record::Alloc {
          payload,
          size,
          frames,
        });
      } else if payload == 0 && size == 0 {
        records.push(Record::Snapshot);
      } else {
        records.push(Record::Free { payload, size });
      }
    }

    assert_eq!(cursor, bytes.len(), "stream has trailing bytes");
    records
  }

  fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> &'a [u8] {
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    slice
  }

  fn take_usize(bytes: &[u8], cursor: &mut usize) -> usize {
    usize::from_ne_bytes(take(bytes, cursor, WORD).try_into().unwrap())
  }
}

#[cfg(test)]
mod tests {
  use super::decode::{decode_stream, Record};
  use super::*;

  fn test_writer(dir: &tempfile::TempDir) -> (EventWriter, std::path::PathBuf) {
    let path = dir.path().join("events.data");
    let config = TracerConfig::default()
      .uncompressed()
      .with_output(path.clone());
    (EventWriter::open(&config).expect("open writer"), path)
  }

  #[inline(never)]
  fn anchor() {}

  #[test]
  fn preamble_records_pointer_width() {
    let dir = tempfile::tempdir().unwrap();
    let (_writer, path) = test_writer(&dir);

    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes, vec![size_of::<*const c_void>() as u8]);
  }

  #[test]
  fn stream_frames_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let (mut writer, path) = test_writer(&dir);
    let mut index = ModuleIndex::new();

    let frames = [anchor as usize, stream_frames_exactly as usize];
    writer.alloc_event(&mut index, 0x1000, 256, &frames);
    writer.free_event(0x1000, 256);
    writer.snapshot_event();

    let bytes = std::fs::read(path).unwrap();
    let records = decode_stream(&bytes);

    assert_eq!(records.len(), 3);

    let Record::Alloc {
      payload,
      size,
      frames,
    } = &records[0]
    else {
      panic!("expected alloc record");
    };
    assert_eq!(*payload, 0x1000);
    assert_eq!(*size, 256);
    assert_eq!(frames.len(), 2);

    // Both addresses live in the test binary: one interned name, cited by
    // ordinal afterwards.
    assert!(frames[0].name.is_some());
    assert!(frames[1].name.is_none());
    assert_eq!(frames[0].ordinal, frames[1].ordinal);

    assert_eq!(
      records[1],
      Record::Free {
        payload: 0x1000,
        size: -256
      }
    );
    assert_eq!(records[2], Record::Snapshot);
  }

  #[test]
  fn unknown_frames_cite_ordinal_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (mut writer, path) = test_writer(&dir);
    let mut index = ModuleIndex::new();

    let local = 0usize;
    writer.alloc_event(&mut index, 0x2000, 16, &[&local as *const usize as usize]);

    let bytes = std::fs::read(path).unwrap();
    let records = decode_stream(&bytes);

    let Record::Alloc { frames, .. } = &records[0] else {
      panic!("expected alloc record");
    };
    assert_eq!(frames[0].ordinal, 0);
    assert!(frames[0].name.is_none());
    assert_eq!(frames[0].offset, frames[0].address);
  }

  #[test]
  fn primed_modules_still_intern_names_into_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (mut writer, path) = test_writer(&dir);
    let mut index = ModuleIndex::new();

    // Priming resolves an address in this binary; the first record citing
    // the same module must nevertheless carry its name.
    index.prime();
    writer.alloc_event(&mut index, 0x4000, 64, &[anchor as usize]);

    let bytes = std::fs::read(path).unwrap();
    let records = decode_stream(&bytes);

    let Record::Alloc { frames, .. } = &records[0] else {
      panic!("expected alloc record");
    };
    assert_ne!(frames[0].ordinal, 0);
    assert!(frames[0].name.is_some());
  }

  #[test]
  fn records_without_stacks_are_two_words() {
    let dir = tempfile::tempdir().unwrap();
    let (mut writer, path) = test_writer(&dir);

    writer.free_event(0x3000, 64);
    writer.snapshot_event();

    let bytes = std::fs::read(path).unwrap();
    // Preamble + two (pointer, delta) records.
    assert_eq!(bytes.len(), 1 + 2 * 2 * size_of::<usize>());
  }
}
