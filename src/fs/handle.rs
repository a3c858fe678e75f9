//! File handle objects returned by `fs.open`.
//!
//! Each handle owns its stream until `close`; every call after that
//! fails with "attempt to use a closed file". Handles register with the
//! computer's [`ResourceTracker`] so shutdown can close them.
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::dispatch::{method_table, CallContext, CallError, HostObject, MethodResult};
use crate::resources::{Closeable, Registration, ResourceTracker};
use crate::value::{Args, Value};

use super::{FileSystem, FsError};

/// How `fs.open` was asked to open a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
    ReadBinary,
    WriteBinary,
    AppendBinary,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "r" => Some(OpenMode::Read),
            "w" => Some(OpenMode::Write),
            "a" => Some(OpenMode::Append),
            "rb" => Some(OpenMode::ReadBinary),
            "wb" => Some(OpenMode::WriteBinary),
            "ab" => Some(OpenMode::AppendBinary),
            _ => None,
        }
    }
}

/// Opens `path` in `mode` and returns the matching tracked handle.
pub fn open(
    fs: &FileSystem,
    tracker: &Arc<ResourceTracker>,
    path: &str,
    mode: OpenMode,
) -> Result<Arc<dyn HostObject>, FsError> {
    debug!("Opening {path} ({mode:?})");
    let handle: Arc<dyn HostObject> = match mode {
        OpenMode::Read => track(tracker, TextReader::new(BufReader::new(fs.open_read(path)?))),
        OpenMode::ReadBinary => {
            track(tracker, BinaryReader::new(BufReader::new(fs.open_read(path)?)))
        }
        OpenMode::Write | OpenMode::Append => {
            let append = mode == OpenMode::Append;
            track(tracker, TextWriter::new(fs.open_write(path, append)?))
        }
        OpenMode::WriteBinary | OpenMode::AppendBinary => {
            let append = mode == OpenMode::AppendBinary;
            track(tracker, BinaryWriter::new(fs.open_write(path, append)?))
        }
    };
    Ok(handle)
}

fn track<T: HostObject + Closeable + 'static>(tracker: &Arc<ResourceTracker>, handle: T) -> Arc<dyn HostObject> {
    let handle = Arc::new(handle);
    tracker.track(&handle);
    handle
}

// ── Shared stream slot ────────────────────────────────

/// The open stream, or `None` once closed.
struct Stream<T> {
    inner: Mutex<Option<T>>,
    registration: Registration,
}

impl<T> Stream<T> {
    fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(Some(inner)),
            registration: Registration::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> Result<R, CallError>) -> Result<R, CallError> {
        match self.lock().as_mut() {
            Some(stream) => f(stream),
            None => Err(CallError::Closed),
        }
    }

    /// Takes the stream out, leaving the handle closed.
    fn take(&self) -> Option<T> {
        let taken = self.lock().take();
        if taken.is_some() {
            self.registration.release();
        }
        taken
    }
}

fn io_failure(err: std::io::Error) -> CallError {
    if err.to_string() == super::OUT_OF_SPACE {
        CallError::message(super::OUT_OF_SPACE)
    } else {
        warn!("File handle I/O error: {err}");
        CallError::message("Failed to access file")
    }
}

fn close_stream<T>(stream: &Stream<T>) -> Result<MethodResult, CallError> {
    match stream.take() {
        Some(_) => Ok(MethodResult::empty()),
        None => Err(CallError::Closed),
    }
}

fn close_writer<W: Write>(stream: &Stream<W>) -> Result<MethodResult, CallError> {
    match stream.take() {
        Some(mut writer) => {
            writer.flush().map_err(io_failure)?;
            Ok(MethodResult::empty())
        }
        None => Err(CallError::Closed),
    }
}

type Reader = BufReader<Box<dyn Read + Send>>;
type Writer = Box<dyn Write + Send>;

// ── Text reader ───────────────────────────────────────

method_table! {
    enum TextReadMethod {
        ReadLine => "readLine",
        ReadAll => "readAll",
        Close => "close",
    }
}

pub struct TextReader {
    stream: Stream<Reader>,
}

impl TextReader {
    fn new(reader: Reader) -> Self {
        Self {
            stream: Stream::new(reader),
        }
    }

    fn read_line(&self) -> Result<MethodResult, CallError> {
        self.stream.with(|reader| {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).map_err(io_failure)?;
            if n == 0 {
                return Ok(MethodResult::of(Value::Nil));
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(MethodResult::of(String::from_utf8_lossy(&line).into_owned()))
        })
    }

    fn read_all(&self) -> Result<MethodResult, CallError> {
        self.stream.with(|reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map_err(io_failure)?;
            Ok(MethodResult::of(String::from_utf8_lossy(&data).into_owned()))
        })
    }
}

impl HostObject for TextReader {
    fn method_names(&self) -> &'static [&'static str] {
        TextReadMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, _args: &[Value]) -> MethodResult {
        let result = match TextReadMethod::from_index(method) {
            Some(TextReadMethod::ReadLine) => self.read_line(),
            Some(TextReadMethod::ReadAll) => self.read_all(),
            Some(TextReadMethod::Close) => close_stream(&self.stream),
            None => Err(CallError::NoSuchMethod),
        };
        result.into()
    }
}

impl Closeable for TextReader {
    fn close(&self) {
        self.stream.take();
    }

    fn registration(&self) -> &Registration {
        &self.stream.registration
    }
}

// ── Text writer ───────────────────────────────────────

method_table! {
    enum TextWriteMethod {
        Write => "write",
        WriteLine => "writeLine",
        Flush => "flush",
        Close => "close",
    }
}

pub struct TextWriter {
    stream: Stream<Writer>,
}

impl TextWriter {
    fn new(writer: Writer) -> Self {
        Self {
            stream: Stream::new(writer),
        }
    }

    fn write(&self, args: Args<'_>, newline: bool) -> Result<MethodResult, CallError> {
        let mut text = args.get(0).to_text();
        if newline {
            text.push('\n');
        }
        self.stream.with(|writer| {
            writer.write_all(text.as_bytes()).map_err(io_failure)?;
            Ok(MethodResult::empty())
        })
    }
}

impl HostObject for TextWriter {
    fn method_names(&self) -> &'static [&'static str] {
        TextWriteMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        let args = Args::new(args);
        let result = match TextWriteMethod::from_index(method) {
            Some(TextWriteMethod::Write) => self.write(args, false),
            Some(TextWriteMethod::WriteLine) => self.write(args, true),
            Some(TextWriteMethod::Flush) => self.stream.with(|writer| {
                writer.flush().map_err(io_failure)?;
                Ok(MethodResult::empty())
            }),
            Some(TextWriteMethod::Close) => close_writer(&self.stream),
            None => Err(CallError::NoSuchMethod),
        };
        result.into()
    }
}

impl Closeable for TextWriter {
    fn close(&self) {
        if let Some(mut writer) = self.stream.take() {
            let _ = writer.flush();
        }
    }

    fn registration(&self) -> &Registration {
        &self.stream.registration
    }
}

// ── Binary reader ─────────────────────────────────────

method_table! {
    enum BinaryReadMethod {
        Read => "read",
        ReadAll => "readAll",
        Close => "close",
    }
}

pub struct BinaryReader {
    stream: Stream<Reader>,
}

impl BinaryReader {
    fn new(reader: Reader) -> Self {
        Self {
            stream: Stream::new(reader),
        }
    }

    /// `read()` yields one byte as a number; `read(n)` up to `n` bytes as
    /// a byte string. Both yield nil at end of file.
    fn read(&self, args: Args<'_>) -> Result<MethodResult, CallError> {
        let count = match args.get(0) {
            Value::Nil => None,
            _ => {
                let n = args.int(0)?;
                if n < 0 {
                    return Err(CallError::message("Cannot read a negative number of bytes"));
                }
                Some(n as usize)
            }
        };
        self.stream.with(|reader| match count {
            None => {
                let mut byte = [0u8; 1];
                let n = reader.read(&mut byte).map_err(io_failure)?;
                Ok(if n == 0 {
                    MethodResult::of(Value::Nil)
                } else {
                    MethodResult::of(i64::from(byte[0]))
                })
            }
            Some(count) => {
                let mut data = Vec::with_capacity(count.min(8192));
                reader
                    .by_ref()
                    .take(count as u64)
                    .read_to_end(&mut data)
                    .map_err(io_failure)?;
                Ok(if data.is_empty() && count > 0 {
                    MethodResult::of(Value::Nil)
                } else {
                    MethodResult::of(data)
                })
            }
        })
    }

    fn read_all(&self) -> Result<MethodResult, CallError> {
        self.stream.with(|reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map_err(io_failure)?;
            Ok(MethodResult::of(data))
        })
    }
}

impl HostObject for BinaryReader {
    fn method_names(&self) -> &'static [&'static str] {
        BinaryReadMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        let result = match BinaryReadMethod::from_index(method) {
            Some(BinaryReadMethod::Read) => self.read(Args::new(args)),
            Some(BinaryReadMethod::ReadAll) => self.read_all(),
            Some(BinaryReadMethod::Close) => close_stream(&self.stream),
            None => Err(CallError::NoSuchMethod),
        };
        result.into()
    }
}

impl Closeable for BinaryReader {
    fn close(&self) {
        self.stream.take();
    }

    fn registration(&self) -> &Registration {
        &self.stream.registration
    }
}

// ── Binary writer ─────────────────────────────────────

method_table! {
    enum BinaryWriteMethod {
        Write => "write",
        Flush => "flush",
        Close => "close",
    }
}

pub struct BinaryWriter {
    stream: Stream<Writer>,
}

impl BinaryWriter {
    fn new(writer: Writer) -> Self {
        Self {
            stream: Stream::new(writer),
        }
    }

    fn write(&self, args: Args<'_>) -> Result<MethodResult, CallError> {
        let data = match args.get(0) {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::Integer(_) | Value::Number(_) => vec![args.int(0)? as u8],
            other => return Err(CallError::bad_argument(0, "string or number", other)),
        };
        self.stream.with(|writer| {
            writer.write_all(&data).map_err(io_failure)?;
            Ok(MethodResult::empty())
        })
    }
}

impl HostObject for BinaryWriter {
    fn method_names(&self) -> &'static [&'static str] {
        BinaryWriteMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        let result = match BinaryWriteMethod::from_index(method) {
            Some(BinaryWriteMethod::Write) => self.write(Args::new(args)),
            Some(BinaryWriteMethod::Flush) => self.stream.with(|writer| {
                writer.flush().map_err(io_failure)?;
                Ok(MethodResult::empty())
            }),
            Some(BinaryWriteMethod::Close) => close_writer(&self.stream),
            None => Err(CallError::NoSuchMethod),
        };
        result.into()
    }
}

impl Closeable for BinaryWriter {
    fn close(&self) {
        if let Some(mut writer) = self.stream.take() {
            let _ = writer.flush();
        }
    }

    fn registration(&self) -> &Registration {
        &self.stream.registration
    }
}
