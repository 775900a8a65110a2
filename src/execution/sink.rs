//! Per-key activation streams.
//!
//! A sink receives `Record`s in order and one final `End`.  The disk sink
//! writes length-prefixed bincode records to `<root>/<split>/<key>.partial`
//! and renames the file to `<key>.bin` when `End` arrives, so a finished
//! stream is never confused with an interrupted one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::keys::{InstrumentKey, Split};

/// One harvested activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    /// Input symbol at this timestep.
    pub symbol: String,
    /// Instrument value, zero-padded to the model's record width.
    pub activation: Vec<f32>,
    /// Ground-truth target label for this timestep.
    pub annotation: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SinkMessage {
    Record(ActivationRecord),
    /// End of stream; the sink finalises and accepts nothing more.
    End,
}

/// Sequential consumer of one key's stream.
pub trait ActivationSink: Send {
    fn put(&mut self, message: SinkMessage) -> Result<()>;
}

/// Opens one sink per `(split, key)`.
pub trait SinkFactory: Sync {
    fn open(&self, split: Split, key: &InstrumentKey) -> Result<Box<dyn ActivationSink>>;
}

/// Writes every stream under one states directory.
#[derive(Clone, Debug)]
pub struct DiskSinkFactory {
    root: PathBuf,
}

impl DiskSinkFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the finished stream for `(split, key)`.
    pub fn stream_path(&self, split: Split, key: &InstrumentKey) -> PathBuf {
        self.root
            .join(split.name())
            .join(format!("{}.bin", key.encode()))
    }
}

impl SinkFactory for DiskSinkFactory {
    fn open(&self, split: Split, key: &InstrumentKey) -> Result<Box<dyn ActivationSink>> {
        let finished = self.stream_path(split, key);
        let partial = finished.with_extension("partial");
        if let Some(dir) = partial.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Box::new(StreamFileSink::create(partial, finished)?))
    }
}

pub struct StreamFileSink {
    partial: PathBuf,
    finished: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl StreamFileSink {
    pub fn create(partial: PathBuf, finished: PathBuf) -> Result<Self> {
        let writer = BufWriter::new(File::create(&partial)?);
        Ok(Self {
            partial,
            finished,
            writer: Some(writer),
        })
    }
}

impl ActivationSink for StreamFileSink {
    fn put(&mut self, message: SinkMessage) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is already finished", self.finished.display()))
        })?;
        match message {
            SinkMessage::Record(record) => {
                let bytes = bincode::serialize(&record)?;
                let len = u32::try_from(bytes.len()).map_err(|_| {
                    Error::InvalidArgument(format!("record of {} bytes is too large", bytes.len()))
                })?;
                writer.write_all(&len.to_le_bytes())?;
                writer.write_all(&bytes)?;
            }
            SinkMessage::End => {
                writer.flush()?;
                self.writer = None;
                fs::rename(&self.partial, &self.finished)?;
            }
        }
        Ok(())
    }
}

/// Read back every record of a stream file.
///
/// The file must end exactly on a record boundary.
pub fn read_stream(path: impl AsRef<Path>) -> Result<Vec<ActivationRecord>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    while let Some(len) = read_prefix(&mut reader)? {
        let mut bytes = Vec::new();
        (&mut reader).take(u64::from(len)).read_to_end(&mut bytes)?;
        if bytes.len() != len as usize {
            return Err(Error::InvalidArgument(format!(
                "{}: record {} truncated ({} of {} bytes)",
                path.display(),
                records.len(),
                bytes.len(),
                len
            )));
        }
        records.push(bincode::deserialize(&bytes)?);
    }
    Ok(records)
}

/// Length prefix of the next record; `None` at a clean end of file.
fn read_prefix(reader: &mut impl Read) -> Result<Option<u32>> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match reader.read(&mut len[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(u32::from_le_bytes(len))),
        n => Err(Error::InvalidArgument(format!(
            "length prefix truncated after {} bytes",
            n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instruments::Instrument;
    use tempfile::tempdir;

    fn record(symbol: &str) -> SinkMessage {
        SinkMessage::Record(ActivationRecord {
            symbol: symbol.into(),
            activation: vec![0.5, -1.0, 0.0],
            annotation: "NOUN".into(),
        })
    }

    #[test]
    fn test_stream_finalised_on_end() {
        let dir = tempdir().unwrap();
        let factory = DiskSinkFactory::new(dir.path());
        let key = InstrumentKey::new(Instrument::Embedding, 0);
        let mut sink = factory.open(Split::Train, &key).unwrap();

        sink.put(record("cat")).unwrap();
        sink.put(record("dog")).unwrap();
        let finished = factory.stream_path(Split::Train, &key);
        assert!(!finished.exists());
        assert!(finished.with_extension("partial").exists());

        sink.put(SinkMessage::End).unwrap();
        assert!(finished.exists());
        assert!(!finished.with_extension("partial").exists());

        let records = read_stream(&finished).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].symbol, "dog");
        assert_eq!(records[0].activation, vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_put_after_end_fails() {
        let dir = tempdir().unwrap();
        let factory = DiskSinkFactory::new(dir.path());
        let key = InstrumentKey::new(Instrument::Embedding, 0);
        let mut sink = factory.open(Split::Test, &key).unwrap();
        sink.put(SinkMessage::End).unwrap();
        assert!(sink.put(record("late")).is_err());
        assert!(read_stream(factory.stream_path(Split::Test, &key)).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.bin");
        fs::write(&path, [9u8, 0, 0, 0, 1, 2]).unwrap();
        assert!(read_stream(&path).is_err());
    }

    #[test]
    fn test_cut_length_prefix_is_an_error() {
        let dir = tempdir().unwrap();
        let factory = DiskSinkFactory::new(dir.path());
        let key = InstrumentKey::new(Instrument::Embedding, 0);
        let mut sink = factory.open(Split::Train, &key).unwrap();
        sink.put(record("cat")).unwrap();
        sink.put(SinkMessage::End).unwrap();
        let path = factory.stream_path(Split::Train, &key);
        assert_eq!(read_stream(&path).unwrap().len(), 1);

        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[7, 0]);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_stream(&path), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_length_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        fs::write(&path, [0xffu8, 0xff, 0xff, 0xff, 1, 2, 3]).unwrap();
        assert!(matches!(read_stream(&path), Err(Error::InvalidArgument(_))));
    }
}
