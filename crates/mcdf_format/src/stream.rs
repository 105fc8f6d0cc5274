//! Compressed archive streams.
//!
//! The whole archive (prefix, header and body) is a single zstd stream.
//! [`ArchiveWriter`] writes the header up front and then one record at a time;
//! [`ArchiveReader`] mirrors that on the way back in.

use camino::Utf8Path;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use crate::descriptor::ArchiveDescriptor;
use crate::error::{FormatError, Result};
use crate::header;

/// zstd level used when callers don't pick one.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 12;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Streams a header followed by record bodies into a zstd-compressed sink.
pub struct ArchiveWriter<W: Write> {
    encoder: zstd::stream::write::Encoder<'static, W>,
    lengths: Vec<u64>,
    written: usize,
}

impl<W: Write> ArchiveWriter<W> {
    /// Start a new archive and write the header for `descriptor`.
    pub fn new(writer: W, descriptor: &ArchiveDescriptor, level: i32) -> Result<Self> {
        let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
        header::write_header(&mut encoder, descriptor)?;

        Ok(Self {
            encoder,
            lengths: descriptor.files.iter().map(|f| f.byte_len()).collect(),
            written: 0,
        })
    }

    /// Copy the next record's bytes from `source`.
    ///
    /// Exactly the declared length is copied. A source that runs dry earlier
    /// fails with [`FormatError::EndOfStream`].
    pub fn write_record<R: Read>(&mut self, source: &mut R) -> Result<u64> {
        let Some(&expected) = self.lengths.get(self.written) else {
            return Err(FormatError::OutOfRange(format!(
                "archive declares {} records, cannot write more",
                self.lengths.len()
            )));
        };

        let copied = copy_exact(source, &mut self.encoder, expected)?;
        self.written += 1;
        Ok(copied)
    }

    /// Finish the compressed stream and hand back the inner writer.
    pub fn finish(self) -> Result<W> {
        if self.written != self.lengths.len() {
            return Err(FormatError::OutOfRange(format!(
                "only {} of {} records were written",
                self.written,
                self.lengths.len()
            )));
        }
        let mut inner = self.encoder.finish()?;
        inner.flush()?;
        Ok(inner)
    }
}

/// Reads a zstd-compressed archive front to back.
pub struct ArchiveReader<R: Read> {
    decoder: zstd::stream::read::Decoder<'static, BufReader<R>>,
    version: Option<i32>,
}

impl ArchiveReader<File> {
    /// Open an archive file for reading.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let file = File::open(path.as_std_path())?;
        Self::new(file)
    }
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        Ok(Self {
            decoder: zstd::stream::read::Decoder::new(reader)?,
            version: None,
        })
    }

    /// Version of the archive once the header has been read or skipped.
    pub fn version(&self) -> Option<i32> {
        self.version
    }

    /// Decode the header; the reader is left at the first record.
    pub fn read_header(&mut self) -> Result<ArchiveDescriptor> {
        self.ensure_at_header()?;
        let descriptor = header::decode_header(&mut self.decoder)?;
        self.version = Some(descriptor.version);
        Ok(descriptor)
    }

    /// Skip the header without parsing it; the reader is left at the first record.
    pub fn advance_to_body(&mut self) -> Result<i32> {
        self.ensure_at_header()?;
        let version = header::skip_header(&mut self.decoder)?;
        self.version = Some(version);
        Ok(version)
    }

    /// Copy exactly `length` bytes of the current record into `out`.
    pub fn copy_record<W: Write>(&mut self, length: u64, out: &mut W) -> Result<u64> {
        self.ensure_in_body()?;
        copy_exact(&mut self.decoder, out, length)
    }

    /// Discard exactly `length` bytes of the current record.
    pub fn skip_record(&mut self, length: u64) -> Result<u64> {
        self.copy_record(length, &mut io::sink())
    }

    fn ensure_at_header(&self) -> Result<()> {
        if self.version.is_some() {
            return Err(FormatError::corrupt("archive header was already consumed"));
        }
        Ok(())
    }

    fn ensure_in_body(&self) -> Result<()> {
        if self.version.is_none() {
            return Err(FormatError::corrupt("archive body accessed before the header"));
        }
        Ok(())
    }
}

/// Copy exactly `expected` bytes from `source` to `sink`.
fn copy_exact<R: Read + ?Sized, W: Write + ?Sized>(
    source: &mut R,
    sink: &mut W,
    expected: u64,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(expected.max(1) as usize)];
    let mut copied = 0u64;

    while copied < expected {
        let want = (expected - copied).min(buf.len() as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(FormatError::EndOfStream {
                    expected,
                    actual: copied,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FormatError::from_read(e, expected, copied)),
        };
        sink.write_all(&buf[..n])?;
        copied += n as u64;
    }

    Ok(copied)
}

/// Write a complete archive to `writer`, pulling record bytes from `open_record`.
///
/// `open_record` is called once per file record, in table order.
pub fn write_archive<W, R, F>(
    writer: W,
    descriptor: &ArchiveDescriptor,
    level: i32,
    mut open_record: F,
) -> Result<W>
where
    W: Write,
    R: Read,
    F: FnMut(usize, &crate::ContainerFileRecord) -> Result<R>,
{
    let mut archive = ArchiveWriter::new(BufWriter::new(writer), descriptor, level)?;
    for (index, record) in descriptor.files.iter().enumerate() {
        let mut source = open_record(index, record)?;
        archive.write_record(&mut source)?;
        tracing::debug!(hash = %record.hash, length = record.length, "wrote archive record");
    }
    let buffered = archive.finish()?;
    buffered
        .into_inner()
        .map_err(|e| FormatError::Io(e.into_error()))
}
