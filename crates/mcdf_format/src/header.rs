//! Binary header encoding.
//!
//! The decompressed archive starts with `[i32 version][i32 header_length]`
//! followed by exactly `header_length` bytes of header. Inside the header,
//! strings are `u32 length + UTF-8`, blobs are `u32 length + bytes` and
//! arrays are `u32 count + items`. All integers are little-endian.

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt, LE};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};

use crate::descriptor::{ArchiveDescriptor, ContainerFileRecord, FileSwapRecord};
use crate::error::{FormatError, Result};
use crate::{CURRENT_VERSION, MIN_VERSION};

/// Upper bound for a declared header length. Anything larger is treated as corruption.
pub const MAX_HEADER_LENGTH: i32 = 256 * 1024 * 1024;

/// Size of the `[i32 version][i32 header_length]` prefix.
pub const PREFIX_LENGTH: usize = 8;

/// Whether a format version can be read by this crate.
pub fn is_supported_version(version: i32) -> bool {
    (MIN_VERSION..=CURRENT_VERSION).contains(&version)
}

/// Encode the version, header length and header of `descriptor`.
pub fn encode_header(descriptor: &ArchiveDescriptor) -> Result<Vec<u8>> {
    if !is_supported_version(descriptor.version) {
        return Err(FormatError::UnsupportedVersion(descriptor.version));
    }

    let mut header = Vec::new();
    write_header_fields(&mut header, descriptor)?;

    let header_length = i32::try_from(header.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LENGTH)
        .ok_or_else(|| FormatError::OutOfRange(format!("header is {} bytes", header.len())))?;

    let mut out = Vec::with_capacity(PREFIX_LENGTH + header.len());
    out.write_i32::<LE>(descriptor.version)?;
    out.write_i32::<LE>(header_length)?;
    out.extend_from_slice(&header);
    Ok(out)
}

/// Encode the header and write it to `writer`.
pub fn write_header<W: Write>(writer: &mut W, descriptor: &ArchiveDescriptor) -> Result<()> {
    let encoded = encode_header(descriptor)?;
    writer.write_all(&encoded)?;
    Ok(())
}

/// Read and validate the version/length prefix.
fn read_prefix<R: Read>(reader: &mut R) -> Result<(i32, usize)> {
    let mut prefix = [0u8; PREFIX_LENGTH];
    let read = read_full(reader, &mut prefix)?;
    if read < PREFIX_LENGTH {
        return Err(FormatError::EndOfStream {
            expected: PREFIX_LENGTH as u64,
            actual: read as u64,
        });
    }

    let version = LE::read_i32(&prefix[0..4]);
    if !is_supported_version(version) {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let header_length = LE::read_i32(&prefix[4..8]);
    if header_length < 0 {
        return Err(FormatError::corrupt(format!(
            "negative header length {header_length}"
        )));
    }
    if header_length > MAX_HEADER_LENGTH {
        return Err(FormatError::corrupt(format!(
            "header length {header_length} exceeds limit"
        )));
    }

    Ok((version, header_length as usize))
}

/// Fill `buf` until it is full or the stream ends. Returns the bytes read.
///
/// A decompressor reports a cut-off frame as `UnexpectedEof`; that ends the
/// read like a clean end of stream does.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(FormatError::Io(e)),
        }
    }
    Ok(filled)
}

/// Move exactly `length` header bytes from `reader` into `sink`.
///
/// The sink only grows as bytes arrive, so a bogus declared length costs
/// nothing until the data is actually there.
fn copy_header<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    length: usize,
    sink: &mut W,
) -> Result<()> {
    let mut buf = [0u8; 8 * 1024];
    let mut copied = 0usize;
    while copied < length {
        let want = (length - copied).min(buf.len());
        let n = read_full(reader, &mut buf[..want])?;
        sink.write_all(&buf[..n])?;
        copied += n;
        if n < want {
            return Err(FormatError::EndOfStream {
                expected: length as u64,
                actual: copied as u64,
            });
        }
    }
    Ok(())
}

/// Decode a full header from `reader`, leaving it positioned at the body.
pub fn decode_header<R: Read>(reader: &mut R) -> Result<ArchiveDescriptor> {
    let (version, header_length) = read_prefix(reader)?;

    let mut header = Vec::new();
    copy_header(reader, header_length, &mut header)?;

    let descriptor = parse_header_fields(version, &header)?;
    tracing::trace!(
        version,
        header_length,
        files = descriptor.files.len(),
        swaps = descriptor.file_swaps.len(),
        "decoded archive header"
    );
    Ok(descriptor)
}

/// Skip the header without parsing it. Returns the archive version.
pub fn skip_header<R: Read>(reader: &mut R) -> Result<i32> {
    let (version, header_length) = read_prefix(reader)?;
    copy_header(reader, header_length, &mut io::sink())?;
    Ok(version)
}

fn write_header_fields(out: &mut Vec<u8>, descriptor: &ArchiveDescriptor) -> Result<()> {
    write_string(out, &descriptor.description)?;
    write_string(out, &descriptor.appearance_payload)?;
    write_blob(out, &descriptor.manipulation_data)?;

    write_count(out, descriptor.files.len())?;
    for file in &descriptor.files {
        if file.length < 0 {
            return Err(FormatError::OutOfRange(format!(
                "record {} has negative length {}",
                file.hash, file.length
            )));
        }
        write_string(out, &file.hash)?;
        out.write_i32::<LE>(file.length)?;
        write_string_list(out, &file.game_paths)?;
    }

    write_count(out, descriptor.file_swaps.len())?;
    for swap in &descriptor.file_swaps {
        write_string_list(out, &swap.game_paths)?;
        write_string(out, &swap.file_swap_path)?;
    }

    if descriptor.version >= 2 {
        write_count(out, descriptor.auxiliary_payloads.len())?;
        for (key, value) in &descriptor.auxiliary_payloads {
            write_string(out, key)?;
            write_string(out, value)?;
        }
    }

    Ok(())
}

fn write_count(out: &mut Vec<u8>, count: usize) -> Result<()> {
    let count = u32::try_from(count)
        .map_err(|_| FormatError::OutOfRange(format!("{count} items do not fit a u32 count")))?;
    out.write_u32::<LE>(count)?;
    Ok(())
}

fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    write_count(out, bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    write_blob(out, value.as_bytes())
}

fn write_string_list(out: &mut Vec<u8>, values: &[String]) -> Result<()> {
    write_count(out, values.len())?;
    for value in values {
        write_string(out, value)?;
    }
    Ok(())
}

/// Bounds-checked reader over the raw header bytes.
struct HeaderCursor<'a> {
    inner: Cursor<&'a [u8]>,
}

impl<'a> HeaderCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            inner: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> usize {
        let len = self.inner.get_ref().len() as u64;
        len.saturating_sub(self.inner.position()) as usize
    }

    fn read_u32(&mut self, field: &str) -> Result<u32> {
        self.inner
            .read_u32::<LE>()
            .map_err(|_| FormatError::corrupt(format!("header ends inside {field}")))
    }

    fn read_i32(&mut self, field: &str) -> Result<i32> {
        self.inner
            .read_i32::<LE>()
            .map_err(|_| FormatError::corrupt(format!("header ends inside {field}")))
    }

    /// Read a count and make sure at least `min_item_size` bytes per item remain.
    fn read_count(&mut self, field: &str, min_item_size: usize) -> Result<usize> {
        let count = self.read_u32(field)? as usize;
        if count.saturating_mul(min_item_size) > self.remaining() {
            return Err(FormatError::corrupt(format!(
                "{field} count {count} exceeds remaining header bytes"
            )));
        }
        Ok(count)
    }

    fn read_blob(&mut self, field: &str) -> Result<Vec<u8>> {
        let len = self.read_count(field, 1)?;
        let mut bytes = vec![0u8; len];
        self.inner
            .read_exact(&mut bytes)
            .map_err(|_| FormatError::corrupt(format!("header ends inside {field}")))?;
        Ok(bytes)
    }

    fn read_string(&mut self, field: &str) -> Result<String> {
        let bytes = self.read_blob(field)?;
        String::from_utf8(bytes)
            .map_err(|_| FormatError::corrupt(format!("{field} is not valid UTF-8")))
    }

    fn read_string_list(&mut self, field: &str) -> Result<Vec<String>> {
        let count = self.read_count(field, 4)?;
        (0..count).map(|_| self.read_string(field)).collect()
    }
}

fn parse_header_fields(version: i32, header: &[u8]) -> Result<ArchiveDescriptor> {
    let mut cursor = HeaderCursor::new(header);

    let description = cursor.read_string("description")?;
    let appearance_payload = cursor.read_string("appearance payload")?;
    let manipulation_data = cursor.read_blob("manipulation data")?;

    // hash length + record length + path count
    let file_count = cursor.read_count("file table", 12)?;
    let mut files = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        let hash = cursor.read_string("file hash")?;
        let length = cursor.read_i32("file length")?;
        if length < 0 {
            return Err(FormatError::corrupt(format!(
                "record {hash} has negative length {length}"
            )));
        }
        let game_paths = cursor.read_string_list("file game paths")?;
        files.push(ContainerFileRecord {
            hash,
            length,
            game_paths,
        });
    }

    let swap_count = cursor.read_count("swap table", 8)?;
    let mut file_swaps = Vec::with_capacity(swap_count);
    for _ in 0..swap_count {
        let game_paths = cursor.read_string_list("swap game paths")?;
        let file_swap_path = cursor.read_string("swap path")?;
        file_swaps.push(FileSwapRecord {
            game_paths,
            file_swap_path,
        });
    }

    let mut auxiliary_payloads = BTreeMap::new();
    if version >= 2 {
        let aux_count = cursor.read_count("auxiliary payloads", 8)?;
        for _ in 0..aux_count {
            let key = cursor.read_string("auxiliary key")?;
            let value = cursor.read_string("auxiliary value")?;
            auxiliary_payloads.insert(key, value);
        }
    }

    if cursor.remaining() != 0 {
        return Err(FormatError::corrupt(format!(
            "{} trailing bytes after header fields",
            cursor.remaining()
        )));
    }

    Ok(ArchiveDescriptor {
        version,
        description,
        appearance_payload,
        auxiliary_payloads,
        manipulation_data,
        files,
        file_swaps,
    })
}
