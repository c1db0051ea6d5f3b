//! Container format for on-disk map data
//!
//! Frame-oriented binary container used by `save_map`/`load_map` and
//! submap persistence: a fixed header, per-frame metadata, then the
//! LZ4-compressed frame payloads. Every frame carries a CRC32 over its
//! compressed bytes so torn writes are detected on read.

use crate::error::{Error, Result};
use crc32fast::Hasher;
use std::io::{Read, Write};

const MAGIC: &[u8; 8] = b"VXFUSE\0\0";
const FORMAT_VERSION: u8 = 1;

/// Frame metadata
#[derive(Debug, Clone)]
struct FrameMetadata {
    uncompressed_len: u32,
    compressed_len: u32,
    crc32: u32,
}

/// Container writer; frames are buffered and flushed by [`finish`]
///
/// [`finish`]: ContainerWriter::finish
pub struct ContainerWriter<W: Write> {
    frames: Vec<(FrameMetadata, Vec<u8>)>,
    writer: W,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            frames: Vec::new(),
            writer,
        }
    }

    /// Compress and buffer one frame of data
    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let compressed = lz4_flex::compress_prepend_size(data);

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let crc32 = hasher.finalize();

        self.frames.push((
            FrameMetadata {
                uncompressed_len: data.len() as u32,
                compressed_len: compressed.len() as u32,
                crc32,
            },
            compressed,
        ));
        Ok(())
    }

    /// Write header, frame table and payloads
    pub fn finish(mut self) -> Result<()> {
        let frame_count = self.frames.len() as u32;

        // File header (16 bytes)
        self.writer.write_all(MAGIC)?;
        self.writer.write_all(&[FORMAT_VERSION])?;
        self.writer.write_all(&[0])?; // flags
        self.writer.write_all(&frame_count.to_be_bytes())?;
        self.writer.write_all(&[0, 0])?; // reserved

        // Frame table (12 bytes per frame)
        for (meta, _) in &self.frames {
            self.writer.write_all(&meta.uncompressed_len.to_be_bytes())?;
            self.writer.write_all(&meta.compressed_len.to_be_bytes())?;
            self.writer.write_all(&meta.crc32.to_be_bytes())?;
        }

        for (_, compressed) in &self.frames {
            self.writer.write_all(compressed)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Container reader
pub struct ContainerReader<R: Read> {
    reader: R,
    frames: Vec<FrameMetadata>,
    current_frame: usize,
}

impl<R: Read> ContainerReader<R> {
    /// Open a container and read its frame table
    pub fn open(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidFormat("bad container magic".to_string()));
        }

        let mut version_and_flags = [0u8; 2];
        reader.read_exact(&mut version_and_flags)?;
        if version_and_flags[0] != FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported container version {}",
                version_and_flags[0]
            )));
        }

        let mut frame_count_buf = [0u8; 4];
        reader.read_exact(&mut frame_count_buf)?;
        let frame_count = u32::from_be_bytes(frame_count_buf);

        let mut reserved = [0u8; 2];
        reader.read_exact(&mut reserved)?;

        let mut frames = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            let mut header = [0u8; 12];
            reader.read_exact(&mut header)?;
            frames.push(FrameMetadata {
                uncompressed_len: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
                compressed_len: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
                crc32: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
            });
        }

        Ok(Self {
            reader,
            frames,
            current_frame: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Read, verify and decompress the next frame
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.current_frame >= self.frames.len() {
            return Ok(None);
        }
        let meta = self.frames[self.current_frame].clone();

        let mut compressed = vec![0u8; meta.compressed_len as usize];
        self.reader.read_exact(&mut compressed)?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let actual = hasher.finalize();
        if actual != meta.crc32 {
            return Err(Error::CrcMismatch {
                expected: meta.crc32,
                actual,
            });
        }

        let decompressed = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| Error::InvalidFormat(format!("lz4: {e}")))?;
        if decompressed.len() != meta.uncompressed_len as usize {
            return Err(Error::InvalidFormat(format!(
                "frame length mismatch: header {} vs payload {}",
                meta.uncompressed_len,
                decompressed.len()
            )));
        }

        self.current_frame += 1;
        Ok(Some(decompressed))
    }
}
