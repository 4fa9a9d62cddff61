use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::fsutil::sync_dir;

/// Header size: 4 bytes length + 4 bytes CRC.
pub(crate) const HEADER_SIZE: u64 = 8;

/// Location of one frame's payload inside the data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameSlot {
    /// Offset of the frame header.
    pub offset: u64,
    /// Payload length.
    pub len: u32,
}

/// A frame recovered by [`FrameFile::scan`].
pub(crate) struct ScannedFrame {
    pub slot: FrameSlot,
    pub payload: Vec<u8>,
}

struct FrameWriter {
    file: File,
    /// Current end of the file.
    offset: u64,
    /// Set when a failed append could not be cut back off the file.
    failed: bool,
}

/// Append-only file of length-prefixed, CRC-checked frames.
///
/// On-disk format, repeated:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload]
/// ```
pub(crate) struct FrameFile {
    path: PathBuf,
    writer: Mutex<FrameWriter>,
    sync: SyncMode,
}

impl FrameFile {
    /// Open (or create) the data file, scanning it for valid frames.
    ///
    /// A torn tail (incomplete header or payload left by a crash) is cut
    /// off so later appends land right after the last complete frame.
    pub(crate) fn open(path: &Path, sync: SyncMode) -> StoreResult<(Self, Vec<ScannedFrame>)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let (frames, valid_end) = scan(path)?;
        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            warn!(
                path = %path.display(),
                valid_end,
                file_len,
                "truncating torn tail of data file"
            );
            file.set_len(valid_end)?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: Mutex::new(FrameWriter {
                    file,
                    offset: valid_end,
                    failed: false,
                }),
                sync,
            },
            frames,
        ))
    }

    /// Append one frame and return where it landed.
    ///
    /// The frame goes to the file in a single unbuffered write, so nothing
    /// from a failed append lingers to be flushed ahead of the next one.
    pub(crate) fn append(&self, payload: &[u8]) -> io::Result<FrameSlot> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        let crc = crc32fast::hash(payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(payload);

        let mut w = self.writer.lock().expect("frame writer poisoned");
        if w.failed {
            return Err(io::Error::other(format!(
                "data file {} holds a partial frame; reopen the bucket",
                self.path.display()
            )));
        }
        let offset = w.offset;

        let result = w.file.write_all(&frame).and_then(|()| {
            if self.sync == SyncMode::EveryWrite {
                w.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            // Cut off whatever part of the frame reached the file.
            if let Err(trunc) = w.file.set_len(offset) {
                w.failed = true;
                warn!(
                    path = %self.path.display(),
                    offset,
                    error = %trunc,
                    "could not truncate failed append"
                );
                return Err(io::Error::new(
                    e.kind(),
                    format!("{e}; truncating back to {offset} also failed: {trunc}"),
                ));
            }
            return Err(e);
        }

        w.offset += HEADER_SIZE + u64::from(len);
        debug!(offset, len, "frame appended");
        Ok(FrameSlot { offset, len })
    }

    /// Read and CRC-check the payload of a frame.
    pub(crate) fn read(&self, slot: FrameSlot) -> StoreResult<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(slot.offset))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let (len, expected_crc) = parse_header(&header);
        if len != slot.len {
            return Err(StoreError::corrupt(
                &self.path,
                format!("frame at {} has length {len}, index says {}", slot.offset, slot.len),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(StoreError::corrupt(
                &self.path,
                format!(
                    "CRC mismatch at {}: expected {expected_crc:#010x}, got {actual_crc:#010x}",
                    slot.offset
                ),
            ));
        }
        Ok(payload)
    }

    /// Replace the whole file with `payloads`, returning their new slots.
    ///
    /// The new file is written next to the old one and renamed over it.
    pub(crate) fn rewrite(&self, payloads: &[Vec<u8>]) -> StoreResult<Vec<FrameSlot>> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StoreError::corrupt(&self.path, "data file has no parent"))?;
        let mut w = self.writer.lock().expect("frame writer poisoned");

        let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
        let mut slots = Vec::with_capacity(payloads.len());
        let mut offset = 0u64;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            for payload in payloads {
                let len = u32::try_from(payload.len()).map_err(|_| {
                    StoreError::Serialization("frame too large".into())
                })?;
                out.write_all(&len.to_le_bytes())?;
                out.write_all(&crc32fast::hash(payload).to_le_bytes())?;
                out.write_all(payload)?;
                slots.push(FrameSlot { offset, len });
                offset += HEADER_SIZE + u64::from(len);
            }
            out.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        sync_dir(dir)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.file = file;
        w.offset = offset;
        w.failed = false;
        debug!(path = %self.path.display(), frames = slots.len(), "data file rewritten");
        Ok(slots)
    }

    /// Current end of the file.
    pub(crate) fn offset(&self) -> u64 {
        self.writer.lock().expect("frame writer poisoned").offset
    }
}

fn parse_header(header: &[u8; HEADER_SIZE as usize]) -> (u32, u32) {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (len, crc)
}

/// Read every frame front-to-back.
///
/// Frames that fail the CRC check are logged and skipped. Scanning stops at
/// the first incomplete frame; its offset is returned as the valid end.
fn scan(path: &Path) -> StoreResult<(Vec<ScannedFrame>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut frames = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let (len, expected_crc) = parse_header(&header);

        if len == 0 || offset + HEADER_SIZE + u64::from(len) > file_len {
            warn!(offset, len, file_len, "incomplete frame; stopping scan");
            break;
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        let slot = FrameSlot { offset, len };
        offset += HEADER_SIZE + u64::from(len);

        if actual_crc != expected_crc {
            warn!(
                offset = slot.offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping frame"
            );
            continue;
        }
        frames.push(ScannedFrame { slot, payload });
    }

    debug!(path = %path.display(), frames = frames.len(), "data file scanned");
    Ok((frames, offset))
}
