//! LSN log: ordered (lsn, context) pairs letting the ingestion source
//! resume after a restart.
//!
//! An append-only file of codec blocks plus a checkpoint block per flush.
//! Recovery scans from the start and keeps the highest complete record,
//! truncating any torn tail.

use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use crate::codec::{self, BlockKind};
use crate::error::{Error, Result};
use crate::fio;
use crate::meta::Lsn;

pub const LSN_LOG_FILE: &str = "lsn.log";

pub struct LsnLog {
    state: Mutex<LogFile>,
    latest: RwLock<Option<(Lsn, Bytes)>>,
}

struct LogFile {
    file: File,
    tail: u64,
}

impl LsnLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fio::open_rw(&path, true, false)?;
        let len = file.metadata()?.len();
        let mut buf = vec![0u8; len as usize];
        fio::read_exact_at(&file, &mut buf, 0)?;

        let mut latest: Option<(Lsn, Bytes)> = None;
        let mut offset = 0usize;
        loop {
            match codec::block_at(&buf, offset) {
                Ok(None) => break,
                Ok(Some((kind, payload, next))) => {
                    match kind {
                        BlockKind::LsnRecord | BlockKind::LsnCheckpoint => {
                            let entry = decode_entry(payload)?;
                            if latest.as_ref().map_or(true, |(l, _)| entry.0 >= *l) {
                                latest = Some(entry);
                            }
                        }
                        other => {
                            return Err(Error::Integrity(format!(
                                "unexpected {other:?} block in lsn log"
                            )))
                        }
                    }
                    offset = next;
                }
                Err(Error::Integrity(reason)) => {
                    log::warn!(
                        "lsn log {}: dropping torn tail at offset {offset} ({reason})",
                        path.as_ref().display()
                    );
                    fio::truncate(&file, offset as u64)?;
                    fio::fsync(&file)?;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Self {
            state: Mutex::new(LogFile {
                file,
                tail: offset as u64,
            }),
            latest: RwLock::new(latest),
        })
    }

    /// Record `(lsn, context)`. Re-appending the stored LSN is allowed;
    /// a lower LSN is a no-op warning.
    pub fn append(&self, lsn: Lsn, context: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("lsn log lock poisoned");
        if let Some((stored, _)) = &*self.latest.read().expect("lsn latest lock poisoned") {
            if lsn < *stored {
                log::warn!("ignoring lsn {lsn} below stored latest {stored}");
                return Ok(());
            }
        }
        let written = self.write_entry(&mut state, BlockKind::LsnRecord, lsn, context)?;
        state.tail += written;
        *self.latest.write().expect("lsn latest lock poisoned") =
            Some((lsn, Bytes::copy_from_slice(context)));
        Ok(())
    }

    /// Append a checkpoint for the stored latest and fsync the log.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().expect("lsn log lock poisoned");
        let latest = self.latest.read().expect("lsn latest lock poisoned").clone();
        if let Some((lsn, context)) = latest {
            let written =
                self.write_entry(&mut state, BlockKind::LsnCheckpoint, lsn, &context)?;
            state.tail += written;
        }
        fio::fsync(&state.file)?;
        Ok(())
    }

    pub fn latest(&self) -> Option<(Lsn, Bytes)> {
        self.latest.read().expect("lsn latest lock poisoned").clone()
    }

    fn write_entry(
        &self,
        state: &mut LogFile,
        kind: BlockKind,
        lsn: Lsn,
        context: &[u8],
    ) -> Result<u64> {
        let mut payload = vec![0u8; 8 + context.len()];
        LittleEndian::write_u64(&mut payload[..8], lsn);
        payload[8..].copy_from_slice(context);
        let mut block = Vec::with_capacity(codec::BLOCK_HEADER_LEN + payload.len());
        codec::write_block(&mut block, kind, &payload)?;
        fio::write_all_at(&state.file, &block, state.tail)?;
        Ok(block.len() as u64)
    }
}

fn decode_entry(payload: &[u8]) -> Result<(Lsn, Bytes)> {
    if payload.len() < 8 {
        return Err(Error::Integrity("short lsn record".to_string()));
    }
    Ok((
        LittleEndian::read_u64(&payload[..8]),
        Bytes::copy_from_slice(&payload[8..]),
    ))
}
