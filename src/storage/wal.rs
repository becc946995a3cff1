use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::messages::{MsgInfo, TimeoutInfo};
use crate::consensus::round_state::RoundStepEvent;
use crate::crypto::hash::sha256;

/// Everything the dispatcher consumes is logged: inbound and self-produced
/// messages, fired timeouts, round-step transitions, and the end-of-height
/// sentinel that marks a block as committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Message(MsgInfo),
    Timeout(TimeoutInfo),
    RoundStep(RoundStepEvent),
    EndHeight(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum WalKind {
    Message = 0x01,
    Timeout = 0x02,
    RoundStep = 0x03,
    EndHeight = 0x04,
}

impl WalKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(WalKind::Message),
            0x02 => Some(WalKind::Timeout),
            0x03 => Some(WalKind::RoundStep),
            0x04 => Some(WalKind::EndHeight),
            _ => None,
        }
    }
}

impl WalRecord {
    fn kind(&self) -> WalKind {
        match self {
            WalRecord::Message(_) => WalKind::Message,
            WalRecord::Timeout(_) => WalKind::Timeout,
            WalRecord::RoundStep(_) => WalKind::RoundStep,
            WalRecord::EndHeight(_) => WalKind::EndHeight,
        }
    }

    fn height_round(&self) -> (u64, u32) {
        match self {
            WalRecord::Message(mi) => (mi.msg.height(), mi.msg.round()),
            WalRecord::Timeout(ti) => (ti.height, ti.round),
            WalRecord::RoundStep(ev) => (ev.height, ev.round),
            WalRecord::EndHeight(h) => (*h, 0),
        }
    }

    /// Frame: height(8) | round(4) | kind(1) | len(4) | payload | sha256(32).
    fn encode(&self) -> Result<Vec<u8>, WalError> {
        let payload = serde_json::to_vec(self)?;
        let (height, round) = self.height_round();
        let mut buf = Vec::with_capacity(payload.len() + 49);
        buf.extend_from_slice(&height.to_be_bytes());
        buf.extend_from_slice(&round.to_be_bytes());
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        let checksum = sha256(&buf);
        buf.extend_from_slice(&checksum.0);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self, WalError> {
        if bytes.len() < 8 + 4 + 1 + 4 + 32 {
            return Err(WalError::CorruptEntry);
        }
        WalKind::from_u8(bytes[12]).ok_or(WalError::CorruptEntry)?;
        let payload_len = u32::from_be_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]) as usize;
        let expected_total = 8 + 4 + 1 + 4 + payload_len + 32;
        if bytes.len() != expected_total {
            return Err(WalError::CorruptEntry);
        }

        let payload = &bytes[17..17 + payload_len];
        let framed = &bytes[..17 + payload_len];
        let expected_checksum = sha256(framed);
        let mut actual = [0u8; 32];
        actual.copy_from_slice(&bytes[17 + payload_len..]);
        if actual != expected_checksum.0 {
            return Err(WalError::ChecksumMismatch);
        }

        serde_json::from_slice(payload).map_err(|_| WalError::CorruptEntry)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt WAL entry")]
    CorruptEntry,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("WAL data corruption; refusing to start")]
    DataCorruption,
}

/// Append-only write-ahead log, one hex-encoded framed record per line.
///
/// `write` buffers; `write_sync` flushes and fsyncs before returning. Records
/// of internal origin must go through `write_sync` so a signature never
/// reaches the network before its WAL entry is durable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Wal {
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let encoded = record.encode()?;
        let hex_line = hex_encode(&encoded);
        writeln!(self.writer, "{}", hex_line)?;
        Ok(())
    }

    pub fn write_sync(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.write(record)?;
        self.flush_and_sync()
    }

    pub fn flush_and_sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Read every record. A torn final line (crash mid-write) is tolerated;
    /// a malformed record anywhere else is `DataCorruption`.
    pub fn read_all(path: &Path) -> Result<Vec<WalRecord>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WalError::Io(e)),
        };

        let reader = BufReader::new(file);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let mut records = Vec::new();

        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let is_last = i + 1 == lines.len();
            let decoded = hex_decode(trimmed).and_then(|bytes| WalRecord::decode(&bytes).ok());
            match decoded {
                Some(record) => records.push(record),
                None if is_last => break,
                None => return Err(WalError::DataCorruption),
            }
        }

        Ok(records)
    }

    /// Locate the latest EndHeight(h) and return (h + 1, suffix records after
    /// it) for replay.
    pub fn records_since_last_end_height(path: &Path) -> Result<(u64, Vec<WalRecord>), WalError> {
        let records = Self::read_all(path)?;
        let mut last_end: Option<(usize, u64)> = None;
        for (i, rec) in records.iter().enumerate() {
            if let WalRecord::EndHeight(h) = rec {
                last_end = Some((i, *h));
            }
        }
        match last_end {
            None => Ok((1, records)),
            Some((i, h)) => Ok((h + 1, records[i + 1..].to_vec())),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        let byte = u8::from_str_radix(&s[i..i + 2], 16).ok()?;
        out.push(byte);
    }
    Some(out)
}
