use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::{
    LOG_ENTRY_MAGIC, LOG_FORMAT_VERSION, LOG_HEADER_MAGIC, SYNC_COMMIT_1, SYNC_COMMIT_2,
};
use crate::error::{DriftError, Result};

/// Logical record kinds in the redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    New = 0,
    Del = 1,
    DelAll = 2,
    Commit1 = 3,
    Commit2 = 4,
}

impl LogEntryType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogEntryType::New),
            1 => Some(LogEntryType::Del),
            2 => Some(LogEntryType::DelAll),
            3 => Some(LogEntryType::Commit1),
            4 => Some(LogEntryType::Commit2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub kind: LogEntryType,
    pub vbucket: u16,
    pub rowid: i64,
    pub key: Vec<u8>,
}

const HEADER_LEN: usize = 12;
const BLOCK_HEADER_LEN: usize = 4;
const ENTRY_FIXED_LEN: usize = 14; // rowid + vbucket + magic + type + keylen

struct Writer {
    file: Option<File>,
    block: Vec<u8>,
    entry_count: u16,
}

/// Append-only, block-structured redo log of key/rowid events.
///
/// Blocks are `block_size` bytes: a crc16 over the payload, an entry count,
/// then packed entries, zero-padded. A partially filled block is flushed
/// (padded) at every commit marker, so the file length is always a whole
/// number of blocks; a torn tail is detected and truncated on open.
///
/// The access log reuses this format with only NEW records.
pub struct MutationLog {
    path: Option<PathBuf>,
    block_size: usize,
    sync_policy: u8,
    writer: Mutex<Writer>,
    item_entries: AtomicU64,
    unique_items: AtomicU64,
}

impl MutationLog {
    pub fn new(path: Option<PathBuf>, block_size: usize, sync_policy: u8) -> Self {
        Self {
            path,
            block_size: block_size.max(256),
            sync_policy,
            writer: Mutex::new(Writer {
                file: None,
                block: Vec::new(),
                entry_count: 0,
            }),
            item_entries: AtomicU64::new(0),
            unique_items: AtomicU64::new(0),
        }
    }

    /// A log constructed without a path accepts writes as no-ops.
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn exists(&self) -> bool {
        self.path.as_ref().map(|p| p.exists()).unwrap_or(false)
    }

    pub fn open(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut writer = self.writer.lock();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            write_header(&mut file, self.block_size)?;
        } else {
            let (_, block_size) = read_header(&mut file)?;
            if block_size != self.block_size {
                return Err(DriftError::CorruptedLog(format!(
                    "block size mismatch: file has {block_size}, configured {}",
                    self.block_size
                )));
            }
            // Drop any torn tail so appends start on a block boundary.
            let usable = len - (len % self.block_size as u64);
            if usable != len {
                warn!(
                    "mutation log {} has a torn tail; truncating {} bytes",
                    path.display(),
                    len - usable
                );
                file.set_len(usable)?;
            }
            file.seek(SeekFrom::End(0))?;
        }
        writer.file = Some(file);
        Ok(())
    }

    pub fn new_item(&self, vbucket: u16, key: &[u8], rowid: i64) -> Result<()> {
        self.item_entries.fetch_add(1, Ordering::Relaxed);
        self.append(LogEntryType::New, vbucket, key, rowid)
    }

    pub fn del_item(&self, vbucket: u16, key: &[u8]) -> Result<()> {
        self.item_entries.fetch_add(1, Ordering::Relaxed);
        self.append(LogEntryType::Del, vbucket, key, -1)
    }

    pub fn delete_all(&self, vbucket: u16) -> Result<()> {
        self.append(LogEntryType::DelAll, vbucket, &[], -1)
    }

    pub fn commit1(&self) -> Result<()> {
        self.append(LogEntryType::Commit1, 0, &[], -1)?;
        let mut writer = self.writer.lock();
        self.flush_block(&mut writer)?;
        if self.sync_policy & SYNC_COMMIT_1 != 0 {
            self.sync(&mut writer)?;
        }
        Ok(())
    }

    pub fn commit2(&self) -> Result<()> {
        self.append(LogEntryType::Commit2, 0, &[], -1)?;
        let mut writer = self.writer.lock();
        self.flush_block(&mut writer)?;
        if self.sync_policy & SYNC_COMMIT_2 != 0 {
            self.sync(&mut writer)?;
        }
        Ok(())
    }

    fn append(&self, kind: LogEntryType, vbucket: u16, key: &[u8], rowid: i64) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.file.is_none() {
            return Ok(());
        }
        let entry_len = ENTRY_FIXED_LEN + key.len();
        let payload_capacity = self.block_size - BLOCK_HEADER_LEN;
        if writer.block.len() + 2 + entry_len > payload_capacity {
            self.flush_block(&mut writer)?;
        }
        writer.block.extend_from_slice(&(entry_len as u16).to_le_bytes());
        writer.block.extend_from_slice(&(rowid as u64).to_le_bytes());
        writer.block.extend_from_slice(&vbucket.to_le_bytes());
        writer.block.push(LOG_ENTRY_MAGIC);
        writer.block.push(kind as u8);
        writer
            .block
            .extend_from_slice(&(key.len() as u16).to_le_bytes());
        writer.block.extend_from_slice(key);
        writer.entry_count += 1;
        Ok(())
    }

    fn flush_block(&self, writer: &mut Writer) -> Result<()> {
        if writer.entry_count == 0 {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(self.block_size);
        let mut payload = Vec::with_capacity(2 + writer.block.len());
        payload.extend_from_slice(&writer.entry_count.to_le_bytes());
        payload.extend_from_slice(&writer.block);
        buf.extend_from_slice(&crc16(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.resize(self.block_size, 0);
        if let Some(file) = writer.file.as_mut() {
            file.write_all(&buf)?;
        }
        writer.block.clear();
        writer.entry_count = 0;
        Ok(())
    }

    fn sync(&self, writer: &mut Writer) -> Result<()> {
        if let Some(file) = writer.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Truncate the log back to an empty header. Returns true when a file
    /// was actually reset.
    pub fn reset(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mut writer = self.writer.lock();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        write_header(&mut file, self.block_size)?;
        writer.file = Some(file);
        writer.block.clear();
        writer.entry_count = 0;
        self.item_entries.store(0, Ordering::Relaxed);
        self.unique_items.store(0, Ordering::Relaxed);
        Ok(true)
    }

    pub fn file_size(&self) -> u64 {
        self.path
            .as_ref()
            .and_then(|p| p.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn item_entries(&self) -> u64 {
        self.item_entries.load(Ordering::Relaxed)
    }

    /// Recalibrate the entry counters after a harvest or compaction pass.
    pub fn reset_counts(&self, entries: u64, unique: u64) {
        self.item_entries.store(entries, Ordering::Relaxed);
        self.unique_items.store(unique, Ordering::Relaxed);
    }

    /// Entries-per-unique-key ratio; the compactor rewrites once this or
    /// the file size exceeds its cap.
    pub fn entry_ratio(&self) -> u64 {
        let unique = self.unique_items.load(Ordering::Relaxed).max(1);
        self.item_entries.load(Ordering::Relaxed) / unique
    }

    /// Read every entry in file order, verifying block checksums.
    pub fn read_entries(&self) -> Result<Vec<LogEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        // Make sure buffered entries are on disk before reading back.
        {
            let mut writer = self.writer.lock();
            if writer.file.is_some() {
                self.flush_block(&mut writer)?;
            }
        }
        let mut file = File::open(path)?;
        let (_, block_size) = read_header(&mut file)?;
        let mut entries = Vec::new();
        let mut block = vec![0u8; block_size];
        loop {
            match read_exact_or_eof(&mut file, &mut block)? {
                ReadBlock::Eof => break,
                ReadBlock::Partial => {
                    return Err(DriftError::CorruptedLog(
                        "truncated block at end of log".to_string(),
                    ));
                }
                ReadBlock::Full => {}
            }
            let stored_crc = u16::from_le_bytes([block[0], block[1]]);
            if crc16(&block[2..]) != stored_crc {
                return Err(DriftError::CorruptedLog("block checksum mismatch".to_string()));
            }
            let count = u16::from_le_bytes([block[2], block[3]]);
            let mut offset = BLOCK_HEADER_LEN;
            for _ in 0..count {
                let entry = parse_entry(&block, &mut offset)?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Rewrite the log retaining only the latest record per key plus the
    /// commit bracketing, shrinking the file.
    pub fn compact(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut harvester = MutationLogHarvester::new();
        harvester.load(self)?;

        let tmp_path = path.with_extension("compact");
        let compacted = MutationLog::new(Some(tmp_path.clone()), self.block_size, self.sync_policy);
        compacted.open()?;
        let mut kept: u64 = 0;
        harvester.apply(&mut |vbucket, key, rowid| {
            let _ = compacted.new_item(vbucket, key, rowid);
            kept += 1;
        });
        compacted.commit1()?;
        compacted.commit2()?;
        drop(compacted);

        let mut writer = self.writer.lock();
        writer.file = None;
        std::fs::rename(&tmp_path, path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::End(0))?;
        writer.file = Some(file);
        writer.block.clear();
        writer.entry_count = 0;
        self.item_entries.store(kept, Ordering::Relaxed);
        self.unique_items.store(kept, Ordering::Relaxed);
        info!(
            "compacted mutation log {} down to {} entries",
            path.display(),
            kept
        );
        Ok(())
    }
}

fn write_header(file: &mut File, block_size: usize) -> Result<()> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&LOG_HEADER_MAGIC.to_le_bytes());
    header.extend_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&(block_size as u32).to_le_bytes());
    header.resize(block_size, 0);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_data()?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<(u32, usize)> {
    let mut header = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)
        .map_err(|_| DriftError::CorruptedLog("short header".to_string()))?;
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != LOG_HEADER_MAGIC {
        return Err(DriftError::CorruptedLog("bad header magic".to_string()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != LOG_FORMAT_VERSION {
        return Err(DriftError::CorruptedLog(format!(
            "unsupported log version {version}"
        )));
    }
    let block_size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if block_size < 256 {
        return Err(DriftError::CorruptedLog("implausible block size".to_string()));
    }
    // The header occupies one full block.
    file.seek(SeekFrom::Start(block_size as u64))?;
    Ok((version, block_size))
}

enum ReadBlock {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<ReadBlock> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadBlock::Eof
            } else {
                ReadBlock::Partial
            });
        }
        filled += n;
    }
    Ok(ReadBlock::Full)
}

fn parse_entry(block: &[u8], offset: &mut usize) -> Result<LogEntry> {
    let corrupt = || DriftError::CorruptedLog("truncated entry".to_string());
    if *offset + 2 > block.len() {
        return Err(corrupt());
    }
    let len = u16::from_le_bytes([block[*offset], block[*offset + 1]]) as usize;
    *offset += 2;
    if len < ENTRY_FIXED_LEN || *offset + len > block.len() {
        return Err(corrupt());
    }
    let e = &block[*offset..*offset + len];
    let rowid = u64::from_le_bytes([e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7]]) as i64;
    let vbucket = u16::from_le_bytes([e[8], e[9]]);
    if e[10] != LOG_ENTRY_MAGIC {
        return Err(DriftError::CorruptedLog("bad entry magic".to_string()));
    }
    let kind = LogEntryType::from_u8(e[11])
        .ok_or_else(|| DriftError::CorruptedLog(format!("unknown entry type {}", e[11])))?;
    let key_len = u16::from_le_bytes([e[12], e[13]]) as usize;
    if ENTRY_FIXED_LEN + key_len != len {
        return Err(corrupt());
    }
    let key = e[ENTRY_FIXED_LEN..].to_vec();
    *offset += len;
    Ok(LogEntry {
        kind,
        vbucket,
        rowid,
        key,
    })
}

/// An uncommitted record left over after replay: anything not bracketed by
/// both commit markers.
#[derive(Debug, Clone)]
pub struct UncommittedRecord {
    pub kind: LogEntryType,
    pub vbucket: u16,
    pub rowid: i64,
    pub key: Vec<u8>,
}

/// Replays a mutation log, separating records into committed and
/// uncommitted per the COMMIT1/COMMIT2 protocol: records enter `loading`,
/// COMMIT1 stages them, COMMIT2 applies the staged set. Whatever remains
/// staged or loading at end-of-log was never durable.
pub struct MutationLogHarvester {
    vbucket_filter: HashMap<u16, u16>,
    committed: HashMap<(u16, Vec<u8>), i64>,
    loading: Vec<LogEntry>,
    pending: Vec<LogEntry>,
    items_seen: u64,
}

impl MutationLogHarvester {
    pub fn new() -> Self {
        Self {
            vbucket_filter: HashMap::new(),
            committed: HashMap::new(),
            loading: Vec::new(),
            pending: Vec::new(),
            items_seen: 0,
        }
    }

    /// Restrict the harvest to known (vbid, vbver) pairs. With no filter
    /// registered, every vbucket is accepted.
    pub fn set_vbucket_version(&mut self, vbid: u16, vbver: u16) {
        self.vbucket_filter.insert(vbid, vbver);
    }

    pub fn load(&mut self, log: &MutationLog) -> Result<()> {
        for entry in log.read_entries()? {
            match entry.kind {
                LogEntryType::New | LogEntryType::Del | LogEntryType::DelAll => {
                    if !self.vbucket_filter.is_empty()
                        && !self.vbucket_filter.contains_key(&entry.vbucket)
                    {
                        continue;
                    }
                    self.items_seen += 1;
                    self.loading.push(entry);
                }
                LogEntryType::Commit1 => {
                    self.pending.append(&mut self.loading);
                }
                LogEntryType::Commit2 => {
                    for staged in self.pending.drain(..) {
                        match staged.kind {
                            LogEntryType::New => {
                                self.committed
                                    .insert((staged.vbucket, staged.key), staged.rowid);
                            }
                            LogEntryType::Del => {
                                self.committed.remove(&(staged.vbucket, staged.key));
                            }
                            LogEntryType::DelAll => {
                                self.committed.retain(|(vb, _), _| *vb != staged.vbucket);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit every committed NEW record.
    pub fn apply(&self, cb: &mut dyn FnMut(u16, &[u8], i64)) {
        for ((vbucket, key), rowid) in &self.committed {
            cb(*vbucket, key, *rowid);
        }
    }

    pub fn total(&self) -> usize {
        self.committed.len()
    }

    pub fn items_seen(&self) -> u64 {
        self.items_seen
    }

    pub fn uncommitted(&self) -> Vec<UncommittedRecord> {
        self.pending
            .iter()
            .chain(self.loading.iter())
            .filter(|e| {
                matches!(e.kind, LogEntryType::New | LogEntryType::Del)
            })
            .map(|e| UncommittedRecord {
                kind: e.kind,
                vbucket: e.vbucket,
                rowid: e.rowid,
                key: e.key.clone(),
            })
            .collect()
    }
}

impl Default for MutationLogHarvester {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16/CCITT over a byte slice.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
