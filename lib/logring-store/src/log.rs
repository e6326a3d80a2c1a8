//! The append-only log: a data file of raw payload bytes paired with a
//! dense index of fixed-size entries.
//!
//! The data file is a plain concatenation of record payloads with no
//! framing. The index file is an array of 12-byte little-endian entries
//! `(length: u32, offset: u32, counter: u32)`; entry 0 is the sentinel
//! `(0, 0, 0)`, and entry k describes the k-th record in append order.
//! Counters increase strictly (contiguously, unless a caller supplies its
//! own counters) and the trailing 4 bytes of the index always hold the
//! counter of the most recent record, which is what appenders read, under
//! the append lock, to pick up where the log left off.
//!
//! Readers take no locks. A reader that races an in-flight append simply
//! stops at the first index entry or payload that has not been fully
//! written yet; it never surfaces a partial record.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use snafu::{ensure, Snafu};

use crate::lock;

/// Size in bytes of one packed index entry.
pub const INDEX_ENTRY_LEN: u64 = 12;

/// Error raised by [`Log`] operations.
#[derive(Debug, Snafu)]
pub enum LogError {
    /// A general I/O error occurred.
    #[snafu(display("log I/O error: {source}"), context(false))]
    Io { source: io::Error },

    /// A precondition on the current last counter did not hold.
    ///
    /// The caller's view of the log is stale; replication catches this and
    /// initiates catch-up, the write path reports it to the client.
    #[snafu(display("expectation failed: last counter is {current}"))]
    ExpectationFailed { current: u32 },

    /// The index file is shorter than the sentinel entry.
    ///
    /// A log in this state cannot be appended to or read; the collection
    /// has to be restored or cleared.
    #[snafu(display("index file {} is truncated below the sentinel entry", path.display()))]
    TruncatedIndex { path: PathBuf },

    /// The index file length is not a multiple of the counter slot size.
    ///
    /// Structural corruption; no recovery is attempted.
    #[snafu(display("misaligned index file {} ({len} bytes)", path.display()))]
    MisalignedIndex { path: PathBuf, len: u64 },

    /// A caller-supplied counter does not advance past the running counter.
    ///
    /// The whole batch is rejected before any byte is written.
    #[snafu(display("counter {counter} does not advance past {current}"))]
    CounterNotMonotonic { counter: u32, current: u32 },

    /// The data file would grow past the 4 GiB the index offset can address.
    #[snafu(display("data file {} exceeds the index offset range", path.display()))]
    OffsetOverflow { path: PathBuf },

    /// An append was attempted with no records.
    #[snafu(display("cannot extend a log with an empty batch"))]
    EmptyBatch,
}

/// Preconditions checked against the last counter before an append.
#[derive(Clone, Copy, Debug, Default)]
pub struct Expect {
    /// Fail if the current last counter is greater than this value: the
    /// caller has not seen everything already in the log.
    pub latest: Option<u32>,
    /// Fail unless the current last counter is exactly this value; used by
    /// replication to detect gaps.
    pub last_counter: Option<u32>,
}

impl Expect {
    /// No precondition.
    pub const NONE: Expect = Expect {
        latest: None,
        last_counter: None,
    };

    /// Fail if anything was appended past `counter`.
    pub fn latest(counter: u32) -> Self {
        Expect {
            latest: Some(counter),
            last_counter: None,
        }
    }

    /// Fail unless the log ends exactly at `counter`.
    pub fn last_counter(counter: u32) -> Self {
        Expect {
            latest: None,
            last_counter: Some(counter),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    length: u32,
    offset: u32,
    counter: u32,
}

impl IndexEntry {
    fn decode(buf: &[u8; 12]) -> Self {
        IndexEntry {
            length: u32::from_le_bytes(buf[0..4].try_into().expect("slice is 4 bytes")),
            offset: u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes")),
            counter: u32::from_le_bytes(buf[8..12].try_into().expect("slice is 4 bytes")),
        }
    }

    fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.counter.to_le_bytes());
        buf
    }
}

/// An append-only log of records keyed by a monotonic 32-bit counter.
#[derive(Debug)]
pub struct Log {
    data_path: PathBuf,
    index_path: PathBuf,
    data: File,
    index: File,
}

impl Log {
    /// Opens the log at `data_path`, creating both files if needed.
    ///
    /// The index lives next to the data file with an `.index` suffix. If
    /// the index does not exist it is created atomically with the sentinel
    /// entry; losing the creation race to another process falls back to
    /// opening the winner's file.
    pub fn open<P: Into<PathBuf>>(data_path: P) -> Result<Log, LogError> {
        let data_path = data_path.into();
        let index_path = index_path_for(&data_path);

        let index = match OpenOptions::new().read(true).write(true).open(&index_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => create_index(&index_path)?,
            Err(e) => return Err(e.into()),
        };
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;

        Ok(Log {
            data_path,
            index_path,
            data,
            index,
        })
    }

    /// The path of the data file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// The path of the index file.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Appends `batch` with sequentially assigned counters, returning the
    /// counter of the first appended record.
    pub fn extend<B: AsRef<[u8]>>(&mut self, batch: &[B], expect: Expect) -> Result<u32, LogError> {
        ensure!(!batch.is_empty(), EmptyBatchSnafu);
        let _guard = lock::lock_append(&self.index)?;
        let current = self.read_last_counter()?;
        check_expect(expect, current)?;

        let items: Vec<(u32, &[u8])> = batch
            .iter()
            .enumerate()
            .map(|(i, payload)| (current + 1 + i as u32, payload.as_ref()))
            .collect();
        self.append_items(&items)
    }

    /// Appends `batch` with caller-supplied counters, returning the first
    /// provided counter.
    ///
    /// Every provided counter must advance strictly past the running
    /// counter; the batch is validated in full before any byte is written,
    /// so a rejected batch leaves the log untouched.
    pub fn extend_with_counters<B: AsRef<[u8]>>(
        &mut self,
        batch: &[(u32, B)],
        expect: Expect,
    ) -> Result<u32, LogError> {
        ensure!(!batch.is_empty(), EmptyBatchSnafu);
        let _guard = lock::lock_append(&self.index)?;
        let current = self.read_last_counter()?;
        check_expect(expect, current)?;

        let mut running = current;
        for (counter, _) in batch {
            ensure!(
                *counter > running,
                CounterNotMonotonicSnafu {
                    counter: *counter,
                    current: running,
                }
            );
            running = *counter;
        }

        let items: Vec<(u32, &[u8])> = batch
            .iter()
            .map(|(counter, payload)| (*counter, payload.as_ref()))
            .collect();
        self.append_items(&items)
    }

    fn append_items(&mut self, items: &[(u32, &[u8])]) -> Result<u32, LogError> {
        self.index.seek(SeekFrom::End(0))?;
        let mut pos = self.data.seek(SeekFrom::End(0))?;

        let mut data_buf = Vec::new();
        let mut index_buf = Vec::with_capacity(items.len() * INDEX_ENTRY_LEN as usize);
        for (counter, payload) in items {
            let length = payload.len() as u32;
            let offset = u32::try_from(pos).map_err(|_| LogError::OffsetOverflow {
                path: self.data_path.clone(),
            })?;
            data_buf.extend_from_slice(payload);
            index_buf.extend_from_slice(
                &IndexEntry {
                    length,
                    offset,
                    counter: *counter,
                }
                .encode(),
            );
            pos += u64::from(length);
        }

        // Data lands before the entries that describe it, so a racing
        // reader either sees a complete record or stops at the index tail.
        self.data.write_all(&data_buf)?;
        self.index.write_all(&index_buf)?;

        Ok(items[0].0)
    }

    /// Returns records with counter above `above`, up to and including
    /// `last` when one is given.
    pub fn read(&mut self, above: u32, last: Option<u32>) -> Result<Records<'_>, LogError> {
        self.seek_index(above)?;
        Ok(Records {
            log: self,
            data_pos: None,
            prev_counter: above,
            last,
            done: false,
        })
    }

    /// The counter of the most recent record, or 0 for an empty log.
    pub fn length(&mut self) -> Result<u32, LogError> {
        self.read_last_counter()
    }

    /// Byte positions `(index, data)` describing the prefix of the log up
    /// to and including counter `until`; with no `until`, the current file
    /// sizes.
    pub fn get_file_positions(&mut self, until: Option<u32>) -> Result<(u64, u64), LogError> {
        let Some(until) = until else {
            return Ok((self.index.metadata()?.len(), self.data.metadata()?.len()));
        };
        self.seek_index(until)?;
        let index_pos = self.index.stream_position()?;
        let mut buf = [0u8; 12];
        if read_full(&mut self.index, &mut buf)? < 12 {
            // `until` is at or past the end; the prefix is everything.
            return Ok((index_pos, self.data.metadata()?.len()));
        }
        let entry = IndexEntry::decode(&buf);
        Ok((index_pos, u64::from(entry.offset)))
    }

    /// Truncates the log back to the sentinel entry.
    pub fn clear(&mut self) -> Result<(), LogError> {
        let _guard = lock::lock_complete(&self.index)?;
        self.index.set_len(INDEX_ENTRY_LEN)?;
        self.data.set_len(0)?;
        Ok(())
    }

    /// Copies this log to `dest_data`/`dest_index`, skipping records whose
    /// counter is in `exclude` and rewriting offsets densely.
    ///
    /// An exclude list (rather than an include list) means records the
    /// caller does not know about are still carried over.
    pub fn copy(
        &mut self,
        exclude: &HashSet<u32>,
        dest_data: &Path,
        dest_index: &Path,
    ) -> Result<(), LogError> {
        let mut out_data = BufWriter::new(File::create(dest_data)?);
        let mut out_index = BufWriter::new(File::create(dest_index)?);

        self.index.seek(SeekFrom::Start(0))?;
        let mut out_pos: u32 = 0;
        loop {
            let mut buf = [0u8; 12];
            if read_full(&mut self.index, &mut buf)? < 12 {
                break;
            }
            let entry = IndexEntry::decode(&buf);
            if entry.counter != 0 && exclude.contains(&entry.counter) {
                continue;
            }
            self.data.seek(SeekFrom::Start(u64::from(entry.offset)))?;
            let mut payload = vec![0u8; entry.length as usize];
            if read_full(&mut self.data, &mut payload)? < payload.len() {
                // Caught a concurrent appender mid-write; everything before
                // this point is a consistent prefix.
                break;
            }
            out_data.write_all(&payload)?;
            out_index.write_all(
                &IndexEntry {
                    length: entry.length,
                    offset: out_pos,
                    counter: entry.counter,
                }
                .encode(),
            )?;
            out_pos += entry.length;
        }
        out_data.flush()?;
        out_index.flush()?;
        Ok(())
    }

    /// Replaces this log's contents with the files at
    /// `data_path`/`index_path`.
    ///
    /// Readers racing the overwrite observe a truncation and stop cleanly
    /// at the boundary.
    pub fn overwrite(&mut self, data_path: &Path, index_path: &Path) -> Result<(), LogError> {
        let _guard = lock::lock_complete(&self.index)?;
        self.index.set_len(0)?;
        self.data.set_len(0)?;
        self.data.seek(SeekFrom::Start(0))?;
        io::copy(&mut File::open(data_path)?, &mut self.data)?;
        self.index.seek(SeekFrom::Start(0))?;
        io::copy(&mut File::open(index_path)?, &mut self.index)?;
        Ok(())
    }

    /// Renames both files under the complete lock, consuming the log.
    ///
    /// Writers blocked on the old files fail or recreate them fresh; this
    /// is how a collection's active log becomes its frozen, deprecated one.
    pub fn rename(self, dest_data: &Path, dest_index: &Path) -> Result<(), LogError> {
        let _guard = lock::lock_complete(&self.index)?;
        std::fs::rename(&self.data_path, dest_data)?;
        std::fs::rename(&self.index_path, dest_index)?;
        Ok(())
    }

    /// Removes both files, consuming the log.
    pub fn delete(self) -> Result<(), LogError> {
        std::fs::remove_file(&self.index_path)?;
        std::fs::remove_file(&self.data_path)?;
        Ok(())
    }

    /// Takes the complete lock, for callers replacing the files wholesale.
    pub(crate) fn complete_lock(&self) -> io::Result<lock::LockGuard> {
        lock::lock_complete(&self.index)
    }

    /// Reads the counter of the most recent record from the trailing four
    /// bytes of the index, leaving the index positioned at end of file.
    fn read_last_counter(&mut self) -> Result<u32, LogError> {
        let len = self.index.seek(SeekFrom::End(0))?;
        ensure!(
            len >= INDEX_ENTRY_LEN,
            TruncatedIndexSnafu {
                path: self.index_path.clone(),
            }
        );
        ensure!(
            len % 4 == 0,
            MisalignedIndexSnafu {
                path: self.index_path.clone(),
                len,
            }
        );
        self.index.seek(SeekFrom::End(-4))?;
        let mut buf = [0u8; 4];
        self.index.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Positions the index at the first entry with counter greater than
    /// `above`; may be end of file.
    ///
    /// Starts from a linear-interpolation guess (entries are usually
    /// contiguous, so `above`'s fraction of the last counter is close to
    /// its fraction of the entry count) and then steps by the observed
    /// counter distance, clamped into shrinking bounds, which degrades to a
    /// bounded scan when replication has left gaps in the counter space.
    fn seek_index(&mut self, above: u32) -> Result<(), LogError> {
        let last = self.read_last_counter()?;
        if last <= above {
            // Positioned at end of file by `read_last_counter`.
            return Ok(());
        }
        let entries = self.index.stream_position()? / INDEX_ENTRY_LEN;

        let mut guess = entries * u64::from(above) / u64::from(last);
        let mut least: u64 = 0;
        let mut greatest: u64 = entries;
        loop {
            if guess >= entries {
                guess = entries - 1;
            }
            self.index
                .seek(SeekFrom::Start(guess * INDEX_ENTRY_LEN + 8))?;
            let mut buf = [0u8; 4];
            if read_full(&mut self.index, &mut buf)? < 4 {
                return Ok(());
            }
            let counter = u32::from_le_bytes(buf);
            if counter == above {
                self.index
                    .seek(SeekFrom::Start((guess + 1) * INDEX_ENTRY_LEN))?;
                return Ok(());
            }
            if counter < above {
                least = guess + 1;
            } else {
                greatest = guess;
            }
            if least >= greatest {
                // The first entry above the target sits at the crossing
                // point.
                self.index
                    .seek(SeekFrom::Start(greatest * INDEX_ENTRY_LEN))?;
                return Ok(());
            }
            let step = i64::from(above) - i64::from(counter);
            let next = (guess as i64 + step).clamp(least as i64, greatest as i64 - 1);
            guess = next as u64;
        }
    }
}

fn check_expect(expect: Expect, current: u32) -> Result<(), LogError> {
    if let Some(latest) = expect.latest {
        ensure!(current <= latest, ExpectationFailedSnafu { current });
    }
    if let Some(exact) = expect.last_counter {
        ensure!(current == exact, ExpectationFailedSnafu { current });
    }
    Ok(())
}

/// Iterator over `(counter, payload)` pairs from [`Log::read`].
#[derive(Debug)]
pub struct Records<'a> {
    log: &'a mut Log,
    data_pos: Option<u64>,
    prev_counter: u32,
    last: Option<u32>,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<(u32, Vec<u8>), LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = [0u8; 12];
        match read_full(&mut self.log.index, &mut buf) {
            Ok(12) => {}
            Ok(_) => {
                // Partial index entry: a writer is mid-append.
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        }
        let entry = IndexEntry::decode(&buf);
        if entry.counter <= self.prev_counter {
            // The files were truncated or replaced underneath us; stop at
            // the last consistent record.
            self.done = true;
            return None;
        }

        let offset = u64::from(entry.offset);
        if self.data_pos != Some(offset) {
            if let Err(e) = self.log.data.seek(SeekFrom::Start(offset)) {
                self.done = true;
                return Some(Err(e.into()));
            }
        }
        let mut payload = vec![0u8; entry.length as usize];
        match read_full(&mut self.log.data, &mut payload) {
            Ok(n) if n == payload.len() => {}
            Ok(_) => {
                // Truncated record: this must be the end of the consistent
                // prefix.
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        }
        self.data_pos = Some(offset + u64::from(entry.length));
        self.prev_counter = entry.counter;
        if let Some(last) = self.last {
            if entry.counter >= last {
                self.done = true;
            }
        }
        Some(Ok((entry.counter, payload)))
    }
}

fn index_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".index");
    PathBuf::from(name)
}

fn create_index(index_path: &Path) -> Result<File, LogError> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(index_path)
    {
        Ok(mut file) => {
            let sentinel = IndexEntry {
                length: 0,
                offset: 0,
                counter: 0,
            };
            file.write_all(&sentinel.encode())?;
            Ok(file)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // Another process won the creation race.
            Ok(OpenOptions::new().read(true).write(true).open(index_path)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads until `buf` is full or end of file, returning the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_log() -> (tempfile::TempDir, Log) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let log = Log::open(dir.path().join("database")).expect("should open log");
        (dir, log)
    }

    fn collect(log: &mut Log, above: u32, last: Option<u32>) -> Vec<(u32, Vec<u8>)> {
        log.read(above, last)
            .expect("read should not fail")
            .collect::<Result<Vec<_>, _>>()
            .expect("records should decode")
    }

    fn payloads(records: &[(u32, Vec<u8>)]) -> Vec<(u32, String)> {
        records
            .iter()
            .map(|(c, p)| (*c, String::from_utf8(p.clone()).unwrap()))
            .collect()
    }

    #[test]
    fn extend_and_read_back() {
        let (_dir, mut log) = temp_log();
        assert_eq!(log.extend(&["1", "2", "3"], Expect::NONE).unwrap(), 1);
        assert_eq!(log.extend(&["4", "5", "6"], Expect::NONE).unwrap(), 4);
        assert_eq!(log.length().unwrap(), 6);

        let first_two = payloads(&collect(&mut log, 0, Some(2)));
        assert_eq!(first_two, vec![(1, "1".into()), (2, "2".into())]);

        let tail = payloads(&collect(&mut log, 3, Some(6)));
        assert_eq!(
            tail,
            vec![(4, "4".into()), (5, "5".into()), (6, "6".into())]
        );

        assert!(collect(&mut log, 6, None).is_empty());
    }

    #[test]
    fn read_positions_anywhere() {
        let (_dir, mut log) = temp_log();
        let batch: Vec<String> = (1..=500).map(|i| format!("record-{i}")).collect();
        log.extend(&batch, Expect::NONE).unwrap();

        for above in [0u32, 1, 17, 250, 499, 500] {
            let records = collect(&mut log, above, None);
            assert_eq!(records.len(), (500 - above) as usize);
            if let Some((counter, payload)) = records.first() {
                assert_eq!(*counter, above + 1);
                assert_eq!(payload, format!("record-{}", above + 1).as_bytes());
            }
        }
    }

    #[test]
    fn seek_across_counter_gap() {
        let (_dir, mut log) = temp_log();
        let batch: Vec<String> = (1..=100).map(|i| i.to_string()).collect();
        log.extend(&batch, Expect::NONE).unwrap();
        log.extend_with_counters(&[(201u32, "special")], Expect::NONE)
            .unwrap();
        log.extend(&batch, Expect::NONE).unwrap();
        assert_eq!(log.length().unwrap(), 301);

        let around_gap = payloads(&collect(&mut log, 200, Some(202)));
        assert_eq!(around_gap, vec![(201, "special".into()), (202, "1".into())]);

        let before_gap = payloads(&collect(&mut log, 98, Some(201)));
        assert_eq!(
            before_gap,
            vec![(99, "99".into()), (100, "100".into()), (201, "special".into())]
        );

        assert!(collect(&mut log, 301, None).is_empty());
    }

    #[test]
    fn expect_latest_rejects_stale_writers() {
        let (_dir, mut log) = temp_log();
        log.extend(&["a", "b"], Expect::NONE).unwrap();

        let err = log.extend(&["c"], Expect::latest(1)).unwrap_err();
        assert!(matches!(err, LogError::ExpectationFailed { current: 2 }));
        assert_eq!(log.length().unwrap(), 2);

        assert_eq!(log.extend(&["c"], Expect::latest(2)).unwrap(), 3);
    }

    #[test]
    fn expect_last_counter_requires_exact_match() {
        let (_dir, mut log) = temp_log();
        log.extend(&["a"], Expect::NONE).unwrap();

        let err = log.extend(&["b"], Expect::last_counter(5)).unwrap_err();
        assert!(matches!(err, LogError::ExpectationFailed { current: 1 }));

        assert_eq!(log.extend(&["b"], Expect::last_counter(1)).unwrap(), 2);
    }

    #[test]
    fn with_counters_batch_rejected_atomically() {
        let (_dir, mut log) = temp_log();
        log.extend(&["a", "b", "c"], Expect::NONE).unwrap();

        // The third counter regresses, so nothing from the batch may land.
        let err = log
            .extend_with_counters(&[(10u32, "x"), (11, "y"), (4, "z")], Expect::NONE)
            .unwrap_err();
        assert!(matches!(
            err,
            LogError::CounterNotMonotonic {
                counter: 4,
                current: 11
            }
        ));
        assert_eq!(log.length().unwrap(), 3);
        assert_eq!(collect(&mut log, 0, None).len(), 3);
    }

    #[test]
    fn clear_resets_to_sentinel() {
        let (_dir, mut log) = temp_log();
        log.extend(&["a", "b"], Expect::NONE).unwrap();
        log.clear().unwrap();
        assert_eq!(log.length().unwrap(), 0);
        assert!(collect(&mut log, 0, None).is_empty());
        assert_eq!(log.extend(&["c"], Expect::NONE).unwrap(), 1);
    }

    #[test]
    fn copy_excludes_counters_and_repacks_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("database")).unwrap();
        log.extend(&["one", "two", "three", "four"], Expect::NONE)
            .unwrap();

        let exclude: HashSet<u32> = [2u32, 3].into_iter().collect();
        let dest_data = dir.path().join("compacted");
        let dest_index = dir.path().join("compacted.index");
        log.copy(&exclude, &dest_data, &dest_index).unwrap();
        log.overwrite(&dest_data, &dest_index).unwrap();

        let records = payloads(&collect(&mut log, 0, None));
        assert_eq!(records, vec![(1, "one".into()), (4, "four".into())]);
        assert_eq!(log.length().unwrap(), 4);

        // Offsets must be dense again: data file is exactly the survivors.
        let data = std::fs::read(dir.path().join("database")).unwrap();
        assert_eq!(data, b"onefour");
    }

    #[test]
    fn truncated_tail_record_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("database")).unwrap();
        log.extend(&["aaaa", "bbbb"], Expect::NONE).unwrap();

        // Chop the last record's payload in half, as a crashed or mid-append
        // writer would leave it.
        let data_path = dir.path().join("database");
        let len = std::fs::metadata(&data_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&data_path).unwrap();
        file.set_len(len - 2).unwrap();

        let records = payloads(&collect(&mut log, 0, None));
        assert_eq!(records, vec![(1, "aaaa".into())]);
    }

    #[test]
    fn index_entry_written_before_data_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("database")).unwrap();
        log.extend(&["aaaa"], Expect::NONE).unwrap();

        // Simulate an appender that has written its index entry but whose
        // payload has not reached the data file yet.
        let mut index = OpenOptions::new()
            .append(true)
            .open(dir.path().join("database.index"))
            .unwrap();
        index
            .write_all(
                &IndexEntry {
                    length: 4,
                    offset: 4,
                    counter: 2,
                }
                .encode(),
            )
            .unwrap();

        let records = payloads(&collect(&mut log, 0, None));
        assert_eq!(records, vec![(1, "aaaa".into())]);
    }

    #[test]
    fn misaligned_index_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("database")).unwrap();
        log.extend(&["a"], Expect::NONE).unwrap();

        let index_path = dir.path().join("database.index");
        let len = std::fs::metadata(&index_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&index_path).unwrap();
        file.set_len(len + 2).unwrap();

        let err = log.length().unwrap_err();
        assert!(matches!(err, LogError::MisalignedIndex { .. }));
    }

    #[test]
    fn empty_index_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("database")).unwrap();
        let index_path = dir.path().join("database.index");
        let file = OpenOptions::new().write(true).open(&index_path).unwrap();
        file.set_len(0).unwrap();

        assert!(matches!(
            log.length().unwrap_err(),
            LogError::TruncatedIndex { .. }
        ));
    }

    #[test]
    fn file_positions_describe_prefixes() {
        let (_dir, mut log) = temp_log();
        log.extend(&["aa", "bbb", "cccc"], Expect::NONE).unwrap();

        // Whole-file positions: sentinel + 3 entries, 9 payload bytes.
        assert_eq!(
            log.get_file_positions(None).unwrap(),
            (4 * INDEX_ENTRY_LEN, 9)
        );
        // Prefix through counter 2: sentinel + 2 entries, "aa" + "bbb".
        assert_eq!(
            log.get_file_positions(Some(2)).unwrap(),
            (3 * INDEX_ENTRY_LEN, 5)
        );
        // Past the end degrades to the whole file.
        assert_eq!(
            log.get_file_positions(Some(10)).unwrap(),
            (4 * INDEX_ENTRY_LEN, 9)
        );
    }

    #[test]
    fn concurrent_handles_serialize_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database");
        let mut a = Log::open(&path).unwrap();
        let mut b = Log::open(&path).unwrap();

        a.extend(&["from-a"], Expect::NONE).unwrap();
        b.extend(&["from-b"], Expect::NONE).unwrap();
        a.extend(&["again-a"], Expect::NONE).unwrap();

        let records = payloads(&collect(&mut a, 0, None));
        assert_eq!(
            records,
            vec![
                (1, "from-a".into()),
                (2, "from-b".into()),
                (3, "again-a".into())
            ]
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn extend_then_read_round_trips(
                batches in prop::collection::vec(
                    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
                    1..6,
                )
            ) {
                let dir = tempfile::tempdir().unwrap();
                let mut log = Log::open(dir.path().join("database")).unwrap();

                let mut expected: Vec<Vec<u8>> = Vec::new();
                for batch in &batches {
                    let first = log.extend(batch, Expect::NONE).unwrap();
                    prop_assert_eq!(first as usize, expected.len() + 1);
                    expected.extend(batch.iter().cloned());
                }

                let records = log
                    .read(0, None)
                    .unwrap()
                    .collect::<Result<Vec<_>, _>>()
                    .unwrap();
                prop_assert_eq!(records.len(), expected.len());
                for (i, (counter, payload)) in records.iter().enumerate() {
                    prop_assert_eq!(*counter as usize, i + 1);
                    prop_assert_eq!(payload, &expected[i]);
                }
            }

            #[test]
            fn read_above_yields_only_greater_counters(
                total in 1u32..200,
                above in 0u32..250,
            ) {
                let dir = tempfile::tempdir().unwrap();
                let mut log = Log::open(dir.path().join("database")).unwrap();
                let batch: Vec<String> = (1..=total).map(|i| i.to_string()).collect();
                log.extend(&batch, Expect::NONE).unwrap();

                let records = log
                    .read(above, None)
                    .unwrap()
                    .collect::<Result<Vec<_>, _>>()
                    .unwrap();
                let expected = total.saturating_sub(above);
                prop_assert_eq!(records.len() as u32, expected);
                prop_assert!(records.iter().all(|(c, _)| *c > above));
            }
        }
    }
}
