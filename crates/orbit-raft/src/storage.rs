use crate::log::{LogEntry, NodeId, Snapshot};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const HARD_STATE_FILE: &str = "hard_state.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const LOG_FILE: &str = "log.bin";

/// Term and vote, which must survive a restart before any RPC is answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Everything read back from disk when a node starts.
#[derive(Debug, Default)]
pub struct Recovered {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
}

/// Durable Raft storage in a single directory.
///
/// The log file is a sequence of `[4-byte length][bincode entry]` records
/// appended in index order. Hard state and snapshot are rewritten whole
/// through a temporary file and a rename.
pub struct RaftStorage {
    dir: PathBuf,
    log: BufWriter<File>,
}

impl RaftStorage {
    /// Create or open storage in `dir`
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = open_append(&dir.join(LOG_FILE))?;
        Ok(RaftStorage { dir, log })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read back hard state, snapshot and log records. A torn record at the
    /// tail of the log is dropped.
    pub fn recover(&self) -> io::Result<Recovered> {
        let hard_state = read_record(&self.dir.join(HARD_STATE_FILE))?.unwrap_or_default();
        let snapshot = read_record(&self.dir.join(SNAPSHOT_FILE))?;

        let mut entries = Vec::new();
        let mut reader = BufReader::new(File::open(self.dir.join(LOG_FILE))?);
        loop {
            let mut len = [0u8; 4];
            match reader.read_exact(&mut len) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let mut buf = vec![0u8; u32::from_be_bytes(len) as usize];
            if let Err(e) = reader.read_exact(&mut buf) {
                if e.kind() == ErrorKind::UnexpectedEof {
                    warn!("Dropping torn record at the tail of the raft log");
                    break;
                }
                return Err(e);
            }
            match bincode::deserialize::<LogEntry>(&buf) {
                Ok(entry) => {
                    // A rewrite after truncation leaves no stale records, but
                    // an append that raced a crash can repeat an index.
                    while entries
                        .last()
                        .map_or(false, |last: &LogEntry| last.index >= entry.index)
                    {
                        entries.pop();
                    }
                    entries.push(entry);
                }
                Err(e) => {
                    warn!("Dropping unreadable raft log record: {}", e);
                    break;
                }
            }
        }

        Ok(Recovered {
            hard_state,
            snapshot,
            entries,
        })
    }

    pub fn save_hard_state(&mut self, state: &HardState) -> io::Result<()> {
        write_record(&self.dir.join(HARD_STATE_FILE), state)
    }

    /// Append entries to the log file and sync them
    pub fn append(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        for entry in entries {
            let bytes = bincode::serialize(entry).map_err(to_io)?;
            self.log.write_all(&(bytes.len() as u32).to_be_bytes())?;
            self.log.write_all(&bytes)?;
        }
        self.log.flush()?;
        self.log.get_ref().sync_data()
    }

    /// Replace the log file with exactly `entries`.
    pub fn rewrite_log<'a>(
        &mut self,
        entries: impl Iterator<Item = &'a LogEntry>,
    ) -> io::Result<()> {
        let path = self.dir.join(LOG_FILE);
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                let bytes = bincode::serialize(entry).map_err(to_io)?;
                writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
                writer.write_all(&bytes)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.log = open_append(&path)?;
        Ok(())
    }

    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        write_record(&self.dir.join(SNAPSHOT_FILE), snapshot)
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn to_io(e: bincode::Error) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, e)
}

fn read_record<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => bincode::deserialize(&bytes).map(Some).map_err(to_io),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = bincode::serialize(value).map_err(to_io)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
