use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Written once at the start of every log file.
pub const MAGIC: &[u8; 8] = b"SLOTWAL1";

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a log back.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset of the first torn or corrupt entry, if replay stopped early.
    pub torn_at: Option<u64>,
}

/// Append-only Write-Ahead Log.
///
/// File layout: `SLOTWAL1` followed by entries of
/// `[u32: len][bincode: Event][u32: crc32]`.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt entry ends replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if writer.get_ref().metadata()?.len() == 0 {
            writer.write_all(MAGIC)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single event and fsync. Production code goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append a single event to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        // Anything still buffered belongs to the old file.
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Cut the file back to `len` bytes, dropping a torn tail so new
    /// appends don't land behind it.
    pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events.
    /// A missing or empty file replays as nothing; a file that doesn't start
    /// with `MAGIC` is an error.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(Replay::default());
        }
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        let mut magic = [0u8; 8];
        if !read_fully(&mut reader, &mut magic)? {
            replay.torn_at = Some(0);
            return Ok(replay);
        }
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a slotd WAL", path.display()),
            ));
        }
        let mut offset = MAGIC.len() as u64;

        loop {
            if offset >= file_len {
                break;
            }
            let mut len_buf = [0u8; 4];
            if !read_fully(&mut reader, &mut len_buf)? {
                replay.torn_at = Some(offset);
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len as u64 + 8 > file_len - offset {
                replay.torn_at = Some(offset);
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            let complete = read_fully(&mut reader, &mut payload)?
                && read_fully(&mut reader, &mut crc_buf)?;
            if !complete || u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.torn_at = Some(offset);
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => {
                    replay.torn_at = Some(offset);
                    break;
                }
            }
            offset += 8 + len as u64;
        }

        Ok(replay)
    }
}

/// `read_exact`, but `Ok(false)` on a short read.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
