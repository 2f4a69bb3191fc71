use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// File magic, written once at offset 0.
const MAGIC: &[u8; 8] = b"GEARWAL1";
/// Anything larger is treated as a torn length prefix.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One step of the replay reader.
enum Frame {
    /// A decoded event and the bytes its frame occupies on disk.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Partial or corrupt tail; replay stops here.
    Torn,
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut head = [0u8; 8];
    match read_full(reader, &mut head)? {
        0 => return Ok(Frame::End),
        n if n < head.len() => return Ok(Frame::Torn),
        _ => {}
    }
    let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    let crc = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    if len > MAX_FRAME_BYTES {
        return Ok(Frame::Torn);
    }
    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len || crc32fast::hash(&payload) != crc {
        return Ok(Frame::Torn);
    }
    let size = (head.len() + len) as u64;
    Ok(bincode::deserialize::<Event>(&payload).map_or(Frame::Torn, |e| Frame::Event(e, size)))
}

/// Like `read_exact`, but reports how much was read instead of failing on EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Append-only event log.
///
/// Layout: the 8-byte magic, then frames of `[u32 len][u32 crc32][bincode Event]`
/// (little-endian). A torn tail left by a crash is cut off when the log is opened,
/// so new frames always follow the last intact one.
pub struct Wal {
    file: File,
    path: PathBuf,
    appends_since_compact: u64,
    /// Set when a failed write could not be rolled back; cleared by compaction.
    poisoned: bool,
}

/// What a scan of the log found: the intact events and where they end.
struct Scan {
    events: Vec<Event>,
    intact_len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Open the log for appending and return every intact event in it. Bytes past
    /// the last intact frame are truncated away before anything new is written.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Scan { events, intact_len } = Self::scan(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        if len > intact_len {
            tracing::warn!(
                discarded = len - intact_len,
                recovered = events.len(),
                "truncating torn tail of {}",
                path.display()
            );
            file.set_len(intact_len)?;
        }
        if intact_len == 0 {
            file.write_all(MAGIC)?;
        }
        if len != intact_len || intact_len == 0 {
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            poisoned: false,
        };
        Ok((wal, events))
    }

    /// Append one framed event to `buf`.
    pub fn encode_frame(buf: &mut Vec<u8>, event: &Event) -> io::Result<()> {
        let payload = bincode::serialize(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large"));
        }
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Write pre-encoded frames with one write and one fsync. On failure the file
    /// is cut back to its previous length so a rejected batch never replays.
    pub fn write_frames(&mut self, frames: &[u8], count: u64) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL has an unrecoverable partial write"));
        }
        let before = self.file.metadata()?.len();
        let written = self
            .file
            .write_all(frames)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(before).and_then(|()| self.file.sync_data()) {
                tracing::error!(error = %rollback, "WAL rollback failed, refusing further appends");
                self.poisoned = true;
            }
            return Err(e);
        }
        self.appends_since_compact += count;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        let mut buf = Vec::new();
        Self::encode_frame(&mut buf, event)?;
        self.write_frames(&buf, 1)
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a sibling temp file, fsync it,
    /// then rename it over the live file.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut buf = MAGIC.to_vec();
        for event in events {
            Self::encode_frame(&mut buf, event)?;
        }
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Every intact event in order. A missing file is an empty log; a file with
    /// the wrong magic is refused.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|scan| scan.events)
    }

    fn scan(path: &Path) -> io::Result<Scan> {
        let empty = Scan {
            events: Vec::new(),
            intact_len: 0,
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        let got = read_full(&mut reader, &mut magic)?;
        if got < magic.len() {
            // Crashed before the header made it out.
            return Ok(empty);
        }
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a gearbook WAL", path.display()),
            ));
        }

        let mut events = Vec::new();
        let mut intact_len = MAGIC.len() as u64;
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    events.push(event);
                    intact_len += size;
                }
                Frame::End => break,
                Frame::Torn => {
                    tracing::warn!(
                        recovered = events.len(),
                        "discarding torn tail of {}",
                        path.display()
                    );
                    break;
                }
            }
        }
        Ok(Scan { events, intact_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gearbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(equipment_id: Ulid) -> Event {
        Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                user_id: Ulid::new(),
                equipment_id,
                unit: 0,
                span: Span::new(1_000, 2_000),
                actual_start: None,
                actual_end: None,
                status: Status::Pending,
                history: Vec::new(),
                notes: Notes::default(),
                created_at: 1,
                updated_at: 1,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let eid = Ulid::new();
        let first = created(eid);
        let Event::ReservationCreated { reservation } = &first else {
            unreachable!()
        };
        let events = vec![
            first.clone(),
            Event::StatusChanged {
                id: reservation.id,
                equipment_id: eid,
                from: Status::Pending,
                to: Status::Confirmed,
                changed_by: Ulid::new(),
                reason: Some("approved".into()),
                changed_at: 5,
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn batch_of_frames_replays_in_order() {
        let path = tmp_path("batch.wal");
        let events: Vec<Event> = (0..5).map(|_| created(Ulid::new())).collect();
        let mut buf = Vec::new();
        for e in &events {
            Wal::encode_frame(&mut buf, e).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        wal.write_frames(&buf, events.len() as u64).unwrap();
        assert_eq!(wal.appends_since_compact(), 5);
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn.wal");
        let event = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // Half a frame header, as if the process died mid-write.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 5]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn reopening_cuts_torn_tail_before_appending() {
        let path = tmp_path("torn_reopen.wal");
        let first = created(Ulid::new());
        let second = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 5]).unwrap();
        }
        {
            let (mut wal, recovered) = Wal::recover(&path).unwrap();
            assert_eq!(recovered, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn short_header_is_rewritten() {
        let path = tmp_path("short_header.wal");
        fs::write(&path, &MAGIC[..3]).unwrap();
        let event = created(Ulid::new());
        {
            let (mut wal, recovered) = Wal::recover(&path).unwrap();
            assert!(recovered.is_empty());
            wal.append(&event).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&created(Ulid::new())).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn foreign_file_is_refused() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"definitely not a wal").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let eid = Ulid::new();
        let keep = created(eid);
        let later = created(eid);
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&created(eid)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
        assert!(!path.with_extension("wal.tmp").exists());
    }
}
