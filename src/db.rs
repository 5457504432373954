//! The taskforce database stores the content id of every target built, so a
//! later build can tell which outputs are up to date.
//!
//! The file is an append-only log: a header, then one record per change.  A
//! record is a little-endian u16 name length, the target's path in its string
//! form, and the 32-byte id.  When the length's top bit is set the record
//! has no id and instead forgets the target.  When a target appears more than
//! once the last record wins.

use crate::cache::Cache;
use crate::hash::ContentId;
use crate::path::Path;
use anyhow::{anyhow, bail, Context};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"tfdb";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
const FORGET_BIT: u16 = 0b1000_0000_0000_0000;

pub struct Db {
    ids: FxHashMap<Path, ContentId>,
    w: BufWriter<File>,
}

struct Reader<R> {
    r: R,
    /// Offset just past the last complete record.
    good: u64,
}

impl<R: Read> Reader<R> {
    /// Reads exactly `buf.len()` bytes; Ok(false) on a clean or torn EOF.
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<bool> {
        match self.r.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// A record's target, and its id unless the record forgets it.
    fn read_record(&mut self) -> anyhow::Result<Option<(Path, Option<ContentId>)>> {
        let mut len = [0u8; 2];
        if !self.fill(&mut len)? {
            return Ok(None);
        }
        let len = u16::from_le_bytes(len);
        let forget = len & FORGET_BIT != 0;
        let len = (len & !FORGET_BIT) as usize;
        let mut name = vec![0u8; len];
        if !self.fill(&mut name)? {
            return Ok(None);
        }
        let mut id = [0u8; 32];
        if !forget && !self.fill(&mut id)? {
            return Ok(None);
        }
        let name = String::from_utf8(name).map_err(|_| anyhow!("non-utf8 target name"))?;
        let path = name
            .parse()
            .with_context(|| format!("bad target name {:?}", name))?;
        if forget {
            self.good += (2 + len) as u64;
            Ok(Some((path, None)))
        } else {
            self.good += (2 + len + 32) as u64;
            Ok(Some((path, Some(ContentId(id)))))
        }
    }
}

fn read(f: &mut File) -> anyhow::Result<(FxHashMap<Path, ContentId>, u64)> {
    let mut r = Reader {
        r: BufReader::new(&mut *f),
        good: HEADER_LEN,
    };
    let mut header = [0u8; HEADER_LEN as usize];
    if !r.fill(&mut header)? {
        bail!("truncated header");
    }
    if &header[..4] != MAGIC {
        bail!("not a taskforce database");
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != VERSION {
        bail!("database version {} does not match {}", version, VERSION);
    }

    let mut ids = FxHashMap::default();
    while let Some((path, id)) = r.read_record()? {
        match id {
            Some(id) => ids.insert(path, id),
            None => ids.remove(&path),
        };
    }
    Ok((ids, r.good))
}

/// Opens the database at `path`, creating it if it does not exist.
pub fn open(path: &std::path::Path) -> anyhow::Result<Db> {
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let len = f.metadata()?.len();

    let ids = if len == 0 {
        f.write_all(MAGIC)?;
        f.write_all(&VERSION.to_le_bytes())?;
        FxHashMap::default()
    } else {
        let (ids, good) = read(&mut f).with_context(|| format!("read {}", path.display()))?;
        if good < len {
            // A build was interrupted mid-write; drop the partial record so
            // new records land on a record boundary.
            warn!(path = %path.display(), "truncating torn database record");
            f.set_len(good)?;
        }
        ids
    };
    f.seek(SeekFrom::End(0))?;
    debug!(path = %path.display(), entries = ids.len(), "opened db");
    Ok(Db {
        ids,
        w: BufWriter::new(f),
    })
}

impl Db {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn write_record(&mut self, name: &str, id: Option<&ContentId>) -> anyhow::Result<()> {
        let len = match u16::try_from(name.len()) {
            Ok(len) if len & FORGET_BIT == 0 => len,
            _ => bail!("target name too long: {}", name),
        };
        let tag = if id.is_none() { FORGET_BIT } else { 0 };
        self.w.write_all(&(len | tag).to_le_bytes())?;
        self.w.write_all(name.as_bytes())?;
        if let Some(id) = id {
            self.w.write_all(id.as_bytes())?;
        }
        self.w.flush()?;
        Ok(())
    }
}

impl Cache for Db {
    fn lookup(&self, target: &Path) -> Option<ContentId> {
        self.ids.get(target).copied()
    }

    fn store(&mut self, target: &Path, id: ContentId) -> anyhow::Result<()> {
        if self.ids.get(target) == Some(&id) {
            return Ok(());
        }
        self.write_record(&target.to_string(), Some(&id))?;
        self.ids.insert(target.clone(), id);
        Ok(())
    }

    fn forget(&mut self, target: &Path) -> anyhow::Result<()> {
        if !self.ids.contains_key(target) {
            return Ok(());
        }
        self.write_record(&target.to_string(), None)?;
        self.ids.remove(target);
        Ok(())
    }
}
