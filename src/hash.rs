//! Content ids: digests identifying a task's output.
//!
//! A task's id is a single hash over everything that can affect its output:
//! the command, its arguments, environment and stdin, plus the ids of all of
//! its sources.  If two tasks have the same id they are guaranteed to produce
//! the same output, so a cached output with a matching id can be reused
//! without running anything.
//!
//! The guarantee is only as good as the task definition: a task that reads a
//! file it did not declare as a source can produce different output under the
//! same id, and nothing here can detect that.

use crate::path::Path;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

/// A 32-byte digest.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(ContentId(out))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated, like a git hash.
        write!(f, "ContentId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The hash function capability.  The core never decides how bytes are
/// hashed, it only combines digests.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> ContentId;

    /// Hashes everything `reader` yields.  Must agree with `hash` over the
    /// same bytes.
    fn hash_reader(&self, reader: &mut dyn Read) -> std::io::Result<ContentId>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash(&self, bytes: &[u8]) -> ContentId {
        ContentId(*blake3::hash(bytes).as_bytes())
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> std::io::Result<ContentId> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            hasher.update(&buf[..n]);
        }
        Ok(ContentId(*hasher.finalize().as_bytes()))
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;
const RECORD_SEPARATOR: u8 = 0x1E;

/// Serializes the fields of a task into an unambiguous byte string.
/// Every variable-length field is length-prefixed, and the groups are
/// terminated by separators, so that no two distinct tasks serialize the same.
#[derive(Default)]
struct IdWriter(Vec<u8>);

impl IdWriter {
    fn write_str(&mut self, s: &str) {
        self.0.extend_from_slice(&(s.len() as u64).to_le_bytes());
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(UNIT_SEPARATOR);
    }

    fn write_id(&mut self, id: &ContentId) {
        self.0.extend_from_slice(id.as_bytes());
    }

    fn write_map(&mut self, map: &BTreeMap<String, String>) {
        for (name, value) in map {
            self.write_str(name);
            self.write_str(value);
        }
        self.end_group();
    }

    fn end_group(&mut self) {
        self.0.push(RECORD_SEPARATOR);
    }
}

/// The inputs of a task's id, already resolved.
pub struct IdInputs<'a> {
    pub cmd: &'a str,
    pub args: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub stdin: Option<&'a str>,
    /// Global settings shared by every task in a build, e.g. the base
    /// environment.  Changing it changes every id.
    pub scope: &'a BTreeMap<String, String>,
    /// Source paths with their resolved ids, in path order.
    pub sources: &'a [(Path, ContentId)],
}

pub fn task_id(hasher: &dyn ContentHasher, inputs: &IdInputs) -> ContentId {
    let mut w = IdWriter::default();
    w.write_str(inputs.cmd);
    w.end_group();
    for arg in inputs.args {
        w.write_str(arg);
    }
    w.end_group();
    w.write_map(inputs.env);
    match inputs.stdin {
        None => w.0.push(0),
        Some(stdin) => {
            w.0.push(1);
            w.write_str(stdin);
        }
    }
    w.end_group();
    w.write_map(inputs.scope);
    for (path, id) in inputs.sources {
        w.write_str(&path.to_string());
        w.write_id(id);
    }
    w.end_group();
    hasher.hash(&w.0)
}

/// The id of one target of a task.  Distinct targets of one task get
/// distinct ids.
pub fn target_id(hasher: &dyn ContentHasher, task: &ContentId, target: &Path) -> ContentId {
    let mut w = IdWriter::default();
    w.write_id(task);
    w.write_str(&target.to_string());
    hasher.hash(&w.0)
}

/// Stand-in id for a source that is neither produced by a task nor present on
/// disk.  Depends on the path so that two missing files differ.
pub fn missing_id(hasher: &dyn ContentHasher, path: &Path) -> ContentId {
    let mut w = IdWriter::default();
    w.write_str("\0missing");
    w.write_str(&path.to_string());
    hasher.hash(&w.0)
}

/// Hashes the contents of a file on disk, without reading it all into memory.
pub fn hash_file(hasher: &dyn ContentHasher, path: &std::path::Path) -> std::io::Result<ContentId> {
    let mut file = std::fs::File::open(path)?;
    hasher.hash_reader(&mut file)
}
