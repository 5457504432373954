//! The record of what was last built: for each target, the content id of the
//! output currently on disk.

use crate::hash::ContentId;
use crate::path::Path;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

pub trait Cache {
    /// The id of the output last stored for `target`, if any.
    fn lookup(&self, target: &Path) -> Option<ContentId>;

    /// Records that `target` on disk now holds the output with id `id`.
    fn store(&mut self, target: &Path, id: ContentId) -> anyhow::Result<()>;

    /// Records that nothing is known about what `target` on disk holds, e.g.
    /// because a failed run may have rewritten it.
    fn forget(&mut self, target: &Path) -> anyhow::Result<()>;
}

/// An in-memory cache.  Clones share the same entries, so a caller can keep a
/// handle to inspect what a build stored.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Rc<RefCell<FxHashMap<Path, ContentId>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: &Path) -> Option<ContentId> {
        self.entries.borrow().get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn lookup(&self, target: &Path) -> Option<ContentId> {
        self.get(target)
    }

    fn store(&mut self, target: &Path, id: ContentId) -> anyhow::Result<()> {
        self.entries.borrow_mut().insert(target.clone(), id);
        Ok(())
    }

    fn forget(&mut self, target: &Path) -> anyhow::Result<()> {
        self.entries.borrow_mut().remove(target);
        Ok(())
    }
}
