//! Per-sandbox block index allocation.
//!
//! Each attached block device holds one ordinal; the guest agent uses it to
//! predict the device node name. Indices are handed out lowest-free-first so
//! a released index is reused by the next attach.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug)]
pub struct BlockIndexAllocator {
    max_index: u32,
    used: Mutex<BTreeSet<u32>>,
}

impl BlockIndexAllocator {
    /// Allocator handing out indices `0..=max_index`.
    pub fn new(max_index: u32) -> Self {
        Self {
            max_index,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Claim the lowest free index.
    pub fn get_and_set(&self) -> Result<u32> {
        let mut used = self
            .used
            .lock()
            .map_err(|_| Error::AllocationFailure("block index lock poisoned".into()))?;

        let index = (0..=self.max_index)
            .find(|i| !used.contains(i))
            .ok_or_else(|| {
                Error::AllocationFailure(format!(
                    "all {} block indices are in use",
                    u64::from(self.max_index) + 1
                ))
            })?;
        used.insert(index);
        debug!(index, "allocated block index");
        Ok(index)
    }

    /// Return `index` to the pool. Releasing a free index is a no-op.
    pub fn release(&self, index: u32) {
        let mut used = match self.used.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !used.remove(&index) {
            warn!(index, "released block index that was not allocated");
        }
    }

    /// Indices currently held, ascending.
    pub fn in_use(&self) -> Vec<u32> {
        match self.used.lock() {
            Ok(guard) => guard.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }
}
