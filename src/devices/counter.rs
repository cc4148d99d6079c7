//! Reference count guarding idempotent attach/detach.

use std::sync::Mutex;

use crate::{Error, Result};

/// Number of holders depending on a device being attached.
///
/// The count only moves through [`AttachCounter::bump`] and never goes
/// negative.
#[derive(Debug, Default)]
pub struct AttachCounter {
    count: Mutex<u32>,
}

impl AttachCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of holders.
    pub fn count(&self) -> u32 {
        match self.count.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Adjust the count by one and report whether the caller should skip the
    /// real hotplug/unplug.
    ///
    /// Increment returns `false` only on 0 -> 1. Decrement returns `false` only
    /// on 1 -> 0 and fails with [`Error::InvalidState`] at 0, leaving the count
    /// untouched.
    pub fn bump(&self, increment: bool) -> Result<bool> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| Error::InvalidState("attach counter lock poisoned".into()))?;

        if increment {
            *count = count.checked_add(1).ok_or_else(|| {
                Error::InvalidState("attach count overflow".into())
            })?;
            return Ok(*count > 1);
        }

        if *count == 0 {
            return Err(Error::InvalidState(
                "detaching a device that is not attached (more detaches than attaches)".into(),
            ));
        }
        *count -= 1;
        Ok(*count > 0)
    }
}
