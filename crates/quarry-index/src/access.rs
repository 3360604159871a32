use std::cell::Cell;

use quarry_core::IndexId;

use crate::{IndexError, Result};

thread_local! {
    static ACTIVE_INDEX: Cell<Option<IndexId>> = const { Cell::new(None) };
}

/// RAII marker for "this thread is currently inside this index".
///
/// Restores the previous state on drop so same-index nesting unwinds correctly.
#[derive(Debug)]
pub struct AccessToken {
    prev: Option<IndexId>,
}

/// Marks the current thread as processing `id`.
///
/// Entering a *different* index while one is active is a programming-contract violation
/// by a key/value extraction function: nested access risks deadlock across
/// differently-ordered index locks. It is reported as an error value (and logged), not
/// a panic. Re-entering the *same* index is allowed.
pub fn enter_index(id: IndexId) -> Result<AccessToken> {
    let prev = ACTIVE_INDEX.with(Cell::get);
    if let Some(active) = prev {
        if active != id {
            tracing::error!(
                target = "quarry.index",
                active = %active,
                requested = %id,
                "reentrant index access from a mapper; this risks deadlock"
            );
            return Err(IndexError::ReentrantAccess {
                active,
                requested: id,
            });
        }
    }
    ACTIVE_INDEX.with(|cell| cell.set(Some(id)));
    Ok(AccessToken { prev })
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        ACTIVE_INDEX.with(|cell| cell.set(self.prev));
    }
}
