#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::EngineError;

/// Mutation currently holding a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Append,
    Edit,
    Regenerate,
    DeleteLast,
}

impl Operation {
    /// Whether the operation streams a generated answer.
    pub fn is_generation(&self) -> bool {
        !matches!(self, Operation::DeleteLast)
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Append => write!(f, "append"),
            Operation::Edit => write!(f, "edit"),
            Operation::Regenerate => write!(f, "regenerate"),
            Operation::DeleteLast => write!(f, "delete"),
        }
    }
}

type LockTable = Arc<Mutex<HashMap<String, Operation>>>;

/// Per-session exclusion tokens. At most one mutation holds a session at a
/// time; a second one is refused rather than queued.
#[derive(Default, Clone)]
pub struct SessionLocks {
    table: LockTable,
}

/// Token for one session, released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    table: LockTable,
    session_id: String,
    operation: Operation,
}

impl SessionLocks {
    pub fn try_acquire(
        &self,
        session_id: &str,
        operation: Operation,
    ) -> Result<SessionGuard, EngineError> {
        let mut table = lock(&self.table);
        if let Some(holder) = table.get(session_id) {
            return Err(EngineError::conflict(format!(
                "session {} is busy with another {} request",
                session_id, holder
            )));
        }
        table.insert(session_id.to_string(), operation);

        Ok(SessionGuard {
            table: self.table.clone(),
            session_id: session_id.to_string(),
            operation,
        })
    }

    pub fn holder(&self, session_id: &str) -> Option<Operation> {
        lock(&self.table).get(session_id).copied()
    }
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.session_id);
    }
}

// A poisoned table still holds consistent entries: every mutation is a single
// insert or remove.
fn lock(table: &LockTable) -> MutexGuard<'_, HashMap<String, Operation>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
