//! Interface between the collector and the kernel-event capture engine.
//!
//! The extraction engine only ever talks to the capture engine through the
//! three operations below: resolving a named field once at initialization
//! time, pulling the raw bytes of a resolved field out of one event, and
//! looking up the thread metadata attached to an event. Anything
//! implementing these traits can feed the collector, including the JSONL
//! replay source shipped for the `replay` subcommand and the test suite.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod replay;

/// Engine-side handle for a resolved field expression. It is only
/// meaningful for the capture-engine instance which issued it and becomes
/// stale when that instance is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHandle(u64);

impl FieldHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("field {0} is not supported by this capture engine")]
    Unsupported(String),
    #[error("capture engine error: {0}")]
    Engine(String),
}

/// Field resolution side of a capture engine. Resolution is expensive and
/// is only performed while the extractor (re)initializes.
pub trait FieldResolver {
    fn resolve(&mut self, expr: &str) -> Result<FieldHandle, ResolveError>;
}

/// Per-task state the capture engine mirrors into every event it can
/// associate with a thread.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadInfo {
    pub pid: i64,
    pub tid: i64,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub exe: String,
    pub exepath: String,
    /// Empty when the task does not run in a container.
    pub container_id: String,
}

/// One event handed out by the capture engine. The engine owns the backing
/// memory and may reuse it, none of the returned references survive the
/// event.
pub trait SourceEvent {
    /// Raw bytes for a field resolved at initialization time. `None` when
    /// the event carries no value for it. Text buffers are NUL terminated
    /// by source contract.
    fn field_bytes(&self, handle: FieldHandle) -> Option<&[u8]>;

    /// Thread metadata for this event, `None` for events not associated
    /// with any task.
    fn thread_info(&self) -> Option<&ThreadInfo>;
}
