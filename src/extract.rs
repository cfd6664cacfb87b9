//! Typed kernel-event field extraction.
//!
//! The capture engine exposes event data as opaque buffers. This module
//! owns the catalogue of fields the collector knows how to pull out of
//! them. Resolving a field against the engine is expensive, so it happens
//! exactly once per field when [`EventExtractor::init`] runs and the
//! resulting bindings are reused for every subsequent event until
//! [`EventExtractor::reset`]. Extraction itself never fails the pipeline:
//! unsupported fields, events without a value and byte-width disagreements
//! all collapse to `None`.

use std::ffi::CStr;
use std::mem::size_of;
use std::time::Duration;

use log::{debug, warn};

use crate::source::{FieldHandle, FieldResolver, SourceEvent, ThreadInfo};
use crate::util::Throttle;

/// Minimum delay between two width-mismatch diagnostics for one field.
const WIDTH_WARN_PERIOD: Duration = Duration::from_secs(30);

/// Resolution domain of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Read straight out of the thread metadata attached to the event.
    ThreadMirror,
    /// Looked up through the capture engine's own field schema.
    Expression,
}

/// Shape of an extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Fixed-width binary scalar, the byte width is part of the contract.
    Scalar(usize),
    /// NUL terminated text.
    Text,
}

/// Immutable declaration of one extractable field.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// Stable name, used for expression resolution and diagnostics.
    pub name: &'static str,
    pub domain: Domain,
    pub kind: ValueKind,
}

/// Fixed-width scalar types extractable from event buffers.
pub trait ScalarValue: Copy {
    const WIDTH: usize;

    /// Native-endian decoding, `None` when the buffer width disagrees.
    fn read_ne(buf: &[u8]) -> Option<Self>;
}

macro_rules! impl_scalar_value {
    ($($t:ty),+) => {
        $(
            impl ScalarValue for $t {
                const WIDTH: usize = size_of::<$t>();

                #[inline]
                fn read_ne(buf: &[u8]) -> Option<Self> {
                    Some(<$t>::from_ne_bytes(buf.try_into().ok()?))
                }
            }
        )+
    };
}

impl_scalar_value!(u16, i32, u32, i64, u64);

/// Lifecycle-scoped resolution state of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// No initialization happened since construction or the last reset.
    Unresolved,
    /// Thread-mirror field, readable whenever the event has thread info.
    Thread,
    /// Expression resolved by the capture engine.
    Expression(FieldHandle),
    /// The engine rejected the expression, permanent until re-init.
    Failed,
}

/// Owns one binding per declared field and drives their lifecycle across
/// capture-engine restarts. Pairing an engine restart with
/// [`EventExtractor::reset`] and [`EventExtractor::init`] is the caller's
/// responsibility, stale bindings are never detected.
pub struct EventExtractor {
    bindings: [Binding; Field::COUNT],
    width_warns: [Throttle; Field::COUNT],
}

impl Default for EventExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExtractor {
    pub fn new() -> Self {
        const WARN: Throttle = Throttle::new(WIDTH_WARN_PERIOD);
        Self {
            bindings: [Binding::Unresolved; Field::COUNT],
            width_warns: [WARN; Field::COUNT],
        }
    }

    /// Resolves every declared field against `source`. Implicitly resets
    /// first, so calling it while already initialized is safe. Individual
    /// resolution failures are recorded and the affected fields stay
    /// absent until the next init, no resolution is ever retried in
    /// between.
    pub fn init<R: FieldResolver + ?Sized>(&mut self, source: &mut R) {
        self.reset();

        let mut failed = 0usize;
        for &field in Field::VARIANTS {
            let desc = field.descriptor();
            self.bindings[field as usize] = match desc.domain {
                Domain::ThreadMirror => Binding::Thread,
                Domain::Expression => match source.resolve(desc.name) {
                    Ok(handle) => Binding::Expression(handle),
                    Err(e) => {
                        warn!("cannot extract field {}: {e}", desc.name);
                        failed += 1;
                        Binding::Failed
                    }
                },
            };
        }

        debug!(
            "field resolution done, {}/{} fields available",
            Field::COUNT - failed,
            Field::COUNT
        );
    }

    /// Drops every binding. Until the next [`EventExtractor::init`] all
    /// getters return `None`.
    pub fn reset(&mut self) {
        self.bindings = [Binding::Unresolved; Field::COUNT];
    }

    /// True once [`EventExtractor::init`] ran and bindings are live.
    pub fn is_ready(&self) -> bool {
        !matches!(self.bindings[0], Binding::Unresolved)
    }

    /// True when `field` resolved during the last init. This is what lets
    /// a consumer tell "the engine cannot provide this field at all" from
    /// "this particular event has no value for it".
    pub fn is_available(&self, field: Field) -> bool {
        !matches!(
            self.bindings[field as usize],
            Binding::Unresolved | Binding::Failed
        )
    }

    fn handle(&self, field: Field) -> Option<FieldHandle> {
        match self.bindings[field as usize] {
            Binding::Expression(handle) => Some(handle),
            _ => None,
        }
    }

    fn thread<'e, E: SourceEvent + ?Sized>(
        &self,
        field: Field,
        event: &'e E,
    ) -> Option<&'e ThreadInfo> {
        match self.bindings[field as usize] {
            Binding::Thread => event.thread_info(),
            _ => None,
        }
    }

    /// Extracts `field` from `event` as a fixed-width scalar. Returns
    /// `None` when the field is unresolved, the event carries no value, or
    /// the source returns a buffer whose width disagrees with the
    /// declaration. A width mismatch is never truncated or reinterpreted
    /// and is logged at most once per 30 seconds per field.
    pub fn scalar<T: ScalarValue, E: SourceEvent + ?Sized>(
        &self,
        field: Field,
        event: &E,
    ) -> Option<T> {
        debug_assert_eq!(field.descriptor().kind, ValueKind::Scalar(T::WIDTH));

        let buf = event.field_bytes(self.handle(field)?)?;
        if buf.len() != T::WIDTH {
            if self.width_warns[field as usize].allow() {
                warn!(
                    "failed to extract value for field {}: expected {} bytes, returned value has {}",
                    field.name(),
                    T::WIDTH,
                    buf.len()
                );
            }
            return None;
        }

        T::read_ne(buf)
    }

    /// Extracts `field` from `event` as text borrowed from the event
    /// buffer. The value is only valid while `event` lives.
    pub fn text<'e, E: SourceEvent + ?Sized>(&self, field: Field, event: &'e E) -> Option<&'e str> {
        let buf = event.field_bytes(self.handle(field)?)?;
        // source contract: text buffers are NUL terminated
        CStr::from_bytes_until_nul(buf).ok()?.to_str().ok()
    }
}

/// Declares the closed set of extractable fields: identity, getter name,
/// resolution domain and value shape. Thread-mirror entries read the
/// matching [`ThreadInfo`] member, expression entries resolve the given
/// name through the capture engine. Adding a field means adding one line
/// here.
macro_rules! event_fields {
    (
        $(
            $variant:ident ( $getter:ident ) => $dom:ident $(( $expr:literal ))? : $ty:ident
        ),+ $(,)?
    ) => {
        /// Identity of every field the collector can extract. The set is
        /// closed at build time.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Field {
            $($variant),+
        }

        /// Descriptor table, indexed by [`Field`] discriminant.
        pub static FIELDS: [FieldDescriptor; Field::COUNT] = [
            $(
                FieldDescriptor {
                    name: event_fields!(@name $dom $getter $(($expr))?),
                    domain: event_fields!(@domain $dom),
                    kind: event_fields!(@kind $ty),
                }
            ),+
        ];

        impl Field {
            pub const VARIANTS: &'static [Field] = &[$(Field::$variant),+];
            pub const COUNT: usize = Self::VARIANTS.len();

            #[inline]
            pub fn descriptor(self) -> &'static FieldDescriptor {
                &FIELDS[self as usize]
            }

            #[inline]
            pub fn name(self) -> &'static str {
                self.descriptor().name
            }

            /// Field declared for a capture expression name, if any.
            pub fn from_expr(expr: &str) -> Option<Field> {
                Self::VARIANTS.iter().copied().find(|f| {
                    f.descriptor().domain == Domain::Expression && f.name() == expr
                })
            }

            pub fn from_index(index: usize) -> Option<Field> {
                Self::VARIANTS.get(index).copied()
            }
        }

        impl EventExtractor {
            $(
                event_fields!(@getter $variant $getter $dom $ty);
            )+
        }
    };

    (@name thread $getter:ident) => {
        stringify!($getter)
    };
    (@name expr $getter:ident ($expr:literal)) => {
        $expr
    };
    (@domain thread) => {
        Domain::ThreadMirror
    };
    (@domain expr) => {
        Domain::Expression
    };
    (@kind str) => {
        ValueKind::Text
    };
    (@kind $t:ty) => {
        ValueKind::Scalar(size_of::<$t>())
    };

    (@getter $variant:ident $getter:ident thread str) => {
        pub fn $getter<'e, E: SourceEvent + ?Sized>(&self, event: &'e E) -> Option<&'e str> {
            self.thread(Field::$variant, event).map(|t| t.$getter.as_str())
        }
    };
    (@getter $variant:ident $getter:ident thread $t:ty) => {
        pub fn $getter<E: SourceEvent + ?Sized>(&self, event: &E) -> Option<$t> {
            self.thread(Field::$variant, event).map(|t| t.$getter)
        }
    };
    (@getter $variant:ident $getter:ident expr str) => {
        pub fn $getter<'e, E: SourceEvent + ?Sized>(&self, event: &'e E) -> Option<&'e str> {
            self.text(Field::$variant, event)
        }
    };
    (@getter $variant:ident $getter:ident expr $t:ty) => {
        pub fn $getter<E: SourceEvent + ?Sized>(&self, event: &E) -> Option<$t> {
            self.scalar::<$t, E>(Field::$variant, event)
        }
    };
}

event_fields! {
    // Container related fields
    ContainerId(container_id) => thread: str,
    ContainerPrivileged(container_privileged) => expr("container.privileged"): u32,

    // Process related fields
    Comm(comm) => thread: str,
    Exe(exe) => thread: str,
    Exepath(exepath) => thread: str,
    Pid(pid) => thread: i64,
    Tid(tid) => thread: i64,
    Uid(uid) => thread: u32,
    Gid(gid) => thread: u32,
    ProcName(proc_name) => expr("proc.name"): str,
    ProcPname(proc_pname) => expr("proc.pname"): str,
    ProcArgs(proc_args) => expr("proc.args"): str,
    Exeline(exeline) => expr("proc.exeline"): str,
    Cmdline(cmdline) => expr("proc.cmdline"): str,
    UserName(user_name) => expr("user.name"): str,
    Cwd(cwd) => expr("proc.cwd"): str,
    Ppid(ppid) => expr("proc.ppid"): i64,

    // General event information
    EventRawRes(event_rawres) => expr("evt.rawres"): i64,
    EvtArgs(evt_args) => expr("evt.args"): str,
    EvtArgName(evt_arg_name) => expr("evt.arg.name"): str,
    EvtArgNewpath(evt_arg_newpath) => expr("evt.arg.newpath"): str,
    EvtArgOldpath(evt_arg_oldpath) => expr("evt.arg.oldpath"): str,
    EvtArgPath(evt_arg_path) => expr("evt.arg.path"): str,
    EvtArgTarget(evt_arg_target) => expr("evt.arg.target"): str,
    EvtArgLinkpath(evt_arg_linkpath) => expr("evt.arg.linkpath"): str,
    EvtArgFd(evt_arg_fd) => expr("evt.rawarg.fd"): i64,
    EvtArgFlags(evt_arg_flags) => expr("evt.rawarg.flags"): i32,
    EvtArgOlddir(evt_arg_olddir) => expr("evt.rawarg.olddir"): i64,
    EvtArgNewdir(evt_arg_newdir) => expr("evt.rawarg.newdir"): i64,
    EvtArgOlddirfd(evt_arg_olddirfd) => expr("evt.rawarg.olddirfd"): i64,
    EvtArgNewdirfd(evt_arg_newdirfd) => expr("evt.rawarg.newdirfd"): i64,
    EvtArgLinkdirfd(evt_arg_linkdirfd) => expr("evt.rawarg.linkdirfd"): i64,
    EvtArgDirfd(evt_arg_dirfd) => expr("evt.rawarg.dirfd"): i64,

    // File and network related fields
    ClientPort(client_port) => expr("fd.cport"): u16,
    ServerPort(server_port) => expr("fd.sport"): u16,
    FdName(fd_name) => expr("fd.name"): str,
}
