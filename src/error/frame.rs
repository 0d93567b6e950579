//! The frame record itself.

use std::fmt;

/// `(tid, seqIndex)` — identifies the frame-sequence a frame belongs to.
/// Used only for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSeqId {
    pub tid: i32,
    pub seq_index: u32,
}

impl fmt::Display for FrameSeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tid, self.seq_index)
    }
}

/// One record pushed as an error propagates up the call stack. All
/// fields are `Copy`: frames reference `'static` strings (call-site
/// literals) rather than owning allocations, so recording a frame never
/// touches the allocator.
#[derive(Debug, Clone, Copy)]
pub struct ErrorFrame {
    pub file: &'static str,
    pub line: u32,
    pub func: &'static str,
    pub description: &'static str,
    /// `errno` captured at the point of failure. Arbitrary signed
    /// values are accepted here without validation, including negative
    /// ones synthesized by callers — never normalised.
    pub errno: i32,
    pub sequence: FrameSeqId,
}

impl fmt::Display for ErrorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) {} - errno {} ({}) [{}]",
            self.func,
            self.file,
            self.line,
            self.description,
            self.errno,
            crate::error::strerror(self.errno),
            self.sequence,
        )
    }
}

/// Which per-thread frame log is currently active. Exactly one is
/// current at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Thread,
    Signal,
}

impl StackKind {
    pub(crate) fn index(self) -> usize {
        match self {
            StackKind::Thread => 0,
            StackKind::Signal => 1,
        }
    }
}

impl Default for StackKind {
    fn default() -> Self {
        StackKind::Thread
    }
}
