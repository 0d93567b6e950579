//! Per-thread, per-stack-kind frame log with nestable sequence
//! checkpoints.

use std::cell::RefCell;

use crate::pid::current_tid;

use super::chunk::ChunkArena;
use super::frame::{ErrorFrame, FrameSeqId, StackKind};

/// A frozen `(begin, end)` window returned by [`StackState::push_sequence`]
/// and consumed by [`StackState::pop_sequence`].
#[derive(Debug, Clone, Copy)]
pub struct ErrorFrameSequence {
    begin: usize,
    end: usize,
    seq_index: u32,
}

impl ErrorFrameSequence {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

pub(crate) struct StackState {
    arena: ChunkArena,
    /// Start of the current open sequence.
    head: usize,
    head_seq_index: u32,
    /// One-past-the-last live frame; the next append point. May trail
    /// behind the arena's high-water mark after a `pop_sequence` rewinds
    /// it, in which case further appends overwrite the discarded frames
    /// rather than growing the arena.
    tail: usize,
    seq_counter: u32,
}

impl StackState {
    fn new() -> Self {
        Self {
            arena: ChunkArena::new(),
            head: 0,
            head_seq_index: 0,
            tail: 0,
            seq_counter: 1,
        }
    }

    pub fn offset(&self) -> usize {
        self.tail - self.head
    }

    pub fn sequence_id(&self) -> FrameSeqId {
        FrameSeqId {
            tid: current_tid().as_raw(),
            seq_index: self.head_seq_index,
        }
    }

    /// Collapses the current sequence to empty if it holds frames that
    /// were never explicitly propagated, discarding them and bumping the
    /// sequence index. Called at the top of every `error_if!` evaluation
    /// so that a failed-then-recovered sub-call never contributes frames
    /// to a later, unrelated failure in the caller.
    pub fn restart(&mut self) {
        if self.tail != self.head {
            self.head = self.tail;
            self.head_seq_index = self.seq_counter;
            self.seq_counter += 1;
        }
    }

    pub fn add_frame(&mut self, file: &'static str, line: u32, func: &'static str, description: &'static str, errno: i32) {
        let frame = ErrorFrame {
            file,
            line,
            func,
            description,
            errno,
            sequence: self.sequence_id(),
        };
        self.arena.write(self.tail, frame);
        self.tail += 1;
    }

    pub fn push_sequence(&mut self) -> ErrorFrameSequence {
        let saved = ErrorFrameSequence {
            begin: self.head,
            end: self.tail,
            seq_index: self.head_seq_index,
        };

        self.head = self.tail;
        self.head_seq_index = self.seq_counter;
        self.seq_counter += 1;

        saved
    }

    pub fn pop_sequence(&mut self, saved: ErrorFrameSequence) {
        self.restart();

        if self.seq_counter == self.head_seq_index + 1 {
            self.seq_counter = self.head_seq_index;
        }

        self.head_seq_index = saved.seq_index;
        self.head = saved.begin;
        self.tail = saved.end;
    }

    /// Materializes the frames in the currently-open sequence, oldest
    /// first.
    pub fn current_frames(&self) -> Vec<ErrorFrame> {
        (self.head..self.tail).map(|ix| self.arena.read(ix)).collect()
    }

    /// Pushes a sequence, pushes pre-built frames into it (used by
    /// `thaw`), leaving the sequence open.
    pub fn extend_current(&mut self, frames: &[ErrorFrame]) {
        for frame in frames {
            self.arena.write(self.tail, *frame);
            self.tail += 1;
        }
    }
}

pub(crate) struct ErrorFrameTls {
    stacks: [StackState; 2],
    current: StackKind,
}

impl ErrorFrameTls {
    fn new() -> Self {
        Self {
            stacks: [StackState::new(), StackState::new()],
            current: StackKind::Thread,
        }
    }

    pub fn current_mut(&mut self) -> &mut StackState {
        &mut self.stacks[self.current.index()]
    }

    pub fn current(&self) -> &StackState {
        &self.stacks[self.current.index()]
    }

    pub fn switch(&mut self, kind: StackKind) -> StackKind {
        std::mem::replace(&mut self.current, kind)
    }
}

thread_local! {
    pub(crate) static TLS: RefCell<ErrorFrameTls> = RefCell::new(ErrorFrameTls::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_discards_unpropagated_frames() {
        let mut stack = StackState::new();
        stack.restart();
        stack.add_frame("f", 1, "g", "d", -1);
        assert_eq!(stack.offset(), 1);

        // A later, unrelated operation restarts before adding its own
        // frame: the earlier one should no longer be visible.
        stack.restart();
        assert_eq!(stack.offset(), 0);
        stack.add_frame("f", 2, "h", "d2", -2);
        assert_eq!(stack.offset(), 1);
        assert_eq!(stack.current_frames()[0].errno, -2);
    }

    #[test]
    fn push_pop_is_balanced_regardless_of_failures() {
        let mut stack = StackState::new();
        stack.restart();
        stack.add_frame("f", 1, "outer", "d", -1);
        let pre_offset = stack.offset();

        let seq = stack.push_sequence();
        stack.add_frame("f", 2, "inner", "d", -99);
        stack.add_frame("f", 3, "inner2", "d", -98);
        stack.pop_sequence(seq);

        assert_eq!(stack.offset(), pre_offset);
        assert_eq!(stack.current_frames().len(), 1);
        assert_eq!(stack.current_frames()[0].errno, -1);
    }

    #[test]
    fn two_level_failure_accumulates_in_order() {
        let mut stack = StackState::new();

        // testFail1: asserts false, errno -1
        stack.restart();
        stack.add_frame("f", 10, "testFail1", "assert false", -1);

        // testFail2 wraps: errno -2
        stack.add_frame("f", 20, "testFail2", "wrap", -2);

        assert_eq!(stack.offset(), 2);
        let frames = stack.current_frames();
        assert_eq!(frames[0].errno, -1);
        assert_eq!(frames[1].errno, -2);
    }
}
