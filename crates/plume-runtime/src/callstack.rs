// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The call stack (spec §4.2): a fixed-capacity array of frames. A frame
//! records enough of the caller's state to undo a call's effect on the
//! operand stack and resume execution after it (spec §4.4's call protocol).

use plume_types::{VmError, MAX_CALL_FRAMES};

/// One call frame. `restore_sp` is the operand stack depth *before* the
/// call's arguments were pushed, so `Return` can truncate the stack back to
/// it and push exactly one return value; `num_locals` is the callee's
/// declared local-space, used by `LoadLocal`/`StoreLocal` to find the start
/// of the locals region below `base_pointer`.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub return_pc: usize,
    pub restore_sp: usize,
    pub restore_bp: usize,
    pub num_locals: usize,
}

pub struct CallStack {
    frames: Vec<Frame>,
    capacity: usize,
}

impl CallStack {
    pub fn new() -> Self {
        CallStack::with_capacity(MAX_CALL_FRAMES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CallStack {
            frames: Vec::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), VmError> {
        if self.frames.len() >= self.capacity {
            return Err(VmError::CallStackOverflow { max: self.capacity });
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Frame, VmError> {
        self.frames.pop().ok_or(VmError::CallStackUnderflow)
    }

    /// The local-space of the currently executing frame, or 0 at the top
    /// level where there is no enclosing call (spec §4.2's implicit
    /// outermost frame has no declared locals of its own).
    pub fn current_locals(&self) -> usize {
        self.frames.last().map(|f| f.num_locals).unwrap_or(0)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl Default for CallStack {
    fn default() -> Self {
        CallStack::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let mut cs = CallStack::new();
        cs.push(Frame {
            return_pc: 4,
            restore_sp: 0,
            restore_bp: 0,
            num_locals: 2,
        })
        .unwrap();
        assert_eq!(cs.current_locals(), 2);
        let frame = cs.pop().unwrap();
        assert_eq!(frame.return_pc, 4);
        assert_eq!(cs.depth(), 0);
    }

    #[test]
    fn pop_on_empty_is_underflow() {
        let mut cs = CallStack::new();
        assert!(matches!(cs.pop(), Err(VmError::CallStackUnderflow)));
    }

    #[test]
    fn push_past_capacity_is_overflow() {
        let mut cs = CallStack::with_capacity(1);
        cs.push(Frame {
            return_pc: 0,
            restore_sp: 0,
            restore_bp: 0,
            num_locals: 0,
        })
        .unwrap();
        assert!(matches!(
            cs.push(Frame {
                return_pc: 0,
                restore_sp: 0,
                restore_bp: 0,
                num_locals: 0
            }),
            Err(VmError::CallStackOverflow { max: 1 })
        ));
    }
}
