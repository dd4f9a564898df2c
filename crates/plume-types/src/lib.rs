// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Shared value encoding, opcode table and fatal-error taxonomy for the
//! Plume virtual machine.

pub mod error;
pub mod opcode;
pub mod value;

pub use error::VmError;
pub use opcode::{ComparisonOp, Opcode, MAX_OPCODE_NUMBER};
pub use value::{HeapBox, HeapData, HeapTag, Value, ValueKind};

/// Maximum number of call-stack frames (spec: "up to 1024 frames").
pub const MAX_CALL_FRAMES: usize = 1024;
