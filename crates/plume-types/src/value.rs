// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The NaN-boxed value encoding (spec §3.1). A [`Value`] is a single 64-bit
//! word; [`Value::kind`] is the total decode function every opcode
//! implementation should go through instead of touching the bit layout
//! directly.
//!
//! The mask layout mirrors the reference C implementation
//! (`examples/original_source/include/value.h`) exactly: the sign bit marks
//! heap pointers, quiet-NaN payload bits 48-50 encode the short-type tag,
//! and payload bits 0-47 hold the small payload or heap pointer.

use std::fmt;

use crate::error::VmError;

const MASK_SIGN: u64 = 0x8000_0000_0000_0000;
const MASK_EXPONENT: u64 = 0x7ff0_0000_0000_0000;
const MASK_QUIET: u64 = 0x0008_0000_0000_0000;
const MASK_SIGNATURE: u64 = 0xffff_0000_0000_0000;
const MASK_PAYLOAD_PTR: u64 = 0x0000_ffff_ffff_ffff;
const MASK_PAYLOAD_INT: u64 = 0x0000_0000_ffff_ffff;

const TYPE_SPECIAL: u64 = 0x0001_0000_0000_0000;
const TYPE_INTEGER: u64 = 0x0002_0000_0000_0000;
const TYPE_FUNCENV: u64 = 0x0005_0000_0000_0000;
const TYPE_FUNCTION: u64 = 0x0006_0000_0000_0000;

const K_NAN: u64 = MASK_EXPONENT | MASK_QUIET;
const K_NULL: u64 = K_NAN | TYPE_SPECIAL;

const SIGNATURE_NAN: u64 = K_NAN;
const SIGNATURE_SPECIAL: u64 = K_NULL;
const SIGNATURE_INTEGER: u64 = K_NAN | TYPE_INTEGER;
const SIGNATURE_FUNCTION: u64 = K_NAN | TYPE_FUNCTION;
const SIGNATURE_FUNCENV: u64 = K_NAN | TYPE_FUNCENV;
const SIGNATURE_POINTER: u64 = K_NAN | MASK_SIGN;

/// A single 64-bit NaN-boxed VM value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value(u64);

/// The nine variants a [`Value`] can decode to (spec §3.1, "type totality").
#[derive(Debug, Clone, Copy)]
pub enum ValueKind {
    Integer(i32),
    Float(f64),
    Special,
    /// A code offset + local-space count: an un-closured callable.
    Function { code_pc: u16, local_space: u16 },
    /// A return-pc/stack-pointer/base-pointer snapshot, used when
    /// suspending execution across calls.
    FuncEnv {
        return_pc: u16,
        saved_sp: u16,
        saved_bp: u16,
    },
    String(HeapRef),
    List(HeapRef),
    Closure(HeapRef),
    Mutable(HeapRef),
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Integer(_) => "integer",
            ValueKind::Float(_) => "float",
            ValueKind::Special => "special",
            ValueKind::Function { .. } => "function",
            ValueKind::FuncEnv { .. } => "func-env",
            ValueKind::String(_) => "string",
            ValueKind::List(_) => "list",
            ValueKind::Closure(_) => "closure",
            ValueKind::Mutable(_) => "mutable",
        }
    }
}

/// The tag a heap box carries, discriminating what its body means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapTag {
    String,
    List,
    Closure,
    Mutable,
}

/// The body of a heap box: either raw string bytes, or a contiguous array
/// of values (used by lists, the fixed-length-2 closure box, and the
/// fixed-length-1 mutable cell).
#[derive(Debug, Clone)]
pub enum HeapData {
    Bytes(Vec<u8>),
    Values(Vec<Value>),
}

/// `{ type, length, body }` (spec §3.1).
#[derive(Debug, Clone)]
pub struct HeapBox {
    pub tag: HeapTag,
    pub data: HeapData,
}

impl HeapBox {
    pub fn len(&self) -> usize {
        match &self.data {
            HeapData::Bytes(b) => b.len(),
            HeapData::Values(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            HeapData::Bytes(b) => Some(b),
            HeapData::Values(_) => None,
        }
    }

    pub fn as_values(&self) -> Option<&[Value]> {
        match &self.data {
            HeapData::Values(v) => Some(v),
            HeapData::Bytes(_) => None,
        }
    }

    pub fn as_values_mut(&mut self) -> Option<&mut [Value]> {
        match &mut self.data {
            HeapData::Values(v) => Some(v),
            HeapData::Bytes(_) => None,
        }
    }
}

/// A pointer to a heap-allocated [`HeapBox`].
///
/// Heap boxes are allocated with `Box::into_raw` and never reclaimed: spec
/// §3.3 leaves reclamation an implementation choice, and the reference
/// interpreter (`examples/original_source/src/interpreter.c`) itself never
/// calls `free` on any `HeapValue` it allocates. All heap boxes therefore
/// live for the remaining lifetime of the process, which is also always the
/// remaining lifetime of the owning `Module` (spec §3.3's lifecycle note).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HeapRef(*mut HeapBox);

impl HeapRef {
    fn alloc(heap_box: HeapBox) -> HeapRef {
        HeapRef(Box::into_raw(Box::new(heap_box)))
    }

    pub fn get(&self) -> &HeapBox {
        // SAFETY: the pointer was produced by `Box::into_raw` in `alloc` and
        // is never freed or aliased mutably while a shared reference exists.
        unsafe { &*self.0 }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut HeapBox {
        // SAFETY: the VM is single-threaded (spec §5) and callers only take
        // this to perform the single in-place `Update` mutation on a
        // `Mutable` cell; no other reference to the same box is alive at
        // that point.
        unsafe { &mut *self.0 }
    }

    fn as_u64(self) -> u64 {
        self.0 as u64
    }

    fn from_u64(bits: u64) -> HeapRef {
        HeapRef((bits & MASK_PAYLOAD_PTR) as *mut HeapBox)
    }
}

impl fmt::Debug for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({:p})", self.0)
    }
}

impl Value {
    pub fn from_i32(x: i32) -> Value {
        Value(SIGNATURE_INTEGER | (x as u32 as u64))
    }

    pub fn from_f64(x: f64) -> Value {
        Value(x.to_bits())
    }

    pub fn special() -> Value {
        Value(SIGNATURE_SPECIAL)
    }

    /// A short function: an inline, non-closured callable (spec §3.1).
    pub fn from_function(code_pc: u16, local_space: u16) -> Value {
        Value(SIGNATURE_FUNCTION | (code_pc as u64) | ((local_space as u64) << 16))
    }

    /// A suspended-execution snapshot (spec §3.2's frame triple, boxed as a
    /// value so it can travel through the same word-sized channel).
    pub fn from_func_env(return_pc: u16, saved_sp: u16, saved_bp: u16) -> Value {
        Value(
            SIGNATURE_FUNCENV
                | (return_pc as u64)
                | ((saved_sp as u64) << 16)
                | ((saved_bp as u64) << 32),
        )
    }

    pub fn from_string(bytes: Vec<u8>) -> Value {
        Value::from_heap(HeapBox {
            tag: HeapTag::String,
            data: HeapData::Bytes(bytes),
        })
    }

    pub fn from_list(values: Vec<Value>) -> Value {
        Value::from_heap(HeapBox {
            tag: HeapTag::List,
            data: HeapData::Values(values),
        })
    }

    /// A closure box holds exactly two values: `{ code-pc, base-pointer }`
    /// (spec §3.1's invariant).
    pub fn from_closure(code_pc: Value, base_pointer: Value) -> Value {
        Value::from_heap(HeapBox {
            tag: HeapTag::Closure,
            data: HeapData::Values(vec![code_pc, base_pointer]),
        })
    }

    pub fn from_mutable(initial: Value) -> Value {
        Value::from_heap(HeapBox {
            tag: HeapTag::Mutable,
            data: HeapData::Values(vec![initial]),
        })
    }

    fn from_heap(heap_box: HeapBox) -> Value {
        Value(SIGNATURE_POINTER | HeapRef::alloc(heap_box).as_u64())
    }

    /// The raw 64-bit word, e.g. for embedding into a constants pool.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Value {
        Value(bits)
    }

    /// Total decode: every 64-bit word constructible by the constructors
    /// above decodes to exactly one of the nine variants.
    pub fn kind(self) -> ValueKind {
        let v = self.0;

        if (!v & MASK_EXPONENT) != 0 {
            return ValueKind::Float(f64::from_bits(v));
        }

        let signature = v & MASK_SIGNATURE;

        if signature == SIGNATURE_POINTER {
            let heap_ref = HeapRef::from_u64(v);
            return match heap_ref.get().tag {
                HeapTag::String => ValueKind::String(heap_ref),
                HeapTag::List => ValueKind::List(heap_ref),
                HeapTag::Closure => ValueKind::Closure(heap_ref),
                HeapTag::Mutable => ValueKind::Mutable(heap_ref),
            };
        }

        match signature {
            SIGNATURE_NAN => ValueKind::Float(f64::from_bits(v)),
            SIGNATURE_SPECIAL => ValueKind::Special,
            SIGNATURE_INTEGER => ValueKind::Integer((v & MASK_PAYLOAD_INT) as u32 as i32),
            SIGNATURE_FUNCTION => ValueKind::Function {
                code_pc: v as u16,
                local_space: (v >> 16) as u16,
            },
            SIGNATURE_FUNCENV => ValueKind::FuncEnv {
                return_pc: v as u16,
                saved_sp: (v >> 16) as u16,
                saved_bp: (v >> 32) as u16,
            },
            // Any other exponent-all-ones pattern is a signaling NaN that
            // never round-trips through a documented constructor; treat it
            // as an ordinary float, same as the reference `get_type`'s
            // fallthrough for a bare quiet NaN with no recognised type tag.
            _ => ValueKind::Float(f64::from_bits(v)),
        }
    }

    pub fn type_name(self) -> &'static str {
        self.kind().name()
    }

    pub fn as_i32(self) -> Option<i32> {
        match self.kind() {
            ValueKind::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_list(self) -> Option<HeapRef> {
        match self.kind() {
            ValueKind::List(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_mutable(self) -> Option<HeapRef> {
        match self.kind() {
            ValueKind::Mutable(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_native_name(self) -> Option<Vec<u8>> {
        match self.kind() {
            ValueKind::String(r) => r.get().as_bytes().map(|b| b.to_vec()),
            _ => None,
        }
    }

    /// Is this callee a bytecode-callable value, i.e. a short function or a
    /// pointer to a closure box? Spec §9's Open Question on `Call`'s
    /// `IS_CLO(callee) || IS_PTR(callee)` guard resolves to exactly this:
    /// accept a short function or a closure, reject everything else
    /// (including string/list/mutable pointers, which are not callable).
    pub fn is_bytecode_callable(self) -> bool {
        matches!(self.kind(), ValueKind::Function { .. } | ValueKind::Closure(_))
    }

    /// Is this callee a native function name, i.e. a string pointer
    /// preceded on the stack by the `(library_index, function_index)` pair
    /// pushed by `LoadNative` (spec §4.5)?
    pub fn is_native_callable(self) -> bool {
        matches!(self.kind(), ValueKind::String(_))
    }

    /// Structural equality (spec §4.3's `Compare` with `op=2`, and the
    /// `equal(a, b) == equal(b, a)` testable property). Integers compare by
    /// 32-bit payload, floats by bit value after decoding, strings by
    /// length-then-content; any other pairing (including a type mismatch)
    /// is a comparison error.
    pub fn equal(self, other: Value) -> Result<bool, VmError> {
        match (self.kind(), other.kind()) {
            (ValueKind::Integer(a), ValueKind::Integer(b)) => Ok(a == b),
            (ValueKind::Float(a), ValueKind::Float(b)) => Ok(a == b),
            (ValueKind::String(a), ValueKind::String(b)) => {
                let a = a.get();
                let b = b.get();
                Ok(a.len() == b.len() && a.as_bytes() == b.as_bytes())
            }
            (a, _) => Err(VmError::Comparison { found: a.name() }),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Integer(i) => write!(f, "Integer({i})"),
            ValueKind::Float(x) => write!(f, "Float({x})"),
            ValueKind::Special => write!(f, "Special"),
            ValueKind::Function {
                code_pc,
                local_space,
            } => write!(f, "Function(pc={code_pc}, locals={local_space})"),
            ValueKind::FuncEnv {
                return_pc,
                saved_sp,
                saved_bp,
            } => write!(
                f,
                "FuncEnv(ret={return_pc}, sp={saved_sp}, bp={saved_bp})"
            ),
            ValueKind::String(r) => write!(
                f,
                "String({:?})",
                String::from_utf8_lossy(r.get().as_bytes().unwrap_or_default())
            ),
            ValueKind::List(r) => write!(f, "List(len={})", r.get().len()),
            ValueKind::Closure(_) => write!(f, "Closure"),
            ValueKind::Mutable(r) => write!(f, "Mutable({:?})", r.get().as_values().unwrap()[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn integer_round_trips() {
        let v = Value::from_i32(-7);
        assert!(matches!(v.kind(), ValueKind::Integer(-7)));
        assert_eq!(v.as_i32(), Some(-7));
    }

    #[test]
    fn float_round_trips_without_colliding_with_tags() {
        for x in [0.0, -0.0, 1.5, f64::INFINITY, f64::NEG_INFINITY, 3.14159] {
            let v = Value::from_f64(x);
            match v.kind() {
                ValueKind::Float(y) => assert_eq!(x.to_bits(), y.to_bits()),
                other => panic!("expected float, got {other:?}"),
            }
        }
    }

    #[test]
    fn special_decodes_as_special() {
        assert!(matches!(Value::special().kind(), ValueKind::Special));
    }

    #[test]
    fn function_round_trips_pc_and_local_space() {
        let v = Value::from_function(1234, 7);
        match v.kind() {
            ValueKind::Function {
                code_pc,
                local_space,
            } => {
                assert_eq!(code_pc, 1234);
                assert_eq!(local_space, 7);
            }
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn string_equality_is_by_length_then_content() {
        let a = Value::from_string(b"hello".to_vec());
        let b = Value::from_string(b"hello".to_vec());
        let c = Value::from_string(b"hello!".to_vec());
        assert!(a.equal(b).unwrap());
        assert!(!a.equal(c).unwrap());
    }

    #[test]
    fn equality_is_symmetric() {
        let values = [
            Value::from_i32(3),
            Value::from_f64(2.5),
            Value::from_string(b"x".to_vec()),
        ];
        for a in values {
            for b in values {
                assert_eq!(a.equal(b).ok(), b.equal(a).ok());
            }
        }
    }

    #[test]
    fn comparing_incomparable_types_is_an_error() {
        let list = Value::from_list(vec![]);
        let other = Value::from_list(vec![]);
        assert!(list.equal(other).is_err());
    }

    #[test]
    fn closure_box_has_exactly_two_slots() {
        let closure = Value::from_closure(Value::from_i32(10), Value::from_i32(0));
        match closure.kind() {
            ValueKind::Closure(r) => assert_eq!(r.get().len(), 2),
            other => panic!("expected closure, got {other:?}"),
        }
    }

    #[test]
    fn mutable_round_trip() {
        let cell = Value::from_mutable(Value::from_i32(41));
        let heap = cell.as_mutable().unwrap();
        assert_eq!(heap.get().as_values().unwrap()[0].as_i32(), Some(41));
        heap.get_mut().as_values_mut().unwrap()[0] = Value::from_i32(99);
        assert_eq!(heap.get().as_values().unwrap()[0].as_i32(), Some(99));
    }

    #[test]
    fn bytecode_vs_native_callee_classification() {
        assert!(Value::from_function(0, 0).is_bytecode_callable());
        assert!(Value::from_closure(Value::from_i32(0), Value::from_i32(0)).is_bytecode_callable());
        assert!(Value::from_string(b"puts".to_vec()).is_native_callable());
        assert!(!Value::from_list(vec![]).is_bytecode_callable());
        assert!(!Value::from_list(vec![]).is_native_callable());
    }
}
