// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The interpreter loop (spec §4.3/§4.4). Dispatch goes through a dense,
//! opcode-indexed function table built once per [`run`] call rather than a
//! generic `match` falling through every variant on the hot path — the
//! same O(1)-dispatch shape as the teacher's `get_handler_from_instruction`
//! table, rebuilt safely here (a plain array, not a lazily-initialized
//! `static mut`) since nothing in this workspace can be checked by the
//! toolchain before it ships.

use plume_types::{ComparisonOp, Opcode, Value, ValueKind, VmError, MAX_OPCODE_NUMBER};

use crate::callstack::Frame;
use crate::module::Module;

type OpFn = fn(&mut Module, &mut usize, &[u32]) -> Result<(), VmError>;

/// Never actually reached: [`Opcode::decode`] rejects any raw byte that
/// wouldn't have a slot filled in below before dispatch ever indexes the
/// table, but the array still needs a total initializer.
fn unreachable_slot(_: &mut Module, _: &mut usize, words: &[u32]) -> Result<(), VmError> {
    Err(VmError::UnknownOpcode {
        opcode: words.first().copied().unwrap_or(0) as u8,
    })
}

fn build_dispatch_table() -> [OpFn; MAX_OPCODE_NUMBER] {
    let mut table: [OpFn; MAX_OPCODE_NUMBER] = [unreachable_slot; MAX_OPCODE_NUMBER];
    table[Opcode::LoadLocal as usize] = op_load_local;
    table[Opcode::StoreLocal as usize] = op_store_local;
    table[Opcode::LoadConstant as usize] = op_load_constant;
    table[Opcode::LoadGlobal as usize] = op_load_global;
    table[Opcode::StoreGlobal as usize] = op_store_global;
    table[Opcode::Return as usize] = op_return;
    table[Opcode::Compare as usize] = op_compare;
    table[Opcode::And as usize] = op_and;
    table[Opcode::Or as usize] = op_or;
    table[Opcode::LoadNative as usize] = op_load_native;
    table[Opcode::MakeList as usize] = op_make_list;
    table[Opcode::ListGet as usize] = op_list_get;
    table[Opcode::Call as usize] = op_call;
    table[Opcode::JumpElseRel as usize] = op_jump_else_rel;
    table[Opcode::MakeLambda as usize] = op_make_lambda;
    table[Opcode::GetIndex as usize] = op_get_index;
    table[Opcode::Special as usize] = op_special;
    table[Opcode::JumpRel as usize] = op_jump_rel;
    table[Opcode::Slice as usize] = op_slice;
    table[Opcode::ListLength as usize] = op_list_length;
    table[Opcode::Halt as usize] = op_halt;
    table[Opcode::Update as usize] = op_update;
    table[Opcode::MakeMutable as usize] = op_make_mutable;
    table[Opcode::Unmut as usize] = op_unmut;
    table[Opcode::Add as usize] = op_add;
    table[Opcode::Sub as usize] = op_sub;
    table[Opcode::ReturnConst as usize] = op_return_const;
    table[Opcode::AddConst as usize] = op_add_const;
    table[Opcode::SubConst as usize] = op_sub_const;
    table[Opcode::JumpElseRelCmp as usize] = op_jump_else_rel_cmp;
    table[Opcode::IJumpElseRelCmpConst as usize] = op_ijump_else_rel_cmp_const;
    table[Opcode::CallGlobal as usize] = op_call_global;
    table[Opcode::CallLocal as usize] = op_call_local;
    table[Opcode::MakeAndStoreLambda as usize] = op_make_and_store_lambda;
    table[Opcode::Mul as usize] = op_mul;
    table[Opcode::MulConst as usize] = op_mul_const;
    table
}

/// Runs `instructions` to completion (a `Halt` or the end of the stream).
pub fn run(module: &mut Module, instructions: &[u32]) -> Result<(), VmError> {
    let table = build_dispatch_table();
    let mut pc: usize = 0;
    tracing::debug!(words = instructions.len(), "interpreter starting");

    while !module.halted && pc + 4 <= instructions.len() {
        let opcode = Opcode::decode(instructions[pc])?;
        tracing::trace!(pc, opcode = opcode.name(), "dispatch");
        table[opcode as usize](module, &mut pc, instructions).map_err(|err| {
            tracing::debug!(pc, opcode = opcode.name(), %err, "interpreter trapped");
            err
        })?;
    }

    tracing::debug!(halted = module.halted, "interpreter finished");
    Ok(())
}

fn imm(words: &[u32], pc: usize, n: usize) -> u32 {
    words[pc + n]
}

/// Applies a relative branch. Offsets are signed (the reference interpreter
/// holds `pc` as `int32_t` and does `pc += offset * 4`), so a backward jump
/// — the only way to encode a loop — must be sign-extended before scaling,
/// not zero-extended: read as `u32` it would carry the high bit into a
/// ~4-billion-word leap instead of stepping backward.
fn branch_rel(pc: &mut usize, words: &[u32], n: usize) {
    let offset = imm(words, *pc, n) as i32 as isize;
    *pc = (*pc as isize + offset * 4) as usize;
}

fn expect_integer(opcode: &'static str, value: Value) -> Result<i32, VmError> {
    value.as_i32().ok_or(VmError::Type {
        opcode,
        expected: "integer",
        found: value.type_name(),
    })
}

fn expect_list(opcode: &'static str, value: Value) -> Result<plume_types::value::HeapRef, VmError> {
    value.as_list().ok_or(VmError::Type {
        opcode,
        expected: "list",
        found: value.type_name(),
    })
}

fn expect_mutable(opcode: &'static str, value: Value) -> Result<plume_types::value::HeapRef, VmError> {
    value.as_mutable().ok_or(VmError::Type {
        opcode,
        expected: "mutable",
        found: value.type_name(),
    })
}

fn constant_at(module: &Module, _opcode: &'static str, index: usize) -> Result<Value, VmError> {
    module.constants.get(index).copied().ok_or(VmError::Index {
        index: index as i64,
        length: module.constants.len(),
    })
}

fn locals_base(module: &Module) -> usize {
    module.base_pointer - module.call_stack.current_locals()
}

fn op_load_local(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let index = locals_base(module) + imm(words, *pc, 1) as usize;
    let value = module.stack.get(index)?;
    module.stack.push(value)?;
    *pc += 4;
    Ok(())
}

fn op_store_local(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let index = locals_base(module) + imm(words, *pc, 1) as usize;
    let value = module.stack.pop()?;
    module.stack.set(index, value)?;
    *pc += 4;
    Ok(())
}

fn op_load_constant(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let value = constant_at(module, "LoadConstant", imm(words, *pc, 1) as usize)?;
    module.stack.push(value)?;
    *pc += 4;
    Ok(())
}

fn op_load_global(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let value = module.stack.get(imm(words, *pc, 1) as usize)?;
    module.stack.push(value)?;
    *pc += 4;
    Ok(())
}

fn op_store_global(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let value = module.stack.pop()?;
    module.stack.set(imm(words, *pc, 1) as usize, value)?;
    *pc += 4;
    Ok(())
}

fn do_return(module: &mut Module, value: Value) -> Result<usize, VmError> {
    let frame = module.call_stack.pop()?;
    module.stack.truncate(frame.restore_sp);
    module.base_pointer = frame.restore_bp;
    module.stack.push(value)?;
    Ok(frame.return_pc)
}

/// A `Return` with no active frame ends the program (spec §4.4/§5) rather
/// than underflowing the call stack — there is no caller left to resume.
fn op_return(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let ret = module.stack.pop()?;
    if module.call_stack.depth() == 0 {
        module.stack.push(ret)?;
        module.halted = true;
        return Ok(());
    }
    *pc = do_return(module, ret)?;
    Ok(())
}

fn op_return_const(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let value = constant_at(module, "ReturnConst", imm(words, *pc, 1) as usize)?;
    if module.call_stack.depth() == 0 {
        module.stack.push(value)?;
        module.halted = true;
        return Ok(());
    }
    *pc = do_return(module, value)?;
    Ok(())
}

fn apply_comparison(opcode: &'static str, op: ComparisonOp, a: Value, b: Value) -> Result<bool, VmError> {
    match op {
        ComparisonOp::Equal => a.equal(b),
        ComparisonOp::And => Ok(expect_integer(opcode, a)? != 0 && expect_integer(opcode, b)? != 0),
        ComparisonOp::Or => Ok(expect_integer(opcode, a)? != 0 || expect_integer(opcode, b)? != 0),
    }
}

fn op_compare(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let op = ComparisonOp::decode(imm(words, *pc, 1))?;
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let result = apply_comparison("Compare", op, a, b)?;
    module.stack.push(Value::from_i32(result as i32))?;
    *pc += 4;
    Ok(())
}

fn op_and(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let result = expect_integer("And", a)? != 0 && expect_integer("And", b)? != 0;
    module.stack.push(Value::from_i32(result as i32))?;
    *pc += 4;
    Ok(())
}

fn op_or(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let result = expect_integer("Or", a)? != 0 || expect_integer("Or", b)? != 0;
    module.stack.push(Value::from_i32(result as i32))?;
    *pc += 4;
    Ok(())
}

fn op_load_native(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let name = constant_at(module, "LoadNative", imm(words, *pc, 1) as usize)?;
    if name.as_native_name().is_none() {
        return Err(VmError::Type {
            opcode: "LoadNative",
            expected: "string",
            found: name.type_name(),
        });
    }
    let library_index = imm(words, *pc, 2);
    let function_index = imm(words, *pc, 3);
    module.stack.push(Value::from_i32(library_index as i32))?;
    module.stack.push(Value::from_i32(function_index as i32))?;
    module.stack.push(name)?;
    *pc += 4;
    Ok(())
}

fn op_make_list(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let count = imm(words, *pc, 1) as usize;
    let values = module.stack.pop_n(count)?;
    module.stack.push(Value::from_list(values))?;
    *pc += 4;
    Ok(())
}

fn op_list_get(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let list = module.stack.pop()?;
    let heap = expect_list("ListGet", list)?;
    let index = imm(words, *pc, 1) as usize;
    let values = heap.get().as_values().unwrap();
    let value = *values.get(index).ok_or(VmError::Index {
        index: index as i64,
        length: values.len(),
    })?;
    module.stack.push(value)?;
    *pc += 4;
    Ok(())
}

fn op_get_index(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let index = module.stack.pop()?;
    let list = module.stack.pop()?;
    let index = expect_integer("GetIndex", index)?;
    let heap = expect_list("GetIndex", list)?;
    let values = heap.get().as_values().unwrap();
    if index < 0 || index as usize >= values.len() {
        return Err(VmError::Index {
            index: index as i64,
            length: values.len(),
        });
    }
    module.stack.push(values[index as usize])?;
    *pc += 4;
    Ok(())
}

fn op_jump_else_rel(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let value = module.stack.pop()?;
    let value = expect_integer("JumpElseRel", value)?;
    if value == 0 {
        branch_rel(pc, words, 1);
    } else {
        *pc += 4;
    }
    Ok(())
}

fn op_jump_rel(_: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    branch_rel(pc, words, 1);
    Ok(())
}

fn op_make_lambda(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let body_len = imm(words, *pc, 1);
    let local_space = imm(words, *pc, 2);
    let code_pc = (*pc as u32 + 4) as u16;
    let lambda = Value::from_function(code_pc, local_space as u16);
    module.stack.push(lambda)?;
    *pc += (body_len as usize + 1) * 4;
    Ok(())
}

fn op_make_and_store_lambda(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let global_index = imm(words, *pc, 1) as usize;
    let body_len = imm(words, *pc, 2);
    let local_space = imm(words, *pc, 3);
    let code_pc = (*pc as u32 + 4) as u16;
    let lambda = Value::from_function(code_pc, local_space as u16);
    module.stack.set(global_index, lambda)?;
    *pc += (body_len as usize + 1) * 4;
    Ok(())
}

fn op_special(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    module.stack.push(Value::special())?;
    *pc += 4;
    Ok(())
}

fn op_slice(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let list = module.stack.pop()?;
    let heap = expect_list("Slice", list)?;
    let start = imm(words, *pc, 1) as usize;
    let values = heap.get().as_values().unwrap();
    if start > values.len() {
        return Err(VmError::Index {
            index: start as i64,
            length: values.len(),
        });
    }
    module.stack.push(Value::from_list(values[start..].to_vec()))?;
    *pc += 4;
    Ok(())
}

fn op_list_length(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let list = module.stack.pop()?;
    let heap = expect_list("ListLength", list)?;
    module.stack.push(Value::from_i32(heap.get().len() as i32))?;
    *pc += 4;
    Ok(())
}

fn op_halt(module: &mut Module, _: &mut usize, _: &[u32]) -> Result<(), VmError> {
    module.halted = true;
    Ok(())
}

fn op_update(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let cell = module.stack.pop()?;
    let heap = expect_mutable("Update", cell)?;
    let value = module.stack.pop()?;
    heap.get_mut().as_values_mut().unwrap()[0] = value;
    *pc += 4;
    Ok(())
}

fn op_make_mutable(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let value = module.stack.pop()?;
    module.stack.push(Value::from_mutable(value))?;
    *pc += 4;
    Ok(())
}

fn op_unmut(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let value = module.stack.pop()?;
    let heap = expect_mutable("Unmut", value)?;
    let inner = heap.get().as_values().unwrap()[0];
    module.stack.push(inner)?;
    *pc += 4;
    Ok(())
}

fn op_add(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let sum = expect_integer("Add", a)?.wrapping_add(expect_integer("Add", b)?);
    module.stack.push(Value::from_i32(sum))?;
    *pc += 4;
    Ok(())
}

fn op_add_const(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = constant_at(module, "AddConst", imm(words, *pc, 1) as usize)?;
    let sum = expect_integer("AddConst", a)?.wrapping_add(expect_integer("AddConst", b)?);
    module.stack.push(Value::from_i32(sum))?;
    *pc += 4;
    Ok(())
}

/// `Sub` pops `a` (the top) then `b`, and pushes `b - a` — the operand
/// order is deliberately the mirror of `SubConst` (spec §9), preserved
/// exactly as the reference interpreter computes it.
fn op_sub(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let diff = expect_integer("Sub", b)?.wrapping_sub(expect_integer("Sub", a)?);
    module.stack.push(Value::from_i32(diff))?;
    *pc += 4;
    Ok(())
}

/// `SubConst` pops `a` and pushes `a - constants[c]` (spec §9) — not
/// `constants[c] - a`, unlike the symmetry one might expect from `Sub`.
fn op_sub_const(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = constant_at(module, "SubConst", imm(words, *pc, 1) as usize)?;
    let diff = expect_integer("SubConst", a)?.wrapping_sub(expect_integer("SubConst", b)?);
    module.stack.push(Value::from_i32(diff))?;
    *pc += 4;
    Ok(())
}

fn op_mul(module: &mut Module, pc: &mut usize, _: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let product = expect_integer("Mul", a)?.wrapping_mul(expect_integer("Mul", b)?);
    module.stack.push(Value::from_i32(product))?;
    *pc += 4;
    Ok(())
}

fn op_mul_const(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let a = module.stack.pop()?;
    let b = constant_at(module, "MulConst", imm(words, *pc, 1) as usize)?;
    let product = expect_integer("MulConst", a)?.wrapping_mul(expect_integer("MulConst", b)?);
    module.stack.push(Value::from_i32(product))?;
    *pc += 4;
    Ok(())
}

fn op_jump_else_rel_cmp(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let op = ComparisonOp::decode(imm(words, *pc, 2))?;
    let a = module.stack.pop()?;
    let b = module.stack.pop()?;
    let result = apply_comparison("JumpElseRelCmp", op, a, b)?;
    if !result {
        branch_rel(pc, words, 1);
    } else {
        *pc += 4;
    }
    Ok(())
}

/// Unlike `JumpElseRelCmp`/`Compare`, this opcode's `And`/`Or` operators are
/// bitwise on the decoded integers (spec §9), matching the reference
/// interpreter's separate `icomparison_table` rather than the logical
/// `compare_and`/`compare_or` helpers used everywhere else.
fn op_ijump_else_rel_cmp_const(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let op = ComparisonOp::decode(imm(words, *pc, 2))?;
    let a = module.stack.pop()?;
    let b = constant_at(module, "IJumpElseRelCmpConst", imm(words, *pc, 3) as usize)?;
    let a = expect_integer("IJumpElseRelCmpConst", a)?;
    let b = expect_integer("IJumpElseRelCmpConst", b)?;
    let result = match op {
        ComparisonOp::Equal => a == b,
        ComparisonOp::And => (a & b) != 0,
        ComparisonOp::Or => (a | b) != 0,
    };
    if !result {
        branch_rel(pc, words, 1);
    } else {
        *pc += 4;
    }
    Ok(())
}

/// Resolves and invokes a callee, whether it is a bytecode function/closure
/// or a native symbol named via the `(library_index, function_index, name)`
/// triple `LoadNative` pushes (spec §4.5/§9). Bytecode calls jump directly
/// (the return address is recorded in the new frame); native calls fall
/// through to the next instruction.
fn dispatch_call(module: &mut Module, pc: &mut usize, callee: Value, argc: usize) -> Result<(), VmError> {
    if callee.is_bytecode_callable() {
        call_bytecode(module, pc, callee, argc)
    } else if callee.is_native_callable() {
        call_native(module, pc, callee, argc)
    } else {
        Err(VmError::Type {
            opcode: "Call",
            expected: "function, closure, or native name",
            found: callee.type_name(),
        })
    }
}

fn call_bytecode(module: &mut Module, pc: &mut usize, callee: Value, argc: usize) -> Result<(), VmError> {
    let (code_pc, local_space) = match callee.kind() {
        ValueKind::Function {
            code_pc,
            local_space,
        } => (code_pc as usize, local_space as usize),
        ValueKind::Closure(heap) => {
            let values = heap.get().as_values().unwrap();
            (
                expect_integer("Call", values[0])? as usize,
                expect_integer("Call", values[1])? as usize,
            )
        }
        _ => unreachable!("guarded by is_bytecode_callable"),
    };

    let restore_sp = module
        .stack
        .len()
        .checked_sub(argc)
        .ok_or(VmError::OperandStackUnderflow)?;
    let restore_bp = module.base_pointer;
    let return_pc = *pc + 4;

    let extra_locals = local_space.saturating_sub(argc);
    module.stack.reserve(extra_locals)?;
    let new_bp = module.stack.len();

    module.call_stack.push(Frame {
        return_pc,
        restore_sp,
        restore_bp,
        num_locals: local_space,
    })?;
    module.base_pointer = new_bp;
    *pc = code_pc;
    Ok(())
}

fn call_native(module: &mut Module, pc: &mut usize, callee: Value, argc: usize) -> Result<(), VmError> {
    let name_bytes = callee.as_native_name().unwrap();
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    let function_index = expect_integer("Call", module.stack.pop()?)? as usize;
    let library_index = expect_integer("Call", module.stack.pop()?)? as usize;
    let args = module.stack.pop_n(argc)?;

    let ret = module.call_native(library_index, function_index, &name, &args)?;
    module.stack.push(ret)?;
    *pc += 4;
    Ok(())
}

fn op_call(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let argc = imm(words, *pc, 1) as usize;
    let callee = module.stack.pop()?;
    dispatch_call(module, pc, callee, argc)
}

fn op_call_global(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let global_index = imm(words, *pc, 1) as usize;
    let argc = imm(words, *pc, 2) as usize;
    let callee = module.stack.get(global_index)?;
    dispatch_call(module, pc, callee, argc)
}

/// `CallLocal`'s second immediate is the argument count (spec §9): the
/// reference interpreter reads the local-slot index twice and never reads
/// its own `i2`, a latent bug this implementation does not reproduce.
fn op_call_local(module: &mut Module, pc: &mut usize, words: &[u32]) -> Result<(), VmError> {
    let local_index = imm(words, *pc, 1) as usize;
    let argc = imm(words, *pc, 2) as usize;
    let callee = module.stack.get(locals_base(module) + local_index)?;
    dispatch_call(module, pc, callee, argc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_image::{LibraryManifest, Program};
    use plume_loader::{Loader, LoaderError, LibraryHandle};
    use pretty_assertions::assert_eq;

    struct NoLoader;
    impl Loader for NoLoader {
        fn load_library(&self, path: &str) -> Result<LibraryHandle, LoaderError> {
            panic!("no libraries expected in this test: {path}");
        }
        fn symbol(&self, _: &LibraryHandle, name: &str) -> Result<plume_loader::Native, LoaderError> {
            panic!("no natives expected in this test: {name}");
        }
    }

    fn run_program(instructions: Vec<u32>, constants: Vec<Value>) -> Module {
        let program = Program::new(instructions, constants, LibraryManifest::default());
        let mut module = Module::new(&program, Box::new(NoLoader), None, &[]).unwrap();
        run(&mut module, &program.instructions).unwrap();
        module
    }

    fn top(module: &Module) -> Value {
        module.stack.get(module.stack.len() - 1).unwrap()
    }

    #[test]
    fn arithmetic_scenario_computes_sum_of_constants() {
        let module = run_program(
            vec![
                2, 0, 0, 0, // LoadConstant 0 -> 2
                2, 1, 0, 0, // LoadConstant 1 -> 3
                27, 0, 0, 0, // Add -> 5
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_i32(2), Value::from_i32(3)],
        );
        assert_eq!(top(&module).as_i32(), Some(5));
    }

    #[test]
    fn conditional_jump_skips_the_then_branch_when_falsy() {
        // JumpElseRel jumps past the following block exactly when the
        // popped condition is zero; a truthy condition falls through into
        // it instead.
        let module = run_program(
            vec![
                2, 0, 0, 0, // LoadConstant 0 -> 0 (falsy)
                13, 2, 0, 0, // JumpElseRel +2 words -> lands on Halt, skipping the block below
                2, 1, 0, 0, // LoadConstant 1 -> 99 (skipped)
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_i32(0), Value::from_i32(99)],
        );
        assert_eq!(module.stack.len(), module.base_pointer);
    }

    #[test]
    fn list_scenario_builds_and_reads_back_a_list() {
        let module = run_program(
            vec![
                2, 0, 0, 0, // LoadConstant 0 -> 10
                2, 1, 0, 0, // LoadConstant 1 -> 20
                10, 2, 0, 0, // MakeList 2
                11, 1, 0, 0, // ListGet 1 -> 20
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_i32(10), Value::from_i32(20)],
        );
        assert_eq!(top(&module).as_i32(), Some(20));
    }

    #[test]
    fn function_call_scenario_returns_its_single_argument() {
        // MakeAndStoreLambda stashes the function in a global slot and
        // CallGlobal invokes it from there, from program start.
        let module = run_program(
            vec![
                38, 0, 2, 1, // MakeAndStoreLambda g=0 body_len=2 local_space=1
                2, 0, 0, 0, //   body: LoadConstant 0 -> 42
                5, 0, 0, 0, //         Return
                36, 0, 0, 0, // CallGlobal g=0 argc=0
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_i32(42)],
        );
        assert_eq!(top(&module).as_i32(), Some(42));
    }

    #[test]
    fn mutable_scenario_round_trips_through_update() {
        // A mutable cell stashed in a global slot, updated through
        // LoadGlobal/Update and read back through LoadGlobal/Unmut.
        let module = run_program(
            vec![
                2, 0, 0, 0, // LoadConstant 0 -> 1
                25, 0, 0, 0, // MakeMutable -> cell(1)
                4, 0, 0, 0, // StoreGlobal 0
                2, 1, 0, 0, // LoadConstant 1 -> 99 (new value, pushed first)
                3, 0, 0, 0, // LoadGlobal 0 -> cell, now on top
                24, 0, 0, 0, // Update: pops cell, pops value 99, cell := 99
                3, 0, 0, 0, // LoadGlobal 0 -> cell
                26, 0, 0, 0, // Unmut -> 99
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_i32(1), Value::from_i32(99)],
        );
        assert_eq!(top(&module).as_i32(), Some(99));
    }

    #[test]
    fn jump_rel_loop_counts_a_global_down_to_zero() {
        // Regression test for signed branch offsets: the backward JumpRel
        // closing this loop encodes a negative word offset, which must be
        // sign-extended before scaling or pc runs off the end of the
        // program on the first iteration.
        let module = run_program(
            vec![
                2, 0, 0, 0, // LoadConstant 0 -> 3
                4, 0, 0, 0, // StoreGlobal 0
                3, 0, 0, 0, // loop: LoadGlobal 0
                13, 5, 0, 0, // JumpElseRel +5 -> exit when counter == 0
                3, 0, 0, 0, //   LoadGlobal 0
                31, 1, 0, 0, //   SubConst 1 -> counter - 1
                4, 0, 0, 0, //   StoreGlobal 0
                20, (-5i32) as u32, 0, 0, // JumpRel -5 -> back to loop
                3, 0, 0, 0, // exit: LoadGlobal 0
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_i32(3), Value::from_i32(1)],
        );
        assert_eq!(top(&module).as_i32(), Some(0));
    }

    #[test]
    fn string_equality_scenario_compares_by_content() {
        let module = run_program(
            vec![
                2, 0, 0, 0, // LoadConstant 0 -> "a"
                2, 1, 0, 0, // LoadConstant 1 -> "a"
                6, 2, 0, 0, // Compare Equal
                23, 0, 0, 0, // Halt
            ],
            vec![Value::from_string(b"a".to_vec()), Value::from_string(b"a".to_vec())],
        );
        assert_eq!(top(&module).as_i32(), Some(1));
    }
}
