// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The module: everything one running program needs besides the bytecode
//! itself (spec §3.3) — the operand stack, the call stack, the constants
//! pool, the resolved-native cache, and the loaded library handles.

use std::path::MAIN_SEPARATOR;

use plume_image::Program;
use plume_loader::{Loader, LoaderError, LibraryHandle, Native};
use plume_types::{Opcode, Value, VmError};

use crate::callstack::CallStack;
use crate::stack::OperandStack;

/// A conservative default for the globals region when a program references
/// no global slot at all.
const MIN_GLOBALS_REGION: usize = 64;

/// Per-library cache of resolved native function pointers, indexed by
/// function index within that library (spec §4.6's lazy-resolve-and-cache
/// protocol).
pub struct NativeTable {
    functions: Vec<Option<Native>>,
}

impl NativeTable {
    fn new(num_functions: u32) -> Self {
        NativeTable {
            functions: vec![None; num_functions as usize],
        }
    }

    pub fn get(&self, function_index: usize) -> Option<Native> {
        self.functions.get(function_index).copied().flatten()
    }

    pub fn set(&mut self, function_index: usize, native: Native) {
        if let Some(slot) = self.functions.get_mut(function_index) {
            *slot = Some(native);
        }
    }
}

pub struct Module {
    pub stack: OperandStack,
    pub call_stack: CallStack,
    pub base_pointer: usize,
    pub constants: Vec<Value>,
    pub natives: Vec<NativeTable>,
    pub handles: Vec<Option<LibraryHandle>>,
    pub loader: Box<dyn Loader>,
    pub argv: Vec<Value>,
    pub halted: bool,
}

impl Module {
    /// Builds a module from a deserialized [`Program`], eagerly loading
    /// every referenced library the way the reference `main` does before
    /// handing off to the interpreter loop. `plume_path` is the resolved
    /// `PLUME_PATH` value (spec §6/§8), used as the search root for
    /// standard-library entries.
    pub fn new(
        program: &Program,
        loader: Box<dyn Loader>,
        plume_path: Option<&str>,
        argv: &[String],
    ) -> Result<Module, VmError> {
        let globals = globals_region_size(program);
        let mut stack = OperandStack::new(crate::stack::DEFAULT_CAPACITY);
        stack.reserve(globals)?;

        let mut handles = Vec::with_capacity(program.libraries.libraries.len());
        let mut natives = Vec::with_capacity(program.libraries.libraries.len());

        for library in &program.libraries.libraries {
            let path = resolve_library_path(&library.name, library.is_standard, plume_path);
            tracing::debug!(name = %library.name, path = %path, "loading library");
            let handle = load_library(&loader, &path)?;
            handles.push(Some(handle));
            natives.push(NativeTable::new(library.num_functions));
        }

        let argv_values = argv
            .iter()
            .map(|s| Value::from_string(s.as_bytes().to_vec()))
            .collect();

        Ok(Module {
            stack,
            call_stack: CallStack::new(),
            base_pointer: globals,
            constants: program.constants.clone(),
            natives,
            handles,
            loader,
            argv: argv_values,
            halted: false,
        })
    }

    /// Resolves and invokes a native call, caching the resolved pointer on
    /// first use (spec §4.6). `library_index`/`function_index` come from
    /// the `(library_index, function_index, name)` triple `LoadNative`
    /// pushed onto the stack ahead of the call.
    pub fn call_native(
        &mut self,
        library_index: usize,
        function_index: usize,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let native = match self.natives.get(library_index).and_then(|t| t.get(function_index)) {
            Some(native) => native,
            None => {
                let handle = self
                    .handles
                    .get(library_index)
                    .and_then(|h| h.as_ref())
                    .ok_or_else(|| VmError::LinkerLibrary {
                        library: library_index.to_string(),
                    })?;
                let resolved = self.loader.symbol(handle, name).map_err(|source| VmError::LinkerSymbol {
                    library: library_index.to_string(),
                    symbol: format!("{name} ({source})"),
                })?;
                tracing::debug!(library_index, function_index, name, "resolved native symbol");
                self.natives[library_index].set(function_index, resolved);
                resolved
            }
        };

        let argc = args.len() as u32;
        // SAFETY: `native` was resolved from a symbol the program's
        // library manifest declared for this slot; the caller contract
        // (spec §4.6) requires it to match the `Native` ABI exactly. The
        // module pointer round-trips through `*mut c_void` only to avoid a
        // circular crate dependency — it is cast back to `Module` on both
        // ends of the boundary.
        let ret = unsafe {
            native(
                argc,
                self as *mut Module as *mut std::ffi::c_void,
                args.as_ptr(),
            )
        };
        Ok(ret)
    }
}

fn load_library(loader: &dyn Loader, path: &str) -> Result<LibraryHandle, VmError> {
    loader.load_library(path).map_err(|source| map_loader_error(path, source))
}

fn map_loader_error(path: &str, source: LoaderError) -> VmError {
    VmError::LinkerLibrary {
        library: format!("{path} ({source})"),
    }
}

fn resolve_library_path(name: &str, is_standard: bool, plume_path: Option<&str>) -> String {
    if is_standard {
        if let Some(root) = plume_path {
            return format!("{root}{MAIN_SEPARATOR}{name}");
        }
    }
    name.to_string()
}

/// Scans the instruction stream for the highest global slot index any
/// global-touching opcode references, so the bottom of the operand stack
/// can be pre-reserved for globals the way the reference module's
/// fixed-size globals region is sized ahead of time (spec §3.3 leaves the
/// exact sizing mechanism unspecified; this mirrors the reference
/// deserializer's practice of deriving it from the program itself).
fn globals_region_size(program: &Program) -> usize {
    let mut max_index: usize = 0;
    let words = &program.instructions;
    let mut pc = 0;
    while pc + 4 <= words.len() {
        if let Ok(opcode) = Opcode::decode(words[pc]) {
            let slot = match opcode {
                Opcode::LoadGlobal | Opcode::StoreGlobal | Opcode::MakeAndStoreLambda => {
                    Some(words[pc + 1] as usize)
                }
                Opcode::CallGlobal => Some(words[pc + 1] as usize),
                _ => None,
            };
            if let Some(index) = slot {
                max_index = max_index.max(index + 1);
            }
        }
        pc += 4;
    }
    max_index.max(MIN_GLOBALS_REGION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_image::LibraryManifest;

    #[test]
    fn globals_region_grows_to_fit_highest_referenced_slot() {
        let program = Program::new(
            vec![
                4, 100, 0, 0, // StoreGlobal 100
                23, 0, 0, 0, // Halt
            ],
            vec![],
            LibraryManifest::default(),
        );
        assert_eq!(globals_region_size(&program), 101);
    }

    #[test]
    fn globals_region_has_a_minimum_floor() {
        let program = Program::new(vec![23, 0, 0, 0], vec![], LibraryManifest::default());
        assert_eq!(globals_region_size(&program), MIN_GLOBALS_REGION);
    }
}
