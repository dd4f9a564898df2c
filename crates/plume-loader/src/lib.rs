// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The dynamic-library loader boundary (spec §6): a handle-producing
//! loader and a symbol-lookup primitive. The core only ever consumes the
//! [`Loader`] trait; this crate supplies one concrete implementation
//! backed by `libloading` (the idiomatic Rust `dlopen`/`LoadLibrary`
//! wrapper, used here in place of the C source's raw platform calls, the
//! way `ancvm_extfunc_util::platform` wraps `libc` for its own
//! platform-specific lookups).

use std::ffi::c_void;
use std::fmt;

use plume_types::Value;

/// The native call ABI (spec §4.6): `fn(argc, module, args) -> Value`. The
/// module pointer is erased to `*mut c_void` here so that this crate does
/// not need to depend on `plume-runtime`'s `Module` type; `plume-runtime`
/// casts it back when invoking a resolved native function.
pub type Native = unsafe extern "C" fn(argc: u32, module: *mut c_void, args: *const Value) -> Value;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("could not load library '{path}': {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("symbol '{symbol}' not found in library '{path}': {source}")]
    Symbol {
        path: String,
        symbol: String,
        #[source]
        source: libloading::Error,
    },
}

/// An opaque, loader-specific handle to a loaded library (spec §3.3's
/// `handles[i]`).
pub struct LibraryHandle {
    path: String,
    library: libloading::Library,
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryHandle({})", self.path)
    }
}

/// Required primitives (spec §6): `load_library(path) -> Handle` and
/// `symbol(Handle, name) -> Native`.
pub trait Loader {
    fn load_library(&self, path: &str) -> Result<LibraryHandle, LoaderError>;
    fn symbol(&self, handle: &LibraryHandle, name: &str) -> Result<Native, LoaderError>;
}

/// The production loader: thin wrapper over `libloading::Library`.
#[derive(Debug, Default)]
pub struct DynamicLoader;

impl Loader for DynamicLoader {
    fn load_library(&self, path: &str) -> Result<LibraryHandle, LoaderError> {
        // SAFETY: loading an arbitrary shared object always carries the
        // usual dlopen caveat (its static initializers run); this mirrors
        // the reference `load_library` primitive spec §6 requires, which
        // carries the same caveat in C.
        let library = unsafe { libloading::Library::new(path) }.map_err(|source| LoaderError::Load {
            path: path.to_string(),
            source,
        })?;
        Ok(LibraryHandle {
            path: path.to_string(),
            library,
        })
    }

    fn symbol(&self, handle: &LibraryHandle, name: &str) -> Result<Native, LoaderError> {
        // SAFETY: the caller-supplied symbol name is expected to resolve to
        // a function matching the `Native` ABI exactly (spec §4.6's
        // contract); there is no way to verify this from the loader side,
        // same as a raw `dlsym`+cast in the reference implementation.
        unsafe {
            let symbol: libloading::Symbol<Native> =
                handle.library.get(name.as_bytes()).map_err(|source| LoaderError::Symbol {
                    path: handle.path.clone(),
                    symbol: name.to_string(),
                    source,
                })?;
            Ok(*symbol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_a_missing_library_is_a_loader_error() {
        let loader = DynamicLoader;
        let result = loader.load_library("/nonexistent/path/to/lib.so");
        assert!(matches!(result, Err(LoaderError::Load { .. })));
    }
}
