//! The parts of the bytecode model that AOT binding writes to.
//!
//! A bytecode file remembers which loaded container it was bound to through
//! its own [`BytecodeFile::aot_file_info_index`], so later binds need no
//! registry search. Methods and functions carry a write-once
//! [`MethodBinding`]: either it is absent and the code runs interpreted, or
//! it is complete.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Index value meaning "not bound to any container"
pub const INVALID_INDEX: u32 = u32::MAX;

/// Canonical form of a bytecode file name as recorded in containers
pub fn normalize_abc_name(name: &str) -> String {
    let name = name.replace('\\', "/");
    let mut rest = name.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_owned()
}

/// A loaded bytecode file
#[derive(Debug)]
pub struct BytecodeFile {
    name: String,
    checksum: u32,
    aot_file_info_index: AtomicU32,
}

impl BytecodeFile {
    /// File `name` with contents `data`; the checksum is the CRC-32 of `data`
    pub fn new(name: &str, data: &[u8]) -> Self {
        Self::with_checksum(name, crc32fast::hash(data))
    }

    /// File `name` with a precomputed checksum
    pub fn with_checksum(name: &str, checksum: u32) -> Self {
        Self {
            name: normalize_abc_name(name),
            checksum,
            aot_file_info_index: AtomicU32::new(INVALID_INDEX),
        }
    }

    /// Normalized file name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checksum of the file contents
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Registry index of the container this file is bound to
    pub fn aot_file_info_index(&self) -> Option<u32> {
        match self.aot_file_info_index.load(Ordering::Acquire) {
            INVALID_INDEX => None,
            index => Some(index),
        }
    }

    /// Whether the file is bound to a container
    pub fn is_loaded_aot(&self) -> bool {
        self.aot_file_info_index().is_some()
    }

    pub(crate) fn set_aot_file_info_index(&self, index: u32) {
        self.aot_file_info_index.store(index, Ordering::Release);
    }
}

/// Native entry of a bound method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodBinding {
    /// Address of the first instruction
    pub code_entry: usize,
    /// Whether the code uses the fast-call convention
    pub is_fast_call: bool,
    /// Frame pointer delta of the compiled frame
    pub fp_delta: i32,
    /// Registry index of the container holding the code
    pub file_index: u32,
    /// Function entry index inside that container
    pub entry_index: u32,
}

/// A method as described by its bytecode file
#[derive(Debug)]
pub struct MethodLiteral {
    method_offset: u32,
    binding: OnceLock<MethodBinding>,
}

impl MethodLiteral {
    /// Method at `method_offset` in its bytecode file
    pub fn new(method_offset: u32) -> Self {
        Self {
            method_offset,
            binding: OnceLock::new(),
        }
    }

    /// Offset of the method in its bytecode file
    pub fn method_offset(&self) -> u32 {
        self.method_offset
    }

    /// Native entry, if bound
    pub fn binding(&self) -> Option<&MethodBinding> {
        self.binding.get()
    }

    /// Whether the method has AOT code
    pub fn is_aot_code(&self) -> bool {
        self.binding.get().is_some()
    }

    /// Address of the AOT code, if bound
    pub fn code_entry(&self) -> Option<usize> {
        self.binding().map(|binding| binding.code_entry)
    }

    /// Record the native entry; false when one was already recorded
    pub(crate) fn set_binding(&self, binding: MethodBinding) -> bool {
        self.binding.set(binding).is_ok()
    }
}

/// A function object
#[derive(Debug)]
pub struct JsFunction {
    method: Arc<MethodLiteral>,
    binding: OnceLock<MethodBinding>,
}

impl JsFunction {
    /// Function running `method`
    pub fn new(method: Arc<MethodLiteral>) -> Self {
        Self {
            method,
            binding: OnceLock::new(),
        }
    }

    /// Underlying method
    pub fn method(&self) -> &Arc<MethodLiteral> {
        &self.method
    }

    /// Native entry cached on the function, if bound
    pub fn binding(&self) -> Option<&MethodBinding> {
        self.binding.get()
    }

    /// Whether calls to this function enter compiled code
    pub fn is_compiled_code(&self) -> bool {
        self.binding.get().is_some()
    }

    pub(crate) fn set_binding(&self, binding: MethodBinding) -> bool {
        self.binding.set(binding).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_abc_name() {
        assert_eq!(normalize_abc_name("./entry/main.abc"), "entry/main.abc");
        assert_eq!(normalize_abc_name("entry\\main.abc"), "entry/main.abc");
        assert_eq!(normalize_abc_name("././a.abc"), "a.abc");
    }

    #[test]
    fn test_file_index_starts_unbound() {
        let file = BytecodeFile::new("./a.abc", b"bytecode");
        assert_eq!(file.name(), "a.abc");
        assert_eq!(file.checksum(), crc32fast::hash(b"bytecode"));
        assert!(!file.is_loaded_aot());
        file.set_aot_file_info_index(3);
        assert_eq!(file.aot_file_info_index(), Some(3));
    }

    #[test]
    fn test_binding_is_write_once() {
        let method = MethodLiteral::new(0x40);
        let first = MethodBinding {
            code_entry: 0x1000,
            is_fast_call: false,
            fp_delta: 16,
            file_index: 0,
            entry_index: 2,
        };
        assert!(method.set_binding(first));
        assert!(!method.set_binding(MethodBinding {
            code_entry: 0x2000,
            ..first
        }));
        assert_eq!(method.code_entry(), Some(0x1000));
    }
}
