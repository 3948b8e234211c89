//! ai files: constant-pool and literal caches computed by the AOT compiler.
//!
//! An ai file is a heap snapshot whose single root is a tagged array of
//! top items, [`SNAPSHOT_DATA_ITEM_SIZE`] values per compiled bytecode file:
//!
//! ```text
//! root      = [fileInfo, cpArray, fileInfo, cpArray, ...]
//! fileInfo  = [Int(fileIndex), String(fileName)]
//! cpArray   = [Int(cpId), pool, Int(cpId), pool, ...]
//! pool      = [Int(index), item, Int(index), item, ...]
//! item      = String
//!           | AotMethodInfo [Int(methodOffset), Int(entryIndex)]
//!           | AotLiteralInfo [Int(kind), ihc, chc, [AotMethodInfo, ...]]
//! ```
//!
//! Entry indices are only known once methods are bound, which happens after
//! the file is read. The compiler therefore writes [`NO_FUNC_ENTRY_VALUE`]
//! for them; every such placeholder becomes a [`PendingPatch`] that
//! [`SnapshotResolver::finalize`] resolves once binding is done.

pub mod constant_pool;
pub mod hidden_class;
pub mod resolver;
pub mod writer;

pub use constant_pool::{ConstPoolSlot, ConstantPool, LiteralInfo, LiteralKind, MethodEntry};
pub use hidden_class::{HiddenClassLayout, Representation};
pub use resolver::{FrameworkPatchHook, PatchLocation, PendingPatch, SnapshotResolver};
pub use writer::{AiFileBuilder, AiItem, AiMethod};

/// Entry index value of a method with no AOT code
pub const NO_FUNC_ENTRY_VALUE: i64 = -1;

/// Values per top item: file info and constant-pool array
pub const SNAPSHOT_DATA_ITEM_SIZE: usize = 2;

/// Values per constant-pool array item: pool id and pool
pub const SNAPSHOT_CP_ARRAY_ITEM_SIZE: usize = 2;
