//! # Otter AOT
//!
//! Loads ahead-of-time compiled code and ties it to the running VM:
//!
//! - [`AotFileRegistry`]: the containers loaded into the process, with
//!   lock-free-for-readers pc classification
//! - [`AotBinder`]: attaches native entries to bytecode methods, gated by
//!   the checksum recorded at compile time
//! - [`ai::SnapshotResolver`]: restores constant-pool caches from `.ai`
//!   snapshots and patches method entries once binding is done
//! - [`AotFileManager`]: the per-VM façade used by bootstrap, the bytecode
//!   loader, the GC and the profiler
//!
//! AOT is an optimization. Apart from build invariants on the stub file,
//! every failure leaves the affected bytecode running in the interpreter.
//!
//! ```no_run
//! use otter_aot::{AotConfig, AotFileManager, BytecodeFile};
//!
//! let config = AotConfig::from_env().with_aot_file_base("/data/app/entry/modules");
//! let manager = AotFileManager::new(config);
//! manager.bootstrap(&[]);
//!
//! let file = BytecodeFile::new("entry/main.abc", b"...");
//! if manager.bind_panda_file(&file) {
//!     manager.revise_after_binding([&file]);
//! }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ai;
pub mod binding;
pub mod bytecode;
pub mod config;
pub mod error;
pub mod file_info;
pub mod manager;
pub mod registry;
pub mod sampler;

pub use binding::{AotBinder, MethodEntryIndexMap, StubEntry, StubEntryTable};
pub use bytecode::{
    BytecodeFile, INVALID_INDEX, JsFunction, MethodBinding, MethodLiteral, normalize_abc_name,
};
pub use config::{AotConfig, parse_env_truthy};
pub use error::{AotError, Result};
pub use file_info::{AotFileInfo, AotFileKind};
pub use manager::{AI_EXTENSION, AN_EXTENSION, AotFileManager};
pub use registry::{AotFileEntry, AotFileRegistry, CodeRange};
pub use sampler::{Sample, SampleKind, SampleRegistry, TaskInfo};
