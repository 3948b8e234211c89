//! Call-site stack maps for AOT and JIT compiled code.
//!
//! A stack map section records, for every call site in a text section, which
//! stack slots hold live GC references and where the values of virtual
//! registers can be found for deoptimization. The section is produced once
//! when code is compiled and is read-only afterwards; lookups binary search
//! the call-site table and decode only the matching payload.
//!
//! # Example
//!
//! ```
//! use otter_aot_stackmap::{CallSiteInfo, DeoptValue, Location, StackMapBuilder, StackMapParser};
//!
//! let mut builder = StackMapBuilder::new();
//! builder.push(CallSiteInfo::new(0x10).with_root(Location::new(6, -40)));
//! builder.push(CallSiteInfo::new(0x40).with_deopt(3, DeoptValue::Constant(42)));
//! let section = builder.build().unwrap();
//!
//! let parser = StackMapParser::new(&section).unwrap();
//! assert!(parser.lookup(0x20).unwrap().is_none());
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod builder;
pub mod error;
pub mod header;
pub mod leb128;
pub mod parser;
pub mod types;
pub mod visit;

pub use builder::{DEOPT_ALIGN, StackMapBuilder, encode};
pub use error::{Result, StackMapError};
pub use header::{CallsiteHeader, StackMapHeader};
pub use leb128::{Leb128Reader, write_sleb128, write_uleb128};
pub use parser::{StackMapParser, parse};
pub use types::{
    CallSiteInfo, CalleeRegAndOffset, CalleeRegAndOffsetVec, DeoptEntry, DeoptKind, DeoptValue,
    DwarfReg, GC_ENTRY_SIZE, Location, StackMapEntry, Triple,
};
pub use visit::{FrameContext, RootVisitor, SlotMemory, visit_roots};
