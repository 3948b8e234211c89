//! Heap snapshots for fast startup.
//!
//! A snapshot is the subgraph reachable from a set of root values, written
//! breadth first with every object encoded once. Objects are grouped into
//! regions by the space they belong to so a reader can size each region
//! before fixing up references; strings follow in their own region and are
//! interned on restore. AOT "ai" files are snapshots whose single root is a
//! constant-pool table.
//!
//! Loading a snapshot is an optimization: every failure is reported as a
//! [`SnapshotError`] and the caller builds the state from scratch.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod deserializer;
pub mod error;
pub mod header;
pub mod heap;
pub mod serializer;

pub use deserializer::{Deserializer, SnapshotImage};
pub use error::{Result, SnapshotError};
pub use header::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION, SnapshotHeader};
pub use heap::{
    GcMode, Heap, HeapObject, MAX_REGULAR_OBJECT_SIZE, MAX_SNAPSHOT_SPACES, ObjectClass, ObjectId,
    Space, TaggedValue,
};
pub use serializer::Serializer;
