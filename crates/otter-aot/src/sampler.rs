//! Thread-to-task map for the sampling profiler.
//!
//! The profiler classifies the interrupted pc of a thread from inside a
//! signal handler. Nothing on that path may block: when the task map or
//! the file registry is locked the sample is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::trace;

use crate::file_info::AotFileKind;
use crate::registry::AotFileRegistry;

/// Task a thread is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    /// Task id
    pub task_id: u64,
    /// Display name
    pub name: String,
}

impl TaskInfo {
    /// Task `task_id` named `name`
    pub fn new(task_id: u64, name: impl Into<String>) -> Self {
        Self {
            task_id,
            name: name.into(),
        }
    }
}

/// Where a sampled pc was executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// Runtime stub
    Stub,
    /// AOT-compiled application code
    Aot,
    /// Interpreter, JIT or native code
    Other,
}

/// One classified sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Sampled thread
    pub thread_id: u64,
    /// Task the thread was running, if registered
    pub task: Option<TaskInfo>,
    /// Interrupted pc
    pub pc: usize,
    /// Code the pc belongs to
    pub kind: SampleKind,
}

/// Registered tasks plus sample counters
#[derive(Debug, Default)]
pub struct SampleRegistry {
    tasks: Mutex<FxHashMap<u64, TaskInfo>>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl SampleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `thread_id` runs `task`
    pub fn register(&self, thread_id: u64, task: TaskInfo) {
        self.tasks.lock().insert(thread_id, task);
    }

    /// Forget `thread_id`
    pub fn unregister(&self, thread_id: u64) -> Option<TaskInfo> {
        self.tasks.lock().remove(&thread_id)
    }

    /// Task registered for `thread_id`
    pub fn task(&self, thread_id: u64) -> Option<TaskInfo> {
        self.tasks.lock().get(&thread_id).cloned()
    }

    /// Classify `pc` of `thread_id` without blocking.
    ///
    /// Returns `None`, and counts a dropped sample, when either lock is
    /// held by another thread.
    pub fn sample(&self, thread_id: u64, pc: usize, registry: &AotFileRegistry) -> Option<Sample> {
        let Some(tasks) = self.tasks.try_lock() else {
            return self.drop_sample(thread_id, "task map");
        };
        let task = tasks.get(&thread_id).cloned();
        drop(tasks);
        let Ok(kind) = registry.try_classify(pc) else {
            return self.drop_sample(thread_id, "file registry");
        };
        self.recorded.fetch_add(1, Ordering::Relaxed);
        Some(Sample {
            thread_id,
            task,
            pc,
            kind: match kind {
                Some(AotFileKind::Stub) => SampleKind::Stub,
                Some(AotFileKind::An) => SampleKind::Aot,
                None => SampleKind::Other,
            },
        })
    }

    fn drop_sample(&self, thread_id: u64, contended: &'static str) -> Option<Sample> {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(thread_id, contended, "dropped profiler sample");
        None
    }

    /// Samples classified so far
    pub fn recorded_samples(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Samples dropped because a lock was held
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_sample() {
        let samples = SampleRegistry::new();
        let registry = AotFileRegistry::new();
        samples.register(7, TaskInfo::new(1, "main"));
        let sample = samples.sample(7, 0x1234, &registry).unwrap();
        assert_eq!(sample.kind, SampleKind::Other);
        assert_eq!(sample.task, Some(TaskInfo::new(1, "main")));
        assert_eq!(samples.unregister(7).map(|task| task.task_id), Some(1));
        assert!(samples.sample(7, 0x1234, &registry).unwrap().task.is_none());
        assert_eq!(samples.recorded_samples(), 2);
    }

    #[test]
    fn test_sample_dropped_while_task_map_locked() {
        let samples = SampleRegistry::new();
        let registry = AotFileRegistry::new();
        let guard = samples.tasks.lock();
        assert!(samples.sample(1, 0x10, &registry).is_none());
        drop(guard);
        assert_eq!(samples.dropped_samples(), 1);
        assert_eq!(samples.recorded_samples(), 0);
    }

    #[test]
    fn test_sample_dropped_while_registry_loads() {
        let samples = SampleRegistry::new();
        let registry = AotFileRegistry::new();
        let guard = registry.hold_write_lock();
        assert!(samples.sample(1, 0x10, &registry).is_none());
        drop(guard);
        assert!(samples.sample(1, 0x10, &registry).is_some());
        assert_eq!(samples.dropped_samples(), 1);
    }
}
