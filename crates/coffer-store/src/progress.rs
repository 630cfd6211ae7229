//! Progress reporting capability for long-running operations.
//!
//! Housekeeping and the consistency checker accept a [`ProgressSink`] and
//! report milestones as plain method calls; implementations decide whether
//! that means log lines, counters or an interactive display. The default
//! implementations do nothing, so sinks implement only what they care
//! about.

use crate::types::ObjectId;

/// Receiver for progress events from housekeeping and the checker.
pub trait ProgressSink {
    /// A named phase of the operation has begun.
    fn phase(&mut self, _name: &str) {}

    /// An inconsistency was found (and fixed, when fixing is enabled).
    fn error_found(&mut self, _description: &str) {}

    /// An object was examined.
    fn object_scanned(&mut self, _id: ObjectId) {}

    /// An object was deleted to reclaim space or repair damage.
    fn object_deleted(&mut self, _id: ObjectId) {}
}

/// A sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {}

/// A sink that counts events; convenient for tools and tests.
#[derive(Debug, Default, Clone)]
pub struct CountingProgressSink {
    /// Number of errors reported.
    pub errors: u64,
    /// Number of objects scanned.
    pub scanned: u64,
    /// Number of objects deleted.
    pub deleted: u64,
    /// Phase names seen, in order.
    pub phases: Vec<String>,
}

impl ProgressSink for CountingProgressSink {
    fn phase(&mut self, name: &str) {
        self.phases.push(name.to_string());
    }

    fn error_found(&mut self, _description: &str) {
        self.errors += 1;
    }

    fn object_scanned(&mut self, _id: ObjectId) {
        self.scanned += 1;
    }

    fn object_deleted(&mut self, _id: ObjectId) {
        self.deleted += 1;
    }
}
