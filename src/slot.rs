//! Slots: the only data channel between modules (`spec.md` §3, §4.3).
//!
//! A slot is an ordered pair `(producer_module, output_name) ->
//! (consumer_module, input_name)`. The producer accumulates
//! created/updated/deleted row-ids into an append-only [`OutputLog`]; each
//! bound [`Slot`] keeps its own read cursor into that log so independent
//! consumers of a fan-out producer advance at their own pace (`spec.md`
//! §8 scenario 2).

use std::collections::VecDeque;

use crate::name::ModuleName;

/// A stable row identifier, standing in for the storage layer's "stable
/// row-ids" (`spec.md` §6 — storage is an external collaborator here).
pub type RowId = u64;

/// Declares one input or output slot a module kind exposes: its name,
/// a type tag checked for compatibility across a connection, and
/// whether binding it is mandatory for the module to validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub name: &'static str,
    pub payload_type: &'static str,
    pub required: bool,
}

impl SlotDescriptor {
    pub const fn new(name: &'static str, payload_type: &'static str, required: bool) -> Self {
        SlotDescriptor {
            name,
            payload_type,
            required,
        }
    }
}

/// Name of the implicit trace output every module exposes (`spec.md` §3).
pub const TRACE_SLOT: &str = "_trace";
/// Name of the implicit parameters input every module exposes (`spec.md` §3).
pub const PARAMS_SLOT: &str = "_params";

/// A window of row-ids a consumer has not yet drained, in emission order.
/// Backed by a `VecDeque` so `next(n)` can pop a contiguous prefix in
/// O(n) without disturbing emission order, matching "returning a
/// contiguous range or set" (`spec.md` §4.3).
#[derive(Debug, Clone, Default)]
pub struct ChangeBuffer {
    pending: VecDeque<RowId>,
}

impl ChangeBuffer {
    pub fn any(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consume up to `n` row-ids, advancing the read cursor.
    pub fn next(&mut self, n: usize) -> Vec<RowId> {
        let take = n.min(self.pending.len());
        self.pending.drain(..take).collect()
    }

    fn extend(&mut self, ids: impl IntoIterator<Item = RowId>) {
        self.pending.extend(ids);
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// The producer-side append-only record of everything it has ever
/// emitted on one output, plus the run_number of its most recent
/// emission (used by `Module::is_ready`'s staleness check: "producer's
/// `last_update` > slot's `last_update`").
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    created: Vec<RowId>,
    updated: Vec<RowId>,
    deleted: Vec<RowId>,
    last_update: u64,
}

impl OutputLog {
    pub fn emit_created(&mut self, ids: impl IntoIterator<Item = RowId>, run_number: u64) {
        self.created.extend(ids);
        self.last_update = run_number;
    }

    pub fn emit_updated(&mut self, ids: impl IntoIterator<Item = RowId>, run_number: u64) {
        self.updated.extend(ids);
        self.last_update = run_number;
    }

    pub fn emit_deleted(&mut self, ids: impl IntoIterator<Item = RowId>, run_number: u64) {
        self.deleted.extend(ids);
        self.last_update = run_number;
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }
}

/// One connection: `(producer, output_name) -> (consumer, input_name)`.
#[derive(Debug, Clone)]
pub struct Slot {
    pub producer: ModuleName,
    pub output_name: String,
    pub consumer: ModuleName,
    pub input_name: String,
    pub producer_type: &'static str,
    pub consumer_type: &'static str,

    pub created: ChangeBuffer,
    pub updated: ChangeBuffer,
    pub deleted: ChangeBuffer,

    cursor_created: usize,
    cursor_updated: usize,
    cursor_deleted: usize,
    last_update: u64,
}

impl Slot {
    pub fn new(
        producer: ModuleName,
        output_name: impl Into<String>,
        consumer: ModuleName,
        input_name: impl Into<String>,
        producer_type: &'static str,
        consumer_type: &'static str,
    ) -> Self {
        Slot {
            producer,
            output_name: output_name.into(),
            consumer,
            input_name: input_name.into(),
            producer_type,
            consumer_type,
            created: ChangeBuffer::default(),
            updated: ChangeBuffer::default(),
            deleted: ChangeBuffer::default(),
            cursor_created: 0,
            cursor_updated: 0,
            cursor_deleted: 0,
            last_update: 0,
        }
    }

    /// Producer output descriptor type assignable to consumer input
    /// descriptor type (`spec.md` §4.3). This core does not model a full
    /// type lattice, so "assignable" is exact match or a wildcard `"any"`
    /// on either side.
    pub fn validate_types(&self) -> bool {
        self.producer_type == "any"
            || self.consumer_type == "any"
            || self.producer_type == self.consumer_type
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn has_buffered(&self) -> bool {
        self.created.any() || self.updated.any() || self.deleted.any()
    }

    /// Sync against the producer: pull any log entries appended since
    /// this slot's cursors, and advance `last_update`.
    pub fn update(&mut self, log: &OutputLog, run_number: u64) {
        if self.cursor_created < log.created.len() {
            self.created.extend(log.created[self.cursor_created..].iter().copied());
            self.cursor_created = log.created.len();
        }
        if self.cursor_updated < log.updated.len() {
            self.updated.extend(log.updated[self.cursor_updated..].iter().copied());
            self.cursor_updated = log.updated.len();
        }
        if self.cursor_deleted < log.deleted.len() {
            self.deleted.extend(log.deleted[self.cursor_deleted..].iter().copied());
            self.cursor_deleted = log.deleted.len();
        }
        self.last_update = run_number;
    }

    /// Re-read from producer from the beginning: drop all buffered and
    /// already-consumed state and re-pull the producer's entire log
    /// (used when a consumer detects its own state is stale, e.g. after
    /// producer deletions — `spec.md` §4.3).
    pub fn reset(&mut self, log: &OutputLog, run_number: u64) {
        self.created.clear();
        self.updated.clear();
        self.deleted.clear();
        self.cursor_created = 0;
        self.cursor_updated = 0;
        self.cursor_deleted = 0;
        self.update(log, run_number);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "output_module": self.producer.as_str(),
            "output_name": self.output_name,
            "input_module": self.consumer.as_str(),
            "input_name": self.input_name,
            "last_update": self.last_update,
        })
    }
}
