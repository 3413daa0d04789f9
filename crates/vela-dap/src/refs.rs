//! Variable reference store.
//!
//! Every DAP `variablesReference` handed to the client maps to an entry here,
//! stamped with the owning thread's suspension generation. Resolving a
//! reference whose generation has been left behind is the client reusing a
//! token across a resume, which must surface as `STALE_REFERENCE` rather than
//! silently reading a different suspension's state.
//!
//! The store is bounded: past `max_refs` the oldest entries are evicted in
//! FIFO order so long sessions cannot grow without limit.

use std::collections::{HashMap, VecDeque};

use vela_vdwp::{FrameId, ObjectId, RefTag, ThreadId, TypeDesc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Locals,
    Globals,
}

impl ScopeKind {
    pub fn title(self) -> &'static str {
        match self {
            ScopeKind::Locals => "Locals",
            ScopeKind::Globals => "Globals",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefTarget {
    /// A frame scope; children are the scope's named bindings.
    Scope { frame: FrameId, kind: ScopeKind },
    /// A runtime object; children depend on its tag.
    Object {
        object: ObjectId,
        tag: RefTag,
        type_desc: TypeDesc,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefEntry {
    pub thread: ThreadId,
    pub generation: u64,
    pub target: RefTarget,
}

pub struct VarStore {
    next_ref: i64,
    entries: HashMap<i64, RefEntry>,
    // Dedupe: the same target interned twice within one suspension yields the
    // same reference, so repeated `variables` fetches are stable.
    index: HashMap<(ThreadId, u64, RefTarget), i64>,
    fifo: VecDeque<i64>,
    max_refs: usize,
}

impl VarStore {
    pub fn new(max_refs: usize) -> Self {
        Self {
            next_ref: 1,
            entries: HashMap::new(),
            index: HashMap::new(),
            fifo: VecDeque::new(),
            max_refs: max_refs.max(1),
        }
    }

    /// Return the reference for `target` under this suspension, allocating on
    /// first use.
    pub fn intern(&mut self, thread: ThreadId, generation: u64, target: RefTarget) -> i64 {
        if let Some(existing) = self.index.get(&(thread, generation, target)) {
            return *existing;
        }

        let var_ref = self.next_ref;
        self.next_ref += 1;
        self.entries.insert(
            var_ref,
            RefEntry {
                thread,
                generation,
                target,
            },
        );
        self.index.insert((thread, generation, target), var_ref);
        self.fifo.push_back(var_ref);
        self.maybe_evict();
        var_ref
    }

    pub fn get(&self, var_ref: i64) -> Option<RefEntry> {
        self.entries.get(&var_ref).copied()
    }

    fn maybe_evict(&mut self) {
        while self.fifo.len() > self.max_refs {
            let Some(oldest) = self.fifo.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.index
                    .remove(&(entry.thread, entry.generation, entry.target));
            }
        }
    }
}
