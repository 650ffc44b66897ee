//! Client execution contexts and hang blame bookkeeping.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::backend::PagetableId;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        /// The context was executing when the GPU hung.
        const HUNG = 1 << 0;
        /// The context hung and the device recovered afterwards.
        const HANG_RECOVERED = 1 << 1;
    }
}

/// Reset status reported to the client owning a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResetStatus {
    #[default]
    None,
    InnocentReset,
    GuiltyReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub id: u32,
    pub pagetable: PagetableId,
    pub flags: ContextFlags,
    pub reset_status: ResetStatus,
    /// Binning base offset programmed before this context's draws.
    pub bin_base_offset: Option<u32>,
}

impl ExecutionContext {
    fn new(id: u32, pagetable: PagetableId) -> Self {
        Self {
            id,
            pagetable,
            flags: ContextFlags::empty(),
            reset_status: ResetStatus::None,
            bin_base_offset: None,
        }
    }

    pub fn is_hung(&self) -> bool {
        self.flags.contains(ContextFlags::HUNG)
    }
}

/// Live contexts keyed by id. Ids start at 1 and the lowest free id is
/// reused.
#[derive(Debug, Default)]
pub struct ContextTable {
    contexts: BTreeMap<u32, ExecutionContext>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, pagetable: PagetableId) -> u32 {
        let mut id = 1;
        for existing in self.contexts.keys() {
            if *existing != id {
                break;
            }
            id += 1;
        }
        self.contexts.insert(id, ExecutionContext::new(id, pagetable));
        id
    }

    pub fn destroy(&mut self, id: u32) -> Option<ExecutionContext> {
        self.contexts.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&ExecutionContext> {
        self.contexts.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ExecutionContext> {
        self.contexts.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionContext> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Flag the context that was running when the hang was detected.
    /// Returns `false` if no such context exists.
    pub fn mark_hung(&mut self, id: u32) -> bool {
        match self.contexts.get_mut(&id) {
            Some(ctx) => {
                ctx.flags |= ContextFlags::HUNG;
                true
            }
            None => false,
        }
    }

    /// Assign reset status to every live context after a recovery pass.
    ///
    /// After a failed pass every context is guilty and flagged hung.
    /// Otherwise a context stays guilty once guilty, becomes guilty if it is
    /// flagged hung or recovered from an earlier hang, and is innocent
    /// otherwise. The hung context additionally gains
    /// [`ContextFlags::HANG_RECOVERED`].
    pub fn mark_reset_status(&mut self, hung_context: u32, recovery_failed: bool) {
        for ctx in self.contexts.values_mut() {
            if recovery_failed {
                ctx.reset_status = ResetStatus::GuiltyReset;
                ctx.flags |= ContextFlags::HUNG;
                continue;
            }
            if ctx.id == hung_context && ctx.is_hung() {
                ctx.flags |= ContextFlags::HANG_RECOVERED;
            }
            if ctx.reset_status == ResetStatus::GuiltyReset {
                continue;
            }
            ctx.reset_status = if ctx
                .flags
                .intersects(ContextFlags::HUNG | ContextFlags::HANG_RECOVERED)
            {
                ResetStatus::GuiltyReset
            } else {
                ResetStatus::InnocentReset
            };
        }
    }
}
