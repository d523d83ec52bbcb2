//! Shareable IRQ handler chains.
//!
//! Drivers register actions on a vector through this layer instead of
//! owning the raw table slot. Actions live in an arena and are chained by
//! index, so removing one never leaves a dangling link.
//!
//! A vector either holds a single exclusive action or any number of
//! shareable ones.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use super::IrqContext;
use crate::config::VECTOR_COUNT;

/// Outcome reported by a chained handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt came from this handler's device.
    Handled,
    /// Not ours; keep walking the chain.
    NotMine,
}

/// Result of [`GenericIrq::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Installed under the returned id.
    Success(IrqActionId),
    /// The sharing policy forbids another handler on this vector.
    AlreadyExists,
}

/// Result of [`GenericIrq::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    /// The action was unlinked.
    Success,
    /// No such action on that vector.
    NotExist,
}

/// Handle to an installed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqActionId(usize);

type ActionFn = Arc<dyn Fn(&mut IrqContext<'_>) -> IrqReturn + Send + Sync>;

struct IrqAction {
    vector: u8,
    shareable: bool,
    handler: ActionFn,
    next: Option<usize>,
}

struct Chains {
    arena: Vec<Option<IrqAction>>,
    free: Vec<usize>,
    heads: [Option<usize>; VECTOR_COUNT],
}

impl Chains {
    fn chain(&self, vector: u8) -> ChainIter<'_> {
        ChainIter {
            chains: self,
            next: self.heads[usize::from(vector)],
        }
    }
}

struct ChainIter<'a> {
    chains: &'a Chains,
    next: Option<usize>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (usize, &'a IrqAction);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let action = self.chains.arena[index].as_ref()?;
        self.next = action.next;
        Some((index, action))
    }
}

/// Per-vector handler chains.
pub struct GenericIrq {
    chains: RwLock<Chains>,
}

impl Default for GenericIrq {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericIrq {
    /// Create an empty set of chains.
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(Chains {
                arena: Vec::new(),
                free: Vec::new(),
                heads: [None; VECTOR_COUNT],
            }),
        }
    }

    /// Returns `true` if any action is installed on `vector`.
    pub fn has_handlers(&self, vector: u8) -> bool {
        self.chains.read().heads[usize::from(vector)].is_some()
    }

    /// Install `handler` on `vector`.
    ///
    /// Fails with `AlreadyExists` if `shareable` is false and the vector
    /// already has a handler, or if the existing handler is exclusive.
    pub fn request(
        &self,
        vector: u8,
        shareable: bool,
        handler: impl Fn(&mut IrqContext<'_>) -> IrqReturn + Send + Sync + 'static,
    ) -> InstallStatus {
        let mut chains = self.chains.write();
        let mut existing = chains.chain(vector).peekable();
        if existing.peek().is_some() {
            let all_shareable = existing.all(|(_, action)| action.shareable);
            if !shareable || !all_shareable {
                return InstallStatus::AlreadyExists;
            }
        }

        let head = chains.heads[usize::from(vector)];
        let action = IrqAction {
            vector,
            shareable,
            handler: Arc::new(handler),
            next: head,
        };
        let index = match chains.free.pop() {
            Some(index) => {
                chains.arena[index] = Some(action);
                index
            }
            None => {
                chains.arena.push(Some(action));
                chains.arena.len() - 1
            }
        };
        chains.heads[usize::from(vector)] = Some(index);
        InstallStatus::Success(IrqActionId(index))
    }

    /// Remove a previously installed action.
    pub fn free(&self, vector: u8, id: IrqActionId) -> RemoveStatus {
        let mut chains = self.chains.write();
        let target = match chains.arena.get(id.0) {
            Some(Some(action)) if action.vector == vector => action.next,
            _ => return RemoveStatus::NotExist,
        };

        let mut prev = None;
        let mut cursor = chains.heads[usize::from(vector)];
        while let Some(index) = cursor {
            if index == id.0 {
                break;
            }
            prev = Some(index);
            cursor = chains.arena[index].as_ref().and_then(|a| a.next);
        }
        if cursor.is_none() {
            return RemoveStatus::NotExist;
        }

        match prev {
            None => chains.heads[usize::from(vector)] = target,
            Some(p) => {
                if let Some(action) = chains.arena[p].as_mut() {
                    action.next = target;
                }
            }
        }
        chains.arena[id.0] = None;
        chains.free.push(id.0);
        RemoveStatus::Success
    }

    /// Run every action on the vector. Returns `true` if one claimed it.
    pub fn handle(&self, ctx: &mut IrqContext<'_>) -> bool {
        let handlers: Vec<ActionFn> = self
            .chains
            .read()
            .chain(ctx.vector)
            .map(|(_, action)| action.handler.clone())
            .collect();
        let chained = !handlers.is_empty();
        let mut claimed = false;
        for handler in handlers {
            if handler(ctx) == IrqReturn::Handled {
                claimed = true;
            }
        }
        if chained && !claimed {
            log::debug!(target: "irq", "no chained handler claimed vector {:#x}", ctx.vector);
        }
        claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handled(_: &mut IrqContext<'_>) -> IrqReturn {
        IrqReturn::Handled
    }

    #[test]
    fn empty_vector_accepts_any_handler() {
        let irqs = GenericIrq::new();
        assert!(matches!(irqs.request(40, false, handled), InstallStatus::Success(_)));
        assert!(matches!(irqs.request(41, true, handled), InstallStatus::Success(_)));
    }

    #[test]
    fn exclusive_handler_rejects_additions() {
        let irqs = GenericIrq::new();
        assert!(matches!(irqs.request(40, false, handled), InstallStatus::Success(_)));
        assert_eq!(irqs.request(40, true, handled), InstallStatus::AlreadyExists);
        assert_eq!(irqs.request(40, false, handled), InstallStatus::AlreadyExists);
    }

    #[test]
    fn non_shareable_rejected_on_shared_vector() {
        let irqs = GenericIrq::new();
        assert!(matches!(irqs.request(40, true, handled), InstallStatus::Success(_)));
        assert!(matches!(irqs.request(40, true, handled), InstallStatus::Success(_)));
        assert_eq!(irqs.request(40, false, handled), InstallStatus::AlreadyExists);
    }

    #[test]
    fn free_unlinks_and_reports_missing() {
        let irqs = GenericIrq::new();
        let InstallStatus::Success(a) = irqs.request(40, true, handled) else {
            panic!("install failed");
        };
        let InstallStatus::Success(b) = irqs.request(40, true, handled) else {
            panic!("install failed");
        };
        assert_eq!(irqs.free(41, a), RemoveStatus::NotExist);
        assert_eq!(irqs.free(40, a), RemoveStatus::Success);
        assert_eq!(irqs.free(40, a), RemoveStatus::NotExist);
        assert!(irqs.has_handlers(40));
        assert_eq!(irqs.free(40, b), RemoveStatus::Success);
        assert!(!irqs.has_handlers(40));
        // Freed slots are reused and an exclusive handler now fits.
        assert!(matches!(irqs.request(40, false, handled), InstallStatus::Success(_)));
    }
}
