//! GC root visitation from decoded stack maps

use rustc_hash::FxHashSet;

use crate::error::{Result, StackMapError};
use crate::types::{CalleeRegAndOffset, Location, StackMapEntry, Triple};

/// Word-granular read access to a stopped thread's stack
pub trait SlotMemory {
    /// Read the machine word stored at `address`
    fn read_word(&self, address: usize) -> Option<u64>;
}

/// Receives the reference slots found while walking frames
pub trait RootVisitor {
    /// A single slot holding a tagged reference
    fn visit_root(&mut self, slot: usize);

    /// A contiguous run of slots `[start, end)`
    fn visit_range(&mut self, start: usize, end: usize);

    /// An interior pointer at `derived_slot` whose object base lives at
    /// `base_slot`. `base_value` is the base pointer before any relocation.
    fn visit_derived(&mut self, base_slot: usize, derived_slot: usize, base_value: u64);
}

/// Register state of one frame, enough to turn a [`Location`] into an address.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    /// Target register numbering
    pub triple: Triple,
    /// Frame pointer of the frame being visited
    pub fp: usize,
    /// Stack pointer at the call site
    pub callsite_sp: usize,
    /// Callee-saved registers spilled by this frame, as fp-relative offsets
    pub callee_regs: &'a [CalleeRegAndOffset],
}

impl<'a> FrameContext<'a> {
    /// Context without callee-saved registers
    pub fn new(triple: Triple, fp: usize, callsite_sp: usize) -> Self {
        Self {
            triple,
            fp,
            callsite_sp,
            callee_regs: &[],
        }
    }

    /// Attach the callee-saved register table
    pub fn with_callee_regs(mut self, callee_regs: &'a [CalleeRegAndOffset]) -> Self {
        self.callee_regs = callee_regs;
        self
    }

    /// Stack address described by `location`.
    ///
    /// FP and SP relative locations are computed directly. Any other
    /// register must have been spilled by this frame; its saved value is
    /// read back from the spill slot.
    pub fn slot_address(&self, location: Location, memory: &dyn SlotMemory) -> Result<usize> {
        let unresolvable = StackMapError::UnresolvableLocation { reg: location.reg };
        let base = if location.reg == self.triple.fp_reg() {
            self.fp
        } else if location.reg == self.triple.sp_reg() {
            self.callsite_sp
        } else {
            let (_, spill) = self
                .callee_regs
                .iter()
                .find(|(reg, _)| *reg == location.reg)
                .ok_or(unresolvable.clone())?;
            let spill_slot = offset_address(self.fp, *spill).ok_or(unresolvable.clone())?;
            let saved = memory
                .read_word(spill_slot)
                .ok_or(StackMapError::UnreadableSlot {
                    address: spill_slot,
                })?;
            usize::try_from(saved).map_err(|_| unresolvable.clone())?
        };
        offset_address(base, location.offset).ok_or(unresolvable)
    }
}

fn offset_address(base: usize, offset: i32) -> Option<usize> {
    base.checked_add_signed(offset as isize)
}

fn read(memory: &dyn SlotMemory, address: usize) -> Result<u64> {
    memory
        .read_word(address)
        .ok_or(StackMapError::UnreadableSlot { address })
}

/// Report the roots of one call site.
///
/// When the word at the base slot is zero the derived slot stands in for
/// the base. A base slot is reported at most once per walk; `seen` carries
/// the slots already reported. Returns the number of newly reported slots.
pub fn visit_roots(
    entries: &[StackMapEntry],
    ctx: &FrameContext<'_>,
    memory: &dyn SlotMemory,
    visitor: &mut dyn RootVisitor,
    seen: &mut FxHashSet<usize>,
) -> Result<usize> {
    let mut reported = 0;
    for entry in entries {
        let mut base = ctx.slot_address(entry.base, memory)?;
        let derived = ctx.slot_address(entry.derived, memory)?;
        if read(memory, base)? == 0 {
            base = derived;
        }
        let base_value = read(memory, base)?;
        if base_value == 0 {
            continue;
        }
        if seen.insert(base) {
            visitor.visit_root(base);
            reported += 1;
        }
        if base != derived {
            visitor.visit_derived(base, derived, base_value);
        }
    }
    Ok(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[derive(Default)]
    struct Words(FxHashMap<usize, u64>);

    impl SlotMemory for Words {
        fn read_word(&self, address: usize) -> Option<u64> {
            self.0.get(&address).copied()
        }
    }

    #[test]
    fn test_callee_saved_register_resolves_through_spill_slot() {
        let mut memory = Words::default();
        // rbx (DWARF 3) spilled at fp-8 and holding 0x9000
        memory.0.insert(0x1000 - 8, 0x9000);
        let regs = [(3u16, -8)];
        let ctx = FrameContext::new(Triple::X86_64, 0x1000, 0x0f00).with_callee_regs(&regs);
        assert_eq!(ctx.slot_address(Location::new(3, 16), &memory), Ok(0x9010));
        assert_eq!(ctx.slot_address(Location::new(6, -40), &memory), Ok(0x1000 - 40));
        assert_eq!(ctx.slot_address(Location::new(7, 24), &memory), Ok(0x0f00 + 24));
        assert_eq!(
            ctx.slot_address(Location::new(12, 0), &memory),
            Err(StackMapError::UnresolvableLocation { reg: 12 })
        );
    }

    #[test]
    fn test_aarch64_register_numbering() {
        let memory = Words::default();
        let ctx = FrameContext::new(Triple::Aarch64, 0x2000, 0x1800);
        assert_eq!(ctx.slot_address(Location::new(29, 16), &memory), Ok(0x2010));
        assert_eq!(ctx.slot_address(Location::new(31, 8), &memory), Ok(0x1808));
    }
}
