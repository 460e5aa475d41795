//! The block recompiler driver: Pass 0 -> function allocation -> the
//! translate loop -> Pass 2, plus the physical-page alias registry that
//! backs `init_block`/`deinit_block`/`invalidate_block`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::analyzer::analyze_pass0;
use crate::collaborators::{CacheMaintenance, InvalidCodeBits, MemoryTranslator, OpcodeTranslator, RecompCache, RegisterMapper};
use crate::config::{PAGE_INSTR_COUNT, RecompilerConfig};
use crate::cursor::{EmitCursor, SourceCursor, TranslationCursor};
use crate::error::RecompileError;
use crate::host;
use crate::mips::GuestInstruction;
use crate::page::{Function, FunctionId, HostSlot, Page, PageShared};
use crate::patch::{JumpKind, JumpPatchTable, JumpRecord};

/// Convention for the recompiler's own fabricated "jump pad", emitted when a
/// function runs off the end of its page without resolving to a clean
/// terminator (`use_register_maps == false`). Register allocation proper is
/// out of scope for this crate (see [`RegisterMapper`]); the pad needs
/// exactly one scratch register to materialize the next guest PC, so it
/// reserves PowerPC `r3` for this purpose by convention and writes the value
/// through `r13`, treated as a fixed pointer to the host CPU context (a
/// common PowerPC calling-convention choice for a reserved state pointer).
const PAD_SCRATCH_REGISTER: u8 = 3;
const CONTEXT_POINTER_REGISTER: u8 = 13;
const CONTEXT_PC_FIELD_OFFSET: i16 = 0;

/// Average number of host instructions a single guest instruction expands
/// into. Used only to size the initial allocation request; an undersized
/// guess just costs an extra `realloc` once emission catches up to the
/// headroom check.
const HOST_EXPANSION_ESTIMATE: usize = 4;

/// Maps guest virtual addresses to the physical-page-scoped [`PageShared`]
/// state every virtual alias of that page must see. The two fixed
/// KSEG0/KSEG1 mirrors (`[0x8000_0000, 0xA000_0000)` cached and
/// `[0xA000_0000, 0xC000_0000)` uncached) both map straight onto the low
/// 29 bits of the address; anything else goes through [`MemoryTranslator`].
#[derive(Debug, Default)]
pub struct PageRegistry {
    shared_by_phys_page: HashMap<u32, Rc<RefCell<PageShared>>>,
}

impl PageRegistry {
    /// An empty registry with no physical pages yet resident.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a guest virtual address to a physical address, applying the
    /// two KSEG mirrors before falling back to `mem`.
    #[must_use]
    pub fn translate(vaddr: u32, mem: &dyn MemoryTranslator) -> u32 {
        match vaddr {
            0x8000_0000..=0x9FFF_FFFF => vaddr - 0x8000_0000,
            0xA000_0000..=0xBFFF_FFFF => vaddr - 0xA000_0000,
            _ => mem.virtual_to_physical(vaddr, 0),
        }
    }

    /// The physical page index (`physical_address >> 12`) a virtual address
    /// resolves to.
    #[must_use]
    pub fn physical_page_index(vaddr: u32, mem: &dyn MemoryTranslator) -> u32 {
        Self::translate(vaddr, mem) >> 12
    }

    /// Return a [`Page`] window onto `vaddr`'s containing 4 KiB page,
    /// creating fresh shared translation state the first time this physical
    /// page is seen and reusing it (aliased) on every subsequent call,
    /// regardless of which virtual window asked.
    pub fn page_for(
        &mut self,
        vaddr: u32,
        guest_code: Rc<RefCell<[GuestInstruction; PAGE_INSTR_COUNT]>>,
        mem: &dyn MemoryTranslator,
    ) -> Page {
        let page_start = vaddr & !(crate::config::PAGE_SIZE_BYTES - 1);
        let phys_index = Self::physical_page_index(page_start, mem);
        let shared = self
            .shared_by_phys_page
            .entry(phys_index)
            .or_insert_with(|| Rc::new(RefCell::new(PageShared::default())))
            .clone();
        Page::new_aliased(page_start, guest_code, &shared)
    }

    /// Drop this physical page's shared translation state entirely. Any
    /// `Page` handles still held by a caller become standalone (no longer
    /// aliased to anything); a fresh call to [`Self::page_for`] starts over.
    pub fn forget(&mut self, vaddr: u32, mem: &dyn MemoryTranslator) {
        let page_start = vaddr & !(crate::config::PAGE_SIZE_BYTES - 1);
        let phys_index = Self::physical_page_index(page_start, mem);
        self.shared_by_phys_page.remove(&phys_index);
    }

    /// Shared state for `vaddr`'s physical page, if it has been created.
    #[must_use]
    pub fn shared_for(&self, vaddr: u32, mem: &dyn MemoryTranslator) -> Option<Rc<RefCell<PageShared>>> {
        let page_start = vaddr & !(crate::config::PAGE_SIZE_BYTES - 1);
        let phys_index = Self::physical_page_index(page_start, mem);
        self.shared_by_phys_page.get(&phys_index).cloned()
    }
}

/// Guard that clears a page's re-entrancy flag on every exit path, including
/// the `?`-propagated error paths through [`recompile_block`].
struct RecompileGuard {
    shared: Rc<RefCell<PageShared>>,
}

impl Drop for RecompileGuard {
    fn drop(&mut self) {
        self.shared.borrow_mut().recompiling = false;
    }
}

fn enter_recompile(shared: &Rc<RefCell<PageShared>>) -> RecompileGuard {
    {
        let mut s = shared.borrow_mut();
        assert!(!s.recompiling, "recompile_block re-entered for the same physical page");
        s.recompiling = true;
    }
    RecompileGuard { shared: Rc::clone(shared) }
}

/// Create (or look up) the page window for `vaddr` and return it. The
/// thinnest possible wrapper over [`PageRegistry::page_for`], kept as a
/// free function so callers mirror the original `init_block`/`deinit_block`/
/// `invalidate_block` entry-point names.
pub fn init_block(
    registry: &mut PageRegistry,
    vaddr: u32,
    guest_code: Rc<RefCell<[GuestInstruction; PAGE_INSTR_COUNT]>>,
    mem: &dyn MemoryTranslator,
) -> Page {
    registry.page_for(vaddr, guest_code, mem)
}

/// Tear down a physical page's translations entirely: free every function's
/// cache allocation, then drop the shared state so the next `init_block`
/// starts from scratch. Used when a page's backing guest memory is being
/// repurposed (e.g. a ROM/RAM remap), as opposed to [`invalidate_block`]'s
/// "the code changed, recompile it" case.
pub fn deinit_block(
    registry: &mut PageRegistry,
    vaddr: u32,
    mem: &dyn MemoryTranslator,
    cache: &mut dyn RecompCache,
) {
    let page_start = vaddr & !(crate::config::PAGE_SIZE_BYTES - 1);
    if let Some(shared) = registry.shared_for(page_start, mem) {
        let shared = shared.borrow();
        for function in shared.functions.values() {
            cache.free(page_start + 4 * function.start_offset);
        }
    }
    registry.forget(page_start, mem);
}

/// Mark a physical page's compiled code invalid and discard its
/// translations, but keep the physical page's shared-state slot (and thus
/// every existing virtual alias's [`Page`] handle) alive for the next
/// `recompile_block` call.
pub fn invalidate_block(
    registry: &mut PageRegistry,
    vaddr: u32,
    mem: &dyn MemoryTranslator,
    invalid_bits: &mut dyn InvalidCodeBits,
    cache: &mut dyn RecompCache,
) {
    let page_start = vaddr & !(crate::config::PAGE_SIZE_BYTES - 1);
    let phys_index = PageRegistry::physical_page_index(page_start, mem);
    invalid_bits.set(phys_index, true);
    if let Some(shared) = registry.shared_for(page_start, mem) {
        let mut shared = shared.borrow_mut();
        for function in shared.functions.values() {
            cache.free(page_start + 4 * function.start_offset);
        }
        shared.clear();
    }
}

/// Recompile the guest function starting at `entry_vaddr`, which must lie
/// within `page`.
///
/// Runs Pass 0, evicts any existing function whose range overlaps the new
/// one, allocates host storage through `cache`, runs the translate loop
/// (calling `translator.convert()` once per guest instruction and
/// `register_mapper.start_new_mapping()` at every flush point), emits a
/// jump pad if the function did not terminate cleanly within the page, and
/// finally resolves every deferred jump recorded along the way (Pass 2)
/// before flushing the host caches.
pub fn recompile_block(
    page: &Page,
    entry_vaddr: u32,
    config: &RecompilerConfig,
    translator: &mut dyn OpcodeTranslator,
    register_mapper: &mut dyn RegisterMapper,
    cache: &mut dyn RecompCache,
    cache_maint: &mut dyn CacheMaintenance,
) -> Result<(), RecompileError> {
    let _guard = enter_recompile(&page.shared);

    let entry_offset = ((entry_vaddr & 0xFFF) >> 2) as usize;

    let pass0 = {
        let guest = page.guest_code.borrow();
        analyze_pass0(&guest, page.start_address, entry_offset)?
    };

    let new_end_offset = if pass0.use_register_maps {
        pass0.src_last_offset as u32
    } else {
        0
    };

    evict_overlapping(page, cache, entry_offset as u32, new_end_offset);

    let guest_len = pass0.src_last_offset - entry_offset;
    let pad_len = if pass0.use_register_maps { 0 } else { 3 };
    let initial_capacity = guest_len
        .saturating_mul(HOST_EXPANSION_ESTIMATE)
        .max(config.min_grow)
        + pad_len
        + config.emit_headroom;

    let allocation = cache.alloc(entry_vaddr, initial_capacity).map_err(|err| {
        warn!("cache allocation failed for guest address 0x{entry_vaddr:08X}: {err}");
        err
    })?;

    let function_id = page.shared.borrow_mut().allocate_function_id();
    let mut function = Function {
        start_offset: entry_offset as u32,
        end_offset: new_end_offset,
        base_address: allocation.base_address,
        code: Vec::with_capacity(initial_capacity),
    };

    register_mapper.start_new_block();

    let mut capacity = initial_capacity;
    let mut jumps = JumpPatchTable::new(config.max_jumps);
    let mut pos = entry_offset;
    let limit = pass0.src_last_offset;

    while pos < limit {
        if function.code.len() + config.emit_headroom >= capacity {
            let new_capacity = capacity + capacity.max(2 * config.min_grow) / 2;
            let allocation = cache.realloc(entry_vaddr, new_capacity)?;
            function.base_address = allocation.base_address;
            capacity = new_capacity;
            function.code.reserve(new_capacity.saturating_sub(function.code.len()));
        }

        if pass0.use_register_maps {
            if pass0.is_jump_dst[pos] {
                register_mapper.start_new_mapping();
            }
        } else {
            register_mapper.start_new_mapping();
        }

        {
            let mut shared = page.shared.borrow_mut();
            shared.host_map[pos] = Some(HostSlot {
                function: function_id,
                offset: function.code.len() as u32,
            });
        }

        let next_pos = {
            let guest = page.guest_code.borrow();
            let mut source = SourceCursor::new(&guest, pos, page.start_address + 4 * pos as u32);
            source.set_limit(limit);
            let emit = EmitCursor::new(&mut function.code, function_id);
            let mut shared = page.shared.borrow_mut();
            let mut cursor = TranslationCursor::new(
                source,
                emit,
                &mut jumps,
                &mut shared.host_map,
                &pass0.is_jump_dst,
            );
            translator.convert(&mut cursor)?;
            cursor.source_position()
        };

        debug_assert!(next_pos > pos, "convert() must consume at least one instruction");
        pos = next_pos;
    }

    register_mapper.start_new_mapping();

    if !pass0.use_register_maps {
        emit_jump_pad(&mut function, pass0.addr_last);
    }

    patch_all(&mut function, jumps.drain(), &page.shared.borrow().host_map, function_id)?;

    cache_maint.dc_flush_range(function.base_address, function.code.len() * 4);
    cache_maint.ic_invalidate_range(function.base_address, function.code.len() * 4);

    debug!(
        "recompiled guest 0x{entry_vaddr:08X}: {} guest instrs -> {} host instrs",
        guest_len,
        function.code.len()
    );

    page.shared.borrow_mut().functions.insert(function_id, function);

    Ok(())
}

fn evict_overlapping(page: &Page, cache: &mut dyn RecompCache, start: u32, end: u32) {
    let evicted_addrs: Vec<u32> = {
        let mut shared = page.shared.borrow_mut();
        let victims: Vec<FunctionId> = shared
            .functions
            .iter()
            .filter(|(_, f)| f.overlaps(start, end))
            .map(|(id, _)| *id)
            .collect();

        let mut addrs = Vec::with_capacity(victims.len());
        for id in victims {
            if let Some(f) = shared.functions.remove(&id) {
                let (s, e) = f.resolved_range();
                shared.clear_host_map_range(id, s, e);
                addrs.push(page.start_address + 4 * f.start_offset);
            }
        }
        addrs
    };
    for addr in evicted_addrs {
        cache.free(addr);
    }
}

/// Emit the "ran off the end of the page" pad: materialize the guest PC the
/// function stopped at into [`PAD_SCRATCH_REGISTER`], store it to the fixed
/// context-PC field, and return to the dispatcher.
fn emit_jump_pad(function: &mut Function, next_guest_pc: u32) {
    let [hi, lo] = host::gen::load_const32(PAD_SCRATCH_REGISTER, next_guest_pc);
    function.code.push(hi);
    function.code.push(lo);
    function.code.push(host::gen::stw(
        PAD_SCRATCH_REGISTER,
        CONTEXT_POINTER_REGISTER,
        CONTEXT_PC_FIELD_OFFSET,
    ));
    function.code.push(host::gen::blr());
}

/// Pass 2: resolve every deferred jump/branch recorded during the translate
/// loop into a concrete `LI`/`BD` field, now that every in-block guest
/// offset has a `host_map` entry.
fn patch_all(
    function: &mut Function,
    records: Vec<JumpRecord>,
    host_map: &[Option<HostSlot>],
    function_id: FunctionId,
) -> Result<(), RecompileError> {
    for record in records {
        let (target_slot, is_jump) = match record.kind {
            JumpKind::OutOfBlock => continue,
            JumpKind::Jump => {
                let target_offset = (record.guest_target_raw as u32 & 0x3FF) as usize;
                (host_map.get(target_offset).copied().flatten(), true)
            }
            JumpKind::Branch => {
                // `guest_source_index` is recorded by `add_jump` at whatever
                // cursor position the translator was at when it called it;
                // `ScriptedTranslator` (and the contract it models) calls
                // `add_jump` after consuming the delay slot, so
                // `guest_source_index` already equals the delay-slot offset
                // that Pass 0's `is_jump_dst[delay_slot_idx + displacement]`
                // uses as its base. No further offset is added here.
                let target_offset = record.guest_source_index as i64 + record.guest_target_raw;
                let slot = if target_offset >= 0 && (target_offset as usize) < host_map.len() {
                    host_map[target_offset as usize]
                } else {
                    None
                };
                // Always patched via the long-form `LI` field, never the
                // 14-bit `BD` field: spec §9 calls for emitting the
                // unconditional long-form branch for every in-block target,
                // matching `Recompile.c`'s `pass2()`, where the `SET_BD`
                // path is dead code and `SET_LI` is used unconditionally.
                (slot, true)
            }
            JumpKind::SpecialBranch | JumpKind::SpecialJump => {
                if let Some(displacement) = record.resolved_displacement {
                    patch_site(function, record.host_patch_site, record.kind.is_jump(), displacement);
                }
                continue;
            }
        };

        let Some(target_slot) = target_slot else {
            // Pass 0 guarantees in-block targets are translated by the time
            // Pass 2 runs; a missing entry means the target offset was never
            // visited, which should not happen for a well-formed in-block
            // jump. We leave the site unpatched rather than panic.
            warn!("jump at patch site {:?} resolved to no host_map entry", record.host_patch_site);
            continue;
        };
        debug_assert_eq!(target_slot.function, function_id, "in-block jump must resolve within the same function");

        let target_addr = function.host_address(target_slot.offset);
        let site_addr = function.host_address(record.host_patch_site.offset);
        let displacement = i64::from(target_addr) - i64::from(site_addr);
        patch_site(function, record.host_patch_site, is_jump, displacement);
    }
    Ok(())
}

fn patch_site(function: &mut Function, site: HostSlot, is_jump: bool, displacement: i64) {
    let idx = site.offset as usize;
    let Some(old) = function.code.get(idx).copied() else {
        return;
    };
    let patched = if is_jump {
        host::set_li(old, displacement as i32)
    } else {
        host::set_bd(old, displacement as i32)
    };
    function.code[idx] = patched;
}
