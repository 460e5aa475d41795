//! Guest pages, translated functions, and the physical-page alias registry.

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;

use crate::config::PAGE_INSTR_COUNT;
use crate::host::HostInstruction;
use crate::mips::GuestInstruction;

/// Opaque identifier for a [`Function`] within a page's shared function
/// table. Stable across overlap eviction of *other* functions and across
/// buffer resizes of the function it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

impl FunctionId {
    /// Construct a `FunctionId` directly. Exposed crate-wide for test
    /// doubles and the patch table's own unit tests; production code
    /// should only ever use ids handed back by
    /// [`PageShared::allocate_function_id`].
    #[must_use]
    pub(crate) const fn from_raw(id: u32) -> Self {
        Self(id)
    }
}

/// A non-owning reference to a host instruction: "which function, which
/// offset within it". Storing an offset instead of a raw pointer means a
/// buffer reallocation never invalidates anything that references it,
/// eliminating any fixup sweep a pointer-based `host_map` would need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSlot {
    /// The function that owns this instruction.
    pub function: FunctionId,
    /// Offset (in host instructions) within that function's code.
    pub offset: u32,
}

/// A contiguous-in-guest translation unit discovered by Pass 0.
#[derive(Debug, Clone)]
pub struct Function {
    /// Inclusive start offset (in guest instructions) within the owning page.
    pub start_offset: u32,
    /// Exclusive end offset within the owning page. `0` means "runs to the
    /// end of the page" (mirrors the original's `end_addr == 0` sentinel).
    pub end_offset: u32,
    /// Logical host base address for this function's first instruction, as
    /// handed back by [`crate::collaborators::RecompCache::alloc`].
    pub base_address: u32,
    /// The function's exclusively-owned host instruction buffer.
    pub code: Vec<HostInstruction>,
}

impl Function {
    /// Whether this function's guest range (`[start_offset, end_offset)`,
    /// with `end_offset == 0` meaning "to the end of the page") intersects
    /// `[other_start, other_end)` under the same convention.
    #[must_use]
    pub fn overlaps(&self, other_start: u32, other_end: u32) -> bool {
        let self_end = if self.end_offset == 0 {
            PAGE_INSTR_COUNT as u32
        } else {
            self.end_offset
        };
        let other_end = if other_end == 0 {
            PAGE_INSTR_COUNT as u32
        } else {
            other_end
        };
        self.start_offset < other_end && other_start < self_end
    }

    /// The function's declared range with the "runs to end of page"
    /// sentinel resolved to a concrete exclusive bound.
    #[must_use]
    pub fn resolved_range(&self) -> (u32, u32) {
        let end = if self.end_offset == 0 {
            PAGE_INSTR_COUNT as u32
        } else {
            self.end_offset
        };
        (self.start_offset, end)
    }

    /// The host address of instruction `offset` within this function.
    #[must_use]
    pub fn host_address(&self, offset: u32) -> u32 {
        self.base_address + offset * 4
    }
}

/// State shared by every virtual-address alias of one physical guest page:
/// the guest-PC → host-address map and the function registry. Aliased
/// [`Page`] handles hold an `Rc` to the same `PageShared`, which is what
/// makes "every alias sees the same host_map" hold by construction rather
/// than by convention.
#[derive(Debug)]
pub struct PageShared {
    /// `host_map[i]` is the host instruction emitted for guest offset `i`,
    /// or `None` if that offset has not been translated yet.
    pub host_map: Vec<Option<HostSlot>>,
    /// Functions registered on this page, keyed by their stable id.
    pub functions: HashMap<FunctionId, Function>,
    next_function_id: u32,
    /// Re-entrancy guard: set for the duration of a `recompile_block` call
    /// on this physical page, across every virtual alias.
    pub(crate) recompiling: bool,
}

impl Default for PageShared {
    fn default() -> Self {
        Self::new()
    }
}

impl PageShared {
    pub(crate) fn new() -> Self {
        Self {
            host_map: vec![None; PAGE_INSTR_COUNT],
            functions: HashMap::new(),
            next_function_id: 0,
            recompiling: false,
        }
    }

    /// Allocate a fresh, stable [`FunctionId`].
    pub(crate) fn allocate_function_id(&mut self) -> FunctionId {
        let id = FunctionId(self.next_function_id);
        self.next_function_id += 1;
        id
    }

    /// Reset to the freshly-initialized state: no translations, no
    /// functions. Used by `invalidate_block`/`deinit_block`.
    pub(crate) fn clear(&mut self) {
        self.host_map.iter_mut().for_each(|slot| *slot = None);
        self.functions.clear();
    }

    /// Clear every `host_map` entry in `[start, end)` that currently points
    /// at `victim`. Used when evicting an overlapping function: the
    /// original C driver relies on the incoming function's translate loop
    /// to overwrite the overlapped offsets, which leaves entries outside
    /// the new function's own range dangling. We clear the victim's full
    /// declared range up front instead, which is required to keep
    /// invariant 1 (`host_map` entries always point into a live function)
    /// intact in safe Rust.
    pub(crate) fn clear_host_map_range(&mut self, victim: FunctionId, start: u32, end: u32) {
        for slot in &mut self.host_map[start as usize..end as usize] {
            if matches!(slot, Some(s) if s.function == victim) {
                *slot = None;
            }
        }
    }
}

/// A 4 KiB-aligned guest region, as seen through one particular virtual
/// address window.
#[derive(Clone)]
pub struct Page {
    /// Guest virtual start address of this window.
    pub start_address: u32,
    /// Guest virtual end address of this window (`start_address + 0x1000`).
    pub end_address: u32,
    /// The 1024 guest instructions backing this page, shared across every
    /// virtual alias since they are all views of the same physical RAM.
    pub guest_code: Rc<RefCell<[GuestInstruction; PAGE_INSTR_COUNT]>>,
    /// State shared with every other virtual alias of the same physical
    /// page. Exposed directly (rather than only through accessor methods)
    /// so this crate's own `tests/` integration suite can assert on
    /// `host_map`/`functions` contents without a borrowed-checker dance
    /// around a getter; `PageShared`'s re-entrancy flag stays `pub(crate)`.
    pub shared: Rc<RefCell<PageShared>>,
}

impl Page {
    /// Create a new, empty page window over `guest_code` at
    /// `[start_address, start_address + 0x1000)`, with fresh (unshared)
    /// translation state.
    #[must_use]
    pub fn new(
        start_address: u32,
        guest_code: Rc<RefCell<[GuestInstruction; PAGE_INSTR_COUNT]>>,
    ) -> Self {
        Self {
            start_address,
            end_address: start_address + crate::config::PAGE_SIZE_BYTES,
            guest_code,
            shared: Rc::new(RefCell::new(PageShared::new())),
        }
    }

    /// Create a new page window that shares translation state with an
    /// existing one (i.e. another virtual alias of the same physical page).
    #[must_use]
    pub fn new_aliased(
        start_address: u32,
        guest_code: Rc<RefCell<[GuestInstruction; PAGE_INSTR_COUNT]>>,
        shared: &Rc<RefCell<PageShared>>,
    ) -> Self {
        Self {
            start_address,
            end_address: start_address + crate::config::PAGE_SIZE_BYTES,
            guest_code,
            shared: Rc::clone(shared),
        }
    }

    /// Whether `other` shares this page's translation state (i.e. is an
    /// alias of the same physical page).
    #[must_use]
    pub fn shares_state_with(&self, other: &Page) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of distinct `Rc` handles to this page's shared state
    /// (diagnostic / test use only).
    #[must_use]
    pub fn shared_ref_count(&self) -> usize {
        Rc::strong_count(&self.shared)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("start_address", &self.start_address)
            .field("end_address", &self.end_address)
            .finish_non_exhaustive()
    }
}
