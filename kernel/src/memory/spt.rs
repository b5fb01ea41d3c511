/*
 * Supplemental Page Table
 *
 * Per-process record of virtual pages that exist but have no hardware
 * mapping yet: heap/stack pages that are anonymous-on-first-touch, and ELF
 * segment pages whose file bytes are only read in on the first fault
 * (lazy loading). The page-fault handler consults this table before
 * deciding a fault is fatal.
 *
 * A page starts life `Uninitialized` (remembering what it will become and,
 * for file-backed pages, where its bytes live) and transmutes in place into
 * `Anonymous` or `FileBacked` the first time `claim` runs for it. That
 * transition is one-way; the only way out is `teardown`, which runs at
 * address-space death.
 */

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use super::{paging, phys, physmap, PhysFrame};

const PAGE_SIZE: u64 = 4096;

/// Backing bytes for a lazily-loaded file-backed page: read `read_bytes`
/// starting at `offset` into `data`, zero-fill the remaining `zero_bytes`.
/// Used for ELF `PT_LOAD` segments, where `read_bytes + zero_bytes` always
/// sums to one page.
#[derive(Clone)]
pub struct SegmentSource {
    pub data: Arc<[u8]>,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl SegmentSource {
    /// A fresh, independent handle onto the same backing bytes — the
    /// "duplicate any embedded file handle" step of an SPT fork-copy.
    fn duplicate(&self) -> Self {
        self.clone()
    }
}

/// What an `Uninitialized` descriptor becomes on its first fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    Anonymous,
    FileBacked,
}

enum PageState {
    Uninitialized {
        kind: PageKind,
        source: Option<SegmentSource>,
    },
    Anonymous {
        frame: PhysFrame,
    },
    FileBacked {
        frame: PhysFrame,
        source: SegmentSource,
    },
}

impl PageState {
    fn frame(&self) -> Option<PhysFrame> {
        match self {
            PageState::Anonymous { frame } | PageState::FileBacked { frame, .. } => Some(*frame),
            PageState::Uninitialized { .. } => None,
        }
    }
}

/// One page's worth of supplemental-table bookkeeping.
pub struct PageDescriptor {
    vaddr: VirtAddr,
    writable: bool,
    state: PageState,
}

impl PageDescriptor {
    pub fn is_resolved(&self) -> bool {
        self.state.frame().is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SptError {
    AlreadyMapped,
    NotFound,
    OutOfMemory,
    MappingFailed,
}

fn page_key(vaddr: VirtAddr) -> u64 {
    vaddr.as_u64() & !(PAGE_SIZE - 1)
}

/// Per-process map from page-aligned virtual address to its supplemental
/// descriptor. `root` is the owning process's PML4, used when `claim`/
/// `copy_for_fork` need to install hardware mappings.
pub struct SupplementalPageTable {
    root: PhysAddr,
    pages: BTreeMap<u64, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new(root: PhysAddr) -> Self {
        Self {
            root,
            pages: BTreeMap::new(),
        }
    }

    /// Re-point this table at a new PML4, for the case where the owning
    /// address space's root is assigned after the table is constructed.
    pub fn set_root(&mut self, root: PhysAddr) {
        self.root = root;
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.pages.contains_key(&page_key(vaddr))
    }

    pub fn is_writable(&self, vaddr: VirtAddr) -> Option<bool> {
        self.pages.get(&page_key(vaddr)).map(|d| d.is_writable())
    }

    /// Physical frame backing `vaddr`, if the page has already been claimed.
    /// Lets callers that build page contents outside of the fault path (e.g.
    /// an initial user stack image) reach the frame through the physmap
    /// window without waiting for a fault.
    pub fn frame_for(&self, vaddr: VirtAddr) -> Option<PhysFrame> {
        self.pages.get(&page_key(vaddr))?.state.frame()
    }

    /// Register a page that exists but has no frame yet. Fails if `vaddr`
    /// (rounded down to its page) is already registered.
    pub fn alloc_page(
        &mut self,
        kind: PageKind,
        vaddr: VirtAddr,
        writable: bool,
        source: Option<SegmentSource>,
    ) -> Result<(), SptError> {
        let key = page_key(vaddr);
        if self.pages.contains_key(&key) {
            return Err(SptError::AlreadyMapped);
        }

        self.pages.insert(
            key,
            PageDescriptor {
                vaddr: VirtAddr::new(key),
                writable,
                state: PageState::Uninitialized { kind, source },
            },
        );
        Ok(())
    }

    /// Resolve the fault at `vaddr`: allocate a frame, map it into `root`
    /// with the descriptor's writable flag, and run the first-fault
    /// initializer. A no-op if the page was already claimed.
    pub fn claim(&mut self, vaddr: VirtAddr) -> Result<(), SptError> {
        let key = page_key(vaddr);
        let page_vaddr = VirtAddr::new(key);

        let (kind, source, writable) = match self.pages.get(&key) {
            Some(desc) => match &desc.state {
                PageState::Uninitialized { kind, source } => {
                    (*kind, source.as_ref().map(SegmentSource::duplicate), desc.writable)
                }
                _ => return Ok(()),
            },
            None => return Err(SptError::NotFound),
        };

        let frame = phys::alloc_frame().ok_or(SptError::OutOfMemory)?;
        let phys_addr = PhysAddr::new(frame.start_address());

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        if paging::map_4k(self.root, page_vaddr, phys_addr, flags).is_err() {
            phys::free_frame(frame);
            return Err(SptError::MappingFailed);
        }

        // Write through the physmap window rather than `page_vaddr` itself:
        // `claim` may run for a process that isn't the one currently active
        // in CR3 (eager prefault from kernel context during `exec`/`fork`),
        // so the only address guaranteed to reach this frame is its
        // physical one.
        unsafe {
            let ptr = physmap::phys_ptr::<u8>(phys_addr);
            core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize);
            if let Some(src) = &source {
                let n = src.read_bytes.min(PAGE_SIZE as usize);
                core::ptr::copy_nonoverlapping(src.data[src.offset..src.offset + n].as_ptr(), ptr, n);
            }
        }

        let new_state = match kind {
            PageKind::Anonymous => PageState::Anonymous { frame },
            PageKind::FileBacked => PageState::FileBacked {
                frame,
                source: source.expect("file-backed page claimed without a segment source"),
            },
        };

        if let Some(desc) = self.pages.get_mut(&key) {
            desc.state = new_state;
        }

        Ok(())
    }

    /// Duplicate this table for `fork`, installing resolved pages into
    /// `dst_root`'s page tables. Uninitialized entries are cloned lazily
    /// (fresh aux, re-registered, no frame touched); resolved entries are
    /// cloned eagerly (new frame, raw memcpy via the physmap window since
    /// `dst_root` isn't the active CR3 during fork).
    pub fn copy_for_fork(&self, dst_root: PhysAddr) -> Result<Self, SptError> {
        let mut dst = SupplementalPageTable::new(dst_root);

        for (&key, desc) in self.pages.iter() {
            let vaddr = VirtAddr::new(key);
            let writable = desc.writable;

            let new_state = match &desc.state {
                PageState::Uninitialized { kind, source } => PageState::Uninitialized {
                    kind: *kind,
                    source: source.as_ref().map(SegmentSource::duplicate),
                },
                PageState::Anonymous { frame } => PageState::Anonymous {
                    frame: Self::clone_frame(*frame)?,
                },
                PageState::FileBacked { frame, source } => PageState::FileBacked {
                    frame: Self::clone_frame(*frame)?,
                    source: source.duplicate(),
                },
            };

            if let Some(frame) = new_state.frame() {
                let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
                if writable {
                    flags |= PageTableFlags::WRITABLE;
                }
                let phys_addr = PhysAddr::new(frame.start_address());
                if paging::map_4k(dst_root, vaddr, phys_addr, flags).is_err() {
                    phys::free_frame(frame);
                    return Err(SptError::MappingFailed);
                }
            }

            dst.pages.insert(
                key,
                PageDescriptor {
                    vaddr,
                    writable,
                    state: new_state,
                },
            );
        }

        Ok(dst)
    }

    fn clone_frame(src: PhysFrame) -> Result<PhysFrame, SptError> {
        let dst = phys::alloc_frame().ok_or(SptError::OutOfMemory)?;
        unsafe {
            let src_ptr = physmap::phys_ptr::<u8>(PhysAddr::new(src.start_address()));
            let dst_ptr = physmap::phys_ptr::<u8>(PhysAddr::new(dst.start_address()));
            core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE as usize);
        }
        Ok(dst)
    }

    /// Release every resolved frame and drop every descriptor. Called from
    /// `AddressSpace`'s `Drop` before the PML4 frame itself is freed.
    pub fn teardown(&mut self) {
        for desc in self.pages.values() {
            if let Some(frame) = desc.state.frame() {
                phys::free_frame(frame);
            }
        }
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_key_rounds_down() {
        assert_eq!(page_key(VirtAddr::new(0x1000)), 0x1000);
        assert_eq!(page_key(VirtAddr::new(0x1abc)), 0x1000);
        assert_eq!(page_key(VirtAddr::new(0x1fff)), 0x1000);
    }
}
