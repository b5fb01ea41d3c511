/*
 * ELF Binary Loader
 *
 * This module implements an ELF64 (Executable and Linkable Format) loader
 * for loading userspace programs into CLUU.
 *
 * ELF Format:
 * ===========
 *
 * ELF binaries consist of:
 * - ELF Header: Magic number, architecture, entry point
 * - Program Headers: Describe segments to load (PT_LOAD)
 * - Section Headers: Describe sections (not needed for loading)
 * - Data: Actual code and data bytes
 *
 * Loading Process:
 * ================
 *
 * 1. Parse and validate ELF header
 * 2. Parse program headers (PT_LOAD segments)
 * 3. Create new process with fresh address space
 * 4. Register each PT_LOAD segment with the supplemental page table
 *    (no frames are allocated or copied here - segment pages are lazily
 *    loaded by the page-fault handler the first time each is touched)
 * 5. Build the initial user stack (argv, word-aligned padding, pointer
 *    array, fake return address)
 * 6. Create the initial thread and point it at the entry point in Ring 3
 * 7. Initialize stdin/stdout/stderr file descriptors
 *
 * Memory Layout After Loading:
 * ============================
 *
 * 0x00400000 - Text segment (code, read+execute)
 * 0x00600000 - Data/BSS segment (data, read+write)
 * 0x00800000 - Heap start (grows up via sbrk)
 * 0x7ff00000 - Stack (grows down, 1 MiB max growth)
 *
 * References:
 * - ELF64 Specification: https://refspecs.linuxfoundation.org/elf/elf.pdf
 * - System V ABI AMD64: https://refspecs.linuxfoundation.org/elf/x86_64-abi-0.99.pdf
 */

use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::address_space::layout;
use crate::memory::spt::{PageKind, SegmentSource};
use crate::memory::{physmap, AddressSpace};
use crate::scheduler::{self, ProcessId, ProcessType, ThreadId};

/// ELF magic number (0x7F 'E' 'L' 'F')
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class (64-bit)
const ELFCLASS64: u8 = 2;

/// ELF data encoding (little-endian)
const ELFDATA2LSB: u8 = 1;

/// ELF version (current)
const EV_CURRENT: u8 = 1;

/// ELF type: Executable file
const ET_EXEC: u16 = 2;

/// ELF machine: AMD x86-64
const EM_X86_64: u16 = 62;

/// Program header type: Loadable segment
const PT_LOAD: u32 = 1;

/// Program header flags
const PF_X: u32 = 1; // Execute
const PF_W: u32 = 2; // Write
const PF_R: u32 = 4; // Read

const PAGE_SIZE: u64 = 4096;

/// ELF64 Header (64 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    e_ident: [u8; 16],      // ELF identification
    e_type: u16,            // Object file type
    e_machine: u16,         // Machine architecture
    e_version: u32,         // Object file version
    e_entry: u64,           // Entry point address
    e_phoff: u64,           // Program header offset
    e_shoff: u64,           // Section header offset
    e_flags: u32,           // Processor-specific flags
    e_ehsize: u16,          // ELF header size
    e_phentsize: u16,       // Program header entry size
    e_phnum: u16,           // Number of program headers
    e_shentsize: u16,       // Section header entry size
    e_shnum: u16,           // Number of section headers
    e_shstrndx: u16,        // Section header string table index
}

/// ELF64 Program Header (56 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,       // Segment type
    p_flags: u32,      // Segment flags
    p_offset: u64,     // Segment file offset
    p_vaddr: u64,      // Segment virtual address
    p_paddr: u64,      // Segment physical address (ignored)
    p_filesz: u64,     // Segment size in file
    p_memsz: u64,      // Segment size in memory
    p_align: u64,      // Segment alignment
}

/// Loaded ELF binary metadata
#[derive(Debug)]
pub struct ElfBinary {
    /// Entry point (RIP for first thread)
    pub entry_point: VirtAddr,
    /// Loaded segments
    pub segments: Vec<ElfSegment>,
}

/// A loaded ELF segment
#[derive(Debug, Clone)]
pub struct ElfSegment {
    /// Virtual address where segment is loaded
    pub vaddr: VirtAddr,
    /// Size of segment in memory
    pub size: usize,
    /// Page table flags (derived from ELF flags)
    pub flags: PageTableFlags,
}

/// ELF loading errors
#[derive(Debug)]
pub enum ElfLoadError {
    InvalidMagic,
    InvalidClass,
    InvalidEncoding,
    InvalidVersion,
    InvalidType,
    InvalidMachine,
    InvalidHeader,
    NoLoadableSegments,
    SegmentTooLarge,
    InvalidAlignment,
    MemoryAllocationFailed,
    MappingFailed,
}

impl core::fmt::Display for ElfLoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ElfLoadError::InvalidMagic => write!(f, "Invalid ELF magic number"),
            ElfLoadError::InvalidClass => write!(f, "Not a 64-bit ELF"),
            ElfLoadError::InvalidEncoding => write!(f, "Not little-endian"),
            ElfLoadError::InvalidVersion => write!(f, "Invalid ELF version"),
            ElfLoadError::InvalidType => write!(f, "Not an executable"),
            ElfLoadError::InvalidMachine => write!(f, "Not an x86-64 binary"),
            ElfLoadError::InvalidHeader => write!(f, "Invalid ELF header"),
            ElfLoadError::NoLoadableSegments => write!(f, "No PT_LOAD segments"),
            ElfLoadError::SegmentTooLarge => write!(f, "Segment too large"),
            ElfLoadError::InvalidAlignment => write!(f, "Invalid segment alignment"),
            ElfLoadError::MemoryAllocationFailed => write!(f, "Failed to allocate memory"),
            ElfLoadError::MappingFailed => write!(f, "Failed to map pages"),
        }
    }
}

/// Parse and validate ELF header
///
/// Verifies:
/// - Magic number (0x7F 'E' 'L' 'F')
/// - 64-bit class
/// - Little-endian encoding
/// - Current version
/// - Executable type (ET_EXEC)
/// - x86-64 architecture
fn parse_elf_header(data: &[u8]) -> Result<Elf64Header, ElfLoadError> {
    if data.len() < core::mem::size_of::<Elf64Header>() {
        return Err(ElfLoadError::InvalidHeader);
    }

    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

    if header.e_ident[0..4] != ELF_MAGIC {
        log::error!("ELF: Invalid magic: {:?}", &header.e_ident[0..4]);
        return Err(ElfLoadError::InvalidMagic);
    }

    if header.e_ident[4] != ELFCLASS64 {
        log::error!("ELF: Not 64-bit (class = {})", header.e_ident[4]);
        return Err(ElfLoadError::InvalidClass);
    }

    if header.e_ident[5] != ELFDATA2LSB {
        log::error!("ELF: Not little-endian (encoding = {})", header.e_ident[5]);
        return Err(ElfLoadError::InvalidEncoding);
    }

    if header.e_ident[6] != EV_CURRENT {
        log::error!("ELF: Invalid version ({})", header.e_ident[6]);
        return Err(ElfLoadError::InvalidVersion);
    }

    let e_type = unsafe { core::ptr::addr_of!(header.e_type).read_unaligned() };
    let e_machine = unsafe { core::ptr::addr_of!(header.e_machine).read_unaligned() };
    let e_entry = unsafe { core::ptr::addr_of!(header.e_entry).read_unaligned() };

    if e_type != ET_EXEC {
        log::error!("ELF: Not executable (type = {})", e_type);
        return Err(ElfLoadError::InvalidType);
    }

    if e_machine != EM_X86_64 {
        log::error!("ELF: Not x86-64 (machine = {})", e_machine);
        return Err(ElfLoadError::InvalidMachine);
    }

    log::debug!("ELF: Valid header, entry = 0x{:x}", e_entry);
    Ok(header)
}

/// Parse program headers from ELF binary
fn parse_program_headers(
    data: &[u8],
    header: &Elf64Header,
) -> Result<Vec<Elf64ProgramHeader>, ElfLoadError> {
    let ph_offset = unsafe { core::ptr::addr_of!(header.e_phoff).read_unaligned() as usize };
    let ph_size = unsafe { core::ptr::addr_of!(header.e_phentsize).read_unaligned() as usize };
    let ph_count = unsafe { core::ptr::addr_of!(header.e_phnum).read_unaligned() as usize };

    if ph_offset + (ph_size * ph_count) > data.len() {
        return Err(ElfLoadError::InvalidHeader);
    }

    let mut program_headers = Vec::new();

    for i in 0..ph_count {
        let offset = ph_offset + (i * ph_size);
        let ph_data = &data[offset..offset + ph_size];
        let ph = unsafe { core::ptr::read_unaligned(ph_data.as_ptr() as *const Elf64ProgramHeader) };
        program_headers.push(ph);
    }

    Ok(program_headers)
}

/// Convert ELF segment flags to page table flags
fn elf_flags_to_page_flags(elf_flags: u32) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;

    if (elf_flags & PF_W) != 0 {
        flags |= PageTableFlags::WRITABLE;
    }

    // NX enforcement is left off: IA32_EFER.NXE is never enabled during boot,
    // so setting NO_EXECUTE here would fault every instruction fetch.

    flags
}

/// Load an ELF binary into a new process's address space
///
/// Parses the header and program headers, then registers each `PT_LOAD`
/// segment's pages with the process's supplemental page table as
/// `Uninitialized` / `FileBacked` (or `Anonymous` for a segment with no file
/// bytes at all, e.g. a pure-BSS segment). No physical frame is allocated
/// and no byte is read from `data` here - the first access to each page
/// faults into `SupplementalPageTable::claim`, which performs the actual
/// copy-and-zero-fill.
///
/// `data` must outlive the process: it is retained inside the process's SPT
/// so later faults can still read the segment bytes.
pub fn load_elf_binary(
    data: Arc<[u8]>,
    address_space: &mut AddressSpace,
) -> Result<ElfBinary, ElfLoadError> {
    log::info!("ELF: Loading binary ({} bytes)", data.len());

    let header = parse_elf_header(&data)?;
    let e_entry = unsafe { core::ptr::addr_of!(header.e_entry).read_unaligned() };
    let entry_point = VirtAddr::new(e_entry);
    log::info!("ELF: Entry point at 0x{:x}", entry_point.as_u64());

    let program_headers = parse_program_headers(&data, &header)?;
    log::info!("ELF: Found {} program headers", program_headers.len());

    let mut segments = Vec::new();
    let mut has_loadable = false;

    for (i, ph) in program_headers.iter().enumerate() {
        let p_type = unsafe { core::ptr::addr_of!(ph.p_type).read_unaligned() };
        let p_vaddr = unsafe { core::ptr::addr_of!(ph.p_vaddr).read_unaligned() };
        let p_filesz = unsafe { core::ptr::addr_of!(ph.p_filesz).read_unaligned() };
        let p_memsz = unsafe { core::ptr::addr_of!(ph.p_memsz).read_unaligned() };
        let p_offset = unsafe { core::ptr::addr_of!(ph.p_offset).read_unaligned() };
        let p_flags = unsafe { core::ptr::addr_of!(ph.p_flags).read_unaligned() };

        if p_type != PT_LOAD {
            log::debug!("ELF: Segment {}: type={}, skipping", i, p_type);
            continue;
        }

        has_loadable = true;

        let vaddr = VirtAddr::new(p_vaddr);
        let file_size = p_filesz as usize;
        let mem_size = p_memsz as usize;
        let file_offset = p_offset as usize;

        log::info!(
            "ELF: Segment {}: vaddr=0x{:x}, filesz={}, memsz={}, flags=0x{:x}",
            i, p_vaddr, file_size, mem_size, p_flags
        );

        if file_offset + file_size > data.len() {
            log::error!("ELF: Segment {} extends beyond file", i);
            return Err(ElfLoadError::InvalidHeader);
        }

        if mem_size > 16 * 1024 * 1024 {
            log::error!("ELF: Segment {} too large ({})", i, mem_size);
            return Err(ElfLoadError::SegmentTooLarge);
        }

        // ELF requires p_vaddr and p_offset to agree modulo the page size,
        // so that page-rounding one also page-rounds the other.
        if file_size > 0 && (p_vaddr % PAGE_SIZE) != (p_offset % PAGE_SIZE) {
            log::error!("ELF: Segment {} vaddr/offset alignment mismatch", i);
            return Err(ElfLoadError::InvalidAlignment);
        }

        let flags = elf_flags_to_page_flags(p_flags);
        let writable = (p_flags & PF_W) != 0;

        let start_page = vaddr.align_down(PAGE_SIZE);
        let end_page = (vaddr + mem_size as u64).align_up(PAGE_SIZE);
        let page_count = ((end_page - start_page) / PAGE_SIZE) as usize;

        // Page-aligned file offset matching start_page, per the congruence
        // checked above.
        let file_page_offset = file_offset as u64 - (vaddr.as_u64() - start_page.as_u64());
        let file_end = (file_offset + file_size) as u64;

        log::debug!(
            "ELF:   Registering {} lazy pages from 0x{:x} to 0x{:x}",
            page_count,
            start_page.as_u64(),
            end_page.as_u64()
        );

        for page_idx in 0..page_count {
            let page_vaddr = start_page + (page_idx as u64 * PAGE_SIZE);
            let page_file_start = file_page_offset + page_idx as u64 * PAGE_SIZE;

            let remaining = file_end as i64 - page_file_start as i64;
            let read_bytes = remaining.clamp(0, PAGE_SIZE as i64) as usize;
            let zero_bytes = PAGE_SIZE as usize - read_bytes;

            let (kind, source) = if read_bytes > 0 {
                (
                    PageKind::FileBacked,
                    Some(SegmentSource {
                        data: data.clone(),
                        offset: page_file_start as usize,
                        read_bytes,
                        zero_bytes,
                    }),
                )
            } else {
                (PageKind::Anonymous, None)
            };

            address_space
                .spt
                .alloc_page(kind, page_vaddr, writable, source)
                .map_err(|_| ElfLoadError::MappingFailed)?;
        }

        segments.push(ElfSegment {
            vaddr,
            size: mem_size,
            flags,
        });

        // Track the segment in the address space's bookkeeping regions
        // (used by syscalls to validate user pointers).
        if (p_flags & PF_X) != 0 {
            address_space.text = crate::memory::address_space::MemoryRegion::new(start_page, (end_page - start_page) as usize, flags);
        } else if writable {
            address_space.data = crate::memory::address_space::MemoryRegion::new(start_page, (end_page - start_page) as usize, flags);
        }
    }

    if !has_loadable {
        log::error!("ELF: No loadable segments found");
        return Err(ElfLoadError::NoLoadableSegments);
    }

    log::info!("ELF: Registered {} lazy segments", segments.len());

    Ok(ElfBinary {
        entry_point,
        segments,
    })
}

/// Build the initial user stack image (argv strings, word-aligned padding,
/// argv pointer array with trailing null, fake return address) and
/// materialize it in the process's address space.
///
/// Unlike ELF segments, the stack's first page(s) cannot be left for the
/// page-fault handler to fill in: the caller's argv strings have to be
/// physically present before the thread ever runs. So this claims pages
/// eagerly through the SPT (`claim` writes through the physmap window, so
/// this is safe to call before the process's page table is ever the active
/// one) and copies the prepared image into them directly.
///
/// Returns `(initial_rsp, argc, argv_ptr)`.
pub(crate) fn build_user_stack(
    address_space: &mut AddressSpace,
    argv: &[&str],
) -> Result<(VirtAddr, u64, VirtAddr), ElfLoadError> {
    let stack_top = VirtAddr::new(layout::USER_STACK_TOP);
    let mut addr = stack_top.as_u64();

    let mut string_addrs = Vec::with_capacity(argv.len());
    for arg in argv {
        addr -= (arg.len() + 1) as u64;
        string_addrs.push(addr);
    }

    addr &= !7u64; // word-align before the pointer array

    let array_len = (argv.len() as u64 + 1) * 8;
    addr -= array_len;
    let argv_array_addr = addr;

    addr -= 8; // fake return address
    let rsp = addr;

    let image_start = addr;
    let image_len = (stack_top.as_u64() - image_start) as usize;
    let mut image = alloc::vec![0u8; image_len];

    let array_off = (argv_array_addr - image_start) as usize;
    for (i, &s_addr) in string_addrs.iter().enumerate() {
        let p = array_off + i * 8;
        image[p..p + 8].copy_from_slice(&s_addr.to_le_bytes());
    }
    let null_off = array_off + argv.len() * 8;
    image[null_off..null_off + 8].copy_from_slice(&0u64.to_le_bytes());

    for (arg, &s_addr) in argv.iter().zip(string_addrs.iter()) {
        let off = (s_addr - image_start) as usize;
        let bytes = arg.as_bytes();
        image[off..off + bytes.len()].copy_from_slice(bytes);
        image[off + bytes.len()] = 0;
    }

    let first_page = VirtAddr::new(image_start).align_down(PAGE_SIZE);
    let mut page_vaddr = first_page;
    while page_vaddr.as_u64() < stack_top.as_u64() {
        if !address_space.spt.contains(page_vaddr) {
            address_space
                .spt
                .alloc_page(PageKind::Anonymous, page_vaddr, true, None)
                .map_err(|_| ElfLoadError::MappingFailed)?;
        }
        address_space
            .spt
            .claim(page_vaddr)
            .map_err(|_| ElfLoadError::MappingFailed)?;

        let frame = address_space
            .spt
            .frame_for(page_vaddr)
            .ok_or(ElfLoadError::MappingFailed)?;
        let phys_addr = PhysAddr::new(frame.start_address());

        let page_start = page_vaddr.as_u64();
        let page_end = page_start + PAGE_SIZE;
        let overlap_start = core::cmp::max(page_start, image_start);
        let overlap_end = core::cmp::min(page_end, stack_top.as_u64());

        if overlap_end > overlap_start {
            let src_off = (overlap_start - image_start) as usize;
            let dst_off = (overlap_start - page_start) as usize;
            let len = (overlap_end - overlap_start) as usize;
            unsafe {
                let dst = physmap::phys_ptr::<u8>(phys_addr).add(dst_off);
                core::ptr::copy_nonoverlapping(image[src_off..src_off + len].as_ptr(), dst, len);
            }
        }

        page_vaddr += PAGE_SIZE;
    }

    address_space.stack.start = first_page;
    address_space.stack.size = (stack_top.as_u64() - first_page.as_u64()) as usize;

    Ok((VirtAddr::new(rsp), argv.len() as u64, VirtAddr::new(argv_array_addr)))
}

/// Placeholder kernel-mode entry for a thread that is about to be
/// reconfigured for Ring 3 by `ThreadManager::setup_userspace_with_args`.
/// The scheduler never actually runs this body: by the time the thread is
/// first dispatched its interrupt context has already been overwritten to
/// `iret` straight into the ELF entry point.
fn user_entry_trampoline() {
    panic!("user_entry_trampoline: reached kernel-mode body of a userspace thread");
}

/// Spawn a userspace process from an ELF binary
///
/// 1. Creates a new userspace process with a fresh address space
/// 2. Registers the ELF's segments for lazy loading
/// 3. Builds the initial user stack (argv per the platform ABI)
/// 4. Creates the initial thread and points it at the entry point in Ring 3
/// 5. Initializes stdin/stdout/stderr file descriptors
///
/// Returns the ProcessId and initial ThreadId on success.
pub fn spawn_elf_process(
    elf_data: Arc<[u8]>,
    name: &str,
    args: &[&str],
) -> Result<(ProcessId, ThreadId), ElfLoadError> {
    log::info!("Spawning ELF process '{}'", name);

    let process_id = scheduler::ProcessManager::spawn_user(name, ProcessType::User)
        .map_err(|_| ElfLoadError::MemoryAllocationFailed)?;

    let (entry_point, rsp, argc, argv_ptr) = scheduler::ProcessManager::with_mut(process_id, |process| {
        let binary = load_elf_binary(elf_data, &mut process.address_space)?;
        let (rsp, argc, argv_ptr) = build_user_stack(&mut process.address_space, args)?;
        Ok::<_, ElfLoadError>((binary.entry_point, rsp, argc, argv_ptr))
    })
    .ok_or(ElfLoadError::MemoryAllocationFailed)??;

    log::info!(
        "ELF process '{}' loaded, entry point: 0x{:x}",
        name,
        entry_point.as_u64()
    );

    let thread_id = scheduler::ThreadManager::spawn_in_process(user_entry_trampoline, name, process_id);

    scheduler::ThreadManager::setup_userspace_with_args(thread_id, entry_point, rsp, argc, argv_ptr.as_u64())
        .map_err(|_| ElfLoadError::MappingFailed)?;

    scheduler::ThreadManager::init_std_streams(thread_id);

    log::info!(
        "ELF process '{}' spawned: PID={:?}, TID={:?}",
        name, process_id, thread_id
    );

    Ok((process_id, thread_id))
}
