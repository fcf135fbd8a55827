//! ELF loading: validation, lazy segment mapping, and the initial user
//! stack with its argument block.
//!
//! Segments are never read here; each page gets a deferred initializer
//! and the fault resolver pulls its bytes in on first touch. Only the
//! first stack page is materialized eagerly, since the argument block is
//! written into it before the process ever runs.

use crate::config::{PAGE_SIZE, USER_STACK_TOP, USER_TOP};
use crate::error::VmError;
use crate::fs::VmFile;
use crate::mm::VirtAddr;
use crate::vm::{AsId, LoadDescriptor, PageFlags, PageInit, Vm};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use xmas_elf::header::{Class, Data, Machine, Type as ElfType, Version};
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const MAX_PHDRS: u16 = 1024;

/// Register state handed to the new user context.
#[derive(Debug)]
pub struct UserContext {
    /// ELF entry point.
    pub entry: usize,
    /// Initial stack pointer, below the pushed argument block.
    pub sp: usize,
    /// Argument count.
    pub argc: usize,
    /// User address of `argv[0]`'s pointer slot.
    pub argv: usize,
}

/// A byte buffer with u64 alignment. The ELF parser reads multi-byte
/// fields in place, so the backing storage must be at least as aligned
/// as the widest field.
struct AlignedBuf(Vec<u64>);

impl AlignedBuf {
    fn new(len: usize) -> Self {
        Self(vec![0u64; (len + 7) / 8])
    }

    fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.0.as_ptr() as *const u8, self.0.len() * 8) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.0.as_mut_ptr() as *mut u8, self.0.len() * 8)
        }
    }
}

fn round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Load `file` as an x86-64 ELF executable into space `id` and set up
/// the initial stack carrying `args`. The caller keeps its own handle to
/// the executable and is responsible for denying writes to it while the
/// process runs.
pub fn load(
    vm: &mut Vm,
    id: AsId,
    file: &Arc<dyn VmFile>,
    args: &[&str],
) -> Result<UserContext, VmError> {
    let file_len = file.len();

    let mut ehdr = AlignedBuf::new(EHDR_SIZE);
    if file.read_at(0, &mut ehdr.bytes_mut()[..EHDR_SIZE]) != EHDR_SIZE {
        return Err(VmError::Validation("truncated ELF header"));
    }
    let head = ElfFile::new(ehdr.bytes()).map_err(VmError::Validation)?;
    check_header(&head)?;

    // Re-read a prefix long enough to cover the program header table,
    // then walk it for real.
    let ph_offset = head.header.pt2.ph_offset() as usize;
    let ph_count = head.header.pt2.ph_count();
    // Both fields come straight from the image; the table end must be
    // computed without wrapping before it is trusted.
    let pht_end = (ph_count as usize)
        .checked_mul(PHDR_SIZE)
        .and_then(|table| table.checked_add(ph_offset))
        .ok_or(VmError::Validation("program header table out of bounds"))?;
    if pht_end > file_len {
        return Err(VmError::Validation("truncated program header table"));
    }
    let mut prefix = AlignedBuf::new(pht_end);
    if file.read_at(0, &mut prefix.bytes_mut()[..pht_end]) != pht_end {
        return Err(VmError::Io);
    }
    let elf = ElfFile::new(prefix.bytes()).map_err(VmError::Validation)?;

    for ph in elf.program_iter() {
        match ph.get_type().map_err(VmError::Validation)? {
            // Kinds a standalone executable must not carry.
            Type::Dynamic | Type::Interp | Type::ShLib => {
                return Err(VmError::Validation("unsupported program header kind"));
            }
            Type::Load => {
                validate_segment(
                    ph.offset() as usize,
                    ph.virtual_addr() as usize,
                    ph.file_size() as usize,
                    ph.mem_size() as usize,
                    file_len,
                )?;
                map_segment(
                    vm,
                    id,
                    file,
                    ph.offset() as usize,
                    ph.virtual_addr() as usize,
                    ph.file_size() as usize,
                    ph.mem_size() as usize,
                    ph.flags().is_write(),
                )?;
            }
            _ => {}
        }
    }

    let (sp, argv) = setup_stack(vm, id, args)?;
    log::debug!(
        "loaded ELF: entry {:#x}, sp {:#x}, {} args",
        head.header.pt2.entry_point(),
        sp,
        args.len()
    );
    Ok(UserContext {
        entry: head.header.pt2.entry_point() as usize,
        sp,
        argc: args.len(),
        argv,
    })
}

fn check_header(elf: &ElfFile) -> Result<(), VmError> {
    if elf.header.pt1.class() != Class::SixtyFour {
        return Err(VmError::Validation("not a 64-bit ELF"));
    }
    if elf.header.pt1.data() != Data::LittleEndian {
        return Err(VmError::Validation("not a little-endian ELF"));
    }
    if elf.header.pt1.version() != Version::Current {
        return Err(VmError::Validation("unknown ELF version"));
    }
    if elf.header.pt2.type_().as_type() != ElfType::Executable {
        return Err(VmError::Validation("not an executable"));
    }
    if elf.header.pt2.machine().as_machine() != Machine::X86_64 {
        return Err(VmError::Validation("wrong machine type"));
    }
    if elf.header.pt2.ph_entry_size() as usize != PHDR_SIZE {
        return Err(VmError::Validation("unexpected program header size"));
    }
    if elf.header.pt2.ph_count() > MAX_PHDRS {
        return Err(VmError::Validation("too many program headers"));
    }
    Ok(())
}

/// Whether one PT_LOAD entry describes a segment this loader is willing
/// to map.
fn validate_segment(
    offset: usize,
    vaddr: usize,
    filesz: usize,
    memsz: usize,
    file_len: usize,
) -> Result<(), VmError> {
    // File position and virtual address must agree modulo the page size,
    // or the shared page math below falls apart.
    if offset % PAGE_SIZE != vaddr % PAGE_SIZE {
        return Err(VmError::Validation("misaligned segment"));
    }
    if offset > file_len {
        return Err(VmError::Validation("segment starts past end of file"));
    }
    if memsz < filesz {
        return Err(VmError::Validation("segment memory smaller than its file image"));
    }
    if memsz == 0 {
        return Err(VmError::Validation("empty segment"));
    }
    let end = vaddr
        .checked_add(memsz)
        .ok_or(VmError::Validation("segment wraps around"))?;
    if vaddr >= USER_TOP || end > USER_TOP {
        return Err(VmError::Validation("segment outside user range"));
    }
    // Page zero stays unmapped so null dereferences fault.
    if vaddr < PAGE_SIZE {
        return Err(VmError::Validation("segment maps page zero"));
    }
    Ok(())
}

fn map_segment(
    vm: &mut Vm,
    id: AsId,
    file: &Arc<dyn VmFile>,
    offset: usize,
    vaddr: usize,
    filesz: usize,
    memsz: usize,
    writable: bool,
) -> Result<(), VmError> {
    let page_offset = vaddr % PAGE_SIZE;
    // Round both the file position and the address down to a page
    // boundary; the leading slack is read from the file so the shared
    // page comes out byte-exact.
    let mut ofs = offset - page_offset;
    let mut va = vaddr - page_offset;
    let mut read_bytes = if filesz > 0 { page_offset + filesz } else { 0 };
    let mut zero_bytes = round_up(page_offset + memsz) - read_bytes;

    let flags = if writable {
        PageFlags::WRITABLE
    } else {
        PageFlags::empty()
    };
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;
        let desc = LoadDescriptor {
            file: file.clone(),
            offset: ofs,
            read_bytes: page_read,
            zero_bytes: page_zero,
            pages: 0,
        };
        vm.alloc_page(id, VirtAddr(va), flags, PageInit::Segment(desc))?;
        read_bytes -= page_read;
        zero_bytes -= page_zero;
        ofs += page_read;
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Materialize the first stack page and write the argument block into
/// it: the strings themselves, an aligned null-terminated pointer
/// vector, and a fake return address.
fn setup_stack(vm: &mut Vm, id: AsId, args: &[&str]) -> Result<(usize, usize), VmError> {
    let page_base = USER_STACK_TOP - PAGE_SIZE;
    vm.push_stack_page(id, VirtAddr(page_base).floor())?;
    vm.claim_page(id, VirtAddr(page_base))?;

    // Worst case: every string padded to alignment, plus the pointer
    // vector, sentinel and return address.
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    let needed = strings + 8 + (args.len() + 2) * 8;
    if needed > PAGE_SIZE {
        return Err(VmError::Validation("arguments overflow the stack page"));
    }

    let mapping = vm
        .translate(id, VirtAddr(page_base))
        .ok_or(VmError::IllegalAccess)?;
    let frame = mapping.ppn.bytes_array();

    let mut sp = USER_STACK_TOP;
    let mut arg_addrs: Vec<usize> = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        sp -= arg.len() + 1;
        let off = sp - page_base;
        frame[off..off + arg.len()].copy_from_slice(arg.as_bytes());
        frame[off + arg.len()] = 0;
        arg_addrs.push(sp);
    }
    sp &= !7;

    // argv[argc] sentinel, then the pointers; arg_addrs is already in
    // reverse argument order.
    sp -= 8;
    frame[sp - page_base..sp - page_base + 8].copy_from_slice(&0u64.to_le_bytes());
    for addr in arg_addrs {
        sp -= 8;
        frame[sp - page_base..sp - page_base + 8]
            .copy_from_slice(&(addr as u64).to_le_bytes());
    }
    let argv = sp;

    // Fake return address.
    sp -= 8;
    frame[sp - page_base..sp - page_base + 8].copy_from_slice(&0u64.to_le_bytes());

    Ok((sp, argv))
}
