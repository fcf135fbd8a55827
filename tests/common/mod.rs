//! Hosted doubles for the external collaborators: a heap-backed frame
//! pool, a software page table, an in-memory file and an in-memory swap
//! device, plus a handcrafted ELF builder.

#![allow(dead_code)]

use pager::config::PAGE_SIZE;
use pager::fs::VmFile;
use pager::mm::{FramePool, Mapping, PageMap, PhysPageNum, VirtAddr, VirtPageNum};
use pager::vm::SwapDevice;
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// A fixed pool of page-aligned heap pages. Physical page numbers are
/// the pages' host addresses shifted down, so `bytes_array` works
/// unchanged.
pub struct TestPool {
    free: Mutex<Vec<usize>>,
    all: Vec<usize>,
}

impl TestPool {
    pub fn new(frames: usize) -> Arc<Self> {
        let mut all = Vec::with_capacity(frames);
        for _ in 0..frames {
            let ptr = unsafe { std::alloc::alloc_zeroed(page_layout()) };
            assert!(!ptr.is_null());
            all.push(ptr as usize);
        }
        Arc::new(Self {
            free: Mutex::new(all.clone()),
            all,
        })
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl FramePool for TestPool {
    fn obtain(&self, zeroed: bool) -> Option<PhysPageNum> {
        let addr = self.free.lock().unwrap().pop()?;
        let ppn = PhysPageNum(addr >> 12);
        if zeroed {
            ppn.bytes_array().fill(0);
        }
        Some(ppn)
    }

    fn release(&self, ppn: PhysPageNum) {
        self.free.lock().unwrap().push(ppn.0 << 12);
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        for &addr in &self.all {
            unsafe { std::alloc::dealloc(addr as *mut u8, page_layout()) };
        }
    }
}

#[derive(Copy, Clone)]
struct SoftEntry {
    ppn: PhysPageNum,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

/// A software page table with dirty and accessed bits. Cloning yields a
/// second handle onto the same table, so tests can keep inspecting it
/// after handing the map to an address space.
#[derive(Clone, Default)]
pub struct TestPageMap {
    entries: Arc<Mutex<BTreeMap<usize, SoftEntry>>>,
}

impl TestPageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapped(&self, vpn: VirtPageNum) -> bool {
        self.entries.lock().unwrap().contains_key(&vpn.0)
    }

    pub fn set_accessed(&self, vpn: VirtPageNum, value: bool) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&vpn.0) {
            e.accessed = value;
        }
    }

    pub fn set_dirty(&self, vpn: VirtPageNum, value: bool) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&vpn.0) {
            e.dirty = value;
        }
    }

    /// A user-mode store: writes through the installed mapping, setting
    /// the dirty and accessed bits the way the hardware would. Panics if
    /// the page is unmapped or read-only, since a real store would fault.
    pub fn user_write(&self, va: VirtAddr, bytes: &[u8]) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&va.floor().0)
            .expect("store through unmapped page");
        assert!(entry.writable, "store through read-only mapping");
        entry.dirty = true;
        entry.accessed = true;
        let off = va.page_offset();
        entry.ppn.bytes_array()[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// A user-mode load through the installed mapping.
    pub fn user_read(&self, va: VirtAddr, len: usize) -> Vec<u8> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&va.floor().0)
            .expect("load through unmapped page");
        entry.accessed = true;
        let off = va.page_offset();
        entry.ppn.bytes_array()[off..off + len].to_vec()
    }
}

impl PageMap for TestPageMap {
    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&vpn.0) {
            return false;
        }
        entries.insert(
            vpn.0,
            SoftEntry {
                ppn,
                writable,
                dirty: false,
                accessed: true,
            },
        );
        true
    }

    fn unmap(&mut self, vpn: VirtPageNum) {
        self.entries.lock().unwrap().remove(&vpn.0);
    }

    fn translate(&self, vpn: VirtPageNum) -> Option<Mapping> {
        self.entries.lock().unwrap().get(&vpn.0).map(|e| Mapping {
            ppn: e.ppn,
            writable: e.writable,
        })
    }

    fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&vpn.0)
            .map_or(false, |e| e.dirty)
    }

    fn clear_dirty(&mut self, vpn: VirtPageNum) {
        self.set_dirty(vpn, false);
    }

    fn is_accessed(&self, vpn: VirtPageNum) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&vpn.0)
            .map_or(false, |e| e.accessed)
    }

    fn clear_accessed(&mut self, vpn: VirtPageNum) {
        self.set_accessed(vpn, false);
    }

    fn activate(&self) {}
}

struct MemFileInner {
    data: Vec<u8>,
    deny: isize,
}

/// An in-memory file. Clones share the backing store, mirroring two
/// kernel handles onto one inode.
#[derive(Clone)]
pub struct MemFile {
    inner: Arc<Mutex<MemFileInner>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemFileInner { data, deny: 0 })),
        }
    }

    pub fn handle(&self) -> Arc<dyn VmFile> {
        Arc::new(self.clone())
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn write_denied(&self) -> bool {
        self.inner.lock().unwrap().deny > 0
    }
}

impl VmFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let inner = self.inner.lock().unwrap();
        if offset >= inner.data.len() {
            return 0;
        }
        let n = buf.len().min(inner.data.len() - offset);
        buf[..n].copy_from_slice(&inner.data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner.deny > 0 || offset >= inner.data.len() {
            return 0;
        }
        let n = buf.len().min(inner.data.len() - offset);
        inner.data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    fn reopen(&self) -> Arc<dyn VmFile> {
        Arc::new(self.clone())
    }

    fn deny_write(&self) {
        self.inner.lock().unwrap().deny += 1;
    }

    fn allow_write(&self) {
        self.inner.lock().unwrap().deny -= 1;
    }
}

/// Page-sized slots in host memory.
pub struct VecSwap {
    slots: Mutex<Vec<Vec<u8>>>,
}

impl VecSwap {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![vec![0u8; PAGE_SIZE]; slots]),
        })
    }
}

impl SwapDevice for VecSwap {
    fn slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn read_slot(&self, slot: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.slots.lock().unwrap()[slot]);
    }

    fn write_slot(&self, slot: usize, buf: &[u8]) {
        self.slots.lock().unwrap()[slot].copy_from_slice(buf);
    }
}

/// One PT_LOAD entry for [`build_elf`].
pub struct Segment {
    pub vaddr: usize,
    pub data: Vec<u8>,
    pub memsz: usize,
    pub writable: bool,
}

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

/// A minimal, valid x86-64 executable image carrying `segments`.
pub fn build_elf(entry: usize, segments: &[Segment]) -> Vec<u8> {
    build_elf_with_type(entry, segments, PT_LOAD)
}

/// Like [`build_elf`] but marking every segment `PT_DYNAMIC`, which the
/// loader must reject.
pub fn build_dynamic_elf(entry: usize, segments: &[Segment]) -> Vec<u8> {
    build_elf_with_type(entry, segments, PT_DYNAMIC)
}

fn build_elf_with_type(entry: usize, segments: &[Segment], p_type: u32) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;

    let pht_end = EHDR + segments.len() * PHDR;

    // Place each segment's bytes so the file offset and the virtual
    // address agree modulo the page size, as the loader requires.
    let mut offsets = Vec::with_capacity(segments.len());
    let mut cursor = pht_end;
    for seg in segments {
        let rem = seg.vaddr % PAGE_SIZE;
        let base = cursor - cursor % PAGE_SIZE;
        let mut off = base + rem;
        if off < cursor {
            off += PAGE_SIZE;
        }
        offsets.push(off);
        cursor = off + seg.data.len();
    }

    let mut image = vec![0u8; cursor];

    // ELF header.
    image[0..4].copy_from_slice(b"\x7fELF");
    image[4] = 2; // 64-bit
    image[5] = 1; // little-endian
    image[6] = 1; // current version
    put16(&mut image, 16, 2); // ET_EXEC
    put16(&mut image, 18, 0x3e); // EM_X86_64
    put32(&mut image, 20, 1);
    put64(&mut image, 24, entry as u64);
    put64(&mut image, 32, EHDR as u64); // e_phoff
    put16(&mut image, 52, EHDR as u16); // e_ehsize
    put16(&mut image, 54, PHDR as u16); // e_phentsize
    put16(&mut image, 56, segments.len() as u16); // e_phnum

    for (i, seg) in segments.iter().enumerate() {
        let at = EHDR + i * PHDR;
        put32(&mut image, at, p_type);
        put32(&mut image, at + 4, if seg.writable { 0x6 } else { 0x4 });
        put64(&mut image, at + 8, offsets[i] as u64);
        put64(&mut image, at + 16, seg.vaddr as u64);
        put64(&mut image, at + 24, seg.vaddr as u64);
        put64(&mut image, at + 32, seg.data.len() as u64);
        put64(&mut image, at + 40, seg.memsz as u64);
        put64(&mut image, at + 48, PAGE_SIZE as u64);
        image[offsets[i]..offsets[i] + seg.data.len()].copy_from_slice(&seg.data);
    }
    image
}

fn put16(image: &mut [u8], at: usize, v: u16) {
    image[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(image: &mut [u8], at: usize, v: u32) {
    image[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(image: &mut [u8], at: usize, v: u64) {
    image[at..at + 8].copy_from_slice(&v.to_le_bytes());
}
