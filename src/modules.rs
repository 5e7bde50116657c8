use std::ffi::c_void;
use std::mem::size_of;

use libc::{c_char, c_int, Elf64_Ehdr, Elf64_Phdr, PT_LOAD};

use crate::diag;

/// Hard cap on distinct loadable objects; later modules fall back to the
/// unknown ordinal 0.
pub const MODULE_CAPACITY: usize = 128;

/// Slot count of the direct-mapped symbol cache. Prime, so consecutive
/// addresses spread over the table.
pub const SYMBOL_CACHE_SLOTS: usize = 131071;

// Assumed load address of a non-relocated main executable, whose link map
// records a base of zero.
const DEFAULT_EXE_BASE: usize = 0x400000;

const RT_CONSISTENT: c_int = 0;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

// The dynamic loader's debug rendezvous. Walking it by hand instead of
// calling `dladdr` avoids taking the loader lock, which another thread may
// hold across a constructor that allocates.
#[repr(C)]
struct LinkMap {
  l_addr: usize,
  l_name: *const c_char,
  l_ld: *mut c_void,
  l_next: *mut LinkMap,
  l_prev: *mut LinkMap,
}

#[repr(C)]
struct RDebug {
  r_version: c_int,
  r_map: *mut LinkMap,
  r_brk: usize,
  r_state: c_int,
  r_ldbase: usize,
}

extern "C" {
  static _r_debug: RDebug;
}

struct FoundObject {
  base: usize,
  is_exe: bool,
  name: *const c_char,
}

#[derive(Clone, Copy)]
struct Module {
  base: usize,
  // Null means "the main executable"; its path lives in `exe_name`.
  name: *const c_char,
  name_len: usize,
}

#[derive(Clone, Copy)]
struct CacheSlot {
  address: usize,
  ordinal: u8,
}

/// Result of resolving one captured instruction address.
#[derive(Debug, Clone, Copy)]
pub struct Located {
  /// 1-based index into the module table, 0 when unknown.
  pub ordinal: u8,
  /// Address minus the module base, or the raw address when unknown.
  pub offset: usize,
  /// Set when this resolution appended a new module table entry, meaning
  /// the module name still has to be written to the event stream.
  pub first_seen: bool,
}

/// Reverse map from instruction addresses to loaded objects.
///
/// The module table is append-only and bounded; the cache in front of it is
/// advisory (a colliding address simply overwrites the slot).
pub struct ModuleIndex {
  cache: Box<[CacheSlot]>,
  exe_name: [u8; 4096],
  exe_name_len: usize,
  exe_probed: bool,
  module_count: usize,
  modules: [Module; MODULE_CAPACITY],
  warned_inconsistent: bool,
}

// SAFETY: the `name` pointers reference strings owned by the dynamic loader
// for the lifetime of the process, and the index is only touched under the
// process-wide tracing lock.
unsafe impl Send for ModuleIndex {}

impl ModuleIndex {
  #[must_use]
  pub fn new() -> Self {
    Self {
      cache: vec![
        CacheSlot {
          address: 0,
          ordinal: 0,
        };
        SYMBOL_CACHE_SLOTS
      ]
      .into_boxed_slice(),
      exe_name: [0; 4096],
      exe_name_len: 0,
      exe_probed: false,
      module_count: 0,
      modules: [Module {
        base: 0,
        name: std::ptr::null(),
        name_len: 0,
      }; MODULE_CAPACITY],
      warned_inconsistent: false,
    }
  }

  /// Resolve `address` to a module ordinal and offset, consulting the cache
  /// first and the loader rendezvous on a miss.
  pub fn locate(&mut self, address: usize) -> Located {
    let slot = address % SYMBOL_CACHE_SLOTS;

    if self.cache[slot].address == address && address != 0 {
      let ordinal = self.cache[slot].ordinal;
      return Located {
        ordinal,
        offset: self.offset_of(ordinal, address),
        first_seen: false,
      };
    }

    // SAFETY: read-only walk over loader-owned memory; consistency is
    // checked (best effort) through the rendezvous state flag.
    let found = unsafe {
      self.check_rendezvous_state();
      object_containing(address)
    };

    let (ordinal, first_seen) = match found {
      Some(object) => self.intern(&object),
      None => (0, false),
    };

    self.cache[slot] = CacheSlot { address, ordinal };

    Located {
      ordinal,
      offset: self.offset_of(ordinal, address),
      first_seen,
    }
  }

  /// Bytes of the name of `ordinal`, for interning into the event stream.
  #[must_use]
  pub fn name_bytes(&self, ordinal: u8) -> &[u8] {
    if ordinal == 0 {
      return &[];
    }

    let module = &self.modules[usize::from(ordinal) - 1];
    if module.name.is_null() {
      return &self.exe_name[..self.exe_name_len];
    }

    // SAFETY: `name`/`name_len` were derived from a loader-owned string
    // that outlives the process's last allocation.
    unsafe { std::slice::from_raw_parts(module.name as *const u8, module.name_len) }
  }

  /// Fault in everything the first real lookup would otherwise initialize
  /// lazily (the executable path, the rendezvous walk) without touching
  /// the module table or the cache. Interning happens on the emit path:
  /// the first event that cites a module must still see `first_seen` and
  /// carry the module's name, and priming runs before the pipeline is
  /// even open.
  pub fn prime(&mut self) {
    self.probe_exe_name();

    let anchor = ModuleIndex::prime as usize;
    // SAFETY: read-only walk over loader-owned memory.
    unsafe {
      self.check_rendezvous_state();
      let _ = object_containing(anchor);
    }
  }

  fn check_rendezvous_state(&mut self) {
    // SAFETY: `_r_debug` is provided and kept mapped by the loader.
    let state = unsafe { _r_debug.r_state };
    if state != RT_CONSISTENT && !self.warned_inconsistent {
      self.warned_inconsistent = true;
      diag::line(format_args!(
        "warning: dynamic loader state changing during lookup"
      ));
    }
  }

  fn intern(&mut self, object: &FoundObject) -> (u8, bool) {
    if object.is_exe {
      self.probe_exe_name();
    }

    let name_len = if object.is_exe {
      0
    } else {
      // SAFETY: loader-owned NUL-terminated string.
      unsafe { libc::strlen(object.name) }
    };

    for index in 0..self.module_count {
      let module = &self.modules[index];
      let matches = if object.is_exe {
        module.name.is_null()
      } else if module.name.is_null() || module.name_len != name_len {
        false
      } else {
        // SAFETY: both sides are valid for `name_len` bytes.
        unsafe { libc::memcmp(module.name as *const c_void, object.name as *const c_void, name_len) == 0 }
      };

      if matches {
        return ((index + 1) as u8, false);
      }
    }

    if self.module_count >= MODULE_CAPACITY {
      return (0, false);
    }

    self.modules[self.module_count] = Module {
      base: object.base,
      name: if object.is_exe {
        std::ptr::null()
      } else {
        object.name
      },
      name_len,
    };
    self.module_count += 1;

    (self.module_count as u8, true)
  }

  fn offset_of(&self, ordinal: u8, address: usize) -> usize {
    if ordinal == 0 {
      return address;
    }

    address - self.modules[usize::from(ordinal) - 1].base
  }

  fn probe_exe_name(&mut self) {
    if self.exe_probed {
      return;
    }
    self.exe_probed = true;

    // SAFETY: the buffer is valid for its full length; readlink does not
    // NUL-terminate, so the stored length is the returned byte count.
    let len = unsafe {
      libc::readlink(
        b"/proc/self/exe\0".as_ptr() as *const c_char,
        self.exe_name.as_mut_ptr() as *mut c_char,
        self.exe_name.len(),
      )
    };

    if len > 0 {
      self.exe_name_len = len as usize;
    }
  }
}

impl Default for ModuleIndex {
  fn default() -> Self {
    Self::new()
  }
}

/// Find the loaded object whose `PT_LOAD` segments cover `address`.
///
/// # Safety
///
/// Reads loader-owned memory; must run on a glibc target where `_r_debug`
/// is exported and link maps stay mapped while walked.
unsafe fn object_containing(address: usize) -> Option<FoundObject> {
  let mut map = _r_debug.r_map;
  let mut first = true;

  while !map.is_null() {
    let entry = &*map;
    let bias = entry.l_addr;
    let is_first = first;
    first = false;
    map = entry.l_next;

    // Relocated objects map their ELF header at the load bias. A zero bias
    // only makes sense for a fixed-address main executable.
    let ehdr_addr = if bias != 0 {
      bias
    } else if is_first {
      DEFAULT_EXE_BASE
    } else {
      continue;
    };

    if !has_elf_magic(ehdr_addr) {
      continue;
    }

    let ehdr = &*(ehdr_addr as *const Elf64_Ehdr);
    let phdrs = (ehdr_addr + ehdr.e_phoff as usize) as *const Elf64_Phdr;

    for index in 0..usize::from(ehdr.e_phnum) {
      let phdr = &*phdrs.add(index);
      if phdr.p_type != PT_LOAD {
        continue;
      }

      let start = bias + phdr.p_vaddr as usize;
      let end = start + phdr.p_memsz as usize;
      if address >= start && address < end {
        let name = entry.l_name;
        let is_exe = name.is_null() || *name == 0;
        // Only the head of the link map is the executable; other unnamed
        // entries (the vDSO on some systems) stay unknown.
        if is_exe && !is_first {
          return None;
        }

        return Some(FoundObject {
          base: ehdr_addr,
          is_exe,
          name,
        });
      }
    }
  }

  None
}

unsafe fn has_elf_magic(address: usize) -> bool {
  let ident = std::slice::from_raw_parts(address as *const u8, ELF_MAGIC.len());
  ident == ELF_MAGIC
}

// Guard against libc definitions drifting; the walk reads these directly.
const _: () = assert!(size_of::<Elf64_Phdr>() == 56);
