use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use libc::{c_char, c_int, size_t};
use memtrail::{
  bootstrap_allocate, bootstrap_reallocate, bootstrap_release, Context, DEFAULT_ALIGNMENT,
};

use crate::tracer;

// Tracer-owned frames between an interposed entry point and the stack
// capture; keeps recorded stacks starting at the entry point's caller.
pub(crate) const SHIM_SKIP: usize = 2;

// Entry points that route through one more local wrapper frame before
// reaching `traced_alloc`: `memalign`/`aligned_alloc` via `memalign_impl`,
// the C++ operators via `cxx_alloc`.
pub(crate) const WRAPPED_SHIM_SKIP: usize = SHIM_SKIP + 1;

// The helpers below are never inlined so the wrapper depths the skip
// constants describe hold in every build profile.

#[inline(never)]
pub(crate) unsafe fn traced_alloc(alignment: usize, size: usize, skip: usize) -> *mut c_void {
  match tracer() {
    Some(t) => t.allocate(alignment, size, &Context::new(skip)),
    None => bootstrap_allocate(alignment, size),
  }
}

pub(crate) unsafe fn traced_free(payload: *mut c_void) {
  match tracer() {
    Some(t) => t.release(payload),
    None => bootstrap_release(payload),
  }
}

#[inline(never)]
unsafe fn traced_realloc(payload: *mut c_void, size: usize, skip: usize) -> *mut c_void {
  match tracer() {
    Some(t) => t.reallocate(payload, size, &Context::new(skip)),
    None => bootstrap_reallocate(payload, size),
  }
}

#[inline(never)]
unsafe fn memalign_impl(alignment: usize, size: usize, skip: usize) -> *mut c_void {
  if !valid_alignment(alignment) {
    set_errno(libc::EINVAL);
    return ptr::null_mut();
  }

  traced_alloc(alignment, size, skip)
}

pub(crate) fn valid_alignment(alignment: usize) -> bool {
  alignment != 0
    && alignment.is_power_of_two()
    && alignment % size_of::<*const c_void>() == 0
}

fn page_size() -> usize {
  // SAFETY: constant system parameter.
  let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if page > 0 {
    page as usize
  } else {
    4096
  }
}

unsafe fn set_errno(value: c_int) {
  *libc::__errno_location() = value;
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
  traced_alloc(DEFAULT_ALIGNMENT, size, SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
  traced_free(ptr);
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
  let Some(total) = nmemb.checked_mul(size) else {
    set_errno(libc::ENOMEM);
    return ptr::null_mut();
  };

  let payload = traced_alloc(DEFAULT_ALIGNMENT, total, SHIM_SKIP);
  if !payload.is_null() {
    ptr::write_bytes(payload as *mut u8, 0, total);
  }

  payload
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
  traced_realloc(ptr, size, SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn reallocarray(
  ptr: *mut c_void,
  nmemb: size_t,
  size: size_t,
) -> *mut c_void {
  let Some(total) = nmemb.checked_mul(size) else {
    // Overflow leaves the original block untouched.
    set_errno(libc::ENOMEM);
    return ptr::null_mut();
  };

  traced_realloc(ptr, total, SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut c_void,
  alignment: size_t,
  size: size_t,
) -> c_int {
  if memptr.is_null() || !valid_alignment(alignment) {
    return libc::EINVAL;
  }

  *memptr = ptr::null_mut();

  let payload = traced_alloc(alignment, size, SHIM_SKIP);
  if payload.is_null() {
    return libc::ENOMEM;
  }

  *memptr = payload;
  0
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
  memalign_impl(alignment, size, WRAPPED_SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
  memalign_impl(alignment, size, WRAPPED_SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
  traced_alloc(page_size(), size, SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
  let page = page_size();
  let rounded = size.div_ceil(page).max(1) * page;
  traced_alloc(page, rounded, SHIM_SKIP)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn strdup(source: *const c_char) -> *mut c_char {
  let len = libc::strlen(source);

  let copy = traced_alloc(DEFAULT_ALIGNMENT, len + 1, SHIM_SKIP);
  if copy.is_null() {
    return ptr::null_mut();
  }

  ptr::copy_nonoverlapping(source as *const u8, copy as *mut u8, len + 1);
  copy as *mut c_char
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn strndup(source: *const c_char, limit: size_t) -> *mut c_char {
  let len = libc::strnlen(source, limit);

  let copy = traced_alloc(DEFAULT_ALIGNMENT, len + 1, SHIM_SKIP);
  if copy.is_null() {
    return ptr::null_mut();
  }

  ptr::copy_nonoverlapping(source as *const u8, copy as *mut u8, len);
  *(copy as *mut u8).add(len) = 0;
  copy as *mut c_char
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn malloc_returns_aligned_writable_payloads() {
    unsafe {
      let p = malloc(100);
      assert!(!p.is_null());
      assert_eq!(p as usize % DEFAULT_ALIGNMENT, 0);

      ptr::write_bytes(p as *mut u8, 0xee, 100);
      free(p);
    }
  }

  #[test]
  fn zero_size_malloc_returns_distinct_pointers() {
    unsafe {
      let a = malloc(0);
      let b = malloc(0);
      assert!(!a.is_null());
      assert!(!b.is_null());
      assert_ne!(a, b);
      free(a);
      free(b);
    }
  }

  #[test]
  fn free_of_null_is_a_noop() {
    unsafe {
      free(ptr::null_mut());
    }
  }

  #[test]
  fn calloc_zeroes_and_detects_overflow() {
    unsafe {
      let p = calloc(16, 32) as *mut u8;
      assert!(!p.is_null());
      for offset in 0..16 * 32 {
        assert_eq!(*p.add(offset), 0);
      }
      free(p as *mut c_void);

      assert!(calloc(usize::MAX, 2).is_null());
    }
  }

  #[test]
  fn realloc_preserves_the_common_prefix() {
    unsafe {
      let p = realloc(ptr::null_mut(), 64) as *mut u8;
      assert!(!p.is_null());
      for offset in 0..64 {
        *p.add(offset) = offset as u8;
      }

      let q = realloc(p as *mut c_void, 256) as *mut u8;
      assert!(!q.is_null());
      for offset in 0..64 {
        assert_eq!(*q.add(offset), offset as u8);
      }

      assert!(realloc(q as *mut c_void, 0).is_null());
    }
  }

  #[test]
  fn reallocarray_rejects_overflow_and_keeps_the_block() {
    unsafe {
      let p = malloc(16) as *mut u8;
      *p = 42;

      let q = reallocarray(p as *mut c_void, usize::MAX / 2, 4);
      assert!(q.is_null());
      assert_eq!(*p, 42);

      free(p as *mut c_void);
    }
  }

  #[test]
  fn posix_memalign_returns_page_aligned_payloads() {
    unsafe {
      let mut p: *mut c_void = ptr::null_mut();
      let rc = posix_memalign(&mut p, 4096, 1024);

      assert_eq!(rc, 0);
      assert!(!p.is_null());
      assert_eq!(p as usize % 4096, 0);
      free(p);
    }
  }

  #[test]
  fn posix_memalign_rejects_bad_alignment() {
    unsafe {
      let mut p: *mut c_void = ptr::null_mut();
      assert_eq!(posix_memalign(&mut p, 3, 64), libc::EINVAL);
      assert_eq!(posix_memalign(&mut p, 2, 64), libc::EINVAL);
      assert_eq!(posix_memalign(ptr::null_mut(), 16, 64), libc::EINVAL);
    }
  }

  #[test]
  fn memalign_family_validates_alignment() {
    unsafe {
      assert!(memalign(24, 64).is_null());
      assert!(aligned_alloc(0, 64).is_null());

      let p = aligned_alloc(64, 64);
      assert!(!p.is_null());
      assert_eq!(p as usize % 64, 0);
      free(p);
    }
  }

  #[test]
  fn valloc_and_pvalloc_align_to_the_page() {
    let page = page_size();
    unsafe {
      let p = valloc(100);
      assert_eq!(p as usize % page, 0);
      free(p);

      let q = pvalloc(page + 1);
      assert_eq!(q as usize % page, 0);
      free(q);
    }
  }

  #[test]
  fn strdup_and_strndup_copy_contents() {
    unsafe {
      let p = strdup(b"hello\0".as_ptr() as *const c_char);
      assert_eq!(libc::strcmp(p, b"hello\0".as_ptr() as *const c_char), 0);
      free(p as *mut c_void);

      let q = strndup(b"hello\0".as_ptr() as *const c_char, 3);
      assert_eq!(libc::strcmp(q, b"hel\0".as_ptr() as *const c_char), 0);
      free(q as *mut c_void);
    }
  }
}
