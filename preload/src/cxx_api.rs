//! The Itanium-mangled `operator new`/`operator delete` family. Each export
//! replaces one mangled symbol of the C++ runtime; the cross product covers
//! `{single, array} x {throwing, nothrow} x {default, explicitly aligned}`
//! plus the sized `delete` variants, which all collapse onto the same two
//! internal paths. The throwing operators cannot raise `std::bad_alloc`
//! from here and return null on exhaustion, as the profiled runtime's
//! failure path is not worth emulating in a tracer.

use std::ffi::c_void;
use std::ptr;

use libc::size_t;
use memtrail::DEFAULT_ALIGNMENT;

use crate::c_api::{traced_alloc, traced_free, valid_alignment, WRAPPED_SHIM_SKIP};

// One wrapper frame between every operator export and `traced_alloc`, so
// the whole family captures with the wrapped skip. Never inlined to keep
// that depth fixed.
#[inline(never)]
unsafe fn cxx_alloc(size: usize, alignment: usize) -> *mut c_void {
  if !valid_alignment(alignment) {
    return ptr::null_mut();
  }

  traced_alloc(alignment, size, WRAPPED_SHIM_SKIP)
}

// operator new(size_t)
#[cfg_attr(not(test), export_name = "_Znwm")]
pub unsafe extern "C" fn cxx_new(size: size_t) -> *mut c_void {
  cxx_alloc(size, DEFAULT_ALIGNMENT)
}

// operator new[](size_t)
#[cfg_attr(not(test), export_name = "_Znam")]
pub unsafe extern "C" fn cxx_new_array(size: size_t) -> *mut c_void {
  cxx_alloc(size, DEFAULT_ALIGNMENT)
}

// operator new(size_t, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZnwmRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_new_nothrow(size: size_t, _nothrow: *const c_void) -> *mut c_void {
  cxx_alloc(size, DEFAULT_ALIGNMENT)
}

// operator new[](size_t, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZnamRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_new_array_nothrow(
  size: size_t,
  _nothrow: *const c_void,
) -> *mut c_void {
  cxx_alloc(size, DEFAULT_ALIGNMENT)
}

// operator new(size_t, align_val_t)
#[cfg_attr(not(test), export_name = "_ZnwmSt11align_val_t")]
pub unsafe extern "C" fn cxx_new_aligned(size: size_t, alignment: size_t) -> *mut c_void {
  cxx_alloc(size, alignment)
}

// operator new[](size_t, align_val_t)
#[cfg_attr(not(test), export_name = "_ZnamSt11align_val_t")]
pub unsafe extern "C" fn cxx_new_array_aligned(size: size_t, alignment: size_t) -> *mut c_void {
  cxx_alloc(size, alignment)
}

// operator new(size_t, align_val_t, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZnwmSt11align_val_tRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_new_aligned_nothrow(
  size: size_t,
  alignment: size_t,
  _nothrow: *const c_void,
) -> *mut c_void {
  cxx_alloc(size, alignment)
}

// operator new[](size_t, align_val_t, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZnamSt11align_val_tRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_new_array_aligned_nothrow(
  size: size_t,
  alignment: size_t,
  _nothrow: *const c_void,
) -> *mut c_void {
  cxx_alloc(size, alignment)
}

// operator delete(void*)
#[cfg_attr(not(test), export_name = "_ZdlPv")]
pub unsafe extern "C" fn cxx_delete(ptr: *mut c_void) {
  traced_free(ptr);
}

// operator delete[](void*)
#[cfg_attr(not(test), export_name = "_ZdaPv")]
pub unsafe extern "C" fn cxx_delete_array(ptr: *mut c_void) {
  traced_free(ptr);
}

// operator delete(void*, size_t)
#[cfg_attr(not(test), export_name = "_ZdlPvm")]
pub unsafe extern "C" fn cxx_delete_sized(ptr: *mut c_void, _size: size_t) {
  traced_free(ptr);
}

// operator delete[](void*, size_t)
#[cfg_attr(not(test), export_name = "_ZdaPvm")]
pub unsafe extern "C" fn cxx_delete_array_sized(ptr: *mut c_void, _size: size_t) {
  traced_free(ptr);
}

// operator delete(void*, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZdlPvRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_delete_nothrow(ptr: *mut c_void, _nothrow: *const c_void) {
  traced_free(ptr);
}

// operator delete[](void*, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZdaPvRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_delete_array_nothrow(ptr: *mut c_void, _nothrow: *const c_void) {
  traced_free(ptr);
}

// operator delete(void*, align_val_t)
#[cfg_attr(not(test), export_name = "_ZdlPvSt11align_val_t")]
pub unsafe extern "C" fn cxx_delete_aligned(ptr: *mut c_void, _alignment: size_t) {
  traced_free(ptr);
}

// operator delete[](void*, align_val_t)
#[cfg_attr(not(test), export_name = "_ZdaPvSt11align_val_t")]
pub unsafe extern "C" fn cxx_delete_array_aligned(ptr: *mut c_void, _alignment: size_t) {
  traced_free(ptr);
}

// operator delete(void*, size_t, align_val_t)
#[cfg_attr(not(test), export_name = "_ZdlPvmSt11align_val_t")]
pub unsafe extern "C" fn cxx_delete_sized_aligned(
  ptr: *mut c_void,
  _size: size_t,
  _alignment: size_t,
) {
  traced_free(ptr);
}

// operator delete[](void*, size_t, align_val_t)
#[cfg_attr(not(test), export_name = "_ZdaPvmSt11align_val_t")]
pub unsafe extern "C" fn cxx_delete_array_sized_aligned(
  ptr: *mut c_void,
  _size: size_t,
  _alignment: size_t,
) {
  traced_free(ptr);
}

// operator delete(void*, align_val_t, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZdlPvSt11align_val_tRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_delete_aligned_nothrow(
  ptr: *mut c_void,
  _alignment: size_t,
  _nothrow: *const c_void,
) {
  traced_free(ptr);
}

// operator delete[](void*, align_val_t, nothrow_t const&)
#[cfg_attr(not(test), export_name = "_ZdaPvSt11align_val_tRKSt9nothrow_t")]
pub unsafe extern "C" fn cxx_delete_array_aligned_nothrow(
  ptr: *mut c_void,
  _alignment: size_t,
  _nothrow: *const c_void,
) {
  traced_free(ptr);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_and_delete_round_trip() {
    unsafe {
      let p = cxx_new(64);
      assert!(!p.is_null());
      ptr::write_bytes(p as *mut u8, 0xcd, 64);
      cxx_delete(p);

      let q = cxx_new_array(128);
      assert!(!q.is_null());
      cxx_delete_array_sized(q, 128);
    }
  }

  #[test]
  fn aligned_new_honors_the_requested_alignment() {
    unsafe {
      let p = cxx_new_aligned(100, 64);
      assert!(!p.is_null());
      assert_eq!(p as usize % 64, 0);
      cxx_delete_aligned(p, 64);
    }
  }

  #[test]
  fn aligned_new_rejects_invalid_alignment() {
    unsafe {
      assert!(cxx_new_aligned(100, 24).is_null());
      assert!(cxx_new_array_aligned_nothrow(100, 0, ptr::null()).is_null());
    }
  }

  #[test]
  fn nothrow_delete_accepts_null() {
    unsafe {
      cxx_delete_nothrow(ptr::null_mut(), ptr::null());
      cxx_delete_array_aligned_nothrow(ptr::null_mut(), 16, ptr::null());
    }
  }
}
