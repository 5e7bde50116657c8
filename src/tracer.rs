use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr;

use parking_lot::ReentrantMutex;

use crate::config::TracerConfig;
use crate::diag;
use crate::header::{Header, DEFAULT_ALIGNMENT};
use crate::modules::ModuleIndex;
use crate::pipeline::EventWriter;
use crate::registry::{Accounting, Charge, PendingList};
use crate::stack::{self, Context, FrameBuffer};

// The raw host allocator. Linking straight against glibc's
// interposition-exempt entry points sidesteps the dlsym bootstrap problem:
// resolving nothing at runtime means nothing can recurse into the shims
// while resolving.
mod raw {
  use std::ffi::c_void;

  extern "C" {
    #[link_name = "__libc_malloc"]
    fn libc_malloc(size: libc::size_t) -> *mut c_void;
    #[link_name = "__libc_free"]
    fn libc_free(ptr: *mut c_void);
  }

  pub unsafe fn allocate(size: usize) -> *mut c_void {
    libc_malloc(size)
  }

  pub unsafe fn release(ptr: *mut c_void) {
    libc_free(ptr);
  }
}

struct TracerShared {
  accounting: Accounting,
  index: ModuleIndex,
  pending: PendingList,
  writer: Option<EventWriter>,
}

impl TracerShared {
  /// Link a fresh header into the pending list and charge it. A new
  /// high-water mark flushes the pending list so the stream's running peak
  /// matches the accounting; a limit breach flushes, warns and exits.
  unsafe fn admit(&mut self, header: *mut Header, config: &TracerConfig) {
    (*header).set_pending();
    self.pending.push_back(header);

    match self.accounting.charge((*header).size() as isize) {
      Charge::Fits { new_peak: false } => {}
      Charge::Fits { new_peak: true } => self.flush_pending(config),
      Charge::OverLimit => {
        self.flush_pending(config);
        diag::line(format_args!(
          "warning: memory limit of {} bytes exceeded",
          self.accounting.limit_size
        ));
        libc::_exit(1);
      }
    }
  }

  /// Free-side bookkeeping: cancel a still-pending allocation in place, or
  /// emit the free record for one whose allocation already reached the
  /// stream. Does not release the host block.
  unsafe fn retire(&mut self, header: *mut Header, config: &TracerConfig) {
    let size = (*header).size() as isize;

    if (*header).is_pending() {
      self.pending.unlink(header);
      (*header).clear_pending();
    } else {
      self.ensure_writer(config);
      if let Some(writer) = self.writer.as_mut() {
        writer.free_event((*header).payload() as usize, size);
      }
    }

    self.accounting.discharge(size);
  }

  fn ensure_writer(&mut self, config: &TracerConfig) {
    if self.writer.is_some() {
      return;
    }

    match EventWriter::open(config) {
      Ok(writer) => self.writer = Some(writer),
      Err(err) => {
        diag::line(format_args!("error: {err}"));
        std::process::abort();
      }
    }
  }

  unsafe fn flush_pending(&mut self, config: &TracerConfig) {
    if self.pending.is_empty() {
      return;
    }

    self.ensure_writer(config);
    let Some(writer) = self.writer.as_mut() else {
      return;
    };

    while let Some(header) = self.pending.pop_front() {
      (*header).clear_pending();
      writer.alloc_event(
        &mut self.index,
        (*header).payload() as usize,
        (*header).size(),
        (*header).frames(),
      );
    }
  }

  fn record_snapshot(&mut self, config: &TracerConfig) {
    // SAFETY: pending headers are live by the registry invariant.
    unsafe {
      self.flush_pending(config);
    }

    self.ensure_writer(config);
    if let Some(writer) = self.writer.as_mut() {
      writer.snapshot_event();
    }

    let total = self.accounting.total_size;
    let delta = total - self.accounting.last_snapshot_size;
    diag::line(format_args!(
      "{} bytes ({}{} bytes)",
      total,
      if delta >= 0 { "+" } else { "" },
      delta
    ));

    self.accounting.last_snapshot_size = total;
    self.accounting.snapshot_no += 1;
  }
}

struct TracerInner {
  depth: Cell<u32>,
  shared: RefCell<TracerShared>,
}

/// The in-process allocation tracer.
///
/// All bookkeeping and emission serializes behind one recursive lock; the
/// recursion depth distinguishes user allocations from allocations the
/// tracer itself triggers (unwinder initialization, loader walks, the
/// compressor spawn), which stay accounting-silent.
pub struct Tracer {
  config: TracerConfig,
  inner: ReentrantMutex<TracerInner>,
}

impl Tracer {
  #[must_use]
  pub fn new(config: TracerConfig) -> Self {
    let limit = config.limit.unwrap_or_else(compute_limit);

    Self {
      config,
      inner: ReentrantMutex::new(TracerInner {
        depth: Cell::new(0),
        shared: RefCell::new(TracerShared {
          accounting: Accounting::new(limit),
          index: ModuleIndex::new(),
          pending: PendingList::new(),
          writer: None,
        }),
      }),
    }
  }

  /// Service one allocation request: capture the caller's stack, obtain the
  /// oversized host block, lay out the header, and account the payload.
  ///
  /// Returns null when the host allocator fails; no event is recorded.
  ///
  /// # Safety
  ///
  /// `alignment` must be a power of two and a multiple of the platform word
  /// size (the shims validate user-supplied values before calling in).
  pub unsafe fn allocate(&self, alignment: usize, size: usize, context: &Context) -> *mut c_void {
    let size = size.max(1);

    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);

    let frames = if depth == 0 {
      stack::capture(context, self.config.max_stack_depth)
    } else {
      FrameBuffer::new()
    };

    let block = raw::allocate(Header::overhead(alignment) + size);
    if block.is_null() {
      guard.depth.set(depth);
      return ptr::null_mut();
    }

    let header = Header::place(block, alignment, size);

    if depth == 0 {
      (*header).record_stack(&frames);
      let mut shared = guard.shared.borrow_mut();
      shared.admit(header, &self.config);
    } else {
      (*header).mark_internal();
    }

    guard.depth.set(depth);
    (*header).payload()
  }

  /// Service a release: recover the header, settle the accounting (pending
  /// cancellation or a free record), and hand the original block back to
  /// the host allocator.
  ///
  /// # Safety
  ///
  /// `payload` must be null or a pointer previously returned by this
  /// tracer's allocation paths and not yet released.
  pub unsafe fn release(&self, payload: *mut c_void) {
    if payload.is_null() {
      return;
    }

    let header = Header::from_payload(payload);
    if (*header).is_internal() {
      (*header).clear_allocated();
      raw::release((*header).block());
      return;
    }

    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);

    if depth == 0 {
      let mut shared = guard.shared.borrow_mut();
      shared.retire(header, &self.config);
    }

    (*header).clear_allocated();
    let block = (*header).block();
    raw::release(block);

    guard.depth.set(depth);
  }

  /// Move an allocation to a new size. Never resizes in place: the event
  /// grammar has no size-delta record, so the payload always moves through
  /// allocate-copy-free. The old block is retired from the accounting
  /// before the new one is charged, so the two never coexist in the
  /// observed totals.
  ///
  /// # Safety
  ///
  /// As [`Tracer::release`] for `payload`.
  pub unsafe fn reallocate(&self, payload: *mut c_void, size: usize, context: &Context) -> *mut c_void {
    if payload.is_null() {
      return self.allocate(DEFAULT_ALIGNMENT, size, context);
    }

    if size == 0 {
      self.release(payload);
      return ptr::null_mut();
    }

    let old = Header::from_payload(payload);
    let old_size = (*old).size();

    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);

    let frames = if depth == 0 {
      stack::capture(context, self.config.max_stack_depth)
    } else {
      FrameBuffer::new()
    };

    let block = raw::allocate(Header::overhead(DEFAULT_ALIGNMENT) + size);
    if block.is_null() {
      guard.depth.set(depth);
      return ptr::null_mut();
    }

    let header = Header::place(block, DEFAULT_ALIGNMENT, size);
    let new_payload = (*header).payload();
    ptr::copy_nonoverlapping(
      payload as *const u8,
      new_payload as *mut u8,
      old_size.min(size),
    );

    if depth == 0 {
      (*header).record_stack(&frames);
      let mut shared = guard.shared.borrow_mut();
      if !(*old).is_internal() {
        shared.retire(old, &self.config);
      }
      shared.admit(header, &self.config);
    } else {
      (*header).mark_internal();
    }

    (*old).clear_allocated();
    raw::release((*old).block());

    guard.depth.set(depth);
    new_payload
  }

  /// Flush pending allocations, write the snapshot sentinel, report the
  /// current total and its delta since the previous snapshot.
  pub fn snapshot(&self) {
    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);

    if depth == 0 {
      let mut shared = guard.shared.borrow_mut();
      shared.record_snapshot(&self.config);
    }

    guard.depth.set(depth);
  }

  /// Exit-time reporting: emit the alloc record of every header still
  /// pending so the reader can attribute leaks, then print the peak and
  /// leaked totals. The stream descriptor is intentionally left open.
  pub fn flush_at_exit(&self) {
    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);

    let mut shared = guard.shared.borrow_mut();
    // SAFETY: pending headers are live by the registry invariant.
    unsafe {
      shared.flush_pending(&self.config);
    }

    diag::line(format_args!("maximum {} bytes", shared.accounting.max_size));
    diag::line(format_args!("leaked {} bytes", shared.accounting.total_size));

    drop(shared);
    guard.depth.set(depth);
  }

  /// Load-time side of the lifecycle: pre-touch the lazily initializing
  /// subsystems (unwinder, loader walk, executable path) while the
  /// recursion guard hides their allocations, open the event pipeline, and
  /// announce the limit.
  pub fn start(&self) {
    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);

    stack::prime();

    {
      let mut shared = guard.shared.borrow_mut();
      shared.index.prime();
      shared.ensure_writer(&self.config);
      diag::line(format_args!(
        "limit {} bytes",
        shared.accounting.limit_size
      ));
    }

    guard.depth.set(depth);
  }

  #[must_use]
  pub fn max_size(&self) -> isize {
    let guard = self.inner.lock();
    let size = guard.shared.borrow().accounting.max_size;
    size
  }

  #[must_use]
  pub fn snapshot_no(&self) -> u64 {
    let guard = self.inner.lock();
    let no = guard.shared.borrow().accounting.snapshot_no;
    no
  }

  #[must_use]
  pub fn total_size(&self) -> isize {
    let guard = self.inner.lock();
    let size = guard.shared.borrow().accounting.total_size;
    size
  }

  #[cfg(test)]
  pub(crate) fn nested_scope<R>(&self, f: impl FnOnce() -> R) -> R {
    let guard = self.inner.lock();
    let depth = guard.depth.get();
    guard.depth.set(depth + 1);
    let result = f();
    guard.depth.set(depth);
    result
  }
}

/// Allocation before the process-global tracer exists (or for a tracer-less
/// test context). The payload still carries a full header, marked internal,
/// so it remains releasable once tracing is live.
///
/// # Safety
///
/// As [`Tracer::allocate`].
pub unsafe fn bootstrap_allocate(alignment: usize, size: usize) -> *mut c_void {
  let size = size.max(1);

  let block = raw::allocate(Header::overhead(alignment) + size);
  if block.is_null() {
    return ptr::null_mut();
  }

  let header = Header::place(block, alignment, size);
  (*header).mark_internal();
  (*header).payload()
}

/// Release counterpart of [`bootstrap_allocate`].
///
/// # Safety
///
/// As [`Tracer::release`].
pub unsafe fn bootstrap_release(payload: *mut c_void) {
  if payload.is_null() {
    return;
  }

  let header = Header::from_payload(payload);
  (*header).clear_allocated();
  raw::release((*header).block());
}

/// Reallocation counterpart of [`bootstrap_allocate`].
///
/// # Safety
///
/// As [`Tracer::reallocate`].
pub unsafe fn bootstrap_reallocate(payload: *mut c_void, size: usize) -> *mut c_void {
  if payload.is_null() {
    return bootstrap_allocate(DEFAULT_ALIGNMENT, size);
  }

  if size == 0 {
    bootstrap_release(payload);
    return ptr::null_mut();
  }

  let old = Header::from_payload(payload);
  let old_size = (*old).size();

  let fresh = bootstrap_allocate(DEFAULT_ALIGNMENT, size);
  if fresh.is_null() {
    return ptr::null_mut();
  }

  ptr::copy_nonoverlapping(payload as *const u8, fresh as *mut u8, old_size.min(size));
  bootstrap_release(payload);

  fresh
}

fn compute_limit() -> isize {
  // SAFETY: sysconf queries constant system parameters.
  let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  let phys = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

  let page = if page > 0 { page as isize } else { 4096 };
  let cap_pages = isize::MAX / page;
  let half_phys_pages = if phys > 0 { phys as isize / 2 } else { cap_pages };

  half_phys_pages.min(cap_pages) * page
}
