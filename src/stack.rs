use smallvec::SmallVec;

/// Hard cap on captured instruction addresses per allocation.
pub const MAX_STACK_DEPTH: usize = 32;

// Frames contributed by `capture` itself and the unwinder entry that the
// caller never wants to see.
const CAPTURE_FRAMES: usize = 2;

/// Inline buffer for captured frames; sized so it never spills to the heap.
pub type FrameBuffer = SmallVec<[usize; MAX_STACK_DEPTH]>;

/// Where an interposed entry point wants unwinding to start.
///
/// Every shim constructs its `Context` as its very first action and passes
/// it down, so the recorded stack begins at the shim's caller rather than
/// inside the tracer.
#[derive(Debug, Clone, Copy)]
pub struct Context {
  skip: usize,
}

impl Context {
  /// `skip` counts the tracer-owned frames between the interposed entry
  /// point's caller and the point where `capture` runs.
  #[must_use]
  pub const fn new(skip: usize) -> Self {
    Self { skip }
  }
}

/// Walk the call chain of the current thread into a bounded inline buffer.
///
/// Runs under the process-wide tracing lock and must not allocate: the
/// buffer lives on the stack and the unsynchronized unwinder walks CFI
/// records without consulting the heap. Lazy unwinder state is faulted in
/// once by [`prime`] before accounting starts; anything it allocates on
/// first use is absorbed by the recursion guard. Never inlined, so skip
/// counts calibrated against this frame stay stable across build profiles.
#[inline(never)]
pub fn capture(context: &Context, limit: usize) -> FrameBuffer {
  let mut frames = FrameBuffer::new();
  let mut skip = context.skip + CAPTURE_FRAMES;
  let limit = limit.min(MAX_STACK_DEPTH);

  // SAFETY: callers serialize behind the tracing lock, so no concurrent
  // unwinding happens through this entry.
  unsafe {
    backtrace::trace_unsynchronized(|frame| {
      if skip > 0 {
        skip -= 1;
        return true;
      }

      if frames.len() >= limit {
        return false;
      }

      frames.push(frame.ip() as usize);
      true
    });
  }

  frames
}

/// Force the unwinder's lazy initialization before accounting begins.
pub fn prime() {
  let _ = capture(&Context::new(0), MAX_STACK_DEPTH);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[inline(never)]
  fn capture_here(limit: usize) -> FrameBuffer {
    capture(&Context::new(0), limit)
  }

  #[test]
  fn captures_a_nonempty_bounded_stack() {
    let frames = capture_here(MAX_STACK_DEPTH);

    assert!(!frames.is_empty());
    assert!(frames.len() <= MAX_STACK_DEPTH);
    assert!(frames.iter().all(|address| *address != 0));
  }

  #[test]
  fn honors_a_lower_depth_limit() {
    let frames = capture_here(4);
    assert!(frames.len() <= 4);
  }

  #[test]
  fn buffer_never_spills() {
    let frames = capture_here(MAX_STACK_DEPTH);
    assert!(!frames.spilled());
  }
}
