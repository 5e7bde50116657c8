//! Companion cdylib to the `memtrail` core crate. Loaded via `LD_PRELOAD`,
//! it replaces the target process's view of the C and C++ allocation entry
//! points and routes every call through the tracer, which delegates the
//! physical allocation back to the host allocator.

mod c_api;
mod cxx_api;

use std::sync::OnceLock;

use libc::c_char;
use memtrail::{Tracer, TracerConfig};

static TRACER: OnceLock<Tracer> = OnceLock::new();

pub(crate) fn tracer() -> Option<&'static Tracer> {
  TRACER.get()
}

/// Load-time constructor. Everything allocated before the singleton is
/// published goes through the bootstrap path and stays invisible to the
/// accounting, so the priming work inside `Tracer::start` happens first.
#[cfg_attr(test, allow(dead_code))]
extern "C" fn initialize() {
  // Children spawned by the target must not be traced.
  // SAFETY: constructors run before the target spawns threads.
  unsafe {
    libc::unsetenv(b"LD_PRELOAD\0".as_ptr() as *const c_char);
  }

  let tracer = Tracer::new(TracerConfig::default());
  tracer.start();
  let _ = TRACER.set(tracer);
}

/// Exit-time destructor: flush leak records and report totals. The stream
/// descriptor stays open for destructors that run even later.
#[cfg_attr(test, allow(dead_code))]
extern "C" fn finalize() {
  if let Some(tracer) = tracer() {
    tracer.flush_at_exit();
  }
}

/// Snapshot entry point callable from the traced program.
#[cfg_attr(not(test), no_mangle)]
pub extern "C" fn memtrail_snapshot() {
  if let Some(tracer) = tracer() {
    tracer.snapshot();
  }
}

// Priority 101 orders the constructor before user constructors, and the
// matching destructor after user destructors.
#[cfg(not(test))]
#[link_section = ".init_array.00101"]
#[used]
static INIT: extern "C" fn() = initialize;

#[cfg(not(test))]
#[link_section = ".fini_array.00101"]
#[used]
static FINI: extern "C" fn() = finalize;

/// Publish a tracer for tests that need the traced path (stack capture
/// only happens once the singleton exists). First caller wins; the stream
/// goes to a per-process scratch file that is never read back.
#[cfg(test)]
pub(crate) fn install_test_tracer() {
  let output = std::env::temp_dir().join(format!(
    "memtrail-preload-test-{}.data",
    std::process::id()
  ));

  let _ = TRACER.set(Tracer::new(
    TracerConfig::default().uncompressed().with_output(output),
  ));
}
