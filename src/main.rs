use memtrail::{Context, Tracer, TracerConfig, DEFAULT_ALIGNMENT};

fn main() {
  let config = TracerConfig::default()
    .uncompressed()
    .with_output("memtrail.demo.data");
  let tracer = Tracer::new(config);
  let context = Context::new(0);

  // SAFETY: demo pointers come straight from the tracer and are released
  // exactly once.
  unsafe {
    let a = tracer.allocate(DEFAULT_ALIGNMENT, 1024, &context);
    let b = tracer.allocate(DEFAULT_ALIGNMENT, 2048, &context);
    tracer.release(a);

    let b = tracer.reallocate(b, 4096, &context);
    tracer.snapshot();
    tracer.release(b);
  }

  println!("=== demo totals ===");
  println!("current: {} bytes", tracer.total_size());
  println!("maximum: {} bytes", tracer.max_size());

  tracer.flush_at_exit();
}
