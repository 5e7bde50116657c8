use std::path::PathBuf;

use crate::stack::MAX_STACK_DEPTH;

/// Controls where and how the tracer writes its event stream.
#[derive(Debug, Clone)]
pub struct TracerConfig {
  /// Route the stream through a forked `gzip --fast` child.
  pub compress: bool,
  /// Overrides the computed memory limit when set.
  pub limit: Option<isize>,
  /// Maximum captured frames per allocation, capped at [`MAX_STACK_DEPTH`].
  pub max_stack_depth: usize,
  /// Output file, truncated on open.
  pub output: PathBuf,
}

impl Default for TracerConfig {
  fn default() -> Self {
    Self {
      compress: true,
      limit: None,
      max_stack_depth: MAX_STACK_DEPTH,
      output: PathBuf::from("memtrail.data"),
    }
  }
}

impl TracerConfig {
  /// Builder-style helper to cap the captured stack depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
    self.max_stack_depth = depth.min(MAX_STACK_DEPTH);
    self
  }

  /// Builder-style helper to pin the byte limit instead of deriving it from
  /// physical memory.
  #[must_use]
  pub fn with_limit(mut self, limit: isize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Builder-style helper to redirect the event stream.
  #[must_use]
  pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
    self.output = output.into();
    self
  }

  /// Skip the compressor child and write the raw stream directly.
  #[must_use]
  pub fn uncompressed(mut self) -> Self {
    self.compress = false;
    self
  }
}
