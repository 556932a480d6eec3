//! Runtime configuration.

/// Knobs for a [`crate::Vm`] instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeConfig {
    /// Run a collection at every allocation site instead of waiting for the
    /// heap threshold. Slow; meant for tests.
    pub stress_gc: bool,
}

impl RuntimeConfig {
    pub fn new() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    pub fn with_stress_gc(mut self, on: bool) -> RuntimeConfig {
        self.stress_gc = on;
        self
    }
}
