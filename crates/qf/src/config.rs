//! Kernel sizing and runtime configuration.

use crate::prio_set::MAX_PRIO;

/// Configuration shared by the QK and QXK kernels.
///
/// `max_active` bounds the priorities the kernel accepts (`1..=max_active`)
/// and `max_tick_rate` the number of independent clock tick rates. Signals
/// below `max_pub_signal` can be published.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    pub max_active: u8,
    pub max_tick_rate: u8,
    pub max_pub_signal: u16,
    pub idle_callback: Option<fn()>,
    pub version: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "QP",
            max_active: 32,
            max_tick_rate: 2,
            max_pub_signal: 32,
            idle_callback: None,
            version: 740,
        }
    }
}

impl KernelConfig {
    /// Creates a new kernel configuration builder.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the highest usable priority; clamped to [`MAX_PRIO`].
    pub fn max_active(mut self, max: u8) -> Self {
        self.config.max_active = max.min(MAX_PRIO);
        self
    }

    /// Sets the number of tick rates; at least one is always available.
    pub fn max_tick_rate(mut self, max: u8) -> Self {
        self.config.max_tick_rate = max.max(1);
        self
    }

    /// Sets the size of the subscriber table.
    pub fn max_pub_signal(mut self, max: u16) -> Self {
        self.config.max_pub_signal = max;
        self
    }

    /// Sets the callback run on every pass of the idle loop.
    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.config.version = version;
        self
    }

    pub fn build(self) -> KernelConfig {
        self.config
    }
}
