//! Tests for the KernelConfig builder.

use qf::{KernelConfig, MAX_PRIO};

#[test]
fn kernel_config_builder() {
    let config = KernelConfig::builder()
        .name("TestKernel")
        .max_active(32)
        .max_tick_rate(3)
        .max_pub_signal(64)
        .version(800)
        .build();

    assert_eq!(config.name, "TestKernel");
    assert_eq!(config.max_active, 32);
    assert_eq!(config.max_tick_rate, 3);
    assert_eq!(config.max_pub_signal, 64);
    assert_eq!(config.version, 800);
}

#[test]
fn kernel_config_default() {
    let config = KernelConfig::default();

    assert_eq!(config.name, "QP");
    assert_eq!(config.max_active, 32);
    assert_eq!(config.max_tick_rate, 2);
    assert_eq!(config.max_pub_signal, 32);
    assert!(config.idle_callback.is_none());
}

#[test]
fn kernel_config_clamps_sizes() {
    let config = KernelConfig::builder()
        .max_active(200)
        .max_tick_rate(0)
        .build();

    assert_eq!(config.max_active, MAX_PRIO);
    assert_eq!(config.max_tick_rate, 1);
}

#[test]
fn kernel_idle_callback() {
    fn idle_callback() {}

    let config = KernelConfig::builder().idle_callback(idle_callback).build();

    assert!(config.idle_callback.is_some());
}
