#![no_std]

#[cfg(test)]
extern crate std;

pub mod klog;
pub mod ports;

pub use klog::{
    KlogBackend, KlogLevel, klog_clear_backend, klog_com1_backend, klog_get_level, klog_init,
    klog_is_enabled, klog_register_backend, klog_set_level,
};
pub use ports::COM1_BASE;
