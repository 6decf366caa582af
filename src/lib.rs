//! guest-memfd-stress — a stress test for the KVM guest_memfd allocation path.
//!
//! The tool repeatedly allocates memory two ways — plain anonymous `mmap` and
//! KVM guest_memfd objects — writes a position-derived byte pattern into each
//! page, verifies it, and releases everything, looping thousands of times
//! with randomized sizes and allocation-kind selection.  Any failure along
//! the way (allocation, mapping, release, or a pattern mismatch) is a test
//! finding: nothing is retried, the process reports the failing operation and
//! exits non-zero.
//!
//! # Architecture
//!
//! - [`provider`] — KVM root handle, VM context, guest_memfd creation, and
//!   memory mapping
//! - [`pattern`] — page-sampled write/verify of the byte pattern
//! - [`stress`] — the iteration loop, mode policy, and size selection

pub mod pattern;
pub mod provider;
pub mod stress;
