//! DCall API - Core types for the direct syscall acceleration bridge
//!
//! This crate provides the types shared between the host and guest sides of
//! the bridge: error handling, virtual address arithmetic, and the syscall
//! number table.
//!
//! # Architecture
//!
//! - **Error**: common error type and the errno mapping used at the raw
//!   syscall boundary
//! - **Addr**: virtual addresses and page arithmetic
//! - **Nr**: syscall numbers, including the two privileged bridge calls

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod addr;
pub mod error;
pub mod nr;

// Re-export commonly used types
pub use crate::addr::{PAGE_SHIFT, PAGE_SIZE, VirtAddr, page_round_down, page_round_up};
pub use crate::error::{Error, Result};

/// Logical processor identifier.
pub type CpuId = u32;
