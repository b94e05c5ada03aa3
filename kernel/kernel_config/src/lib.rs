//! Build-time configuration constants shared by the memory allocation crates.

#![no_std]

pub mod memory;
