//! Shared infrastructure utilities for typelift.
//!
//! - **`atomic_write`**: crash-safe file persistence (temp + rename), used by
//!   the hover cache and the on-disk document materializer.

pub mod atomic_write;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, atomic_write, atomic_write_with_options, recover_bak_file,
};
