//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod mock_files;
pub mod socket_guard;
