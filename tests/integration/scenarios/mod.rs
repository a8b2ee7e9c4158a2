//! Test scenarios for integration testing
//!
//! Each module contains tests for specific functionality:
//! - set_get: plain storage and retrieval, single and bulk
//! - cas: conditional writes and deletes
//! - connection: authentication, timeouts and broken connections
//! - pool: connection reuse and disconnect_all

pub mod pool;
