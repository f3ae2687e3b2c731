//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod archive_mock;
pub mod critical_utils;
pub mod socket_guard;

/// Starts a mock server or returns from the test when sockets are unavailable.
#[allow(unused_macros)]
macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = $crate::support::socket_guard::start_mock_server_or_skip().await
        else {
            return;
        };
        mock_server
    }};
}
