// cdp-test-utils: Shared test utilities for the CDP client.
//
// Provides a mock CDP server (hello, challenge/response auth, structure and
// value serving, time answers) plus canned node fixtures for tests.

pub mod fixtures;
pub mod mock_cdp_server;

pub use mock_cdp_server::{MockCdpServer, MockServerConfig, Records};
