//! Network constants for the trusted and untrusted connections

use std::time::Duration;

// Connections
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const CHANNEL_SIZE: usize = 100;

// Block locators
pub const TRUSTED_LOCATOR_MAX: usize = 50;
pub const UNTRUSTED_HEADER_DELTA: u32 = 6;
pub const UNTRUSTED_LOCATOR_MAX: usize = 10;

// Header re-requests while syncing
pub const MAX_OUTSTANDING_FOR_HEADERS: usize = 5;

// Monitors
pub const REQUEST_TIMEOUT_INTERVAL: Duration = Duration::from_secs(5);
pub const UNTRUSTED_TIMEOUT_INTERVAL: Duration = Duration::from_secs(10);
pub const SAFE_DELAY_INTERVAL: Duration = Duration::from_millis(100);
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

// Readiness waits
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const READY_POLL_ATTEMPTS: u32 = 100;

// Untrusted pool
pub const POOL_INTERVAL: Duration = Duration::from_secs(2);
pub const POOL_NOT_READY_DELAY: Duration = Duration::from_millis(500);
pub const ADDRESS_REUSE: Duration = Duration::from_secs(600);
pub const HIGH_SCORE: i32 = 5;
pub const LOW_SCORE: i32 = 1;
pub const VERIFIED_SCORE: i32 = 5;

// Peer scanning
pub const SCAN_CONNECTIONS: usize = 1000;
pub const SCAN_WAIT: Duration = Duration::from_secs(10);

// Version message
pub const USER_AGENT: &str = "/Tokenized:0.1.0/";
pub const VERSION_RECEIVER: &str = "127.0.0.1:8333";
pub const VERSION_SENDER: &str = "127.0.0.1:9333";
