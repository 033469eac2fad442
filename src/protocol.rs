//! Shared constants for the canister asset protocol

// Chunk size for asset transfer (1.5MB). The remote rejects single messages
// much above 2MB, so chunks stay comfortably below that.
pub const CHUNK_SIZE: usize = 3 * 512 * 1024;

// Type tag for values that travel as UTF-8 JSON instead of raw blobs.
// The `amt:` scheme is not a registered MIME type, so it never collides.
pub const STRING_MIME: &str = "amt:string";

// Fixed key of the single filesystem entry
pub const FS_KEY: &str = "fs";

// Display name used when reporting filesystem commits
pub const FS_NAME: &str = "Filesystem";

// Lower bound for the transfer worker pool
pub const MIN_POOL_SIZE: usize = 4;

// Remote method names, used for worker task routing and log lines
pub mod method {
    pub const UPLOAD_CHUNK: &str = "upload-chunk";
    pub const DOWNLOAD_CHUNK: &str = "download-chunk";
    pub const CANCEL_ALL: &str = "cancel-all";
}

// Centralized timeout helpers. A zero value means "no timeout".
pub mod timeouts {
    use std::time::Duration;

    // Progress tick interval for UI updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 120;

    pub fn rpc_deadline(ms: u64) -> Option<Duration> {
        if ms == 0 {
            None
        } else {
            Some(Duration::from_millis(ms))
        }
    }
}
