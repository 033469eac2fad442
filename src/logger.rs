use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::store::CacheKind;

/// Notification sink for transfer and commit events.
///
/// Every hook defaults to a no-op so observers only implement what they show.
pub trait TransferLogger: Send + Sync {
    fn upload_start(&self, _uid: &str, _name: &str, _total_chunks: u64) {}
    fn upload_done(&self, _uid: &str, _bytes: u64) {}
    fn download_done(&self, _uid: &str, _bytes: u64) {}
    fn commit_done(&self, _kind: CacheKind, _uid: &str) {}
    fn error(&self, _context: &str, _uid: &str, _msg: &str) {}
    fn flush_done(&self, _items: u64, _failed: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl TransferLogger for TextLogger {
    fn upload_start(&self, uid: &str, name: &str, total_chunks: u64) {
        self.line(&format!("UPLOAD uid={uid} name={name} chunks={total_chunks}"));
    }
    fn upload_done(&self, uid: &str, bytes: u64) {
        self.line(&format!("UPLOADED uid={uid} bytes={bytes}"));
    }
    fn download_done(&self, uid: &str, bytes: u64) {
        self.line(&format!("DOWNLOADED uid={uid} bytes={bytes}"));
    }
    fn commit_done(&self, kind: CacheKind, uid: &str) {
        self.line(&format!("COMMIT kind={kind} uid={uid}"));
    }
    fn error(&self, context: &str, uid: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} uid={uid} msg={msg}"));
    }
    fn flush_done(&self, items: u64, failed: u64, seconds: f64) {
        self.line(&format!("FLUSH items={items} failed={failed} seconds={seconds:.3}"));
    }
}
