//! Cooperative cancellation, checked at iteration boundaries.
//!
//! Two sources fold into one token: an in-process flag (for embedding and
//! signal handlers) and an optional stop-flag file whose mere existence
//! requests a graceful stop after the current iteration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl CancelToken {
    pub fn new(stop_file: Option<PathBuf>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            stop_file,
        }
    }

    /// Request cancellation from inside the process.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True when either source has requested a stop. The file check is a
    /// fresh stat each call; iteration boundaries are rare enough that this
    /// never matters.
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.stop_file
            .as_deref()
            .map(|p| p.exists())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_process_cancel() {
        let token = CancelToken::new(None);
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones share the flag.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_stop_file_cancels() {
        let path = std::env::temp_dir().join(format!("worldtune_stop_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let token = CancelToken::new(Some(path.clone()));
        assert!(!token.is_cancelled());
        std::fs::write(&path, "").unwrap();
        assert!(token.is_cancelled());
        let _ = std::fs::remove_file(&path);
    }
}
