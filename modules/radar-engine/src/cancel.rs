use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use radar_common::RadarError;

/// Cooperative cancellation shared between the caller and a running analysis.
/// Checked between embedding chunks and between cluster windows.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), RadarError> {
        if self.is_cancelled() {
            Err(RadarError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.cancel();
        assert!(matches!(flag.check(), Err(RadarError::Cancelled)));
    }
}
