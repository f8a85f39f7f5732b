use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop request shared between a worker and its controllers.
///
/// Loops check it between blocks/frames, never in the middle of one.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Returns true only for the call that set the flag.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_stopped());

        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(other.is_stopped());
    }
}
