use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DarnerError, Result};

/// Cooperative progress and cancellation for a repair run.
///
/// Every per-item loop iteration calls `checkpoint` first; a set cancel flag
/// surfaces as `Aborted`, which is the only abort-class error and
/// re-propagates through per-item catch blocks. Progress counts attempted
/// items, successful or not, against a fixed target.
pub struct RepairControl<'a> {
    progress: Option<&'a mut dyn FnMut(f32)>,
    cancel: Option<&'a AtomicBool>,
    attempted: usize,
    target: usize,
}

impl<'a> RepairControl<'a> {
    pub fn new(
        progress: Option<&'a mut dyn FnMut(f32)>,
        cancel: Option<&'a AtomicBool>,
    ) -> Self {
        Self {
            progress,
            cancel,
            attempted: 0,
            target: 0,
        }
    }

    pub fn set_target(&mut self, target: usize) {
        self.target = target;
        self.publish();
    }

    /// Cancellation rendezvous; call at the top of every item iteration.
    pub fn checkpoint(&self) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(DarnerError::Aborted),
            _ => Ok(()),
        }
    }

    /// Count one attempted item and publish the fraction.
    pub fn advance(&mut self) {
        self.attempted += 1;
        self.publish();
    }

    /// Publish completion regardless of how many items were attempted.
    pub fn publish_done(&mut self) {
        if let Some(sink) = self.progress.as_deref_mut() {
            sink(1.0);
        }
    }

    fn publish(&mut self) {
        let fraction = if self.target == 0 {
            0.0
        } else {
            (self.attempted as f32 / self.target as f32).min(1.0)
        };
        if let Some(sink) = self.progress.as_deref_mut() {
            sink(fraction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_respects_cancel_flag() {
        let flag = AtomicBool::new(false);
        let control = RepairControl::new(None, Some(&flag));
        assert!(control.checkpoint().is_ok());
        flag.store(true, Ordering::SeqCst);
        assert!(matches!(
            control.checkpoint().unwrap_err(),
            DarnerError::Aborted
        ));
    }

    #[test]
    fn advance_publishes_fraction_of_target() {
        let mut seen = Vec::new();
        let mut sink = |f: f32| seen.push(f);
        let mut control = RepairControl::new(Some(&mut sink), None);
        control.set_target(4);
        control.advance();
        control.advance();
        control.publish_done();
        assert_eq!(seen, vec![0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn progress_is_counted_per_attempt_and_capped() {
        let mut last = 0.0f32;
        let mut sink = |f: f32| last = f;
        let mut control = RepairControl::new(Some(&mut sink), None);
        control.set_target(1);
        control.advance();
        control.advance(); // more attempts than target never exceeds 1.0
        assert_eq!(last, 1.0);
    }
}
