//! Deadline and shutdown checks for a running reconcile.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::ControllerError;

/// Polled by the reconciler before every write.
#[derive(Debug, Clone)]
pub struct Cancellation {
    deadline: Option<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// Cancel after `timeout`, or as soon as `shutdown` turns true.
    pub fn new(timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            shutdown: Some(shutdown),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            shutdown: None,
        }
    }

    /// Never cancels.
    pub fn never() -> Self {
        Self {
            deadline: None,
            shutdown: None,
        }
    }

    pub fn check(&self) -> Result<(), ControllerError> {
        if self.shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(ControllerError::Cancelled("shutdown"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ControllerError::Cancelled("deadline exceeded"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_passes() {
        assert!(Cancellation::never().check().is_ok());
    }

    #[test]
    fn past_deadline_cancels() {
        let cancel = Cancellation::with_deadline(Instant::now());
        assert!(matches!(
            cancel.check(),
            Err(ControllerError::Cancelled("deadline exceeded"))
        ));
    }

    #[test]
    fn shutdown_cancels() {
        let (tx, rx) = watch::channel(false);
        let cancel = Cancellation::new(Duration::from_secs(60), rx);
        assert!(cancel.check().is_ok());
        tx.send(true).unwrap();
        assert!(matches!(
            cancel.check(),
            Err(ControllerError::Cancelled("shutdown"))
        ));
    }
}
