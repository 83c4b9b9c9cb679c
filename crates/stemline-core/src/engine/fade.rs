//! Fade-out completion tracking
//!
//! A fade-out resolves once the primary volume measured on the backend is
//! within [`FADE_EPSILON`] of zero. The backend is not queried before the
//! ramp is expected to be finished; after that the control tick polls it
//! until the ramp lands or is superseded by a newer volume change.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// Volume at which a fade-out counts as finished
pub const FADE_EPSILON: f32 = 0.01;

/// How a fade-out ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    /// Volume reached zero
    Completed,
    /// A later volume change, fade-in or dispose replaced the ramp
    Superseded,
}

/// Future returned by `StemChannel::fade_out`
#[must_use = "a fade-out does nothing to wait on unless polled"]
pub struct FadeOut {
    receiver: Option<oneshot::Receiver<FadeOutcome>>,
}

impl FadeOut {
    /// A fade-out that is already complete (nothing was playing)
    pub fn completed() -> Self {
        Self { receiver: None }
    }

    /// Non-blocking check of the outcome
    pub fn try_outcome(&mut self) -> Option<FadeOutcome> {
        match &mut self.receiver {
            None => Some(FadeOutcome::Completed),
            Some(receiver) => match receiver.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(FadeOutcome::Superseded),
            },
        }
    }
}

impl Future for FadeOut {
    type Output = FadeOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.receiver {
            None => Poll::Ready(FadeOutcome::Completed),
            Some(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|result| result.unwrap_or(FadeOutcome::Superseded)),
        }
    }
}

/// Channel-side state of the running fade-out
#[derive(Default)]
pub struct FadeTracker {
    pending: Option<PendingFade>,
}

struct PendingFade {
    sender: oneshot::Sender<FadeOutcome>,
    /// When the ramp should have landed
    expected_end: Instant,
}

impl FadeTracker {
    /// Track a new fade-out lasting `duration`, superseding the previous one
    pub fn start(&mut self, now: Instant, duration: Duration) -> FadeOut {
        self.resolve(FadeOutcome::Superseded);
        let (sender, receiver) = oneshot::channel();
        self.pending = Some(PendingFade {
            sender,
            expected_end: now + duration,
        });
        FadeOut {
            receiver: Some(receiver),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the backend volume should be polled at `now`
    pub fn due(&self, now: Instant) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|fade| now >= fade.expected_end)
    }

    /// Resolve the running fade-out, if any
    pub fn resolve(&mut self, outcome: FadeOutcome) {
        if let Some(fade) = self.pending.take() {
            // The receiver may already be gone
            let _ = fade.sender.send(outcome);
        }
    }

    /// Resolve as completed if `volume` is within tolerance; returns true if resolved
    pub fn check(&mut self, volume: f32) -> bool {
        if self.pending.is_some() && volume.abs() <= FADE_EPSILON {
            self.resolve(FadeOutcome::Completed);
            true
        } else {
            false
        }
    }
}
