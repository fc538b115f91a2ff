//! Structured, best-effort progress events (§4.M, §6).

use serde::Serialize;

/// One progress event, matching the wire schema in spec §6:
/// `{stage, fov, t, T, message}`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub fov: usize,
    pub t: usize,
    pub total: usize,
    pub message: String,
}

/// A reporter is a capability: a function from event to unit. Emission is
/// best-effort and may be dropped; callers must not rely on every event
/// arriving.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// A reporter that drops every event; the default for callers that do not
/// care about progress.
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _event: ProgressEvent) {}
}

/// Emit a progress event every `coarseness` frames, plus unconditionally on
/// the final frame. Mirrors the `frame_idx % 30 == 0` gating the stage
/// services use.
pub fn should_report(t: usize, total: usize, coarseness: usize) -> bool {
    t.is_multiple_of(coarseness.max(1)) || t + 1 == total
}
