//! One-shot continuation records.
//!
//! A continuation is captured at every user-handler dispatch: the frames
//! between the effect's yield point and the handler boundary, snapshotted
//! into an arena record and addressed by id. Records are strictly
//! one-shot — the first consumption (resume, delegation re-capture, or
//! discard) invalidates the handle, and a second resume is the fatal
//! "continuation already resumed" contract violation.
//!
//! Records live for at most one run; the arena is dropped with the
//! machine.

use crate::vm::frames::Frame;

use doeff_core::errors::EffectError;
use doeff_core::expr::Continuation;

/// Why a continuation handle could not be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationFault {
    AlreadyConsumed,
    Unknown,
}

impl ContinuationFault {
    pub fn into_error(self) -> EffectError {
        match self {
            ContinuationFault::AlreadyConsumed => {
                EffectError::handler_contract("continuation already resumed")
            }
            ContinuationFault::Unknown => {
                EffectError::handler_contract("unknown continuation handle")
            }
        }
    }
}

struct Record {
    /// Frames in stack order (index 0 is the bottom of the segment).
    frames: Option<Vec<Frame>>,
    token: u64,
}

/// Arena of captured continuations for one run.
#[derive(Default)]
pub struct ContinuationArena {
    records: Vec<Record>,
}

impl ContinuationArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a frame segment into a fresh record.
    pub fn capture(&mut self, frames: Vec<Frame>) -> Continuation {
        let id = self.records.len() as u64;
        let token = id + 1;
        self.records.push(Record { frames: Some(frames), token });
        Continuation { id, token }
    }

    /// Consume the record, yielding its frames for splicing. One-shot.
    pub fn take(&mut self, k: Continuation) -> Result<Vec<Frame>, ContinuationFault> {
        let record = self
            .records
            .get_mut(k.id as usize)
            .filter(|r| r.token == k.token)
            .ok_or(ContinuationFault::Unknown)?;
        record.frames.take().ok_or(ContinuationFault::AlreadyConsumed)
    }

    /// Consume the record without resuming, for discard paths. Returns the
    /// frames so the caller can close their coroutines, or `None` if the
    /// record was already consumed.
    pub fn discard(&mut self, k: Continuation) -> Option<Vec<Frame>> {
        self.records
            .get_mut(k.id as usize)
            .filter(|r| r.token == k.token)
            .and_then(|r| r.frames.take())
    }

    pub fn is_consumed(&self, k: Continuation) -> bool {
        self.records
            .get(k.id as usize)
            .filter(|r| r.token == k.token)
            .map(|r| r.frames.is_none())
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_take_is_one_shot() {
        let mut arena = ContinuationArena::new();
        let k = arena.capture(Vec::new());
        assert!(!arena.is_consumed(k));
        assert!(arena.take(k).is_ok());
        assert!(matches!(arena.take(k), Err(ContinuationFault::AlreadyConsumed)));
        assert!(arena.is_consumed(k));
    }

    #[test]
    fn stale_tokens_do_not_resolve() {
        let mut arena = ContinuationArena::new();
        let k = arena.capture(Vec::new());
        let forged = Continuation { id: k.id, token: k.token + 7 };
        assert!(matches!(arena.take(forged), Err(ContinuationFault::Unknown)));
    }

    #[test]
    fn discard_consumes_quietly() {
        let mut arena = ContinuationArena::new();
        let k = arena.capture(Vec::new());
        assert!(arena.discard(k).is_some());
        assert!(arena.discard(k).is_none());
        assert!(matches!(arena.take(k), Err(ContinuationFault::AlreadyConsumed)));
    }
}
