//! Structured failure traces.
//!
//! When a run fails, the machine synthesizes a traceback from the
//! unwinding itself: the handler chain at the failure site, the creation
//! site of the failing effect, and a spawn-site separator for every task
//! boundary the failure crossed. The rendering is deterministic text so
//! both the CLI and test assertions can match on it.

use doeff_core::errors::EffectError;

use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Status of a handler frame at the failure site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Running,
    Delegated,
    Resumed,
    Failed,
}

impl fmt::Display for HandlerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandlerStatus::Running => "running",
            HandlerStatus::Delegated => "delegated",
            HandlerStatus::Resumed => "resumed",
            HandlerStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// One element of the structured traceback, in unwind order.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEntry {
    /// The effect closest to the failure, with its creation site.
    Effect { effect: String, site: Option<String> },
    /// A handler body the failure passed through or originated in.
    HandlerFrame {
        handler: String,
        status: HandlerStatus,
        effect: Option<String>,
    },
    /// A handler scope the failure unwound out of.
    Scope { handler: String },
    /// The failure crossed from a spawned task into its waiter.
    SpawnBoundary { task: u64, site: Option<String> },
}

// ---------------------------------------------------------------------------
// EffectTrace
// ---------------------------------------------------------------------------

/// The structured traceback attached to a failed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectTrace {
    pub entries: Vec<TraceEntry>,
}

impl EffectTrace {
    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic text rendering: one line per entry, innermost first,
    /// followed by the error cause chain.
    pub fn render(&self, error: &EffectError) -> String {
        let mut out = String::from("effect trace (innermost first):\n");
        if self.entries.is_empty() {
            out.push_str("  <no frames recorded>\n");
        }
        for entry in &self.entries {
            match entry {
                TraceEntry::Effect { effect, site } => {
                    out.push_str(&format!("  effect {}", effect));
                    if let Some(site) = site {
                        out.push_str(&format!(" created at {}", site));
                    }
                    out.push('\n');
                }
                TraceEntry::HandlerFrame { handler, status, effect } => {
                    out.push_str(&format!("  handler {} [{}]", handler, status));
                    if let Some(effect) = effect {
                        out.push_str(&format!(" handling {}", effect));
                    }
                    out.push('\n');
                }
                TraceEntry::Scope { handler } => {
                    out.push_str(&format!("  scope {}\n", handler));
                }
                TraceEntry::SpawnBoundary { task, site } => {
                    match site {
                        Some(site) => out.push_str(&format!(
                            "  ── in task {} spawned at {} ──\n",
                            task, site
                        )),
                        None => out.push_str(&format!("  ── in task {} ──\n", task)),
                    }
                }
            }
        }
        out.push_str("caused by:\n");
        for (depth, err) in error.chain().iter().enumerate() {
            out.push_str(&format!(
                "  {}{}: {}\n",
                "  ".repeat(depth),
                err.kind(),
                err
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Failure — an error in flight
// ---------------------------------------------------------------------------

/// A propagating failure: the error plus the trace accumulated while
/// unwinding.
#[derive(Debug, Clone)]
pub struct Failure {
    pub error: EffectError,
    pub trace: EffectTrace,
}

impl Failure {
    pub fn new(error: EffectError) -> Self {
        Self { error, trace: EffectTrace::default() }
    }

    pub fn with_effect(error: EffectError, effect: String, site: Option<String>) -> Self {
        let mut trace = EffectTrace::default();
        trace.push(TraceEntry::Effect { effect, site });
        Self { error, trace }
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

// ---------------------------------------------------------------------------
// RunError — public error shape
// ---------------------------------------------------------------------------

/// The error surfaced on a failed [`RunResult`](crate::api::RunResult).
#[derive(Debug, Clone)]
pub struct RunError {
    pub error: EffectError,
    pub trace: EffectTrace,
    pub run_id: Uuid,
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    /// The deterministic text block for diagnostics.
    pub fn render_trace(&self) -> String {
        self.trace.render(&self.error)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_entries_innermost_first() {
        let mut trace = EffectTrace::default();
        trace.push(TraceEntry::Effect {
            effect: "Ask(\"k\")".into(),
            site: Some("prog.rs:10".into()),
        });
        trace.push(TraceEntry::Scope { handler: "reader".into() });
        trace.push(TraceEntry::SpawnBoundary { task: 2, site: None });

        let err = EffectError::MissingEnvKey { key: "k".into() };
        let text = trace.render(&err);
        let effect_pos = text.find("effect Ask").unwrap();
        let scope_pos = text.find("scope reader").unwrap();
        let spawn_pos = text.find("── in task 2 ──").unwrap();
        assert!(effect_pos < scope_pos && scope_pos < spawn_pos);
        assert!(text.contains("MissingEnvKeyError"));
    }

    #[test]
    fn render_includes_cause_chain() {
        let inner = EffectError::failure("db unreachable");
        let outer = EffectError::failure_with_cause("login failed", inner);
        let text = EffectTrace::default().render(&outer);
        let login = text.find("login failed").unwrap();
        let db = text.find("db unreachable").unwrap();
        assert!(login < db);
    }
}
