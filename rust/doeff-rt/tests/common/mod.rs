//! Shared fixtures for the machine integration tests.
#![allow(dead_code)]

use doeff_core::effects::{await_, UserEffect};
use doeff_core::expr::{Co, Expr};
use doeff_core::values::{Awaitable, Value};
use doeff_rt::{run, RunConfig, RunResult};

use std::any::Any;
use std::sync::{Arc, Mutex};

/// Run a program under the default handler stack.
pub fn run_default(program: impl Into<Expr>) -> RunResult {
    run(program, RunConfig::default())
}

/// A shared execution-order recorder observable from closures.
#[derive(Clone, Default)]
pub struct OrderLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl OrderLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// An effect that records `entry` when the task actually executes.
    pub fn mark(&self, entry: &str) -> Expr {
        let log = self.clone();
        let entry = entry.to_string();
        await_(Awaitable::new(format!("mark:{}", entry), move || {
            log.push(entry);
            Ok(Value::Unit)
        }))
    }
}

/// Minimal user effect for handler dispatch tests.
#[derive(Debug)]
pub struct Ping;

impl UserEffect for Ping {
    fn dispatch_key(&self) -> &str {
        "ping"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `yield expr; return its value` as a named program.
pub fn just(name: &str, expr: Expr) -> Expr {
    Expr::gen(name, Co::just(expr))
}
