//! Program facade: monadic combinators over expressions.
//!
//! `Program` wraps an [`Expr`] and provides the collection combinators of
//! the public API (`pure` / `map` / `flat_map` / `sequence` / `traverse`
//! and the collection builders). Each combinator compiles to a [`Co`]
//! chain, so composition stays lazy until the machine drives it.

use crate::expr::{Co, Expr};
use crate::values::Value;

/// A composable, lazily-evaluated program.
#[derive(Debug, Clone)]
pub struct Program {
    expr: Expr,
}

impl Program {
    /// A program that immediately yields `v`.
    pub fn pure(v: impl Into<Value>) -> Program {
        Program { expr: Expr::pure(v) }
    }

    pub fn from_expr(expr: Expr) -> Program {
        Program { expr }
    }

    /// Wrap a do-notation chain.
    pub fn gen(name: impl Into<String>, co: Co) -> Program {
        Program { expr: Expr::gen(name, co) }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn into_expr(self) -> Expr {
        self.expr
    }

    /// Transform the program's value.
    pub fn map(self, f: impl FnOnce(Value) -> Value + Send + 'static) -> Program {
        Program {
            expr: Expr::gen("map", Co::bind(self.expr, move |v| Co::done(f(v)))),
        }
    }

    /// Chain a dependent program.
    pub fn flat_map(self, f: impl FnOnce(Value) -> Expr + Send + 'static) -> Program {
        Program {
            expr: Expr::gen("flat_map", Co::bind(self.expr, move |v| Co::just(f(v)))),
        }
    }

    /// Run `self`, discard its value, then run `next`.
    pub fn then(self, next: impl Into<Expr>) -> Program {
        let next = next.into();
        Program {
            expr: Expr::gen("then", Co::bind(self.expr, move |_| Co::just(next))),
        }
    }

    /// Run programs in order, collecting their results into a list.
    pub fn sequence(items: impl IntoIterator<Item = Expr>) -> Program {
        let items: Vec<Expr> = items.into_iter().collect();
        Program {
            expr: Expr::gen("sequence", sequence_co(items.into_iter(), Vec::new())),
        }
    }

    /// Apply `f` to each input in order, collecting the results.
    pub fn traverse(
        items: impl IntoIterator<Item = Value>,
        f: impl Fn(Value) -> Expr + Send + 'static,
    ) -> Program {
        let exprs: Vec<Expr> = items.into_iter().map(f).collect();
        Program {
            expr: Expr::gen("traverse", sequence_co(exprs.into_iter(), Vec::new())),
        }
    }

    /// `sequence` under its collection-builder name.
    pub fn list(items: impl IntoIterator<Item = Expr>) -> Program {
        Self::sequence(items)
    }

    /// Fixed-arity `sequence`; the result is still a list value.
    pub fn tuple(items: impl IntoIterator<Item = Expr>) -> Program {
        Self::sequence(items)
    }

    /// `sequence` with structural deduplication of the results.
    pub fn set(items: impl IntoIterator<Item = Expr>) -> Program {
        Self::sequence(items).map(|v| match v {
            Value::List(items) => {
                let mut out: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    if !out.contains(&item) {
                        out.push(item);
                    }
                }
                Value::List(out)
            }
            other => other,
        })
    }

    /// Run each entry's program in order, collecting a map of results.
    pub fn dict(entries: impl IntoIterator<Item = (String, Expr)>) -> Program {
        let entries: Vec<(String, Expr)> = entries.into_iter().collect();
        Program {
            expr: Expr::gen("dict", dict_co(entries.into_iter(), Vec::new())),
        }
    }
}

fn sequence_co(mut items: std::vec::IntoIter<Expr>, mut acc: Vec<Value>) -> Co {
    match items.next() {
        None => Co::done(Value::List(acc)),
        Some(expr) => Co::bind(expr, move |v| {
            acc.push(v);
            sequence_co(items, acc)
        }),
    }
}

fn dict_co(
    mut entries: std::vec::IntoIter<(String, Expr)>,
    mut acc: Vec<(String, Value)>,
) -> Co {
    match entries.next() {
        None => Co::done(Value::map(acc)),
        Some((key, expr)) => Co::bind(expr, move |v| {
            acc.push((key, v));
            dict_co(entries, acc)
        }),
    }
}

impl From<Program> for Expr {
    fn from(p: Program) -> Self {
        p.into_expr()
    }
}

impl From<Expr> for Program {
    fn from(expr: Expr) -> Self {
        Program { expr }
    }
}
