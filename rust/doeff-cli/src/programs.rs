//! Built-in demo programs runnable from the command line.
//!
//! Rust has no runtime symbol import, so the CLI runs programs out of
//! this registry instead of resolving `module.symbol` paths.

use doeff_core::effects::{
    ask, fail, gather, get, listen, modify, put, race, safe, tell,
};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr};
use doeff_core::program::Program;
use doeff_core::values::Value;

/// A named demo program.
pub struct RegisteredProgram {
    pub name: &'static str,
    pub summary: &'static str,
    pub build: fn() -> Expr,
}

pub const REGISTRY: &[RegisteredProgram] = &[
    RegisteredProgram {
        name: "pure",
        summary: "return 42 with no effects",
        build: || Program::pure(42).into_expr(),
    },
    RegisteredProgram {
        name: "counter",
        summary: "state round-trip: three increments of a counter",
        build: counter,
    },
    RegisteredProgram {
        name: "gather-state",
        summary: "sequential gather with state accumulation",
        build: gather_state,
    },
    RegisteredProgram {
        name: "greeting",
        summary: "read greeting/name from the environment",
        build: greeting,
    },
    RegisteredProgram {
        name: "safe-failure",
        summary: "a failure converted to a value by safe()",
        build: safe_failure,
    },
    RegisteredProgram {
        name: "listen-log",
        summary: "capture a private writer log with listen()",
        build: listen_log,
    },
    RegisteredProgram {
        name: "race-pair",
        summary: "race two programs; the first completion wins",
        build: race_pair,
    },
];

pub fn find(name: &str) -> Option<&'static RegisteredProgram> {
    REGISTRY.iter().find(|p| p.name == name)
}

fn increment(key: &'static str) -> Expr {
    modify(key, "increment", |v| {
        Value::Int(v.as_int().unwrap_or(0) + 1)
    })
}

fn counter() -> Expr {
    Expr::gen(
        "counter",
        Co::bind(put("counter", 0), |_| {
            Co::bind(increment("counter"), |_| {
                Co::bind(increment("counter"), |_| {
                    Co::bind(increment("counter"), |_| {
                        Co::just(get("counter"))
                    })
                })
            })
        }),
    )
}

fn gather_state() -> Expr {
    let inc = || -> Expr {
        Expr::gen(
            "inc",
            Co::bind(increment("c"), |v| {
                Co::bind(tell(format!("counter is now {}", v)), move |_| Co::done(v))
            }),
        )
    };
    Expr::gen(
        "gather-state",
        Co::bind(put("c", 0), move |_| {
            Co::just(gather([inc().into(), inc().into(), inc().into()]))
        }),
    )
}

fn greeting() -> Expr {
    Expr::gen(
        "greeting",
        Co::bind(ask("greeting"), |g| {
            Co::bind(ask("name"), move |n| {
                Co::done(Value::Str(format!("{} {}", display(&g), display(&n))))
            })
        }),
    )
}

fn display(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn safe_failure() -> Expr {
    safe(fail(EffectError::failure("intentional demo failure")))
}

fn listen_log() -> Expr {
    Expr::gen(
        "listen-log",
        Co::bind(tell("outer entry"), |_| {
            Co::just(listen(Expr::gen(
                "inner",
                Co::bind(tell("inner entry"), |_| Co::done("inner value")),
            )))
        }),
    )
}

fn race_pair() -> Expr {
    let slow = Program::pure("slow").into_expr();
    let fast = Program::pure("fast").into_expr();
    race([fast.into(), slow.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use doeff_rt::{run, RunConfig};

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<&str> = REGISTRY.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), REGISTRY.len());
    }

    #[test]
    fn every_registered_program_runs_under_defaults() {
        for registered in REGISTRY {
            if registered.name == "greeting" {
                continue; // needs env entries
            }
            let result = run((registered.build)(), RunConfig::default());
            assert!(
                result.is_ok() || registered.name == "safe-failure",
                "program {} failed: {:?}",
                registered.name,
                result.error().map(|e| e.to_string())
            );
        }
    }

    #[test]
    fn counter_counts_to_three() {
        let result = run(counter(), RunConfig::default());
        assert_eq!(result.value(), Some(&Value::Int(3)));
    }
}
