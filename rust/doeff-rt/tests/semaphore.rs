//! Semaphore semantics: FIFO fairness, permit transfer, release bounds,
//! cancellation without leaks.

mod common;

use common::{just, run_default, OrderLog};
use doeff_core::effects::{
    acquire_semaphore, cancel, create_semaphore, gather, release_semaphore, safe,
    spawn, spawn_with, wait, PRIORITY_IDLE,
};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr};
use doeff_core::values::{SemaphoreId, Value};

fn expect_semaphore(v: &Value) -> SemaphoreId {
    match v {
        Value::Semaphore(id) => *id,
        other => panic!("expected semaphore handle, got {:?}", other),
    }
}

#[test]
fn create_acquire_release_round_trip() {
    let program = Expr::gen(
        "round-trip",
        Co::bind(create_semaphore(1), |sem| {
            let sem = expect_semaphore(&sem);
            Co::bind(acquire_semaphore(sem), move |_| {
                Co::bind(release_semaphore(sem), |_| Co::done("done"))
            })
        }),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Str("done".into())));
}

#[test]
fn create_with_non_positive_permits_fails() {
    let result = run_default(just("bad", safe(create_semaphore(0))));
    match result.value() {
        Some(Value::Err(e)) => {
            assert!(matches!(**e, EffectError::SemaphoreInit { permits: 0 }))
        }
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn acquire_blocks_until_release() {
    let order = OrderLog::new();
    let holder_order = order.clone();
    let waiter_order = order.clone();
    let program = Expr::gen(
        "program",
        Co::bind(create_semaphore(1), move |sem| {
            let sem = expect_semaphore(&sem);
            let holder = Expr::gen(
                "holder",
                Co::bind(acquire_semaphore(sem), move |_| {
                    Co::bind(holder_order.mark("holder-acquired"), move |_| {
                        Co::bind(release_semaphore(sem), move |_| {
                            Co::just(holder_order.mark("holder-released"))
                        })
                    })
                }),
            );
            let waiter = Expr::gen(
                "waiter",
                Co::bind(acquire_semaphore(sem), move |_| {
                    Co::bind(waiter_order.mark("waiter-acquired"), move |_| {
                        Co::just(release_semaphore(sem))
                    })
                }),
            );
            Co::bind(spawn(holder), move |t1| {
                Co::bind(spawn(waiter), move |t2| Co::just(gather([t1, t2])))
            })
        }),
    );
    let result = run_default(program);
    assert!(result.is_ok());
    let entries = order.entries();
    let holder_pos = entries.iter().position(|e| e == "holder-acquired").unwrap();
    let waiter_pos = entries.iter().position(|e| e == "waiter-acquired").unwrap();
    assert!(holder_pos < waiter_pos);
}

#[test]
fn waiters_wake_in_fifo_order() {
    let order = OrderLog::new();
    let order_in = order.clone();
    let program = Expr::gen(
        "program",
        Co::bind(create_semaphore(1), move |sem| {
            let order = order_in;
            let sem = expect_semaphore(&sem);
            // The parent holds the only permit, so A, B and C all park in
            // acquire order; an idle-priority releaser then hands the
            // permit down the queue.
            Co::bind(acquire_semaphore(sem), move |_| {
                let contender = |name: &'static str, log: OrderLog| {
                    Expr::gen(
                        name,
                        Co::bind(acquire_semaphore(sem), move |_| {
                            Co::bind(log.mark(name), move |_| {
                                Co::just(release_semaphore(sem))
                            })
                        }),
                    )
                };
                let a = contender("A", order.clone());
                let b = contender("B", order.clone());
                let c = contender("C", order.clone());
                let releaser = spawn_with(
                    just("releaser", release_semaphore(sem)),
                    PRIORITY_IDLE,
                    false,
                );
                Co::bind(spawn(a), move |ta| {
                    Co::bind(spawn(b), move |tb| {
                        Co::bind(spawn(c), move |tc| {
                            Co::bind(releaser, move |tr| {
                                Co::just(gather([ta, tb, tc, tr]))
                            })
                        })
                    })
                })
            })
        }),
    );
    let result = run_default(program);
    assert!(result.is_ok());
    assert_eq!(order.entries(), vec!["A", "B", "C"]);
}

#[test]
fn release_beyond_max_permits_fails() {
    let program = Expr::gen(
        "over-release",
        Co::bind(create_semaphore(1), |sem| {
            let sem = expect_semaphore(&sem);
            Co::just(safe(release_semaphore(sem)))
        }),
    );
    let result = run_default(program);
    match result.value() {
        Some(Value::Err(e)) => assert!(matches!(**e, EffectError::SemaphoreRelease)),
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn cancelling_a_blocked_acquirer_preserves_the_permit_count() {
    let program = Expr::gen(
        "program",
        Co::bind(create_semaphore(1), move |sem| {
            let sem = expect_semaphore(&sem);
            Co::bind(acquire_semaphore(sem), move |_| {
                let blocked = just("blocked", acquire_semaphore(sem));
                Co::bind(spawn(blocked), move |victim| {
                    let victim_id = victim.as_task().expect("task handle");
                    // Let the victim park before cancelling it.
                    let nudge = just("nudge", Expr::pure(0));
                    Co::bind(spawn(nudge), move |nt| {
                        Co::bind(wait(nt), move |_| {
                            Co::bind(cancel(victim_id), move |_| {
                                Co::bind(safe(wait(victim)), move |caught| {
                                    // Release and re-acquire: the permit
                                    // count must be intact.
                                    Co::bind(release_semaphore(sem), move |_| {
                                        Co::bind(acquire_semaphore(sem), move |_| {
                                            Co::done(caught)
                                        })
                                    })
                                })
                            })
                        })
                    })
                })
            })
        }),
    );
    let result = run_default(program);
    match result.value() {
        Some(Value::Err(e)) => {
            assert!(matches!(**e, EffectError::TaskCancelled { .. }))
        }
        other => panic!("expected Err value, got {:?}", other),
    }
}
