//! End-to-end scenarios: full lifecycle through real mailboxes and the
//! orchestrator, the way an embedding host drives the engine.

use serde_json::{json, Value};
use statechart_lite_core::compiler::{self, parser::parse_chart};
use statechart_lite_core::interp::Interp;
use statechart_lite_core::mailbox::spawn_instance;
use statechart_lite_core::{
    EventObject, InterpOptions, Layout, MachineContext, Notification, ServiceFn, StatechartEngine,
    Status,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn compile(json: &str, layout: Layout) -> Arc<statechart_lite_core::types::Program> {
    let desc = parse_chart(json).unwrap();
    Arc::new(compiler::compile(&desc, layout).unwrap())
}

/// Wait until a received notification satisfies `pred`, bounded by a
/// real-time deadline.
async fn await_notification<F>(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    mut pred: F,
) -> Notification
where
    F: FnMut(&Notification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let n = rx.recv().await.expect("notification stream closed");
            if pred(&n) {
                return n;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

// ─── S1: traffic light ────────────────────────────────────────

#[tokio::test]
async fn s1_traffic_light_cycles_through_colors() {
    let program = compile(
        r#"{
            "id": "light",
            "initial": "red",
            "states": {
                "red": { "on": { "TIMER": "green" } },
                "green": { "on": { "TIMER": "yellow" } },
                "yellow": { "on": { "TIMER": "red" } }
            }
        }"#,
        Layout::NameKeyed,
    );
    let handle = spawn_instance(
        "light-1",
        program,
        MachineContext::new(),
        InterpOptions::default(),
        None,
        None,
    );
    handle.start().unwrap();

    let mut seen = vec![handle.state().await.unwrap().leaf().unwrap().to_string()];
    for _ in 0..4 {
        handle.send(EventObject::bare("TIMER")).unwrap();
        seen.push(handle.state().await.unwrap().leaf().unwrap().to_string());
    }
    assert_eq!(
        seen,
        vec![
            "#light.red",
            "#light.green",
            "#light.yellow",
            "#light.red",
            "#light.green"
        ]
    );
}

// ─── S2: compound + guard ─────────────────────────────────────

const OP_CHART: &str = r#"{
    "id": "op",
    "initial": "work",
    "context": { "canGo": true },
    "states": {
        "work": {
            "initial": "idle",
            "on": {
                "LOCK": { "actions": { "type": "assign", "values": { "canGo": false } } }
            },
            "states": {
                "idle": { "on": { "GO": { "target": "busy", "cond": "canGo" } } },
                "busy": { "on": { "DONE": "idle" } }
            }
        }
    }
}"#;

fn guarded_ctx() -> MachineContext {
    let mut ctx = MachineContext::new();
    ctx.register_guard("canGo", |vars, _| {
        Ok(vars.get("canGo").and_then(|v| v.as_bool()).unwrap_or(false))
    })
    .unwrap();
    ctx
}

#[tokio::test]
async fn s2_guard_gates_the_transition() {
    let program = compile(OP_CHART, Layout::NameKeyed);
    let handle = spawn_instance(
        "op-1",
        program,
        guarded_ctx(),
        InterpOptions::default(),
        None,
        None,
    );
    handle.start().unwrap();

    let mut seen = vec![handle.state().await.unwrap().leaf().unwrap().to_string()];
    for event in ["GO", "DONE", "GO"] {
        handle.send(EventObject::bare(event)).unwrap();
        seen.push(handle.state().await.unwrap().leaf().unwrap().to_string());
    }
    assert_eq!(
        seen,
        vec!["#op.work.idle", "#op.work.busy", "#op.work.idle", "#op.work.busy"]
    );

    // Back to idle, then flip the flag through an assign action.
    handle.send(EventObject::bare("DONE")).unwrap();
    handle.send(EventObject::bare("LOCK")).unwrap();
    handle.send(EventObject::bare("GO")).unwrap();
    let snap = handle.state().await.unwrap();
    // The only matching transition's guard is false: unchanged.
    assert_eq!(snap.leaf(), Some("#op.work.idle"));
    assert_eq!(snap.context.get("canGo"), Some(&json!(false)));
}

// ─── S3: ping-pong across two instances ───────────────────────

fn player_chart(id: &str, peer: &str, limit: u32) -> String {
    format!(
        r#"{{
            "id": "{id}",
            "initial": "idle",
            "context": {{ "count": 0, "limit": {limit} }},
            "states": {{
                "idle": {{
                    "on": {{
                        "START": {{
                            "target": "play",
                            "actions": ["tally", {{ "type": "send", "event": "BALL", "to": "{peer}" }}]
                        }},
                        "BALL": {{
                            "target": "play",
                            "actions": ["tally", {{ "type": "send", "event": "BALL", "to": "{peer}" }}]
                        }}
                    }}
                }},
                "play": {{
                    "on": {{
                        "BALL": [
                            {{
                                "target": "finished",
                                "cond": "atLimit",
                                "actions": {{ "type": "send", "event": "FINISH", "to": "{peer}" }}
                            }},
                            {{
                                "target": "play",
                                "internal": true,
                                "actions": ["tally", {{ "type": "send", "event": "BALL", "to": "{peer}" }}]
                            }}
                        ],
                        "FINISH": "finished"
                    }}
                }},
                "finished": {{ "type": "final" }}
            }}
        }}"#
    )
}

fn player_ctx() -> MachineContext {
    let mut ctx = MachineContext::new();
    ctx.register_action("tally", |vars, _| {
        let n = vars.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
        vars.insert("count".into(), json!(n + 1));
        Ok(())
    })
    .unwrap();
    ctx.register_guard("atLimit", |vars, _| {
        let count = vars.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
        let limit = vars.get("limit").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(count >= limit)
    })
    .unwrap();
    ctx
}

#[tokio::test]
async fn s3_ping_pong_alternates_to_completion() {
    const N: u32 = 5;
    let engine = StatechartEngine::new();
    engine
        .register_machine_json(&player_chart("ping", "pong", N))
        .await
        .unwrap();
    engine
        .register_machine_json(&player_chart("pong", "ping", N))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.orchestrator().subscribe("*", tx).await;

    let ping = engine.spawn("ping", "ping", player_ctx(), None).await.unwrap();
    let pong = engine.spawn("pong", "pong", player_ctx(), None).await.unwrap();
    ping.start().unwrap();
    pong.start().unwrap();

    ping.send(EventObject::bare("START")).unwrap();

    // Both instances report done.
    let mut done = std::collections::HashSet::new();
    while done.len() < 2 {
        let n = await_notification(&mut rx, |n| matches!(n, Notification::Done { .. })).await;
        done.insert(n.instance().to_string());
    }

    let ping_snap = ping.state().await.unwrap();
    let pong_snap = pong.state().await.unwrap();
    assert_eq!(ping_snap.status, Status::Done);
    assert_eq!(pong_snap.status, Status::Done);
    assert!(!ping_snap.is_running);

    // Strict alternation: each side sent exactly N balls.
    assert_eq!(ping_snap.context.get("count"), Some(&json!(N)));
    assert_eq!(pong_snap.context.get("count"), Some(&json!(N)));
}

// ─── S4: parallel multi-target ────────────────────────────────

#[tokio::test]
async fn s4_multi_target_sync_moves_both_regions() {
    let program = compile(
        r#"{
            "id": "m",
            "initial": "p",
            "on": { "SYNC": { "target": ["a2", "b2"] } },
            "states": {
                "p": {
                    "type": "parallel",
                    "states": {
                        "A": {
                            "initial": "a1",
                            "states": {
                                "a1": { "exit": "trace_exit_a1" },
                                "a2": { "entry": "trace_enter_a2" }
                            }
                        },
                        "B": {
                            "initial": "b1",
                            "states": {
                                "b1": { "exit": "trace_exit_b1" },
                                "b2": { "entry": "trace_enter_b2" }
                            }
                        }
                    }
                }
            }
        }"#,
        Layout::NameKeyed,
    );
    let mut ctx = MachineContext::new();
    for tag in [
        "trace_exit_a1",
        "trace_exit_b1",
        "trace_enter_a2",
        "trace_enter_b2",
    ] {
        ctx.register_action(tag, move |vars, _| {
            let trail = vars.entry("trail".to_string()).or_insert_with(|| json!([]));
            trail.as_array_mut().unwrap().push(json!(tag));
            Ok(())
        })
        .unwrap();
    }
    let handle = spawn_instance("m-1", program, ctx, InterpOptions::default(), None, None);
    handle.start().unwrap();

    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaves(), vec!["#m.p.A.a1", "#m.p.B.b1"]);

    handle.send(EventObject::bare("SYNC")).unwrap();
    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaves(), vec!["#m.p.A.a2", "#m.p.B.b2"]);

    // One exit each, one entry each, exits before entries, regions in
    // declaration order.
    let trail: Vec<String> = snap.context["trail"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    let pos = |tag: &str| trail.iter().position(|t| t == tag).unwrap();
    assert_eq!(trail.iter().filter(|t| t.starts_with("trace_exit")).count(), 2);
    assert_eq!(trail.iter().filter(|t| t.starts_with("trace_enter")).count(), 2);
    assert!(pos("trace_exit_a1") < pos("trace_exit_b1"));
    assert!(pos("trace_exit_b1") < pos("trace_enter_a2"));
    assert!(pos("trace_enter_a2") < pos("trace_enter_b2"));
}

// ─── S5: delayed transition cancellation ──────────────────────

#[tokio::test(start_paused = true)]
async fn s5_abort_cancels_pending_after_timer() {
    let program = compile(
        r#"{
            "id": "m",
            "initial": "waiting",
            "states": {
                "waiting": {
                    "after": { "500": "timedOut" },
                    "on": { "ABORT": "idle" }
                },
                "timedOut": {},
                "idle": {}
            }
        }"#,
        Layout::NameKeyed,
    );
    let handle = spawn_instance(
        "m-1",
        program,
        MachineContext::new(),
        InterpOptions::default(),
        None,
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe("observer", tx).unwrap();
    handle.start().unwrap();
    handle.state().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.send(EventObject::bare("ABORT")).unwrap();
    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaf(), Some("#m.idle"));

    // Well past the original deadline.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaf(), Some("#m.idle"));

    // The timer was cancelled, never fired, and no observation ever
    // mentions the timedOut state.
    let mut saw_cancel = false;
    while let Ok(n) = rx.try_recv() {
        match n {
            Notification::TimerFired { .. } => panic!("cancelled timer fired"),
            Notification::TimerCancelled { .. } => saw_cancel = true,
            Notification::StateChanged { to, .. } => {
                assert!(to.iter().all(|path| !path.contains("timedOut")));
            }
            _ => {}
        }
    }
    assert!(saw_cancel);
}

/// `after[0]` arms a timer that fires on a later dequeue, never inside
/// the arming step.
#[test]
fn s5b_zero_delay_fires_on_next_step_not_synchronously() {
    let program = compile(
        r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": { "after": { "0": "b" } },
                "b": {}
            }
        }"#,
        Layout::NameKeyed,
    );
    let mut ctx = MachineContext::new();
    let mut interp = Interp::new(program, Arc::from("m-1"), InterpOptions::default());

    let report = interp.start(&mut ctx);
    // Still in `a` when the step that armed the timer completes.
    assert_eq!(interp.configuration(), vec!["#m.a"]);
    let (state, index, generation) = report
        .effects
        .iter()
        .find_map(|e| match e {
            statechart_lite_core::interp::Effect::ArmTimer {
                state,
                index,
                generation,
                delay_ms,
            } => {
                assert_eq!(*delay_ms, 0);
                Some((*state, *index, *generation))
            }
            _ => None,
        })
        .unwrap();

    interp.handle_timer(&mut ctx, state, index, generation);
    assert_eq!(interp.configuration(), vec!["#m.b"]);
}

// ─── S6: invoked service failure ──────────────────────────────

#[tokio::test]
async fn s6_service_failure_routes_to_on_error() {
    let program = compile(
        r#"{
            "id": "m",
            "initial": "fetching",
            "states": {
                "fetching": {
                    "invoke": { "src": "load", "onDone": "ok", "onError": "err" }
                },
                "ok": {},
                "err": {}
            }
        }"#,
        Layout::NameKeyed,
    );
    let mut ctx = MachineContext::new();
    ctx.register_service(
        "load",
        ServiceFn(|_input: Value| async move { anyhow::bail!("disk on fire") }),
    )
    .unwrap();

    let handle = spawn_instance("m-1", program, ctx, InterpOptions::default(), None, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe("observer", tx).unwrap();
    handle.start().unwrap();

    await_notification(&mut rx, |n| matches!(n, Notification::ServiceFailed { .. })).await;
    await_notification(&mut rx, |n| {
        matches!(n, Notification::StateChanged { to, .. } if to.iter().any(|p| p == "#m.err"))
    })
    .await;

    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaf(), Some("#m.err"));
    let message = snap.context["error_message"].as_str().unwrap();
    assert!(message.contains("disk on fire"), "{message}");
}

#[tokio::test]
async fn s6b_service_success_routes_to_on_done_with_payload() {
    let program = compile(
        r#"{
            "id": "m",
            "initial": "fetching",
            "states": {
                "fetching": {
                    "invoke": {
                        "src": "load",
                        "data": { "url": "s3://wafers" },
                        "onDone": { "target": "ok", "actions": "stash" }
                    }
                },
                "ok": {}
            }
        }"#,
        Layout::NameKeyed,
    );
    let mut ctx = MachineContext::new();
    ctx.register_service(
        "load",
        ServiceFn(|input: Value| async move {
            Ok(json!({ "fetched": input["url"], "rows": 3 }))
        }),
    )
    .unwrap();
    ctx.register_action("stash", |vars, event| {
        vars.insert("result".into(), event.payload.clone());
        Ok(())
    })
    .unwrap();

    let handle = spawn_instance("m-1", program, ctx, InterpOptions::default(), None, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe("observer", tx).unwrap();
    handle.start().unwrap();

    await_notification(&mut rx, |n| matches!(n, Notification::ServiceDone { .. })).await;
    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaf(), Some("#m.ok"));
    assert_eq!(
        snap.context["result"],
        json!({ "fetched": "s3://wafers", "rows": 3 })
    );
}

// ─── Layout equivalence ───────────────────────────────────────

/// The name-keyed and dense layouts produce observationally equivalent
/// step sequences on the same event trace.
#[tokio::test]
async fn layouts_are_observationally_equivalent() {
    let chart = r#"{
        "id": "m",
        "initial": "p",
        "context": { "hot": false },
        "on": { "SYNC": { "target": ["a2", "b2"] } },
        "states": {
            "p": {
                "type": "parallel",
                "states": {
                    "A": {
                        "initial": "a1",
                        "states": {
                            "a1": { "on": { "STEP": { "target": "a2", "cond": "isHot" } } },
                            "a2": { "on": { "BACK": "a1" } }
                        }
                    },
                    "B": {
                        "initial": "b1",
                        "states": {
                            "b1": {
                                "on": {
                                    "HEAT": { "actions": { "type": "assign", "values": { "hot": true } } },
                                    "STEP": "b2"
                                }
                            },
                            "b2": {}
                        }
                    }
                }
            }
        }
    }"#;
    let trace = ["HEAT", "STEP", "BACK", "SYNC", "NOISE"];

    let mut runs: Vec<Vec<String>> = Vec::new();
    for layout in [Layout::NameKeyed, Layout::Dense] {
        let program = compile(chart, layout);
        let mut ctx = MachineContext::new();
        ctx.register_guard("isHot", |vars, _| {
            Ok(vars.get("hot").and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .unwrap();
        let handle = spawn_instance(
            "m-1",
            program,
            ctx,
            InterpOptions {
                layout,
                ..InterpOptions::default()
            },
            None,
            None,
        );
        handle.start().unwrap();

        let mut observed = Vec::new();
        for event in trace {
            handle.send(EventObject::bare(event)).unwrap();
            let snap = handle.state().await.unwrap();
            observed.push(format!(
                "{}|{}",
                snap.leaves().join(","),
                serde_json::to_string(&snap.context).unwrap()
            ));
        }
        runs.push(observed);
    }
    assert_eq!(runs[0], runs[1]);
}

// ─── Parallel region completion ───────────────────────────────

#[tokio::test]
async fn parallel_completion_raises_done_event() {
    let program = compile(
        r#"{
            "id": "m",
            "initial": "p",
            "on": { "done.state.m.p": "wrapped" },
            "states": {
                "p": {
                    "type": "parallel",
                    "states": {
                        "A": {
                            "initial": "a1",
                            "states": { "a1": { "on": { "FIN_A": "fa" } }, "fa": { "type": "final" } }
                        },
                        "B": {
                            "initial": "b1",
                            "states": { "b1": { "on": { "FIN_B": "fb" } }, "fb": { "type": "final" } }
                        }
                    }
                },
                "wrapped": {}
            }
        }"#,
        Layout::NameKeyed,
    );
    let handle = spawn_instance(
        "m-1",
        program,
        MachineContext::new(),
        InterpOptions::default(),
        None,
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe("observer", tx).unwrap();
    handle.start().unwrap();

    handle.send(EventObject::bare("FIN_A")).unwrap();
    await_notification(&mut rx, |n| {
        matches!(n, Notification::RegionCompleted { region, .. } if region == "#m.p.A")
    })
    .await;
    // One region done is not enough.
    let snap = handle.state().await.unwrap();
    assert!(snap.leaves().iter().any(|p| p.starts_with("#m.p.B")));

    handle.send(EventObject::bare("FIN_B")).unwrap();
    await_notification(&mut rx, |n| {
        matches!(n, Notification::StateChanged { to, .. } if to.iter().any(|p| p == "#m.wrapped"))
    })
    .await;
    let snap = handle.state().await.unwrap();
    assert_eq!(snap.leaf(), Some("#m.wrapped"));
}
