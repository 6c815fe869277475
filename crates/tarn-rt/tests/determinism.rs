// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Whole-program determinism: repeated runs must produce byte-identical
//! traces, and small programs must produce exactly the documented order.

use tarn_rt::{select, Case, Scheduler};
use tarn_trace::{check_repeated, Trace};

/// A program mixing spawning, buffered and rendezvous channels, sleeps,
/// select and close — every feature that could perturb ordering.
fn mixed_program(trace: &Trace) {
    let sched = Scheduler::new();
    let data = sched.channel::<u32>(2);

    let tx = data.clone();
    let t = trace.clone();
    let s = sched.clone();
    sched.spawn(async move {
        for n in 0..8u32 {
            tx.send(n).await.unwrap();
            t.record(format!("sent {n}"));
            if n % 3 == 0 {
                s.sleep(5).await;
            }
        }
        tx.close();
    });

    let rx = data.clone();
    let t = trace.clone();
    sched.spawn(async move {
        rx.for_each(|v| t.record(format!("got {v}"))).await;
        t.record("drained");
    });

    let t = trace.clone();
    let s = sched.clone();
    sched.spawn(async move {
        let quiet = s.channel::<()>(0);
        let timeout = s.timer(3);
        let picked = select(vec![Case::recv(&quiet), Case::recv(&timeout)])
            .await
            .unwrap();
        t.record(format!("timed out via case {}", picked.index));
    });

    sched.run();
    trace.record(format!("final time {}", sched.now()));
}

#[test]
fn mixed_program_hashes_identically_across_100_runs() {
    let hash = check_repeated(100, mixed_program).unwrap();
    assert!(hash.starts_with("sha256:"));
}

#[test]
fn mixed_program_records_a_nonempty_trace() {
    let trace = Trace::new();
    mixed_program(&trace);
    // 8 sends + 8 receives + drained + timeout + final time.
    assert_eq!(trace.len(), 19);
}

#[test]
fn rendezvous_program_produces_exactly_the_documented_order() {
    let run = |trace: &Trace| {
        let sched = Scheduler::new();
        let ch = sched.channel::<&str>(0);
        let tx = ch.clone();
        let t = trace.clone();
        sched.spawn(async move {
            t.record("a-start");
            tx.send("x").await.unwrap();
            t.record("a-done");
        });
        let rx = ch.clone();
        let t = trace.clone();
        sched.spawn(async move {
            t.record("b-start");
            let got = rx.recv().await.unwrap();
            t.record(format!("b-got {got}"));
        });
        sched.run();
    };
    let trace = Trace::new();
    run(&trace);
    assert_eq!(trace.labels(), vec!["a-start", "b-start", "b-got x", "a-done"]);
    check_repeated(100, run).unwrap();
}

#[test]
fn select_commits_to_the_same_case_on_every_run() {
    let run = |trace: &Trace| {
        let sched = Scheduler::new();
        let a = sched.channel::<u32>(1);
        let b = sched.channel::<u32>(1);
        let s = sched.clone();
        let (sa, sb) = (a.clone(), b.clone());
        sched.spawn(async move {
            s.sleep(2).await;
            sa.send(10).await.unwrap();
            sb.send(20).await.unwrap();
        });
        let t = trace.clone();
        let (ra, rb) = (a.clone(), b.clone());
        sched.spawn(async move {
            let picked = select(vec![Case::recv(&ra), Case::recv(&rb)]).await.unwrap();
            t.record(format!("case {} value {:?}", picked.index, picked.value));
        });
        sched.run();
    };
    let trace = Trace::new();
    run(&trace);
    assert_eq!(trace.labels(), vec!["case 0 value Some(10)"]);
    check_repeated(100, run).unwrap();
}
