mod common;

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use common::{Event, Recorder, registry, yaml_suite};
use suiterun::result::StatusDetail;
use suiterun::{Criteria, Runner, TestStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SUITE: &str = r#"
matrix:
  flavor: [plain, fancy]
tests:
  - name: base
    abstract: true
    run: [{type: scripted}]
  - name: one
    base: base
  - name: two
    base: base
    pre_run: [{type: sleep, duration: 0.01}]
  - name: three
    base: base
    post_run: [{type: scripted, outcome: fail}]
  - name: four
    skip: true
  - name: five
    run: [{type: scripted, outcome: fail}]
"#;

#[test]
fn test_notification_counts() {
    for threads in [1, 2, 4] {
        for iterations in [1, 2, 3] {
            let dir = TempDir::new().unwrap();
            let suite = yaml_suite(&dir, SUITE);
            let recorder = Recorder::default();
            let result = Runner::new(&suite, registry())
                .with_output_dir(dir.path().join("out"))
                .with_threads(threads)
                .with_iterations(iterations)
                .with_reporter(Box::new(recorder.clone()))
                .run(&Criteria::all())
                .unwrap();

            let executions = iterations * 2 * 5;
            let label = format!("threads={threads} iterations={iterations}");
            assert_eq!(result.total(), executions, "{label}");
            assert_eq!(recorder.count(|e| matches!(e, Event::RunStart(_))), 1, "{label}");
            assert_eq!(recorder.count(|e| matches!(e, Event::RunEnd)), 1, "{label}");
            assert_eq!(
                recorder.count(|e| matches!(e, Event::IterationStart(_))),
                iterations,
                "{label}"
            );
            assert_eq!(
                recorder.count(|e| matches!(e, Event::PermutationEnd(..))),
                iterations * 2,
                "{label}"
            );
            assert_eq!(recorder.count(|e| matches!(e, Event::TestStart(..))), executions, "{label}");
            assert_eq!(recorder.count(|e| matches!(e, Event::TestEnd(..))), executions, "{label}");

            let phase_starts = recorder.count(|e| matches!(e, Event::PhaseStart(..)));
            let phase_ends = recorder.count(|e| matches!(e, Event::PhaseEnd(..)));
            // Every test but the skipped one enters all three phases.
            assert_eq!(phase_starts, iterations * 2 * 4 * 3, "{label}");
            assert_eq!(phase_starts, phase_ends, "{label}");
            assert_eq!(
                recorder.count(|e| matches!(e, Event::StepStart(..))),
                recorder.count(|e| matches!(e, Event::StepEnd(..))),
                "{label}"
            );

            assert_eq!(result.passed(), iterations * 2 * 3, "{label}");
            assert_eq!(result.failed(), iterations * 2, "{label}");
            assert_eq!(result.skipped(), iterations * 2, "{label}");
        }
    }
}

#[test]
fn test_events_nest_per_test() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(&dir, SUITE);
    let recorder = Recorder::default();
    Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .with_threads(4)
        .with_iterations(2)
        .with_reporter(Box::new(recorder.clone()))
        .run(&Criteria::all())
        .unwrap();

    // A test's events are emitted by one worker, so per (test, iteration,
    // permutation) the start always precedes the end.
    let mut open: HashMap<(String, usize, usize), usize> = HashMap::new();
    for event in recorder.events() {
        match event {
            Event::TestStart(name, i, p) => *open.entry((name, i, p)).or_default() += 1,
            Event::TestEnd(name, i, p) => {
                let count = open.get_mut(&(name.clone(), i, p)).unwrap();
                assert_eq!(*count, 1, "{name} ended without starting");
                *count -= 1;
            }
            _ => {}
        }
    }
    assert!(open.values().all(|c| *c == 0));

    let events = recorder.events();
    assert!(matches!(events.first(), Some(Event::RunStart(_))));
    assert_eq!(events.last(), Some(&Event::RunEnd));
}

#[test]
fn test_threads_run_in_parallel() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(
        &dir,
        r#"
tests:
  - {name: a, run: [{type: sleep, duration: 0.4}]}
  - {name: b, run: [{type: sleep, duration: 0.4}]}
  - {name: c, run: [{type: sleep, duration: 0.4}]}
  - {name: d, run: [{type: sleep, duration: 0.4}]}
"#,
    );
    let started = Instant::now();
    let result = Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .with_threads(4)
        .run(&Criteria::all())
        .unwrap();
    assert_eq!(result.passed(), 4);
    assert!(started.elapsed() < Duration::from_millis(1200));
}

#[test]
fn test_cancellation_interrupts_run() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(
        &dir,
        r#"
tests:
  - {name: long, run: [{type: sleep, duration: 30}]}
  - {name: queued, run: [{type: sleep, duration: 30}]}
"#,
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        canceller.cancel();
    });

    let started = Instant::now();
    let result = Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .with_threads(1)
        .with_iterations(5)
        .with_cancellation_token(token)
        .run(&Criteria::all())
        .unwrap();
    handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.interrupted);
    assert_eq!(result.exit_code(), 130);
    assert_eq!(result.iterations.len(), 1);

    let r = result.iterations[0].permutations[0].get("long").unwrap();
    assert_eq!((r.status, r.detail), (TestStatus::NotRun, Some(StatusDetail::TestErr)));
    assert!(result.iterations[0].permutations[0].get("queued").is_none());
}
