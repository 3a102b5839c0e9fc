mod common;

use common::{Event, Recorder, registry, yaml_suite};
use suiterun::result::{Phase, StatusDetail};
use suiterun::{Criteria, Runner, TestStatus};
use tempfile::TempDir;

const SUITE: &str = r#"
tests:
  - name: passes
    pre_run: [{type: scripted, outcome: pass}]
    run: [{type: scripted, outcome: pass}]
    post_run: [{type: scripted, outcome: pass}]

  - name: pre_fails
    pre_run:
      - {type: scripted, name: setup, outcome: fail}
      - {type: scripted, name: never, outcome: pass}
    run: [{type: scripted, outcome: pass}]
    post_run: [{type: scripted, outcome: pass}]

  - name: fails
    run: [{type: scripted, outcome: fail}]

  - name: expected_fail
    expected_failure: true
    run: [{type: scripted, outcome: fail}]

  - name: unexpected_pass
    expected_failure: true
    run: [{type: scripted, outcome: pass}]

  - name: incomplete
    run:
      - {type: scripted, outcome: incomplete}
      - {type: scripted, outcome: pass}

  - name: cleanup_fails
    run: [{type: scripted, outcome: pass}]
    post_run:
      - {type: scripted, name: first, outcome: fail}
      - {type: scripted, name: second, outcome: incomplete}

  - name: no_command
    pre_run: [{type: scripted, outcome: pass}]
"#;

#[test]
fn test_phase_outcomes() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(&dir, SUITE);
    let result = Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .with_threads(3)
        .run(&Criteria::all())
        .unwrap();
    let perm = &result.iterations[0].permutations[0];
    let get = |name: &str| perm.get(name).unwrap();

    let r = get("passes");
    assert_eq!((r.status, r.detail), (TestStatus::Passed, None));
    assert!(r.notices.is_empty());

    let r = get("pre_fails");
    assert_eq!((r.status, r.detail), (TestStatus::NotRun, Some(StatusDetail::PreTestErr)));
    assert_eq!(r.pre_run.steps.len(), 1);
    assert!(!r.run.executed);
    assert!(r.post_run.executed);

    let r = get("fails");
    assert_eq!((r.status, r.detail), (TestStatus::Failed, None));

    let r = get("expected_fail");
    assert_eq!((r.status, r.detail), (TestStatus::Passed, Some(StatusDetail::ExpectedFail)));

    let r = get("unexpected_pass");
    assert_eq!((r.status, r.detail), (TestStatus::Failed, Some(StatusDetail::UnexpectedPass)));

    let r = get("incomplete");
    assert_eq!((r.status, r.detail), (TestStatus::NotRun, Some(StatusDetail::TestErr)));
    assert_eq!(r.run.steps.len(), 1);

    let r = get("cleanup_fails");
    assert_eq!(r.status, TestStatus::Passed);
    assert_eq!(r.post_run.steps.len(), 2);
    assert_eq!(r.notices.len(), 1);
    assert!(r.notices[0].contains("'first'"));

    let r = get("no_command");
    assert_eq!(r.status, TestStatus::NotRun);
    assert_eq!(r.reason.as_deref(), Some("no command"));

    assert_eq!(result.exit_code(), 1);
}

#[test]
fn test_phases_always_paired() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(&dir, SUITE);
    let recorder = Recorder::default();
    Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .with_threads(2)
        .with_reporter(Box::new(recorder.clone()))
        .run(&Criteria::all())
        .unwrap();

    let events = recorder.events();
    for test in ["passes", "pre_fails", "fails", "incomplete", "cleanup_fails"] {
        let phases: Vec<&Event> = events
            .iter()
            .filter(|e| match e {
                Event::PhaseStart(t, ..) | Event::PhaseEnd(t, _) => t == test,
                _ => false,
            })
            .collect();
        assert_eq!(
            phases,
            [
                &Event::PhaseStart(test.to_string(), Phase::PreRun, phases_len(test, Phase::PreRun)),
                &Event::PhaseEnd(test.to_string(), Phase::PreRun),
                &Event::PhaseStart(test.to_string(), Phase::Run, phases_len(test, Phase::Run)),
                &Event::PhaseEnd(test.to_string(), Phase::Run),
                &Event::PhaseStart(test.to_string(), Phase::PostRun, phases_len(test, Phase::PostRun)),
                &Event::PhaseEnd(test.to_string(), Phase::PostRun),
            ],
            "{test}"
        );
    }

    // Short-circuited tests never enter a phase.
    assert_eq!(
        recorder.count(|e| matches!(e, Event::PhaseStart(t, ..) if t == "no_command")),
        0
    );
}

fn phases_len(test: &str, phase: Phase) -> usize {
    match (test, phase) {
        ("passes", _) => 1,
        ("pre_fails", Phase::PreRun) => 2,
        ("pre_fails", _) => 1,
        ("incomplete", Phase::Run) => 2,
        ("cleanup_fails", Phase::PostRun) => 2,
        ("cleanup_fails", Phase::Run) => 1,
        ("fails", Phase::Run) => 1,
        (_, Phase::Run) => 1,
        _ => 0,
    }
}

#[test]
fn test_step_events_carry_indices() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(
        &dir,
        r#"
tests:
  - name: t
    run:
      - {type: scripted}
      - {type: scripted}
      - {type: scripted}
"#,
    );
    let recorder = Recorder::default();
    Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .with_reporter(Box::new(recorder.clone()))
        .run(&Criteria::all())
        .unwrap();

    let ends: Vec<usize> = recorder
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::StepEnd(_, Phase::Run, index) => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(ends, [0, 1, 2]);
}

#[test]
fn test_step_error_aborts_run() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(
        &dir,
        r#"
tests:
  - name: broken
    run: [{type: scripted, outcome: explode}]
    post_run: [{type: scripted}]
"#,
    );
    let err = Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .run(&Criteria::all())
        .unwrap_err();
    assert!(err.to_string().contains("scripted error: explode"));

    let r = err.result.iterations[0].permutations[0].get("broken").unwrap();
    assert_eq!((r.status, r.detail), (TestStatus::NotRun, Some(StatusDetail::TestErr)));
    assert!(!r.post_run.executed);
}

#[test]
fn test_variables_reach_steps() {
    let dir = TempDir::new().unwrap();
    let suite = yaml_suite(
        &dir,
        r#"
variables:
  verdict: fail
tests:
  - name: uses_suite
    run: [{type: scripted, outcome: "{verdict}"}]
  - name: overrides
    var_map: {verdict: pass}
    run: [{type: scripted, outcome: "{verdict}"}]
  - name: undefined
    run: [{type: scripted, outcome: "{nope}"}]
"#,
    );
    let result = Runner::new(&suite, registry())
        .with_output_dir(dir.path().join("out"))
        .run(&Criteria::all())
        .unwrap();
    let perm = &result.iterations[0].permutations[0];
    assert_eq!(perm.get("uses_suite").unwrap().status, TestStatus::Failed);
    assert_eq!(perm.get("overrides").unwrap().status, TestStatus::Passed);
    let r = perm.get("undefined").unwrap();
    assert_eq!((r.status, r.detail), (TestStatus::NotRun, Some(StatusDetail::InitErr)));
}
