//! Control entry points racing an in-flight run: questions, pause/resume,
//! stop, and the context-budget handoff.

use devloop::core::types::{CallPurpose, FailureResponse, Phase, TaskStatus, TokenUsage};
use devloop::engine::{EngineError, STOPPED_BY_USER};
use devloop::events::EngineEvent;
use devloop::io::agent::AgentError;
use devloop::test_support::{Harness, plan_markdown, question};

#[tokio::test]
async fn interview_question_round_trip() {
    let h = Harness::new(Harness::fast_config());
    h.agent
        .ask(CallPurpose::Interview, vec![question("Which database?")]);

    h.engine.start().expect("start");
    assert_eq!(h.engine.settled().await, Phase::WaitingForUser);
    let ctx = h.engine.snapshot();
    assert_eq!(
        ctx.pending_question().map(|q| q.question.as_str()),
        Some("Which database?")
    );
    assert_eq!(ctx.question_origin, Some(Phase::ConductingInterview));
    assert_eq!(h.agent.interrupt_count(), 1);

    h.engine.answer_question("Postgres").expect("answer");
    assert_eq!(h.engine.settled().await, Phase::Completed);

    let ctx = h.engine.snapshot();
    let interview = ctx.interview.as_ref().expect("interview");
    assert!(interview.is_complete());
    assert_eq!(interview.exchanges().len(), 1);
    assert_eq!(interview.exchanges()[0].answer, "Postgres");

    let interview_calls: Vec<_> = h
        .agent
        .calls()
        .into_iter()
        .filter(|call| call.purpose == CallPurpose::Interview)
        .collect();
    assert_eq!(interview_calls.len(), 2);
    assert!(interview_calls[1].prompt.contains("Postgres"));
    assert_eq!(interview_calls[1].session_id.as_deref(), Some("session-1"));
}

#[tokio::test]
async fn queued_questions_resume_after_the_last_answer() {
    let h = Harness::new(Harness::fast_config());
    h.agent.ask(
        CallPurpose::Implementation,
        vec![question("Keep the old API?"), question("Add a flag?")],
    );

    h.engine.start().expect("start");
    assert_eq!(h.engine.settled().await, Phase::WaitingForUser);

    h.engine.answer_question("yes").expect("first answer");
    assert_eq!(h.engine.phase(), Phase::WaitingForUser);
    assert_eq!(
        h.engine
            .snapshot()
            .pending_question()
            .map(|q| q.question.clone()),
        Some("Add a flag?".to_string())
    );

    h.engine.answer_question("no").expect("second answer");
    assert_eq!(h.engine.settled().await, Phase::Completed);

    let retried = h
        .agent
        .calls()
        .into_iter()
        .filter(|call| call.purpose == CallPurpose::Implementation && call.task_number == Some(1))
        .nth(1)
        .expect("implementation re-entered");
    assert!(retried.prompt.contains("Q: Keep the old API?\nA: yes"));
    assert!(retried.prompt.contains("Q: Add a flag?\nA: no"));
}

#[tokio::test]
async fn answer_without_pending_question_is_a_no_op() {
    let h = Harness::new(Harness::fast_config());
    h.agent.hold(CallPurpose::Implementation);

    h.engine.start().expect("start");
    h.agent.wait_until_held().await;

    let before = h.engine.snapshot();
    assert!(before.session_id.is_some());
    h.engine.answer_question("unsolicited").expect("no-op");
    let after = h.engine.snapshot();
    assert_eq!(before.logs.len(), after.logs.len());
    assert_eq!(after.phase, Phase::ExecutingTask);

    h.agent.release();
    assert_eq!(h.engine.settled().await, Phase::Completed);
}

#[tokio::test]
async fn answer_requires_a_session() {
    let h = Harness::new(Harness::fast_config());
    assert!(matches!(
        h.engine.answer_question("hello"),
        Err(EngineError::NoSessionId)
    ));
}

#[tokio::test]
async fn pause_waits_for_the_call_then_resume_finishes() {
    let h = Harness::new(Harness::fast_config());
    h.agent.hold(CallPurpose::Implementation);

    h.engine.start().expect("start");
    h.agent.wait_until_held().await;

    assert!(h.engine.pause());
    assert_eq!(h.engine.phase(), Phase::Paused);
    assert!(!h.engine.pause());
    // The in-flight call is not cancelled by a pause.
    assert_eq!(h.agent.interrupt_count(), 0);

    h.agent.release();
    assert_eq!(h.engine.settled().await, Phase::Paused);
    assert_eq!(
        h.engine.snapshot().paused_from,
        Some(Phase::CommittingImplementation)
    );

    h.engine.resume().expect("resume");
    assert_ne!(h.engine.phase(), Phase::Paused);
    assert_ne!(h.engine.phase(), Phase::Idle);
    assert_eq!(h.engine.settled().await, Phase::Completed);
    assert!(matches!(h.engine.resume(), Err(EngineError::NotPaused)));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = Harness::new(Harness::fast_config());
    h.agent.hold(CallPurpose::Implementation);

    h.engine.start().expect("start");
    h.agent.wait_until_held().await;

    assert!(h.engine.stop());
    let once = h.engine.snapshot();
    assert!(!h.engine.stop());
    let twice = h.engine.snapshot();

    assert_eq!(h.engine.settled().await, Phase::Failed);
    assert_eq!(once.phase, Phase::Failed);
    assert_eq!(once.errors.len(), twice.errors.len());
    assert_eq!(once.logs.len(), twice.logs.len());
    let stops = twice
        .errors
        .iter()
        .filter(|entry| entry.message == STOPPED_BY_USER)
        .count();
    assert_eq!(stops, 1);
    // The cancelled call never reaches the commit step.
    assert!(h.version_control.messages().is_empty());
}

#[tokio::test]
async fn stop_while_waiting_clears_pending_question() {
    let h = Harness::new(Harness::fast_config());
    h.agent
        .ask(CallPurpose::Interview, vec![question("Scope?")]);
    h.engine.start().expect("start");
    assert_eq!(h.engine.settled().await, Phase::WaitingForUser);

    assert!(h.engine.stop());
    let ctx = h.engine.snapshot();
    assert_eq!(ctx.phase, Phase::Failed);
    assert!(ctx.pending_question().is_none());
}

#[tokio::test]
async fn low_budget_hands_off_and_reseeds_the_task() {
    let mut config = Harness::fast_config();
    config.budget.window_tokens = 100_000;
    config.budget.low_budget_percent = 20.0;
    let h = Harness::new(config);
    h.agent.report_usage(
        CallPurpose::Implementation,
        TokenUsage {
            input_tokens: 90_000,
            ..TokenUsage::default()
        },
    );
    h.agent
        .respond(CallPurpose::HandoffSummary, "Parser done; wire up the CLI next");

    h.engine.start().expect("start");
    assert_eq!(h.engine.settled().await, Phase::Completed);

    let calls = h.agent.calls();
    let purposes: Vec<CallPurpose> = calls.iter().map(|call| call.purpose).collect();
    let first_impl = purposes
        .iter()
        .position(|p| *p == CallPurpose::Implementation)
        .expect("implementation");
    assert_eq!(
        &purposes[first_impl..first_impl + 4],
        &[
            CallPurpose::Implementation,
            CallPurpose::HandoffCommit,
            CallPurpose::HandoffSummary,
            CallPurpose::Implementation,
        ]
    );
    let reseeded = &calls[first_impl + 3];
    assert!(reseeded.session_id.is_none());
    assert!(reseeded.prompt.contains("Parser done; wire up the CLI next"));
    assert_eq!(reseeded.task_number, Some(1));

    // The next task starts without the previous task's summary.
    let second_task = calls
        .iter()
        .find(|call| call.purpose == CallPurpose::Implementation && call.task_number == Some(2))
        .expect("second task");
    assert!(!second_task.prompt.contains("Parser done"));

    let ctx = h.engine.snapshot();
    assert_eq!(
        ctx.plan.expect("plan").tasks[0].status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn events_report_phase_changes_and_settling() {
    let h = Harness::new(Harness::fast_config());
    let mut events = h.engine.subscribe();

    h.engine.start().expect("start");
    assert_eq!(h.engine.settled().await, Phase::Completed);

    let mut phases = Vec::new();
    let mut settled = None;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::PhaseChanged { to, .. } => phases.push(to),
            EngineEvent::Settled { phase } => settled = Some(phase),
            _ => {}
        }
    }
    assert_eq!(phases.first(), Some(&Phase::ConductingInterview));
    assert_eq!(phases.last(), Some(&Phase::Completed));
    assert!(phases.contains(&Phase::WritingTests));
    assert_eq!(settled, Some(Phase::Completed));
}

#[tokio::test]
async fn rejected_reload_leaves_the_live_run_alone() {
    let h = Harness::new(Harness::fast_config());
    std::fs::write(h.dir.path().join("PLAN.md"), plan_markdown(2)).expect("write plan");
    h.agent.hold(CallPurpose::Implementation);

    h.engine.start().expect("start");
    h.agent.wait_until_held().await;
    let before = h.engine.snapshot();

    assert!(matches!(
        h.engine.load_existing_plan(None),
        Err(EngineError::AlreadyRunning(Phase::ExecutingTask))
    ));
    assert!(matches!(
        h.engine.start_with_existing_plan(),
        Err(EngineError::AlreadyRunning(_))
    ));
    assert!(matches!(
        h.engine.set_feature_description("Something else"),
        Err(EngineError::AlreadyRunning(_))
    ));
    assert!(matches!(
        h.engine.set_target_path(None),
        Err(EngineError::AlreadyRunning(_))
    ));

    let during = h.engine.snapshot();
    assert_eq!(during.current_task_index, before.current_task_index);
    assert_eq!(during.feature_description, "Add a widget");
    assert_eq!(during.target_path, before.target_path);

    h.agent.release();
    assert_eq!(h.engine.settled().await, Phase::Completed);
    let ctx = h.engine.snapshot();
    assert!(ctx.errors.is_empty());
    assert_eq!(
        ctx.plan.expect("plan").tasks[1].status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn failure_decision_while_paused_waits_for_resume() {
    let h = Harness::new(Harness::fast_config());
    h.agent.hold(CallPurpose::Implementation);
    h.agent
        .fail_task(CallPurpose::Implementation, 1, AgentError::NoResult, Some(1));

    h.engine.start().expect("start");
    h.agent.wait_until_held().await;
    assert!(h.engine.pause());
    h.agent.release();
    assert_eq!(h.engine.settled().await, Phase::Paused);

    let ctx = h.engine.snapshot();
    assert!(ctx.pending_task_failure.is_some());
    assert_eq!(ctx.paused_from, Some(Phase::WaitingForUser));

    h.engine
        .handle_task_failure_response(FailureResponse::Skip)
        .expect("skip");
    let ctx = h.engine.snapshot();
    assert_eq!(ctx.phase, Phase::Paused);
    assert_eq!(ctx.paused_from, Some(Phase::ExecutingTask));
    assert!(!h.engine.is_loop_active());
    assert_eq!(h.agent.calls_for(CallPurpose::Implementation), 1);

    h.engine.resume().expect("resume");
    assert_eq!(h.engine.settled().await, Phase::Completed);
    let statuses: Vec<TaskStatus> = h
        .engine
        .snapshot()
        .plan
        .expect("plan")
        .tasks
        .iter()
        .map(|task| task.status)
        .collect();
    assert_eq!(statuses, vec![TaskStatus::Skipped, TaskStatus::Completed]);
}

#[tokio::test]
async fn manual_retry_starts_a_fresh_session() {
    let h = Harness::new(Harness::fast_config());
    h.agent
        .fail_task(CallPurpose::ReviewAnalysis, 1, AgentError::NoResult, Some(1));

    h.engine.start().expect("start");
    assert_eq!(h.engine.settled().await, Phase::WaitingForUser);
    assert!(h.engine.snapshot().session_id.is_some());

    h.engine
        .handle_task_failure_response(FailureResponse::Retry)
        .expect("retry");
    assert_eq!(h.engine.settled().await, Phase::Completed);

    let retried = h
        .agent
        .calls()
        .into_iter()
        .filter(|call| call.purpose == CallPurpose::Implementation && call.task_number == Some(1))
        .nth(1)
        .expect("task re-run");
    assert!(retried.session_id.is_none());
    assert!(retried.prompt.contains("Code review failed"));
}
