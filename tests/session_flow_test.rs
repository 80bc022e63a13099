//! 会话流程集成测试

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use winpilot::actuator::DryRunActuator;
use winpilot::agent::{Collaborators, LlmEvaluator};
use winpilot::config::AppConfig;
use winpilot::core::{
    AgentRef, ControlReply, RoundOutcome, SessionControl, SessionError, SessionManager,
    SessionStatus, SnapshotStore, StateReply,
};
use winpilot::experience::JsonExperienceStore;
use winpilot::interaction::{Confirmation, ScriptedInput};
use winpilot::llm::{Decision, MockLlmClient, ScriptedPrompter};
use winpilot::observability::{read_jsonl, EVALUATION_LOG};

fn test_config(log_root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.app.log_root = log_root.to_path_buf();
    config.session.ask_experience = false;
    config
}

fn notepad() -> Arc<DryRunActuator> {
    Arc::new(DryRunActuator::new(&["Untitled - Notepad".to_string()]))
}

fn switch_to_notepad() -> Decision {
    Decision::new("SWITCH").with_target("Notepad")
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_close_notepad_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let actuator = notepad();
    let coordinator = Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()]));
    let delegate = Arc::new(ScriptedPrompter::new(vec![
        Decision::new("CONTINUE").with_action("close_window", serde_json::json!({})),
        Decision::new("FINISH"),
    ]));
    let collab = Collaborators::new(coordinator.clone(), delegate.clone(), actuator.clone())
        .with_input(Arc::new(ScriptedInput::new(["close Notepad"])));

    let manager = SessionManager::new(test_config(dir.path()), collab);
    let (handles, id) = manager.create("close_notepad", "normal", None).unwrap();
    assert_eq!(handles.len(), 1);

    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.steps, 3);
    assert_eq!(actuator.executed().len(), 1);
    assert_eq!(actuator.executed()[0].function, "close_window");
    assert_eq!(delegate.requests(), vec!["close Notepad", "close Notepad"]);
    // 窗口已关闭：不再截取最终快照
    assert!(actuator.snapshots().is_empty());
    assert_eq!(manager.status(&id).unwrap(), SessionStatus::Completed);
    assert_eq!(manager.get_state(&id), StateReply::NoSessionRunning);

    let response_log = dir.path().join("close_notepad").join("response.log");
    let entries = winpilot::observability::read_jsonl(response_log).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["Agent"], "Coordinator");
    assert_eq!(entries[2]["Status"], "FINISH");
}

#[tokio::test]
async fn test_max_step_stops_after_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.max_step = 3;
    let coordinator = Arc::new(ScriptedPrompter::new(vec![Decision::new("CONTINUE"); 10]));
    let collab = Collaborators::new(
        coordinator.clone(),
        Arc::new(ScriptedPrompter::new(vec![])),
        notepad(),
    )
    .with_input(Arc::new(ScriptedInput::new(["keep going", "and again"])));

    let manager = SessionManager::new(config, collab);
    let (_, id) = manager.create("budget", "normal", None).unwrap();
    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    assert_eq!(coordinator.calls(), 3);
    assert_eq!(outcome.steps, 3);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.status, SessionStatus::MaxStepReached);
}

#[tokio::test]
async fn test_rejected_actions_retry_within_step_budget() {
    let dir = tempfile::tempdir().unwrap();
    let actuator = Arc::new(
        DryRunActuator::new(&["Untitled - Notepad".to_string()]).reject_function("click_input"),
    );
    let click = Decision::new("CONTINUE").with_action("click_input", serde_json::json!({}));
    let delegate = Arc::new(ScriptedPrompter::new(vec![
        click.clone(),
        click.clone(),
        click.clone(),
        click,
        Decision::new("CONTINUE").with_action("type_keys", serde_json::json!({"text": "hello"})),
        Decision::new("FINISH"),
    ]));
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()])),
        delegate.clone(),
        actuator.clone(),
    )
    .with_input(Arc::new(ScriptedInput::new(["type hello"])));

    let manager = SessionManager::new(test_config(dir.path()), collab);
    let (_, id) = manager.create("rejected", "normal", None).unwrap();
    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    // 每次被拒绝的动作都已计步，只受 max_step 约束
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(delegate.calls(), 6);
    assert_eq!(outcome.steps, 7);
    let executed = actuator.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].function, "type_keys");
}

#[tokio::test]
async fn test_unlock_confirmation_releases_selection() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.confirm_app_selection = true;
    let delegate = Arc::new(ScriptedPrompter::new(vec![Decision::new("FINISH")]));
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()])),
        delegate.clone(),
        notepad(),
    )
    .with_input(Arc::new(ScriptedInput::new(["look at Notepad"])));

    let manager = SessionManager::new(config, collab);
    assert!(manager.confirmation_locked());
    let (handles, id) = manager.create("unlock", "normal", None).unwrap();
    let control = handles[0].control.clone();
    let worker = manager.start(&id).await.unwrap();

    wait_until("selection gate", || control.status() == SessionStatus::Confirmation).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(delegate.calls(), 0);
    assert!(!worker.is_finished());

    manager.unlock_confirmation(&id).unwrap();
    let results = tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("unlock must release the coordinator")
        .unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(delegate.calls(), 1);
}

#[tokio::test]
async fn test_round_and_session_evaluation_logged() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.eva_round = true;
    config.session.eva_session = true;
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        r#"{"complete": "yes", "reason": "round done"}"#.to_string(),
        r#"{"complete": "no", "reason": "session incomplete", "sub_scores": {"closed": "no"}}"#
            .to_string(),
    ]));
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![Decision::new("FINISH")])),
        Arc::new(ScriptedPrompter::new(vec![])),
        notepad(),
    )
    .with_evaluator(Arc::new(LlmEvaluator::new(llm, 0.0)))
    .with_input(Arc::new(ScriptedInput::new(["check Notepad"])));

    let manager = SessionManager::new(config, collab);
    let (_, id) = manager.create("evaluate", "normal", None).unwrap();
    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    let evaluation = outcome.evaluation.unwrap();
    assert!(!evaluation.is_complete());
    assert_eq!(evaluation.sub_scores["closed"], "no");

    let entries = read_jsonl(dir.path().join("evaluate").join(EVALUATION_LOG)).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["level"], "round");
    assert_eq!(entries[0]["request"], "check Notepad");
    assert_eq!(entries[0]["complete"], "yes");
    assert_eq!(entries[1]["level"], "session");
    assert_eq!(entries[1]["requests"][0], "check Notepad");
}

#[tokio::test]
async fn test_experience_saved_on_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir.path().join("logs"));
    config.session.ask_experience = true;
    let store = Arc::new(JsonExperienceStore::new(dir.path().join("exp")));
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()])),
        Arc::new(ScriptedPrompter::new(vec![
            Decision::new("CONTINUE").with_action("close_window", serde_json::json!({})),
            Decision::new("FINISH"),
        ])),
        notepad(),
    )
    .with_experience(store.clone())
    .with_input(Arc::new(
        ScriptedInput::new(["close Notepad"]).with_confirmations([Confirmation::Yes]),
    ));

    let manager = SessionManager::new(config, collab);
    let (_, id) = manager.create("experience", "normal", None).unwrap();
    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);

    let saved = store.load().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].request, "close Notepad");
    assert_eq!(saved[0].steps.len(), 3);
}

#[tokio::test]
async fn test_experience_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir.path().join("logs"));
    config.session.ask_experience = true;
    // saved_path 指向普通文件：无法创建目录，persist 失败
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, "occupied").unwrap();
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![Decision::new("FINISH")])),
        Arc::new(ScriptedPrompter::new(vec![])),
        notepad(),
    )
    .with_experience(Arc::new(JsonExperienceStore::new(&blocker)))
    .with_input(Arc::new(
        ScriptedInput::new(["check Notepad"]).with_confirmations([Confirmation::Yes]),
    ));

    let manager = SessionManager::new(config, collab);
    let (_, id) = manager.create("experience_fail", "normal", None).unwrap();
    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.rounds, 1);
    assert!(blocker.is_file());
}

#[tokio::test]
async fn test_declined_confirmation_never_actuates() {
    let dir = tempfile::tempdir().unwrap();
    let actuator = notepad();
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()])),
        Arc::new(ScriptedPrompter::new(vec![Decision::new("CONFIRM")
            .with_action("close_window", serde_json::json!({}))])),
        actuator.clone(),
    )
    .with_input(Arc::new(
        ScriptedInput::new(["close Notepad"]).with_confirmations([Confirmation::No]),
    ));

    let manager = SessionManager::new(test_config(dir.path()), collab);
    let (_, id) = manager.create("decline", "normal", None).unwrap();
    let results = manager.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    assert!(actuator.executed().is_empty());
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.rounds, 1);
}

/// 同一脚本运行两次：一次中途暂停再恢复，一次不暂停，handle 次数应一致
#[tokio::test]
async fn test_pause_resume_keeps_handle_count() {
    async fn run(pause_at: Option<usize>) -> (usize, u64) {
        let dir = tempfile::tempdir().unwrap();
        let control_cell: Arc<OnceLock<Arc<SessionControl>>> = Arc::new(OnceLock::new());
        let hook_cell = control_cell.clone();
        let coordinator = Arc::new(
            ScriptedPrompter::new(vec![
                Decision::new("CONTINUE"),
                Decision::new("CONTINUE"),
                Decision::new("CONTINUE"),
                Decision::new("FINISH"),
            ])
            .on_call(move |n| {
                if Some(n) == pause_at {
                    if let Some(control) = hook_cell.get() {
                        assert_eq!(control.pause(), ControlReply::Ok);
                    }
                }
            }),
        );
        let collab = Collaborators::new(
            coordinator.clone(),
            Arc::new(ScriptedPrompter::new(vec![])),
            notepad(),
        )
        .with_input(Arc::new(ScriptedInput::new(["count steps"])));

        let manager = SessionManager::new(test_config(dir.path()), collab);
        let (handles, id) = manager.create("pause", "normal", None).unwrap();
        let control = handles[0].control.clone();
        control_cell.set(control.clone()).ok();

        let worker = manager.start(&id).await.unwrap();
        if pause_at.is_some() {
            for _ in 0..200 {
                if control.is_paused() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(control.is_paused());
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(coordinator.calls(), pause_at.unwrap());
            assert_eq!(manager.resume(&id), ControlReply::Ok);
        }
        let results = worker.await.unwrap();
        let outcome = results.into_iter().next().unwrap().unwrap();
        (coordinator.calls(), outcome.steps)
    }

    let baseline = run(None).await;
    let paused = run(Some(2)).await;
    assert_eq!(baseline, (4, 4));
    assert_eq!(paused, baseline);
}

#[tokio::test]
async fn test_terminate_dominates_pause() {
    let dir = tempfile::tempdir().unwrap();
    let control_cell: Arc<OnceLock<Arc<SessionControl>>> = Arc::new(OnceLock::new());
    let hook_cell = control_cell.clone();
    let coordinator = Arc::new(
        ScriptedPrompter::new(vec![Decision::new("CONTINUE"); 5]).on_call(move |n| {
            if n == 1 {
                if let Some(control) = hook_cell.get() {
                    control.pause();
                }
            }
        }),
    );
    let collab = Collaborators::new(
        coordinator.clone(),
        Arc::new(ScriptedPrompter::new(vec![])),
        notepad(),
    )
    .with_input(Arc::new(ScriptedInput::new(["never ends"])));

    let manager = SessionManager::new(test_config(dir.path()), collab);
    let (handles, id) = manager.create("terminate", "normal", None).unwrap();
    control_cell.set(handles[0].control.clone()).ok();

    let worker = manager.start(&id).await.unwrap();
    for _ in 0..200 {
        if handles[0].control.is_paused() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    manager.terminate(&id).unwrap();

    let results = tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("terminate must unblock a paused session")
        .unwrap();
    assert!(results[0].is_ok());
    assert_eq!(coordinator.calls(), 1);
    assert_eq!(manager.get_state(&id), StateReply::NoSessionRunning);
    assert_eq!(manager.pause(&id), ControlReply::NoSessionRunning);
}

#[tokio::test]
async fn test_fork_while_waiting_for_request() {
    let dir = tempfile::tempdir().unwrap();
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()])),
        Arc::new(ScriptedPrompter::new(vec![Decision::new("FINISH")])),
        notepad(),
    );

    let manager = SessionManager::new(test_config(dir.path()), collab);
    let (handles, id) = manager.create("fork", "normal", None).unwrap();
    let worker = manager.start(&id).await.unwrap();
    manager.submit_request(&id, "look at Notepad").unwrap();

    // 第一轮结束后进入等待下一请求
    let control = handles[0].control.clone();
    wait_until("second request prompt", || {
        control.status() == SessionStatus::WaitingRequest && control.round_state().is_some()
    })
    .await;
    let before = manager.get_state(&id);
    assert_eq!(before, StateReply::State("FINISH".to_string()));

    let fork_id = manager.fork(&id).await.unwrap();
    assert_ne!(fork_id, id);
    assert_eq!(manager.get_state(&fork_id), before);
    assert_eq!(manager.get_state(&id), StateReply::NoSessionRunning);

    // 原会话在等待中被终止
    let results = tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results[0].as_ref().unwrap().rounds, 1);

    // 分叉会话带着第一轮历史继续运行
    let fork_worker = manager.start(&fork_id).await.unwrap();
    manager.submit_request(&fork_id, "N").unwrap();
    let results = fork_worker.await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.steps, 2);
}

#[tokio::test]
async fn test_fork_mid_round_resumes_pending_round() {
    let dir = tempfile::tempdir().unwrap();
    let actuator = notepad();
    let control_cell: Arc<OnceLock<Arc<SessionControl>>> = Arc::new(OnceLock::new());
    let hook_cell = control_cell.clone();
    let coordinator = Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()]).on_call(
        move |n| {
            if n == 1 {
                if let Some(control) = hook_cell.get() {
                    control.pause();
                }
            }
        },
    ));
    let delegate = Arc::new(ScriptedPrompter::new(vec![
        Decision::new("CONTINUE").with_action("type_keys", serde_json::json!({"text": "hello"})),
        Decision::new("FINISH"),
    ]));
    let collab = Collaborators::new(coordinator.clone(), delegate.clone(), actuator.clone());

    let manager = SessionManager::new(test_config(dir.path()), collab);
    let (handles, id) = manager.create("fork_mid", "normal", None).unwrap();
    let control = handles[0].control.clone();
    control_cell.set(control.clone()).ok();
    let worker = manager.start(&id).await.unwrap();
    manager.submit_request(&id, "type hello").unwrap();

    // 协调者已选中应用、控制权交给委托者，但本轮尚未结束
    wait_until("paused before the delegate step", || {
        control.is_paused()
            && control.latest_snapshot().map_or(false, |s| {
                s.rounds
                    .last()
                    .map_or(false, |r| r.outcome.is_none() && matches!(r.agent, AgentRef::Delegate(_)))
            })
    })
    .await;

    let fork_id = manager.fork(&id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("fork must terminate the paused source")
        .unwrap();
    assert_eq!(delegate.calls(), 0);
    assert!(actuator.executed().is_empty());

    let fork_worker = manager.start(&fork_id).await.unwrap();
    manager.submit_request(&fork_id, "N").unwrap();
    let results = fork_worker.await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.steps, 3);
    assert_eq!(coordinator.calls(), 1);
    assert_eq!(delegate.requests(), vec!["type hello", "type hello"]);
    assert_eq!(actuator.executed().len(), 1);
    // 源会话与分叉会话各截取一次最终快照：分叉会话的窗口已重新绑定
    assert_eq!(actuator.snapshots().len(), 2);
}

#[tokio::test]
async fn test_follower_batch_creates_one_session_per_plan() {
    let dir = tempfile::tempdir().unwrap();
    let plans = dir.path().join("plans");
    std::fs::create_dir_all(&plans).unwrap();
    std::fs::write(
        plans.join("b.json"),
        r#"{"task": "second", "object": "notepad", "steps": ["type"]}"#,
    )
    .unwrap();
    std::fs::write(plans.join("a.json"), r#"{"task": "first", "steps": []}"#).unwrap();
    std::fs::write(plans.join("notes.txt"), "ignored").unwrap();

    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![])),
        Arc::new(ScriptedPrompter::new(vec![])),
        notepad(),
    );
    let manager = SessionManager::new(test_config(&dir.path().join("logs")), collab);
    let (handles, id) = manager.create("batch", "follower", Some(&plans)).unwrap();
    let tasks: Vec<&str> = handles.iter().map(|h| h.task.as_str()).collect();
    assert_eq!(tasks, vec!["batch/a", "batch/b"]);

    let results = manager.start(&id).await.unwrap().await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().rounds, 1);
    assert_eq!(results[1].as_ref().unwrap().rounds, 2);

    // 同一 id 只能启动一次
    assert!(matches!(
        manager.start(&id).await,
        Err(SessionError::AlreadyStarted(_))
    ));
}

#[tokio::test]
async fn test_store_and_load_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("stored"));
    let actuator = notepad();
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![switch_to_notepad()])),
        Arc::new(ScriptedPrompter::new(vec![Decision::new("FINISH")])),
        actuator.clone(),
    )
    .with_input(Arc::new(ScriptedInput::new(["look at Notepad"])));

    let manager = SessionManager::new(test_config(&dir.path().join("logs")), collab.clone());
    let (_, id) = manager.create("persist", "normal", None).unwrap();
    manager.start(&id).await.unwrap().await.unwrap();
    assert_eq!(actuator.snapshots().len(), 1);

    let path = manager.store(&id, &store).await.unwrap();
    assert!(path.ends_with(format!("session_{}.json", id)));

    let snapshot = store.load(&id).unwrap();
    assert!(snapshot.finished);
    assert_eq!(snapshot.rounds.len(), 1);
    assert_eq!(snapshot.rounds[0].outcome, Some(RoundOutcome::Finished));
    assert_eq!(snapshot.coordinator.delegates.len(), 1);

    let other = SessionManager::new(test_config(&dir.path().join("logs")), collab);
    let handles = other.load(&id, &store).unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].task, "persist");
    assert!(matches!(
        other.load("missing", &store),
        Err(SessionError::NotFound(_))
    ));

    // 读回的会话窗口是未解析的描述符；启动时重新绑定，才能截取最终快照
    let results = other.start(&id).await.unwrap().await.unwrap();
    let outcome = results.into_iter().next().unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(actuator.snapshots().len(), 2);
}

#[test]
fn test_unsupported_mode_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let collab = Collaborators::new(
        Arc::new(ScriptedPrompter::new(vec![])),
        Arc::new(ScriptedPrompter::new(vec![])),
        notepad(),
    );
    let manager = SessionManager::new(test_config(dir.path()), collab);
    assert!(matches!(
        manager.create("x", "turbo", None),
        Err(SessionError::UnsupportedMode(mode)) if mode == "turbo"
    ));
    assert_eq!(manager.get_state("unknown"), StateReply::NoSessionRunning);
}
