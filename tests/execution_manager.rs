use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use taskmill::{
    ExecutionContext, ExecutionManager, ExecutionManagerConfig, SubmitError, Tag, Task, TaskError,
    current_task,
};
use tokio::sync::Notify;

fn manager() -> Arc<ExecutionManager> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    ExecutionManager::new(ExecutionManagerConfig::default())
}

#[tokio::test]
async fn test_submit_and_get_result() {
    let manager = manager();
    let task = Task::new("answer", async { Ok(42) });

    manager.submit(vec![Tag::new("math")], &task).unwrap();
    assert_eq!(task.get().await.unwrap(), 42);
    assert!(task.is_done());
    assert!(!task.is_error());
}

#[tokio::test]
async fn test_timestamps_are_ordered() {
    let manager = manager();
    let task = Task::new("stamped", async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    });

    assert_eq!(task.handle().submitted_at(), None);
    manager.submit(Vec::new(), &task).unwrap();
    task.get().await.unwrap();

    let submitted = task.handle().submitted_at().unwrap();
    let started = task.handle().started_at().unwrap();
    let ended = task.handle().ended_at().unwrap();
    assert!(submitted <= started, "submit must precede start");
    assert!(started <= ended, "start must precede end");
}

#[tokio::test]
async fn test_double_submit_is_rejected() {
    let manager = manager();
    let task = Task::new("once", async { Ok(()) });

    manager.submit(Vec::new(), &task).unwrap();
    match manager.submit(Vec::new(), &task) {
        Err(SubmitError::AlreadySubmitted { id }) => assert_eq!(id, task.id()),
        other => panic!("expected AlreadySubmitted, got {other:?}"),
    }
    task.get().await.unwrap();
}

#[tokio::test]
async fn test_cancel_before_submit_never_runs_body() {
    let manager = manager();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in = ran.clone();
    let task = Task::new("cancelled-early", async move {
        ran_in.store(true, Ordering::SeqCst);
        Ok(())
    });

    assert!(task.cancel(true));
    // submitting a cancelled task is a silent no-op
    manager.submit(Vec::new(), &task).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(task.is_cancelled());
    assert!(task.is_done());
    assert!(task.is_error());
    assert!(matches!(task.get().await, Err(TaskError::Cancelled)));
    assert!(!ran.load(Ordering::SeqCst), "body must never execute");
}

#[tokio::test]
async fn test_cancel_during_run_interrupts_body() {
    let manager = manager();
    let started = Arc::new(Notify::new());
    let observed = Arc::new(AtomicBool::new(false));
    let started_in = started.clone();
    let observed_in = observed.clone();
    let task = Task::new("cancelled-midway", async move {
        let token = current_task().unwrap().cancellation_token();
        started_in.notify_one();
        token.cancelled().await;
        observed_in.store(true, Ordering::SeqCst);
        Ok(())
    });

    manager.submit(Vec::new(), &task).unwrap();
    started.notified().await;
    assert!(task.cancel(true));

    assert!(matches!(task.get().await, Err(TaskError::Cancelled)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(observed.load(Ordering::SeqCst), "body should see the signal");
}

#[tokio::test]
async fn test_cancel_after_completion_keeps_result() {
    let manager = manager();
    let task = Task::new("finished", async { Ok("kept".to_string()) });

    manager.submit(Vec::new(), &task).unwrap();
    assert_eq!(task.get().await.unwrap(), "kept");

    assert!(!task.cancel(true));
    assert!(!task.is_cancelled());
    assert_eq!(task.get().await.unwrap(), "kept");
}

#[tokio::test]
async fn test_timed_get_leaves_task_running() {
    let manager = manager();
    let release = Arc::new(Notify::new());
    let release_in = release.clone();
    let task = Task::new("slow", async move {
        release_in.notified().await;
        Ok("eventually".to_string())
    });
    manager.submit(Vec::new(), &task).unwrap();

    match task.get_timeout(Duration::from_millis(20)).await {
        Err(TaskError::Timeout { waited }) => assert_eq!(waited, Duration::from_millis(20)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(!task.is_done(), "timeout must not affect the task");

    // a zero timeout reports "not done yet" without waiting
    assert!(matches!(
        task.get_timeout(Duration::ZERO).await,
        Err(TaskError::Timeout { .. })
    ));

    release.notify_one();
    assert_eq!(task.get().await.unwrap(), "eventually");
}

#[tokio::test]
async fn test_body_error_surfaces_from_get() {
    let manager = manager();
    let task: Task<()> = Task::new("failing", async { anyhow::bail!("deliberate") });
    manager.submit(Vec::new(), &task).unwrap();

    match task.get().await {
        Err(TaskError::Failure(err)) => assert!(err.to_string().contains("deliberate")),
        other => panic!("expected body failure, got {other:?}"),
    }
    assert!(task.is_error());
    assert!(!task.is_cancelled());
}

#[tokio::test]
async fn test_tag_queries() {
    let manager = manager();
    let a = Task::new("a", async { Ok(()) });
    let b = Task::new("b", async { Ok(()) });
    let c = Task::new("c", async { Ok(()) });

    manager.submit(vec![Tag::new("red")], &a).unwrap();
    manager.submit(vec![Tag::new("red"), Tag::new("blue")], &b).unwrap();
    manager.submit(vec![Tag::new("blue")], &c).unwrap();
    for task in [&a, &b, &c] {
        task.get().await.unwrap();
    }

    // completed tasks remain queryable
    assert_eq!(manager.tasks_with_tag(&Tag::new("red")).len(), 2);
    assert_eq!(
        manager.tasks_with_any_tag(&[Tag::new("red"), Tag::new("blue")]).len(),
        3
    );
    let both = manager.tasks_with_all_tags(&[Tag::new("red"), Tag::new("blue")]);
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].id(), b.id());

    let mut tags = manager.task_tags();
    tags.sort();
    assert_eq!(tags, vec![Tag::new("blue"), Tag::new("red")]);

    assert_eq!(manager.task(a.id()).unwrap().id(), a.id());
}

#[tokio::test]
async fn test_all_tags_empty_when_any_tag_unmatched() {
    let manager = manager();
    let task = Task::new("only-b", async { Ok(()) });
    manager.submit(vec![Tag::new("b")], &task).unwrap();
    task.get().await.unwrap();

    // no task has tag "a", so the intersection must be empty even though
    // many tasks may carry "b"
    let result = manager.tasks_with_all_tags(&[Tag::new("a"), Tag::new("b")]);
    assert!(result.is_empty());
    let result = manager.tasks_with_all_tags(&[Tag::new("b"), Tag::new("a")]);
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_submitted_by_links_parent() {
    let manager = manager();
    let inner_mgr = manager.clone();
    let child_holder: Arc<tokio::sync::Mutex<Option<Task<()>>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let holder_in = child_holder.clone();
    let parent = Task::new("parent", async move {
        let child = Task::new("child", async { Ok(()) });
        inner_mgr.submit(Vec::new(), &child)?;
        child.get().await?;
        *holder_in.lock().await = Some(child);
        Ok(())
    });

    manager.submit(Vec::new(), &parent).unwrap();
    parent.get().await.unwrap();

    let child = child_holder.lock().await.take().unwrap();
    let submitter = child.handle().submitted_by().unwrap();
    assert_eq!(submitter.id(), parent.id());
    // provenance only goes one level; the parent has no submitter
    assert!(parent.handle().submitted_by().is_none());
}

#[tokio::test]
async fn test_listeners_fire_exactly_once_each() {
    let manager = manager();
    let release = Arc::new(Notify::new());
    let running = Arc::new(Notify::new());
    let release_in = release.clone();
    let running_in = running.clone();
    let task = Task::new("listened", async move {
        running_in.notify_one();
        release_in.notified().await;
        Ok(())
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let before = fired.clone();
    task.add_listener(move || {
        before.fetch_add(1, Ordering::SeqCst);
    });

    manager.submit(Vec::new(), &task).unwrap();
    running.notified().await;
    let during = fired.clone();
    task.add_listener(move || {
        during.fetch_add(1, Ordering::SeqCst);
    });

    release.notify_one();
    task.get().await.unwrap();
    let after = fired.clone();
    task.add_listener(move || {
        after.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_counters_track_submissions() {
    let manager = manager();
    assert_eq!(manager.total_tasks_submitted(), 0);

    let tasks: Vec<Task<()>> = (0..5).map(|i| Task::new(format!("t{i}"), async { Ok(()) })).collect();
    for task in &tasks {
        manager.submit(Vec::new(), task).unwrap();
    }
    for task in &tasks {
        task.get().await.unwrap();
    }

    assert_eq!(manager.total_tasks_submitted(), 5);
    assert_eq!(manager.num_incomplete_tasks(), 0);
    assert_eq!(manager.num_active_tasks(), 0);
}

#[tokio::test]
async fn test_shutdown_rejects_and_cancels() {
    let manager = manager();
    let task = Task::new("in-flight", async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    });
    manager.submit(Vec::new(), &task).unwrap();

    manager.shutdown_now();
    assert!(manager.is_shut_down());
    assert!(matches!(task.get().await, Err(TaskError::Cancelled)));

    let late = Task::new("late", async { Ok(()) });
    assert!(matches!(
        manager.submit(Vec::new(), &late),
        Err(SubmitError::ShutDown)
    ));
}

#[tokio::test]
async fn test_context_stamps_tags() {
    let manager = manager();
    let context = ExecutionContext::new(manager.clone(), vec![Tag::new("owner-1")]);

    let task = Task::new("owned", async { Ok(()) });
    context.submit(&task).unwrap();
    task.get().await.unwrap();

    assert!(task.handle().has_tag(&Tag::new("owner-1")));
    let owned = context.tasks();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id(), task.id());

    let extra = Task::new("extra", async { Ok(()) });
    context.submit_tagged(vec![Tag::new("effector")], &extra).unwrap();
    extra.get().await.unwrap();
    assert!(extra.handle().has_tag(&Tag::new("owner-1")));
    assert!(extra.handle().has_tag(&Tag::new("effector")));
    assert_eq!(context.tasks().len(), 2);
}
