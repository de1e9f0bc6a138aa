//! Command stack behavior through the public facade

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{
    add, divide, manager_with, set, value_of, FailingCommand, PermanentCommand, UnrepeatableCommand,
};
use parking_lot::Mutex;
use quire_engine::{
    Command, CommandState, DirtyStateEvent, EditingContext, ModelId, StackError, StackEventKind,
};
use serde_json::json;

fn ids(values: &[&str]) -> Vec<ModelId> {
    values.iter().map(|v| ModelId::from(*v)).collect()
}

#[tokio::test]
async fn test_execute_undo_redo() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 42}))]);
    let stack = manager.command_stack("c1");

    stack.execute(add("x", 2)).await?;
    stack.execute(divide("x", 11)).await?;
    assert_eq!(value_of(&manager, "x"), json!(4));

    stack.undo().await?;
    assert_eq!(value_of(&manager, "x"), json!(44));
    stack.undo().await?;
    assert_eq!(value_of(&manager, "x"), json!(42));
    assert_eq!(
        stack.undo().await.err(),
        Some(StackError::NothingToUndo(EditingContext::from("c1")))
    );

    stack.redo().await?;
    stack.redo().await?;
    assert_eq!(value_of(&manager, "x"), json!(4));
    assert_eq!(
        stack.redo().await.err(),
        Some(StackError::NothingToRedo(EditingContext::from("c1")))
    );
    Ok(())
}

#[tokio::test]
async fn test_execute_requires_context() {
    let manager = manager_with(&[("x", json!({"value": 1}))]);
    let result = manager.core().execute(add("x", 1), &[]).await;
    assert_eq!(result.err(), Some(StackError::ContextRequired));
    assert_eq!(value_of(&manager, "x"), json!(1));
}

#[tokio::test]
async fn test_unknown_model_is_integrity_fault() {
    let manager = manager_with(&[]);
    let stack = manager.command_stack("c1");
    let result = stack.execute(add("missing", 1)).await;
    assert!(matches!(result, Err(StackError::Store(_))));
}

#[tokio::test]
async fn test_failed_execute_is_atomic() {
    let manager = manager_with(&[("x", json!({"value": 42}))]);
    let stack = manager.command_stack("c1");

    let events = Arc::new(AtomicUsize::new(0));
    let counter = events.clone();
    let _subscription = manager.subscribe_model(None, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let compound = Command::compound("Add then fail", vec![add("x", 1), FailingCommand::command("x")]);
    let result = stack.execute(compound).await;

    assert!(matches!(result, Err(StackError::Command(_))));
    assert_eq!(value_of(&manager, "x"), json!(42));
    assert!(!stack.can_undo());
    assert!(!stack.is_dirty());
    assert_eq!(events.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejected_undo_leaves_state_unchanged() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 1}))]);
    let stack = manager.command_stack("c1");

    stack.execute(add("x", 1)).await?;
    stack.execute(PermanentCommand::command("x", json!(10))).await?;

    assert!(!stack.can_undo());
    assert_eq!(stack.undo().await.err(), Some(StackError::NotUndoable));
    assert_eq!(value_of(&manager, "x"), json!(10));
    assert_eq!(stack.undo_command().map(|c| c.label().to_string()), Some("Permanent".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_undo_redo_symmetry() -> anyhow::Result<()> {
    let manager = manager_with(&[
        ("a", json!({"value": 1, "tags": []})),
        ("b", json!({"value": 10})),
    ]);
    let stack = manager.command_stack("c1");
    let initial = (manager.get_model(&"a".into()), manager.get_model(&"b".into()));

    stack.execute(add("a", 5)).await?;
    stack.execute(set("a", "tags", json!(["x", "y"]))).await?;
    stack.execute(divide("b", 3)).await?;
    stack.execute(set("b", "name", json!("bee"))).await?;
    stack.execute(set("a", "tags", json!(["x"]))).await?;
    let executed = (manager.get_model(&"a".into()), manager.get_model(&"b".into()));

    for _ in 0..5 {
        stack.undo().await?;
    }
    assert_eq!((manager.get_model(&"a".into()), manager.get_model(&"b".into())), initial);

    for _ in 0..5 {
        stack.redo().await?;
    }
    assert_eq!((manager.get_model(&"a".into()), manager.get_model(&"b".into())), executed);
    Ok(())
}

#[tokio::test]
async fn test_new_execution_discards_redo() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    stack.execute(add("x", 1)).await?;
    stack.execute(add("x", 2)).await?;
    stack.undo().await?;
    assert!(stack.can_redo());

    stack.execute(add("x", 10)).await?;
    assert!(!stack.can_redo());
    assert!(stack.redo_command().is_none());
    assert_eq!(value_of(&manager, "x"), json!(11));
    Ok(())
}

#[tokio::test]
async fn test_no_change_is_not_recorded() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 7}))]);
    let stack = manager.command_stack("c1");

    let stack_events = Arc::new(AtomicUsize::new(0));
    let model_events = Arc::new(AtomicUsize::new(0));
    let s = stack_events.clone();
    let m = model_events.clone();
    let _stack_subscription = stack.subscribe(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
    });
    let _model_subscription = manager.subscribe_model(Some("x".into()), move |_| {
        m.fetch_add(1, Ordering::SeqCst);
    });

    let result = stack.execute(set("x", "value", json!(7))).await?;
    assert!(result.is_none());
    assert!(!stack.can_undo());
    assert!(!stack.is_dirty());
    assert_eq!(stack_events.load(Ordering::SeqCst), 0);
    assert_eq!(model_events.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_result_maps_leaves_to_patches() -> anyhow::Result<()> {
    let manager = manager_with(&[("a", json!({"value": 1})), ("b", json!({"value": 2}))]);
    let stack = manager.command_stack("c1");

    let compound = Command::compound(
        "Both",
        vec![add("a", 1), set("b", "value", json!(2)), add("b", 3)],
    );
    let result = stack.execute(compound).await?.expect("changes");

    assert_eq!(result.len(), 2);
    let changes = result.change_set();
    assert_eq!(changes.keys().cloned().collect::<Vec<_>>(), ids(&["a", "b"]));
    assert_eq!(value_of(&manager, "b"), json!(5));
    Ok(())
}

#[tokio::test]
async fn test_dependent_undo_across_contexts() -> anyhow::Result<()> {
    let manager = manager_with(&[
        ("m1", json!({"value": 1})),
        ("m2", json!({"value": 2})),
        ("m3", json!({"value": 3})),
    ]);
    let a = manager.command_stack("A");
    let b = manager.command_stack("B");

    a.execute(add("m1", 10)).await?;
    a.execute_in(add("m2", 10), &[EditingContext::from("B")]).await?;
    a.execute(add("m3", 10)).await?;

    assert_eq!(b.undo_with(false).await.err(), Some(StackError::NotUndoable));
    assert_eq!(value_of(&manager, "m3"), json!(13));

    let analysis = b.analyze_undo();
    assert!(analysis.can_undo);
    assert!(analysis.has_dependencies);
    assert_eq!(
        analysis.summary,
        "Command can be undone in editing context 'B' together with dependent commands in editing context 'A'."
    );

    b.undo().await?;
    assert_eq!(value_of(&manager, "m1"), json!(11));
    assert_eq!(value_of(&manager, "m2"), json!(2));
    assert_eq!(value_of(&manager, "m3"), json!(3));
    assert!(!b.can_undo());
    assert!(a.can_undo());

    a.undo().await?;
    assert_eq!(value_of(&manager, "m1"), json!(1));

    // C1 precedes the merged unit in A, so it is redone first
    b.redo().await?;
    assert_eq!(value_of(&manager, "m1"), json!(11));
    assert_eq!(value_of(&manager, "m2"), json!(12));
    assert_eq!(value_of(&manager, "m3"), json!(13));
    Ok(())
}

#[tokio::test]
async fn test_independent_context_undo_needs_no_dependencies() -> anyhow::Result<()> {
    let manager = manager_with(&[("m1", json!({"value": 1})), ("m2", json!({"value": 2}))]);
    let a = manager.command_stack("A");
    let b = manager.command_stack("B");

    a.execute(add("m1", 1)).await?;
    b.execute(add("m2", 1)).await?;

    a.undo_with(false).await?;
    assert_eq!(value_of(&manager, "m1"), json!(1));
    assert_eq!(value_of(&manager, "m2"), json!(3));
    assert!(!b.analyze_undo().has_dependencies);
    Ok(())
}

#[tokio::test]
async fn test_analysis_reports_blocking_dependency() -> anyhow::Result<()> {
    let manager = manager_with(&[("m1", json!({"value": 1})), ("m2", json!({"value": 2}))]);
    let a = manager.command_stack("A");

    a.execute_in(add("m1", 1), &[EditingContext::from("B")]).await?;
    manager
        .command_stack("A")
        .execute(PermanentCommand::command("m2", json!(0)))
        .await?;

    let analysis = manager.command_stack("B").analyze_undo();
    assert!(!analysis.can_undo);
    assert_eq!(
        analysis.summary,
        "Command cannot be undone in editing context 'B' because a dependent command in editing context 'A' cannot be undone."
    );

    let nothing = manager.command_stack("C").analyze_redo();
    assert!(!nothing.can_redo);
    assert_eq!(nothing.summary, "There is no command to redo in editing context 'C'.");
    Ok(())
}

#[tokio::test]
async fn test_execute_and_append() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 0})), ("y", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    assert_eq!(
        stack.execute_and_append(add("x", 1)).await.err(),
        Some(StackError::NothingToAppend(EditingContext::from("c1")))
    );

    stack.execute(add("x", 1)).await?;
    stack.execute_and_append(add("y", 5)).await?;
    assert_eq!(value_of(&manager, "y"), json!(5));

    stack.undo().await?;
    assert_eq!(value_of(&manager, "x"), json!(0));
    assert_eq!(value_of(&manager, "y"), json!(0));
    assert!(!stack.can_undo());

    let undone = stack.redo_command().expect("undone command");
    assert_eq!(undone.state(), Some(CommandState::Undone));
    let mut undone = undone;
    assert_eq!(undone.append(add("x", 1)), Err(StackError::AppendToUndone));
    Ok(())
}

#[tokio::test]
async fn test_append_rejected_when_shared_entry_is_buried() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({}))]);
    let a = manager.command_stack("A");
    let b = manager.command_stack("B");

    a.execute_in(set("x", "n", json!(1)), &[EditingContext::from("B")]).await?;
    b.execute(set("x", "n", json!(2))).await?;

    assert_eq!(
        a.execute_and_append(set("x", "other", json!(true))).await.err(),
        Some(StackError::AppendBuried(EditingContext::from("B")))
    );
    assert_eq!(manager.get_model(&"x".into()), Some(json!({"n": 2})));

    b.undo().await?;
    assert_eq!(manager.get_model(&"x".into()), Some(json!({"n": 1})));
    b.undo().await?;
    assert_eq!(manager.get_model(&"x".into()), Some(json!({})));
    assert!(!a.can_undo());
    Ok(())
}

#[tokio::test]
async fn test_redo_without_dependencies_is_rejected() -> anyhow::Result<()> {
    let manager = manager_with(&[("m1", json!({"value": 1})), ("m2", json!({"value": 2}))]);
    let a = manager.command_stack("A");
    let b = manager.command_stack("B");

    a.execute(add("m1", 1)).await?;
    a.execute_in(add("m2", 1), &[EditingContext::from("B")]).await?;
    a.undo().await?;
    a.undo().await?;

    assert!(b.analyze_redo().has_dependencies);
    assert_eq!(b.redo_with(false).await.err(), Some(StackError::NotRedoable));
    assert_eq!(value_of(&manager, "m1"), json!(1));
    assert_eq!(value_of(&manager, "m2"), json!(2));

    b.redo().await?;
    assert_eq!(value_of(&manager, "m1"), json!(2));
    assert_eq!(value_of(&manager, "m2"), json!(3));
    assert!(!a.can_redo());
    Ok(())
}

#[tokio::test]
async fn test_rejected_redo_leaves_state_unchanged() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 1}))]);
    let stack = manager.command_stack("c1");

    stack.execute(UnrepeatableCommand::command("x", 5)).await?;
    stack.undo().await?;
    assert_eq!(value_of(&manager, "x"), json!(1));

    assert!(!stack.can_redo());
    let analysis = stack.analyze_redo();
    assert!(!analysis.can_redo);
    assert_eq!(analysis.summary, "Command cannot be redone in editing context 'c1'.");

    assert_eq!(stack.redo().await.err(), Some(StackError::NotRedoable));
    assert_eq!(value_of(&manager, "x"), json!(1));
    assert_eq!(
        stack.redo_command().map(|c| c.label().to_string()),
        Some("Unrepeatable".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_execute_discards_shared_redo_in_other_context() -> anyhow::Result<()> {
    let manager = manager_with(&[
        ("m1", json!({"value": 1})),
        ("m2", json!({"value": 2})),
        ("m3", json!({"value": 3})),
    ]);
    let a = manager.command_stack("A");
    let b = manager.command_stack("B");

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let k = kinds.clone();
    let _subscription = b.subscribe(move |event| k.lock().push(event.kind));

    a.execute_in(add("m1", 1), &[EditingContext::from("B")]).await?;
    b.execute(add("m2", 1)).await?;
    b.undo().await?;
    b.undo().await?;
    assert!(b.can_redo());

    a.execute(add("m3", 1)).await?;
    assert!(!b.can_redo());
    assert!(!a.can_redo());
    assert_eq!(
        b.redo().await.err(),
        Some(StackError::NothingToRedo(EditingContext::from("B")))
    );
    assert_eq!(
        *kinds.lock(),
        vec![
            StackEventKind::Executed,
            StackEventKind::Executed,
            StackEventKind::Undone,
            StackEventKind::Undone,
            StackEventKind::RedoDiscarded,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_savepoint_dirty_accounting() -> anyhow::Result<()> {
    let manager = manager_with(&[("modelA", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    for _ in 0..3 {
        stack.execute(add("modelA", 1)).await?;
    }
    stack.mark_saved().await;
    assert!(!stack.is_dirty());

    stack.execute(add("modelA", 1)).await?;
    assert_eq!(stack.dirty_model_ids(), ids(&["modelA"]));

    stack.undo().await?;
    assert_eq!(stack.dirty_model_ids(), ids(&[]));
    stack.undo().await?;
    assert_eq!(stack.dirty_model_ids(), ids(&["modelA"]));

    stack.redo().await?;
    stack.redo().await?;
    assert_eq!(stack.dirty_model_ids(), ids(&["modelA"]));
    Ok(())
}

#[tokio::test]
async fn test_flush_retains_dirtiness() -> anyhow::Result<()> {
    let manager = manager_with(&[("modelA", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let dirty_events = Arc::new(AtomicUsize::new(0));
    let k = kinds.clone();
    let d = dirty_events.clone();
    let _stack_subscription = stack.subscribe(move |event| k.lock().push(event.kind));
    let _dirty_subscription = stack.subscribe_dirty(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    stack.execute(add("modelA", 1)).await?;
    assert_eq!(dirty_events.load(Ordering::SeqCst), 1);

    stack.flush().await;
    assert!(stack.is_dirty());
    assert_eq!(stack.dirty_model_ids(), ids(&["modelA"]));
    assert!(!stack.can_undo());
    assert_eq!(dirty_events.load(Ordering::SeqCst), 1);
    assert_eq!(*kinds.lock(), vec![StackEventKind::Executed, StackEventKind::Flushed]);
    assert_eq!(manager.editing_contexts(), vec![EditingContext::from("c1")]);

    stack.mark_saved().await;
    assert!(!stack.is_dirty());
    assert!(stack.dirty_model_ids().is_empty());
    assert_eq!(dirty_events.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_dirty_events_track_transitions() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    let events: Arc<Mutex<Vec<DirtyStateEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _subscription = manager
        .core()
        .subscribe_dirty(None, move |event| sink.lock().push(event.clone()));

    stack.execute(add("x", 1)).await?;
    stack.execute(add("x", 1)).await?;
    stack.mark_saved().await;
    stack.undo().await?;

    let events = events.lock();
    let flags: Vec<Option<bool>> = events
        .iter()
        .map(|event| event.dirty.get(&ModelId::from("x")).copied())
        .collect();
    assert_eq!(flags, vec![Some(true), Some(false), Some(true)]);
    Ok(())
}

#[tokio::test]
async fn test_subscriber_panic_does_not_block_others() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    let received = Arc::new(AtomicUsize::new(0));
    let r = received.clone();
    let _panicking = stack.subscribe(|_| panic!("subscriber failure"));
    let _counting = stack.subscribe(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    stack.execute(add("x", 1)).await?;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(value_of(&manager, "x"), json!(1));
    Ok(())
}

#[tokio::test]
async fn test_closed_subscription_stops_events() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    let received = Arc::new(AtomicUsize::new(0));
    let r = received.clone();
    let subscription = stack.subscribe(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    stack.execute(add("x", 1)).await?;
    subscription.close();
    subscription.close();
    stack.execute(add("x", 1)).await?;

    assert!(subscription.is_closed());
    assert_eq!(received.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_model_events_carry_patch() -> anyhow::Result<()> {
    let manager = manager_with(&[("x", json!({"value": 0})), ("y", json!({"value": 0}))]);
    let stack = manager.command_stack("c1");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = manager.subscribe_model(Some("x".into()), move |event| {
        sink.lock().push((event.model_id.clone(), event.model.clone(), event.patch.len()));
    });

    stack.execute(add("y", 1)).await?;
    stack.execute(add("x", 3)).await?;

    assert_eq!(
        *seen.lock(),
        vec![(ModelId::from("x"), json!({"value": 3}), 1)]
    );
    Ok(())
}
