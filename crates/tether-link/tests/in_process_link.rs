use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;
use tokio::sync::mpsc;

use tether_core::backend::GenerativeBackend;
use tether_core::domain::runtime::{SessionError, SessionSummary};
use tether_core::domain::{
    BackendEvent, Channel, DeltaEvent, Notification, NotificationStream, SessionId, SessionUpdate,
    StopReason, Transcript, TurnStatus,
};
use tether_core::test_utils::{BackendGate, GatedBackend, ScriptedBackend, text_script};
use tether_core::{PersistenceConfig, RuntimeConfig};
use tether_link::{
    InProcessLink, Link, LinkError, LocalLinkSetup, OperationKind, Router, RouterError,
    SessionClient, SessionContext, setup_local_link,
};

type Client = SessionClient<InProcessLink<SessionContext>>;
type Updates = NotificationStream<SessionUpdate, LinkError>;

fn sid(value: &str) -> SessionId {
    SessionId::parse(value).expect("valid session id")
}

async fn local(backend: impl GenerativeBackend) -> LocalLinkSetup {
    setup_local_link(RuntimeConfig::in_memory(), Arc::new(backend))
        .await
        .expect("local setup")
}

async fn local_gated() -> (LocalLinkSetup, mpsc::UnboundedReceiver<BackendGate>) {
    let (backend, gates) = GatedBackend::new();
    (local(backend).await, gates)
}

/// Folds every update until the stream completes.
async fn fold_until_complete(mut updates: Updates) -> Transcript {
    let mut local = Transcript::new();
    loop {
        match updates.next().await {
            Some(Notification::Next(update)) => local.apply_update(&update),
            Some(Notification::Complete) => return local,
            other => panic!("watch ended without completing: {other:?}"),
        }
    }
}

async fn fold_until_text(updates: &mut Updates, local: &mut Transcript, text: &str) {
    while !local
        .last_assistant()
        .is_some_and(|turn| turn.text() == text)
    {
        match updates.next().await {
            Some(Notification::Next(update)) => local.apply_update(&update),
            other => panic!("stream ended before text {text:?}: {other:?}"),
        }
    }
}

async fn wait_idle(client: &Client, session_id: &SessionId) -> Transcript {
    let (updates, _unsubscribe) = client.watch_session(session_id, true).await;
    fold_until_complete(updates).await
}

#[tokio::test]
async fn hello_over_the_link() {
    let setup = local(ScriptedBackend::new(text_script(&["Hel", "lo"]))).await;
    let client = setup.client();
    let s1 = sid("s1");

    let accepted = client
        .send_message(Some(s1.clone()), "hi")
        .await
        .expect("send");
    assert_eq!(accepted.aggregation.session_id, s1);
    assert_eq!(accepted.user_turn.text(), "hi");

    let watched = wait_idle(&client, &s1).await;
    let fetched = client.get_session(&s1).await.expect("get session");
    assert_eq!(watched, fetched);

    let assistant = fetched.last_assistant().expect("assistant turn");
    assert_eq!(assistant.id, accepted.aggregation.turn_id);
    assert_eq!(assistant.status, TurnStatus::Complete);
    assert_eq!(assistant.parts.len(), 1);
    assert_eq!(assistant.parts[0].kind, Channel::Text);
    assert_eq!(assistant.parts[0].content, "Hello");

    setup.shutdown().await;
}

#[tokio::test]
async fn send_without_session_id_creates_one() {
    let setup = local(ScriptedBackend::new(text_script(&["ok"]))).await;
    let client = setup.client();

    let accepted = client.send_message(None, "hi").await.expect("send");
    let session_id = accepted.aggregation.session_id;
    wait_idle(&client, &session_id).await;

    let sessions = client.list_sessions().await.expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, session_id);
    assert_eq!(sessions[0].turn_count, 2);
    assert!(!sessions[0].busy);

    setup.shutdown().await;
}

#[tokio::test]
async fn second_send_while_generating_is_busy() {
    let (setup, mut gates) = local_gated().await;
    let client = setup.client();
    let s1 = sid("s1");

    client
        .send_message(Some(s1.clone()), "one")
        .await
        .expect("first send");
    let gate = gates.recv().await.expect("backend called");

    let err = client
        .send_message(Some(s1.clone()), "two")
        .await
        .err()
        .expect("busy");
    assert!(err.as_session_error().is_some_and(SessionError::is_busy));
    assert_eq!(client.get_session(&s1).await.expect("get").len(), 2);

    gate.send_all(text_script(&["done"]));
    wait_idle(&client, &s1).await;
    client
        .send_message(Some(s1.clone()), "two")
        .await
        .expect("accepted once idle");

    setup.shutdown().await;
}

#[tokio::test]
async fn stop_generation_keeps_partial_output() {
    let (setup, mut gates) = local_gated().await;
    let client = setup.client();
    let s1 = sid("s1");

    let (mut updates, _unsubscribe) = client.watch_session(&s1, false).await;
    client
        .send_message(Some(s1.clone()), "hi")
        .await
        .expect("send");
    let gate = gates.recv().await.expect("backend called");

    gate.send(DeltaEvent::start(Channel::Text));
    gate.send(DeltaEvent::delta(Channel::Text, "Hel"));
    let mut local = Transcript::new();
    fold_until_text(&mut updates, &mut local, "Hel").await;

    assert!(client.stop_generation(&s1).await.expect("stop"));
    gate.cancelled().await;
    assert!(!client.stop_generation(&s1).await.expect("second stop"));

    let transcript = client.get_session(&s1).await.expect("get");
    let assistant = transcript.last_assistant().expect("assistant turn");
    assert_eq!(assistant.status, TurnStatus::Complete);
    assert_eq!(assistant.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(assistant.text(), "Hel");
    assert!(assistant.parts.iter().all(|part| part.closed));

    setup.shutdown().await;
}

#[tokio::test]
async fn unsubscribing_one_watcher_leaves_the_other() {
    let (setup, mut gates) = local_gated().await;
    let client = setup.client();
    let s1 = sid("s1");

    let (mut first, mut first_unsubscribe) = client.watch_session(&s1, false).await;
    let (mut second, _second_unsubscribe) = client.watch_session(&s1, false).await;

    client
        .send_message(Some(s1.clone()), "hi")
        .await
        .expect("send");
    let gate = gates.recv().await.expect("backend called");
    gate.send(DeltaEvent::start(Channel::Text));
    gate.send(DeltaEvent::delta(Channel::Text, "a"));

    let mut first_local = Transcript::new();
    fold_until_text(&mut first, &mut first_local, "a").await;
    first_unsubscribe.unsubscribe();
    first_unsubscribe.unsubscribe();
    assert!(!first_unsubscribe.is_active());

    gate.send(DeltaEvent::delta(Channel::Text, "b"));
    let mut second_local = Transcript::new();
    fold_until_text(&mut second, &mut second_local, "ab").await;

    gate.send(DeltaEvent::end(Channel::Text));
    gate.send(BackendEvent::Completed);
    wait_idle(&client, &s1).await;

    // The detached watcher got no terminal notification.
    while let Some(notification) = first.next().await {
        assert!(
            matches!(notification, Notification::Next(_)),
            "detached watcher was terminated: {notification:?}"
        );
    }

    setup.shutdown().await;
}

#[tokio::test]
async fn get_session_on_unknown_id_is_not_found() {
    let setup = local(ScriptedBackend::new(text_script(&["x"]))).await;
    let client = setup.client();

    let err = client
        .get_session(&sid("nope"))
        .await
        .err()
        .expect("not found");
    assert!(matches!(
        err.as_session_error(),
        Some(SessionError::SessionNotFound { .. })
    ));

    let err = client
        .stop_generation(&sid("nope"))
        .await
        .err()
        .expect("not found");
    assert!(matches!(
        err.as_session_error(),
        Some(SessionError::SessionNotFound { .. })
    ));

    setup.shutdown().await;
}

#[tokio::test]
async fn delete_completes_watchers() {
    let setup = local(ScriptedBackend::new(text_script(&["x"]))).await;
    let client = setup.client();
    let s1 = sid("s1");

    client
        .send_message(Some(s1.clone()), "hi")
        .await
        .expect("send");
    wait_idle(&client, &s1).await;

    let (updates, _unsubscribe) = client.watch_session(&s1, false).await;
    client.delete_session(&s1).await.expect("delete");
    client.delete_session(&s1).await.expect("delete is idempotent");

    let (items, error) = updates.collect().await;
    assert!(error.is_none());
    assert!(matches!(items.first(), Some(SessionUpdate::Snapshot { .. })));
    assert!(client.get_session(&s1).await.is_err());
    assert!(client.list_sessions().await.expect("list").is_empty());

    setup.shutdown().await;
}

#[tokio::test]
async fn sessions_survive_a_restart_with_sqlite() {
    let dir = TempDir::new().expect("temp dir");
    let config = RuntimeConfig::default()
        .with_persistence(PersistenceConfig::sqlite(dir.path().join("sessions.db")));
    let s1 = sid("s1");

    let setup = setup_local_link(
        config.clone(),
        Arc::new(ScriptedBackend::new(text_script(&["Hel", "lo"]))),
    )
    .await
    .expect("first setup");
    let client = setup.client();
    client
        .send_message(Some(s1.clone()), "hi")
        .await
        .expect("send");
    wait_idle(&client, &s1).await;
    setup.shutdown().await;

    let setup = setup_local_link(config, Arc::new(ScriptedBackend::new(Vec::new())))
        .await
        .expect("second setup");
    let transcript = setup.client().get_session(&s1).await.expect("get");
    assert_eq!(transcript.len(), 2);
    assert_eq!(
        transcript.last_assistant().map(|turn| turn.text()),
        Some("Hello".to_string())
    );
    setup.shutdown().await;
}

#[tokio::test]
async fn unknown_operation_and_kind_mismatch_are_typed() {
    let setup = local(ScriptedBackend::new(Vec::new())).await;

    let err = setup
        .link
        .query::<(), ()>("renameSession", ())
        .await
        .err()
        .expect("unknown");
    assert!(matches!(
        err,
        LinkError::Router(RouterError::UnknownOperation { .. })
    ));

    let err = setup
        .link
        .query::<(), Vec<SessionSummary>>("deleteSession", ())
        .await
        .err()
        .expect("kind mismatch");
    assert!(matches!(
        err,
        LinkError::Router(RouterError::KindMismatch {
            expected: OperationKind::Query,
            registered: OperationKind::Mutation,
            ..
        })
    ));

    setup.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_fails_the_call_only() {
    let mut router: Router<()> = Router::new();
    router
        .mutation("explode", |_context: Arc<()>, input: u32| async move {
            assert!(input > 10, "input too small");
            Ok::<u32, LinkError>(input)
        })
        .expect("register");
    let link = InProcessLink::new(router, ());

    let err = link
        .mutate::<u32, u32>("explode", 1)
        .await
        .err()
        .expect("panic becomes an error");
    assert!(matches!(
        err,
        LinkError::HandlerPanicked { ref message, .. } if message == "input too small"
    ));

    let value: u32 = link.mutate("explode", 11u32).await.expect("link still works");
    assert_eq!(value, 11);
}

proptest! {
    #[test]
    fn registered_names_resolve_and_duplicates_are_rejected(
        names in prop::collection::btree_set("[a-z][a-zA-Z]{0,12}", 1..8)
    ) {
        let mut router: Router<()> = Router::new();
        for name in &names {
            router
                .query(name, |_context: Arc<()>, input: u32| async move {
                    Ok::<u32, LinkError>(input)
                })
                .expect("unique name");
        }

        prop_assert_eq!(router.operations().len(), names.len());
        for name in &names {
            prop_assert!(router.resolve(name, OperationKind::Query).is_ok());
            prop_assert!(
                matches!(
                    router.resolve(name, OperationKind::Subscription),
                    Err(RouterError::KindMismatch { .. })
                ),
                "kind must match exactly"
            );
            let duplicate = router
                .mutation(name, |_context: Arc<()>, input: u32| async move {
                    Ok::<u32, LinkError>(input)
                })
                .err();
            prop_assert_eq!(
                duplicate,
                Some(RouterError::DuplicateOperation { name: name.clone() })
            );
        }
    }
}
