//! End-to-end tests of the spawned engine task against in-memory
//! collaborators.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use ekklesia_bus::LocalEventBus;
use ekklesia_shared::{
    ConversationKey, DeliveryState, InboundEvent, MessageId, MessageRow, UserId,
};
use ekklesia_sync::{
    spawn_engine, Collaborators, ContactRecord, ContactSource, ConversationSummary,
    DispatchOutcome, DispatchRequest, EngineConfig, EngineHandle, EngineNotification,
    HistorySource, MessageDispatcher, ReadMarkerSink, SourceError,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

fn ana() -> UserId {
    UserId::new("ana")
}

fn direct(peer: &str) -> ConversationKey {
    ConversationKey::direct(ana(), UserId::new(peer))
}

/// Commits a row the way the backend does: conversation topic plus both
/// inboxes for direct messages.
fn commit(bus: &LocalEventBus, row: MessageRow) {
    let event = InboundEvent::insert(row.clone());
    let _ = bus.publish(&row.conversation_key.to_topic(), event.clone());
    if let Some(pair) = row.conversation_key.as_direct() {
        let (a, b) = pair.participants();
        let _ = bus.publish(&a.inbox_topic(), event.clone());
        let _ = bus.publish(&b.inbox_topic(), event);
    }
}

fn incoming(id: &str, from: &str) -> MessageRow {
    MessageRow {
        id: id.to_string(),
        conversation_key: ConversationKey::direct(UserId::new(from), ana()),
        sender_id: UserId::new(from),
        body: format!("msg {id}"),
        created_at: Utc::now(),
        correlation_token: None,
    }
}

/// Echoes successful sends back through the bus with a fresh permanent id.
struct EchoDispatcher {
    bus: LocalEventBus,
    next_id: AtomicU64,
    failures: Mutex<Vec<String>>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl EchoDispatcher {
    fn new(bus: LocalEventBus) -> Self {
        Self {
            bus,
            next_id: AtomicU64::new(100),
            failures: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn fail_next(&self, reason: &str) {
        self.failures.lock().unwrap().push(reason.to_string());
    }
}

impl MessageDispatcher for EchoDispatcher {
    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'static, DispatchOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(reason) = self.failures.lock().unwrap().pop() {
            return async move { DispatchOutcome::Failed { reason } }.boxed();
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let bus = self.bus.clone();
        async move {
            commit(
                &bus,
                MessageRow {
                    id,
                    conversation_key: request.conversation_key,
                    sender_id: request.sender_id,
                    body: request.body,
                    created_at: Utc::now(),
                    correlation_token: Some(request.correlation_token),
                },
            );
            DispatchOutcome::Delivered
        }
        .boxed()
    }
}

#[derive(Default)]
struct FakeHistory {
    rows: Mutex<HashMap<ConversationKey, Vec<MessageRow>>>,
    gates: Mutex<HashMap<ConversationKey, oneshot::Receiver<()>>>,
    summaries: Mutex<Vec<ConversationSummary>>,
}

impl FakeHistory {
    fn set_rows(&self, key: ConversationKey, rows: Vec<MessageRow>) {
        self.rows.lock().unwrap().insert(key, rows);
    }

    /// Hold the next fetch of `key` until the returned sender fires.
    fn gate(&self, key: ConversationKey) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(key, rx);
        tx
    }
}

impl HistorySource for FakeHistory {
    fn fetch_history(
        &self,
        key: ConversationKey,
    ) -> BoxFuture<'static, Result<Vec<MessageRow>, SourceError>> {
        let rows = self.rows.lock().unwrap().get(&key).cloned().unwrap_or_default();
        let gate = self.gates.lock().unwrap().remove(&key);
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(rows)
        }
        .boxed()
    }

    fn fetch_summaries(
        &self,
        _me: UserId,
    ) -> BoxFuture<'static, Result<Vec<ConversationSummary>, SourceError>> {
        let summaries = self.summaries.lock().unwrap().clone();
        async move { Ok(summaries) }.boxed()
    }
}

struct FakeDirectory {
    name: String,
    result: Result<Vec<ContactRecord>, SourceError>,
}

impl FakeDirectory {
    fn with(name: &str, ids: &[&str]) -> Arc<Self> {
        let records = ids
            .iter()
            .map(|id| ContactRecord {
                id: UserId::new(*id),
                display_name: id.to_uppercase(),
                address: Some(format!("+55{id}")),
                favorite: false,
            })
            .collect();
        Arc::new(Self {
            name: name.to_string(),
            result: Ok(records),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            result: Err(SourceError::new("directory unavailable")),
        })
    }
}

impl ContactSource for FakeDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_contacts(&self) -> BoxFuture<'static, Result<Vec<ContactRecord>, SourceError>> {
        let result = self.result.clone();
        async move { result }.boxed()
    }
}

#[derive(Default)]
struct FakeReads {
    calls: Mutex<Vec<UserId>>,
    fail_next: AtomicBool,
}

impl ReadMarkerSink for FakeReads {
    fn mark_read_remote(
        &self,
        _me: UserId,
        contact: UserId,
    ) -> BoxFuture<'static, Result<(), SourceError>> {
        self.calls.lock().unwrap().push(contact);
        let fail = self.fail_next.swap(false, Ordering::SeqCst);
        async move {
            if fail {
                Err(SourceError::new("read marker store unavailable"))
            } else {
                Ok(())
            }
        }
        .boxed()
    }
}

struct Fixture {
    bus: LocalEventBus,
    dispatcher: Arc<EchoDispatcher>,
    history: Arc<FakeHistory>,
    reads: Arc<FakeReads>,
    handle: EngineHandle,
    notifications: mpsc::Receiver<EngineNotification>,
}

impl Fixture {
    fn start(sources: Vec<Arc<dyn ContactSource>>) -> Self {
        Self::start_on(LocalEventBus::new(), sources)
    }

    fn start_on(bus: LocalEventBus, sources: Vec<Arc<dyn ContactSource>>) -> Self {
        let dispatcher = Arc::new(EchoDispatcher::new(bus.clone()));
        let history = Arc::new(FakeHistory::default());
        let reads = Arc::new(FakeReads::default());
        let collaborators = Collaborators {
            dispatcher: dispatcher.clone(),
            history: history.clone(),
            contact_sources: sources,
            read_markers: reads.clone(),
        };
        let config = EngineConfig {
            subscribe_backoff: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        let (handle, notifications) =
            spawn_engine(config, ana(), Arc::new(bus.clone()), collaborators);
        Self {
            bus,
            dispatcher,
            history,
            reads,
            handle,
            notifications,
        }
    }

    async fn expect(&mut self, pred: impl Fn(&EngineNotification) -> bool) -> EngineNotification {
        let wait = async {
            while let Some(n) = self.notifications.recv().await {
                if pred(&n) {
                    return n;
                }
            }
            panic!("notification channel closed");
        };
        timeout(Duration::from_secs(2), wait)
            .await
            .expect("timed out waiting for notification")
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_send_converges_to_single_confirmed_message() {
    let mut fx = Fixture::start(Vec::new());
    fx.expect(|n| matches!(n, EngineNotification::Started)).await;

    fx.handle.select_conversation(direct("x")).await.unwrap();
    let temp = fx.handle.send("Oi").await.unwrap();
    assert!(temp.is_temporary());

    let handle = fx.handle.clone();
    eventually(|| {
        let handle = handle.clone();
        async move {
            let timeline = handle.timeline().await.unwrap();
            timeline.len() == 1 && timeline[0].delivery_state == DeliveryState::Confirmed
        }
    })
    .await;

    let timeline = fx.handle.timeline().await.unwrap();
    assert_eq!(timeline[0].id, MessageId::Permanent("100".into()));
    assert_eq!(timeline[0].body, "Oi");
    assert_eq!(fx.handle.unread_total().await.unwrap(), 0);

    let requests = fx.dispatcher.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(MessageId::Temporary(requests[0].correlation_token), temp);
}

#[tokio::test]
async fn test_late_history_of_previous_selection_is_discarded() {
    let mut fx = Fixture::start(Vec::new());
    fx.expect(|n| matches!(n, EngineNotification::Started)).await;

    fx.history.set_rows(direct("a"), vec![incoming("a1", "a")]);
    fx.history.set_rows(direct("b"), vec![incoming("b1", "b")]);
    let release_a = fx.history.gate(direct("a"));

    fx.handle.select_conversation(direct("a")).await.unwrap();
    fx.handle.select_conversation(direct("b")).await.unwrap();

    let handle = fx.handle.clone();
    eventually(|| {
        let handle = handle.clone();
        async move { handle.timeline().await.unwrap().len() == 1 }
    })
    .await;

    release_a.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let timeline = fx.handle.timeline().await.unwrap();
    let ids: Vec<String> = timeline.iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["b1"]);
    assert_eq!(
        fx.handle.active_conversation().await.unwrap(),
        Some(direct("b"))
    );
    assert!(!fx.bus.is_subscribed(&direct("a").to_topic()));
}

#[tokio::test]
async fn test_dispatch_failure_then_retry() {
    let mut fx = Fixture::start(Vec::new());
    fx.handle.select_conversation(direct("x")).await.unwrap();

    fx.dispatcher.fail_next("provider rejected");
    let temp = fx.handle.send("Oi").await.unwrap();

    let failed = fx
        .expect(|n| matches!(n, EngineNotification::MessageFailed { .. }))
        .await;
    assert_eq!(
        failed,
        EngineNotification::MessageFailed {
            key: direct("x"),
            message_id: temp.clone(),
            reason: "provider rejected".into(),
        }
    );
    let timeline = fx.handle.timeline().await.unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].delivery_state, DeliveryState::Failed);

    let again = fx.handle.retry(temp.clone()).await.unwrap();
    assert_ne!(again, temp);

    let handle = fx.handle.clone();
    eventually(|| {
        let handle = handle.clone();
        async move {
            let timeline = handle.timeline().await.unwrap();
            timeline.len() == 1 && timeline[0].delivery_state == DeliveryState::Confirmed
        }
    })
    .await;
}

#[tokio::test]
async fn test_roster_survives_one_failing_source() {
    let sources: Vec<Arc<dyn ContactSource>> = vec![
        FakeDirectory::failing("volunteers"),
        FakeDirectory::with("staff", &["p", "q"]),
    ];
    let mut fx = Fixture::start(sources);

    let failure = fx
        .expect(|n| matches!(n, EngineNotification::RosterSourceFailed { .. }))
        .await;
    assert!(matches!(
        failure,
        EngineNotification::RosterSourceFailed { ref source, .. } if source == "volunteers"
    ));

    fx.expect(|n| matches!(n, EngineNotification::RosterChanged)).await;
    let roster = fx.handle.roster().await.unwrap();
    let ids: Vec<&str> = roster.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["p", "q"]);
}

#[tokio::test]
async fn test_unread_for_other_contact_then_open_zeroes() {
    let sources: Vec<Arc<dyn ContactSource>> = vec![FakeDirectory::with("volunteers", &["y", "z"])];
    let mut fx = Fixture::start(sources);
    fx.expect(|n| matches!(n, EngineNotification::RosterChanged)).await;

    fx.handle.select_conversation(direct("z")).await.unwrap();
    commit(&fx.bus, incoming("1", "y"));

    let handle = fx.handle.clone();
    eventually(|| {
        let handle = handle.clone();
        async move { handle.unread_total().await.unwrap() == 1 }
    })
    .await;
    let roster = fx.handle.roster().await.unwrap();
    assert_eq!(roster[0].id, UserId::new("y"));
    assert_eq!(roster[0].unread_count, 1);
    assert!(fx.handle.timeline().await.unwrap().is_empty());

    fx.handle.select_conversation(direct("y")).await.unwrap();
    assert_eq!(fx.handle.unread_total().await.unwrap(), 0);

    let reads = fx.reads.clone();
    eventually(|| {
        let reads = reads.clone();
        async move { reads.calls.lock().unwrap().contains(&UserId::new("y")) }
    })
    .await;
}

#[tokio::test]
async fn test_failed_remote_mark_read_is_sent_again() {
    let sources: Vec<Arc<dyn ContactSource>> = vec![FakeDirectory::with("volunteers", &["y"])];
    let mut fx = Fixture::start(sources);
    fx.expect(|n| matches!(n, EngineNotification::RosterChanged)).await;

    commit(&fx.bus, incoming("1", "y"));
    let handle = fx.handle.clone();
    eventually(|| {
        let handle = handle.clone();
        async move { handle.unread_total().await.unwrap() == 1 }
    })
    .await;

    fx.reads.fail_next.store(true, Ordering::SeqCst);
    fx.handle.mark_read(UserId::new("y")).await.unwrap();
    let failure = fx
        .expect(|n| matches!(n, EngineNotification::MarkReadFailed { .. }))
        .await;
    assert!(matches!(
        failure,
        EngineNotification::MarkReadFailed { ref contact, .. } if contact == &UserId::new("y")
    ));
    assert_eq!(fx.handle.unread_total().await.unwrap(), 0);

    fx.handle.mark_read(UserId::new("y")).await.unwrap();
    let reads = fx.reads.clone();
    eventually(|| {
        let reads = reads.clone();
        async move { reads.calls.lock().unwrap().len() == 2 }
    })
    .await;
    assert_eq!(
        *fx.reads.calls.lock().unwrap(),
        vec![UserId::new("y"), UserId::new("y")]
    );
}

#[tokio::test]
async fn test_subscription_retry_restores_live_updates() {
    let bus = LocalEventBus::new();
    let mut fx = Fixture::start_on(bus.clone(), Vec::new());
    fx.expect(|n| matches!(n, EngineNotification::Started)).await;

    bus.set_online(false).unwrap();
    fx.handle.select_conversation(direct("x")).await.unwrap();
    let failure = fx
        .expect(|n| matches!(n, EngineNotification::SubscriptionFailed { .. }))
        .await;
    assert!(matches!(
        failure,
        EngineNotification::SubscriptionFailed { will_retry: true, .. }
    ));

    // Published while no subscription is open; recovered by the refetch.
    fx.history.set_rows(direct("x"), vec![incoming("9", "x")]);
    bus.set_online(true).unwrap();

    fx.expect(|n| matches!(n, EngineNotification::SubscriptionRestored { .. }))
        .await;
    assert!(bus.is_subscribed(&direct("x").to_topic()));

    let handle = fx.handle.clone();
    eventually(|| {
        let handle = handle.clone();
        async move { handle.timeline().await.unwrap().len() == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_releases_every_subscription() {
    let mut fx = Fixture::start(Vec::new());
    fx.expect(|n| matches!(n, EngineNotification::Started)).await;
    fx.handle.select_conversation(direct("x")).await.unwrap();
    assert_eq!(fx.bus.active_subscriptions(), 2);

    fx.handle.shutdown().await.unwrap();
    assert_eq!(fx.bus.active_subscriptions(), 0);
    fx.expect(|n| matches!(n, EngineNotification::Closed)).await;

    assert!(fx.handle.send("late").await.is_err());
}
