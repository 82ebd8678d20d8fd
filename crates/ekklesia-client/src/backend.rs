//! Local stand-in for the managed backend.
//!
//! Serves history, summaries, directories and read markers from the SQLite
//! store, and commits dispatched messages the way the hosted backend does:
//! insert with a permanent id, then fan the row out on the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use ekklesia_bus::LocalEventBus;
use ekklesia_shared::{ConversationKey, GroupId, InboundEvent, MessageRow, UserId};
use ekklesia_store::{Database, Directory, DirectoryEntry, Group, StoreError};
use ekklesia_sync::{
    Collaborators, ContactRecord, ContactSource, ConversationSummary, DispatchOutcome,
    DispatchRequest, HistorySource, MessageDispatcher, ReadMarkerSink, SourceError,
};
use futures::future::{self, BoxFuture, FutureExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages returned by one history fetch.
const HISTORY_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct Backend {
    db: Arc<Mutex<Database>>,
    bus: LocalEventBus,
    fail_next: Arc<AtomicBool>,
}

impl Backend {
    pub fn new(db: Database, bus: LocalEventBus) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            bus,
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, SourceError> {
        let db = self
            .db
            .lock()
            .map_err(|_| SourceError::new("database lock poisoned"))?;
        f(&db).map_err(|e| SourceError::new(e.to_string()))
    }

    /// Every collaborator the engine needs, backed by this store.
    pub fn collaborators(&self) -> Collaborators {
        let me = Arc::new(self.clone());
        let volunteers: Arc<dyn ContactSource> = Arc::new(DirectorySource {
            backend: self.clone(),
            directory: Directory::Volunteers,
        });
        let staff: Arc<dyn ContactSource> = Arc::new(DirectorySource {
            backend: self.clone(),
            directory: Directory::Staff,
        });
        Collaborators {
            dispatcher: me.clone(),
            history: me.clone(),
            // Volunteers first: their display fields win on duplicates.
            contact_sources: vec![volunteers, staff],
            read_markers: me,
        }
    }

    /// Make the next dispatch fail, to exercise the retry path.
    pub fn fail_next_dispatch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn bus(&self) -> &LocalEventBus {
        &self.bus
    }

    /// Persist a row and publish it on every topic that carries it.
    /// Returns `false` if the row was already stored.
    pub fn commit(&self, row: MessageRow) -> Result<bool, SourceError> {
        let inserted = self.with_db(|db| db.insert_message(&row))?;
        if !inserted {
            debug!(message_id = %row.id, "Row already committed");
            return Ok(false);
        }

        let event = InboundEvent::insert(row);
        let mut topics = vec![event.conversation_key().to_topic()];
        if let Some(pair) = event.conversation_key().as_direct() {
            let (a, b) = pair.participants();
            topics.push(a.inbox_topic());
            if a != b {
                topics.push(b.inbox_topic());
            }
        }
        for topic in topics {
            if let Err(e) = self.bus.publish(&topic, event.clone()) {
                warn!(topic = %topic, error = %e, "Publishing committed row failed");
            }
        }
        Ok(true)
    }

    /// Commit a message from `from` to `to` as if sent from another device.
    pub fn inject(&self, from: UserId, to: UserId, body: &str) -> Result<String, SourceError> {
        let row = MessageRow {
            id: new_permanent_id(),
            conversation_key: ConversationKey::direct(from.clone(), to),
            sender_id: from,
            body: body.to_string(),
            created_at: Utc::now(),
            correlation_token: None,
        };
        let id = row.id.clone();
        self.commit(row)?;
        Ok(id)
    }

    pub fn group_info(&self, id: &GroupId) -> Result<(Group, Vec<UserId>), SourceError> {
        self.with_db(|db| Ok((db.get_group(id)?, db.group_members(id)?)))
    }
}

fn new_permanent_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl MessageDispatcher for Backend {
    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'static, DispatchOutcome> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return future::ready(DispatchOutcome::Failed {
                reason: "delivery provider rejected the message".into(),
            })
            .boxed();
        }
        if request.recipient_address.trim().is_empty() {
            return future::ready(DispatchOutcome::Failed {
                reason: "recipient has no address".into(),
            })
            .boxed();
        }

        let backend = self.clone();
        async move {
            info!(
                recipient = %request.recipient_address,
                token = %request.correlation_token,
                "Dispatching message"
            );
            let row = MessageRow {
                id: new_permanent_id(),
                conversation_key: request.conversation_key,
                sender_id: request.sender_id,
                body: request.body,
                created_at: Utc::now(),
                correlation_token: Some(request.correlation_token),
            };
            match backend.commit(row) {
                Ok(_) => DispatchOutcome::Delivered,
                Err(e) => DispatchOutcome::Failed {
                    reason: e.to_string(),
                },
            }
        }
        .boxed()
    }
}

impl HistorySource for Backend {
    fn fetch_history(
        &self,
        key: ConversationKey,
    ) -> BoxFuture<'static, Result<Vec<MessageRow>, SourceError>> {
        let backend = self.clone();
        async move { backend.with_db(|db| db.messages_for_conversation(&key, HISTORY_LIMIT)) }.boxed()
    }

    fn fetch_summaries(
        &self,
        me: UserId,
    ) -> BoxFuture<'static, Result<Vec<ConversationSummary>, SourceError>> {
        let backend = self.clone();
        async move {
            let rows = backend.with_db(|db| db.conversation_summaries(&me))?;
            Ok(rows
                .into_iter()
                .map(|row| ConversationSummary {
                    contact_id: row.peer,
                    last_body: row.last_body,
                    last_at: row.last_at,
                    unread: row.unread,
                })
                .collect())
        }
        .boxed()
    }
}

impl ReadMarkerSink for Backend {
    fn mark_read_remote(
        &self,
        me: UserId,
        contact: UserId,
    ) -> BoxFuture<'static, Result<(), SourceError>> {
        let backend = self.clone();
        async move { backend.with_db(|db| db.mark_read(&me, &contact, Utc::now())) }.boxed()
    }
}

/// One directory table exposed as a contact source.
struct DirectorySource {
    backend: Backend,
    directory: Directory,
}

impl ContactSource for DirectorySource {
    fn name(&self) -> &str {
        self.directory.name()
    }

    fn fetch_contacts(&self) -> BoxFuture<'static, Result<Vec<ContactRecord>, SourceError>> {
        let backend = self.backend.clone();
        let directory = self.directory;
        async move {
            let entries = backend.with_db(|db| db.list_contacts(directory))?;
            Ok(entries
                .into_iter()
                .map(|entry| ContactRecord {
                    id: entry.user_id,
                    display_name: entry.display_name,
                    address: entry.address,
                    favorite: entry.favorite,
                })
                .collect())
        }
        .boxed()
    }
}

/// Populate an empty database with a small congregation.
pub fn seed_demo(db: &Database, me: &UserId) -> Result<(), StoreError> {
    if !db.list_contacts(Directory::Volunteers)?.is_empty() {
        return Ok(());
    }
    let now = Utc::now();

    let entry = |id: &str, name: &str, address: &str, favorite: bool| DirectoryEntry {
        user_id: UserId::new(id),
        display_name: name.to_string(),
        address: Some(address.to_string()),
        favorite,
        created_at: now,
    };

    for volunteer in [
        entry("bruno", "Bruno Lima", "+5511900000001", true),
        entry("carla", "Carla Souza", "+5511900000002", false),
        entry("davi", "Davi Rocha", "+5511900000003", false),
    ] {
        db.upsert_contact(Directory::Volunteers, &volunteer)?;
    }
    for staff in [
        entry("carla", "Pra. Carla Souza", "+5511900000099", false),
        entry("paulo", "Pr. Paulo", "+5511900000010", true),
    ] {
        db.upsert_contact(Directory::Staff, &staff)?;
    }

    let group = Group {
        id: GroupId::new("louvor"),
        name: "Ministério de Louvor".to_string(),
        created_at: now,
    };
    db.create_group(
        &group,
        &[me.clone(), UserId::new("bruno"), UserId::new("carla")],
    )?;

    let history = [
        ("bruno", me.as_str(), "Bom dia! Confirmado para domingo?", 30),
        (me.as_str(), "bruno", "Sim, estarei lá às 8h.", 25),
        ("paulo", me.as_str(), "Reunião de líderes na quarta.", 10),
    ];
    for (from, to, body, minutes_ago) in history {
        db.insert_message(&MessageRow {
            id: new_permanent_id(),
            conversation_key: ConversationKey::direct(UserId::new(from), UserId::new(to)),
            sender_id: UserId::new(from),
            body: body.to_string(),
            created_at: now - Duration::minutes(minutes_ago),
            correlation_token: None,
        })?;
    }

    info!("Seeded demo data");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekklesia_bus::EventBus;
    use tokio::sync::mpsc;

    fn backend() -> Backend {
        let db = Database::open_in_memory().unwrap();
        seed_demo(&db, &UserId::new("ana")).unwrap();
        Backend::new(db, LocalEventBus::new())
    }

    #[tokio::test]
    async fn test_dispatch_commits_and_echoes_with_token() {
        let backend = backend();
        let key = ConversationKey::direct(UserId::new("ana"), UserId::new("bruno"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conv = backend.bus().subscribe(key.to_topic(), tx.clone()).unwrap();
        let _inbox = backend
            .bus()
            .subscribe(UserId::new("ana").inbox_topic(), tx)
            .unwrap();

        let token = Uuid::new_v4();
        let outcome = backend
            .dispatch(DispatchRequest {
                correlation_token: token,
                conversation_key: key.clone(),
                sender_id: UserId::new("ana"),
                recipient_address: "+5511900000001".into(),
                body: "Oi".into(),
            })
            .await;
        assert_eq!(outcome, DispatchOutcome::Delivered);

        let deliveries: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries
            .iter()
            .all(|d| d.event.row().correlation_token == Some(token)));

        let history = backend.fetch_history(key).await.unwrap();
        assert_eq!(history.last().map(|r| r.body.as_str()), Some("Oi"));
    }

    #[tokio::test]
    async fn test_forced_failure_applies_once() {
        let backend = backend();
        backend.fail_next_dispatch();
        let request = DispatchRequest {
            correlation_token: Uuid::new_v4(),
            conversation_key: ConversationKey::group("louvor"),
            sender_id: UserId::new("ana"),
            recipient_address: "louvor".into(),
            body: "Ensaio hoje".into(),
        };

        assert!(matches!(
            backend.dispatch(request.clone()).await,
            DispatchOutcome::Failed { .. }
        ));
        assert_eq!(backend.dispatch(request).await, DispatchOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_directories_and_summaries() {
        let backend = backend();
        let sources = backend.collaborators().contact_sources;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name(), "volunteers");

        let volunteers = sources[0].fetch_contacts().await.unwrap();
        assert_eq!(volunteers.len(), 3);
        let staff = sources[1].fetch_contacts().await.unwrap();
        assert!(staff.iter().any(|c| c.id == UserId::new("paulo")));

        let summaries = backend.fetch_summaries(UserId::new("ana")).await.unwrap();
        let paulo = summaries
            .iter()
            .find(|s| s.contact_id == UserId::new("paulo"))
            .unwrap();
        assert_eq!(paulo.unread, 1);

        backend
            .mark_read_remote(UserId::new("ana"), UserId::new("paulo"))
            .await
            .unwrap();
        let summaries = backend.fetch_summaries(UserId::new("ana")).await.unwrap();
        let paulo = summaries
            .iter()
            .find(|s| s.contact_id == UserId::new("paulo"))
            .unwrap();
        assert_eq!(paulo.unread, 0);
    }

    #[test]
    fn test_group_info() {
        let backend = backend();
        let (group, members) = backend.group_info(&GroupId::new("louvor")).unwrap();
        assert_eq!(group.name, "Ministério de Louvor");
        assert_eq!(members.len(), 3);
        assert!(backend.group_info(&GroupId::new("nope")).is_err());
    }

    #[test]
    fn test_seed_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        seed_demo(&db, &UserId::new("ana")).unwrap();
        seed_demo(&db, &UserId::new("ana")).unwrap();
        assert_eq!(db.list_contacts(Directory::Volunteers).unwrap().len(), 3);
    }
}
