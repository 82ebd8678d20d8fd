//! Contact roster: the merged, ordered contact list shown next to the chat.
//!
//! Built from the contact directories plus per-conversation summaries on a
//! full refresh, then kept current from the personal inbox stream. The
//! roster is derived state; a full refresh can always rebuild it.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use ekklesia_shared::{ConversationKey, MessageRow, UserId};
use serde::Serialize;
use tracing::debug;

use crate::collaborators::{ContactRecord, ConversationSummary};
use crate::unread::UnreadCounter;

/// A rendered roster row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub id: UserId,
    pub display_name: String,
    pub address: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub favorite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Updated { contact: UserId, unread_incremented: bool },
    /// Already applied within the de-duplication window.
    Duplicate,
    /// Not a direct message involving this user.
    Ignored,
}

#[derive(Debug, Clone)]
struct Activity {
    preview: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RosterEntry {
    record: ContactRecord,
    activity: Option<Activity>,
}

impl RosterEntry {
    fn placeholder(id: &UserId) -> Self {
        Self {
            record: ContactRecord {
                id: id.clone(),
                display_name: id.to_string(),
                address: None,
                favorite: false,
            },
            activity: None,
        }
    }

    fn record_activity(&mut self, activity: Activity) -> bool {
        match &self.activity {
            Some(current) if current.at > activity.at => false,
            _ => {
                self.activity = Some(activity);
                true
            }
        }
    }
}

#[derive(Debug)]
pub struct Roster {
    me: UserId,
    entries: HashMap<UserId, RosterEntry>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    dedup_window: usize,
    preview_chars: usize,
}

impl Roster {
    pub fn new(me: UserId, dedup_window: usize, preview_chars: usize) -> Self {
        Self {
            me,
            entries: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            dedup_window: dedup_window.max(1),
            preview_chars,
        }
    }

    fn entry_or_placeholder(&mut self, id: &UserId) -> &mut RosterEntry {
        self.entries
            .entry(id.clone())
            .or_insert_with(|| RosterEntry::placeholder(id))
    }

    fn preview(&self, body: &str) -> String {
        let mut chars = body.chars();
        let head: String = chars.by_ref().take(self.preview_chars).collect();
        if chars.next().is_some() {
            format!("{head}…")
        } else {
            head
        }
    }

    /// Rebuild from a full fetch.
    ///
    /// `directories` holds the contact lists that were fetched successfully,
    /// in precedence order; when it is empty the known contacts are kept.
    /// `summaries` is `None` when the summary fetch failed, in which case
    /// previews and unread counts are left untouched. Live activity newer than
    /// the fetched summaries survives the rebuild, and unread messages that
    /// arrived after a contact's summary are added to its count.
    pub fn load(
        &mut self,
        directories: Vec<Vec<ContactRecord>>,
        summaries: Option<Vec<ConversationSummary>>,
        unread: &mut UnreadCounter,
    ) {
        let previous = std::mem::take(&mut self.entries);

        if directories.is_empty() {
            for (id, entry) in &previous {
                self.entries.insert(
                    id.clone(),
                    RosterEntry {
                        record: entry.record.clone(),
                        activity: None,
                    },
                );
            }
        } else {
            for record in directories.into_iter().flatten() {
                if record.id == self.me {
                    continue;
                }
                self.entries
                    .entry(record.id.clone())
                    .or_insert(RosterEntry {
                        record,
                        activity: None,
                    });
            }
        }

        if let Some(summaries) = summaries {
            let mut counts = Vec::with_capacity(summaries.len());
            for summary in summaries {
                let activity = Activity {
                    preview: self.preview(&summary.last_body),
                    at: summary.last_at,
                };
                self.entry_or_placeholder(&summary.contact_id)
                    .record_activity(activity);
                counts.push((summary.contact_id, summary.unread, summary.last_at));
            }
            unread.rebase(counts);
        }

        for (id, old) in previous {
            if let Some(activity) = old.activity {
                self.entry_or_placeholder(&id).record_activity(activity);
            }
        }

        debug!(contacts = self.entries.len(), "Roster rebuilt");
    }

    /// Apply one row from the personal inbox topic.
    ///
    /// Messages from others bump the unread count unless their conversation
    /// is the one currently open. Self-authored messages only refresh the
    /// preview.
    ///
    /// The contact moves to the front only when the row is newer than its
    /// current activity. A delayed row older than that activity still counts
    /// as unread but leaves the preview and the ordering as they are.
    pub fn apply_inbound(
        &mut self,
        row: &MessageRow,
        active: Option<&ConversationKey>,
        unread: &mut UnreadCounter,
    ) -> RosterChange {
        let Some(pair) = row.conversation_key.as_direct() else {
            return RosterChange::Ignored;
        };
        if !pair.contains(&self.me) {
            return RosterChange::Ignored;
        }
        if !self.remember(&row.id) {
            debug!(message_id = %row.id, "Duplicate inbox delivery absorbed");
            return RosterChange::Duplicate;
        }

        let peer = pair.peer_of(&self.me).clone();
        let activity = Activity {
            preview: self.preview(&row.body),
            at: row.created_at,
        };
        self.entry_or_placeholder(&peer).record_activity(activity);

        let from_peer = row.sender_id != self.me;
        let viewing = active == Some(&row.conversation_key);
        let unread_incremented = from_peer && !viewing;
        if unread_incremented {
            unread.increment(&peer, row.created_at);
        }

        RosterChange::Updated {
            contact: peer,
            unread_incremented,
        }
    }

    /// Returns `false` if the id was already seen.
    fn remember(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.seen_order.push_back(id.to_string());
        while self.seen_order.len() > self.dedup_window {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn address_of(&self, id: &UserId) -> Option<&str> {
        self.entries.get(id)?.record.address.as_deref()
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contact(&self, id: &UserId, unread: &UnreadCounter) -> Option<Contact> {
        self.entries.get(id).map(|e| to_contact(e, unread))
    }

    /// Contacts with messages first, most recent first; then the rest by
    /// display name.
    pub fn snapshot(&self, unread: &UnreadCounter) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .entries
            .values()
            .map(|e| to_contact(e, unread))
            .collect();
        contacts.sort_by(roster_order);
        contacts
    }
}

fn to_contact(entry: &RosterEntry, unread: &UnreadCounter) -> Contact {
    Contact {
        id: entry.record.id.clone(),
        display_name: entry.record.display_name.clone(),
        address: entry.record.address.clone(),
        last_message_preview: entry.activity.as_ref().map(|a| a.preview.clone()),
        last_message_at: entry.activity.as_ref().map(|a| a.at),
        unread_count: unread.count(&entry.record.id),
        favorite: entry.record.favorite,
    }
}

fn roster_order(a: &Contact, b: &Contact) -> Ordering {
    let by_name = || {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    };
    match (a.last_message_at, b.last_message_at) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(by_name),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => by_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn me() -> UserId {
        UserId::new("ana")
    }

    fn record(id: &str, name: &str) -> ContactRecord {
        ContactRecord {
            id: UserId::new(id),
            display_name: name.to_string(),
            address: Some(format!("+55-{id}")),
            favorite: false,
        }
    }

    fn inbound(id: &str, from: &str, to: &str, at: DateTime<Utc>) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            conversation_key: ConversationKey::direct(UserId::new(from), UserId::new(to)),
            sender_id: UserId::new(from),
            body: format!("msg {id}"),
            created_at: at,
            correlation_token: None,
        }
    }

    fn names(contacts: &[Contact]) -> Vec<&str> {
        contacts.iter().map(|c| c.display_name.as_str()).collect()
    }

    #[test]
    fn test_merge_first_source_wins() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();

        let volunteers = vec![record("y", "Yara (volunteer)"), record("z", "Zeca")];
        let mut staff_y = record("y", "Yara (staff)");
        staff_y.address = None;
        let staff = vec![staff_y, record("p", "Pastor Paulo"), record("ana", "Me")];

        roster.load(vec![volunteers, staff], None, &mut unread);

        assert_eq!(roster.len(), 3);
        let y = roster.contact(&UserId::new("y"), &unread).unwrap();
        assert_eq!(y.display_name, "Yara (volunteer)");
        assert_eq!(y.address.as_deref(), Some("+55-y"));
        assert!(!roster.contains(&me()));
    }

    #[test]
    fn test_ordering_messages_then_alphabetical() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();
        let t0 = Utc::now();

        let summaries = vec![
            ConversationSummary {
                contact_id: UserId::new("z"),
                last_body: "old".into(),
                last_at: t0,
                unread: 0,
            },
            ConversationSummary {
                contact_id: UserId::new("y"),
                last_body: "new".into(),
                last_at: t0 + Duration::seconds(10),
                unread: 2,
            },
        ];
        roster.load(
            vec![vec![
                record("z", "Zeca"),
                record("y", "Yara"),
                record("b", "beto"),
                record("a", "Alice"),
            ]],
            Some(summaries),
            &mut unread,
        );

        let snapshot = roster.snapshot(&unread);
        assert_eq!(names(&snapshot), vec!["Yara", "Zeca", "Alice", "beto"]);
        assert_eq!(snapshot[0].unread_count, 2);
        assert_eq!(unread.total(), 2);
    }

    #[test]
    fn test_inbound_from_other_contact_bumps_unread_and_moves_to_top() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();
        let t0 = Utc::now();
        roster.load(vec![vec![record("y", "Yara"), record("z", "Zeca")]], None, &mut unread);

        let viewing_z = ConversationKey::direct(me(), UserId::new("z"));
        roster.apply_inbound(&inbound("1", "z", "ana", t0), Some(&viewing_z), &mut unread);
        let change = roster.apply_inbound(&inbound("2", "y", "ana", t0 + Duration::seconds(1)), Some(&viewing_z), &mut unread);

        assert_eq!(
            change,
            RosterChange::Updated {
                contact: UserId::new("y"),
                unread_incremented: true
            }
        );
        let snapshot = roster.snapshot(&unread);
        assert_eq!(names(&snapshot), vec!["Yara", "Zeca"]);
        assert_eq!(snapshot[0].unread_count, 1);
        assert_eq!(snapshot[1].unread_count, 0);
        assert_eq!(snapshot[0].last_message_preview.as_deref(), Some("msg 2"));
    }

    #[test]
    fn test_own_message_never_counts_as_unread() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();
        let change = roster.apply_inbound(&inbound("1", "ana", "y", Utc::now()), None, &mut unread);

        assert_eq!(
            change,
            RosterChange::Updated {
                contact: UserId::new("y"),
                unread_incremented: false
            }
        );
        assert_eq!(unread.total(), 0);
        let y = roster.contact(&UserId::new("y"), &unread).unwrap();
        assert_eq!(y.display_name, "y");
        assert_eq!(y.last_message_preview.as_deref(), Some("msg 1"));
    }

    #[test]
    fn test_redelivery_within_window_is_absorbed() {
        let mut roster = Roster::new(me(), 2, 40);
        let mut unread = UnreadCounter::new();
        let t0 = Utc::now();
        let first = inbound("1", "y", "ana", t0);

        roster.apply_inbound(&first, None, &mut unread);
        assert_eq!(roster.apply_inbound(&first, None, &mut unread), RosterChange::Duplicate);
        assert_eq!(unread.total(), 1);

        roster.apply_inbound(&inbound("2", "y", "ana", t0), None, &mut unread);
        roster.apply_inbound(&inbound("3", "y", "ana", t0), None, &mut unread);
        // "1" fell out of the window.
        assert!(matches!(
            roster.apply_inbound(&first, None, &mut unread),
            RosterChange::Updated { .. }
        ));
    }

    #[test]
    fn test_delayed_event_does_not_roll_back_preview() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();
        let t0 = Utc::now();

        roster.apply_inbound(&inbound("2", "y", "ana", t0 + Duration::seconds(5)), None, &mut unread);
        roster.apply_inbound(&inbound("1", "y", "ana", t0), None, &mut unread);

        let y = roster.contact(&UserId::new("y"), &unread).unwrap();
        assert_eq!(y.last_message_preview.as_deref(), Some("msg 2"));
        assert_eq!(y.unread_count, 2);
    }

    #[test]
    fn test_ignores_group_and_foreign_rows() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();

        let mut group_row = inbound("1", "y", "ana", Utc::now());
        group_row.conversation_key = ConversationKey::group("choir");
        assert_eq!(roster.apply_inbound(&group_row, None, &mut unread), RosterChange::Ignored);

        let foreign = inbound("2", "y", "z", Utc::now());
        assert_eq!(roster.apply_inbound(&foreign, None, &mut unread), RosterChange::Ignored);
        assert!(roster.is_empty());
    }

    #[test]
    fn test_reload_keeps_newer_live_activity_and_known_contacts_on_failure() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();
        let t0 = Utc::now();
        roster.load(vec![vec![record("y", "Yara")]], None, &mut unread);
        roster.apply_inbound(&inbound("9", "y", "ana", t0 + Duration::seconds(30)), None, &mut unread);

        let stale = vec![ConversationSummary {
            contact_id: UserId::new("y"),
            last_body: "older".into(),
            last_at: t0,
            unread: 4,
        }];
        roster.load(Vec::new(), Some(stale), &mut unread);

        let y = roster.contact(&UserId::new("y"), &unread).unwrap();
        assert_eq!(y.display_name, "Yara");
        assert_eq!(y.last_message_preview.as_deref(), Some("msg 9"));
        assert_eq!(y.unread_count, 5);
    }

    #[test]
    fn test_reload_racing_inbox_keeps_new_unread() {
        let mut roster = Roster::new(me(), 16, 40);
        let mut unread = UnreadCounter::new();
        let t0 = Utc::now();
        roster.load(vec![vec![record("y", "Yara")]], None, &mut unread);
        roster.apply_inbound(&inbound("2", "y", "ana", t0 + Duration::seconds(5)), None, &mut unread);

        let summaries = vec![ConversationSummary {
            contact_id: UserId::new("y"),
            last_body: "msg 1".into(),
            last_at: t0,
            unread: 0,
        }];
        roster.load(vec![vec![record("y", "Yara")]], Some(summaries), &mut unread);

        let y = roster.contact(&UserId::new("y"), &unread).unwrap();
        assert_eq!(y.last_message_preview.as_deref(), Some("msg 2"));
        assert_eq!(y.unread_count, 1);
        assert_eq!(unread.total(), 1);

        // A summary that already includes the message takes over.
        let caught_up = vec![ConversationSummary {
            contact_id: UserId::new("y"),
            last_body: "msg 2".into(),
            last_at: t0 + Duration::seconds(5),
            unread: 1,
        }];
        roster.load(Vec::new(), Some(caught_up), &mut unread);
        assert_eq!(unread.total(), 1);
    }

    #[test]
    fn test_preview_truncated_on_char_boundary() {
        let roster = Roster::new(me(), 16, 3);
        assert_eq!(roster.preview("Olá"), "Olá");
        assert_eq!(roster.preview("Olá, irmãos"), "Olá…");
    }
}
