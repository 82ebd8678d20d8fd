//! Per-contact unread counts and the global total.
//!
//! Purely event and action driven: counts go up from inbox deliveries
//! (see [`crate::roster`]) and down through [`UnreadCounter::mark_read`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ekklesia_shared::UserId;

#[derive(Debug, Clone, Default)]
pub struct UnreadCounter {
    counts: HashMap<UserId, u32>,
    /// Send times of the unread messages counted from live deliveries.
    arrivals: HashMap<UserId, Vec<DateTime<Utc>>>,
    total: u32,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one unread message for `contact`, sent at `at`; returns the new
    /// count.
    pub fn increment(&mut self, contact: &UserId, at: DateTime<Utc>) -> u32 {
        self.arrivals.entry(contact.clone()).or_default().push(at);
        let count = self.counts.entry(contact.clone()).or_insert(0);
        *count = count.saturating_add(1);
        self.total = self.total.saturating_add(1);
        *count
    }

    /// Zero `contact`'s count and return what it was. Calling it again
    /// returns 0 and changes nothing.
    pub fn mark_read(&mut self, contact: &UserId) -> u32 {
        let prior = self.counts.remove(contact).unwrap_or(0);
        self.arrivals.remove(contact);
        self.total = self.total.saturating_sub(prior);
        prior
    }

    pub fn count(&self, contact: &UserId) -> u32 {
        self.counts.get(contact).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Replace every count, e.g. with the figures of a full roster fetch.
    pub fn replace_all<I>(&mut self, counts: I)
    where
        I: IntoIterator<Item = (UserId, u32)>,
    {
        self.arrivals.clear();
        self.set_counts(counts.into_iter().collect());
    }

    /// Take server counts as of each contact's last summarized message.
    ///
    /// Live arrivals sent after a contact's summary are added on top of its
    /// count. Contacts with live arrivals and no summary keep those.
    pub fn rebase<I>(&mut self, summaries: I)
    where
        I: IntoIterator<Item = (UserId, u32, DateTime<Utc>)>,
    {
        let mut counts = HashMap::new();
        for (contact, unread, summarized_at) in summaries {
            let newer = match self.arrivals.get_mut(&contact) {
                Some(times) => {
                    times.retain(|at| *at > summarized_at);
                    times.len() as u32
                }
                None => 0,
            };
            counts.insert(contact, unread.saturating_add(newer));
        }
        self.arrivals.retain(|_, times| !times.is_empty());
        for (contact, times) in &self.arrivals {
            counts
                .entry(contact.clone())
                .or_insert(times.len() as u32);
        }
        self.set_counts(counts);
    }

    fn set_counts(&mut self, counts: HashMap<UserId, u32>) {
        self.counts = counts.into_iter().filter(|(_, n)| *n > 0).collect();
        self.total = self
            .counts
            .values()
            .fold(0u32, |acc, n| acc.saturating_add(*n));
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.arrivals.clear();
        self.total = 0;
    }

    pub fn counts(&self) -> &HashMap<UserId, u32> {
        &self.counts
    }
}
