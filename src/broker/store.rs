//! Message store
//!
//! Every published message lives here exactly once, whatever the number of
//! queues it was routed to. Queues hold `Arc<Message>` references and the
//! store counts how many queues still need each message; the entry goes away
//! when the last one releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::broker::message::{Message, MessageId};
use crate::utils::sync::lock;

#[derive(Debug)]
struct StoreEntry {
    message: Arc<Message>,
    refs: usize,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Mutex<HashMap<MessageId, StoreEntry>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `refs` references to `message`, inserting it if it is new.
    pub fn retain(&self, message: &Arc<Message>, refs: usize) {
        if refs == 0 {
            return;
        }
        let mut entries = lock(&self.entries);
        entries
            .entry(message.id)
            .and_modify(|e| e.refs += refs)
            .or_insert_with(|| StoreEntry {
                message: message.clone(),
                refs,
            });
    }

    /// Drop one reference. Returns the message when that was the last one.
    pub fn release(&self, id: &MessageId) -> Option<Arc<Message>> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(id)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            return entries.remove(id).map(|e| e.message);
        }
        None
    }

    pub fn get(&self, id: &MessageId) -> Option<Arc<Message>> {
        lock(&self.entries).get(id).map(|e| e.message.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}
