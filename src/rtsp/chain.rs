//! Insertion-ordered match-handler chain.
//!
//! Handlers run in registration order for every unsolicited message until
//! one reports `Handled`. A handler can remove itself from inside the
//! dispatch via its return value, and the owner can remove any handler
//! between dispatches; removal never invalidates a running iteration
//! because entries are only swept once dispatch completes.

use crate::rtsp::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Not interested; try the next handler.
    Pass,
    /// Consumed; stop the chain.
    Handled,
    /// Not interested, and unregister this handler.
    PassRemove,
    /// Consumed; stop the chain and unregister this handler.
    HandledRemove,
}

/// Handler signature: the context is whatever state the owning loop
/// threads through (session, manager). `None` is the HUP notification.
pub type MatchFn<T> = fn(&mut T, Option<&Message>) -> MatchResult;

struct Entry<T> {
    id: u64,
    f: MatchFn<T>,
    removed: bool,
}

pub struct MatchChain<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> Default for MatchChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MatchChain<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, f: MatchFn<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            f,
            removed: false,
        });
        id
    }

    pub fn remove(&mut self, id: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.removed = true;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.removed).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the chain; returns true when some handler consumed the message.
    pub fn dispatch(&mut self, ctx: &mut T, msg: Option<&Message>) -> bool {
        let mut handled = false;

        for i in 0..self.entries.len() {
            if self.entries[i].removed {
                continue;
            }
            let f = self.entries[i].f;
            match f(ctx, msg) {
                MatchResult::Pass => {}
                MatchResult::Handled => {
                    handled = true;
                    break;
                }
                MatchResult::PassRemove => self.entries[i].removed = true,
                MatchResult::HandledRemove => {
                    self.entries[i].removed = true;
                    handled = true;
                    break;
                }
            }
        }

        self.entries.retain(|e| !e.removed);
        handled
    }
}
