//! Key action subscriptions

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{key_part, KeyAction};

/// Receives key actions emitted by the router.
pub trait KeyListener: Send + Sync {
    /// Handle one action. An error is logged by the router and does not stop
    /// delivery to other listeners or the backend.
    fn dispatch(&self, action: KeyAction, code: u32) -> anyhow::Result<()>;
}

/// Which codes a subscription wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFilter {
    /// Every action
    All,
    /// Actions whose output code (without modifiers) equals this value
    Code(u16),
}

/// Listeners keyed by filter. A listener may subscribe to several filters.
#[derive(Default)]
pub struct NotificationRegistry {
    wildcard: Vec<Arc<dyn KeyListener>>,
    by_code: HashMap<u16, Vec<Arc<dyn KeyListener>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener`. Returns `false` if it already holds this filter.
    pub fn register(&mut self, listener: Arc<dyn KeyListener>, filter: KeyFilter) -> bool {
        let list = match filter {
            KeyFilter::All => &mut self.wildcard,
            KeyFilter::Code(code) => self.by_code.entry(code).or_default(),
        };

        if list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        list.push(listener);
        true
    }

    /// Drop the subscription of `listener` for `filter`. Returns whether one
    /// existed.
    pub fn unregister(&mut self, listener: &Arc<dyn KeyListener>, filter: KeyFilter) -> bool {
        match filter {
            KeyFilter::All => remove_listener(&mut self.wildcard, listener),
            KeyFilter::Code(code) => match self.by_code.get_mut(&code) {
                Some(list) => {
                    let removed = remove_listener(list, listener);
                    if list.is_empty() {
                        self.by_code.remove(&code);
                    }
                    removed
                }
                None => false,
            },
        }
    }

    /// Listeners for `code` in delivery order: code-specific first, then
    /// wildcard.
    pub fn listeners_for(&self, code: u32) -> Vec<Arc<dyn KeyListener>> {
        let specific = self.by_code.get(&key_part(code)).into_iter().flatten();
        specific.chain(self.wildcard.iter()).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.by_code.is_empty()
    }
}

fn remove_listener(list: &mut Vec<Arc<dyn KeyListener>>, listener: &Arc<dyn KeyListener>) -> bool {
    let before = list.len();
    list.retain(|l| !Arc::ptr_eq(l, listener));
    list.len() != before
}
