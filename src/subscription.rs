//! Unsubscribe handles returned by interceptor and listener registration.

use std::fmt;

/// Handle that removes a registration when [`unsubscribe`](Self::unsubscribe)
/// is called.
///
/// Dropping the handle keeps the registration in place.
#[must_use = "dropping a Subscription keeps the registration; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(id: u64, remove: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            remove: Some(Box::new(remove)),
        }
    }

    /// Returns the registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Removes the registration.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
