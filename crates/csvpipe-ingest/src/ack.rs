//! One-shot acknowledgment tokens.
//!
//! An [`Ack`] travels with the data it acknowledges, moved from stage to stage.
//! Completing it consumes the token, so it can fire at most once. A token that
//! is dropped or [withheld](Ack::withhold) never fires, which leaves the
//! originating notification on the feed for redelivery.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::clients::{FeedError, NotificationFeed};

pub struct Ack {
    action: Option<AckAction>,
}

enum AckAction {
    Feed {
        feed: Arc<dyn NotificationFeed>,
        receipt: String,
    },
    Callback(Box<dyn FnOnce() + Send>),
    Shared(Arc<SharedAck>),
}

/// Countdown shared by the parts of a split token.
struct SharedAck {
    remaining: AtomicUsize,
    action: Mutex<Option<AckAction>>,
}

impl SharedAck {
    fn take(&self) -> Option<AckAction> {
        match self.action.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Ack {
    /// Deletes `receipt` from `feed` when completed.
    pub fn feed(feed: Arc<dyn NotificationFeed>, receipt: impl Into<String>) -> Self {
        Self::with(AckAction::Feed {
            feed,
            receipt: receipt.into(),
        })
    }

    /// Runs `f` when completed.
    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Self {
        Self::with(AckAction::Callback(Box::new(f)))
    }

    /// A token with no effect.
    pub fn noop() -> Self {
        Self::from_fn(|| {})
    }

    fn with(action: AckAction) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Splits into `parts` tokens. The underlying action fires when the last
    /// part completes, and never if any part is dropped or withheld.
    pub fn split(mut self, parts: usize) -> Vec<Ack> {
        if parts == 1 {
            return vec![self];
        }
        let Some(action) = self.action.take() else {
            return Vec::new();
        };
        if parts == 0 {
            debug!("acknowledgment split into zero parts, withholding");
            return Vec::new();
        }

        let shared = Arc::new(SharedAck {
            remaining: AtomicUsize::new(parts),
            action: Mutex::new(Some(action)),
        });
        (0..parts)
            .map(|_| Self::with(AckAction::Shared(Arc::clone(&shared))))
            .collect()
    }

    /// Performs the acknowledgment.
    pub async fn complete(mut self) -> Result<(), FeedError> {
        let mut next = self.action.take();
        while let Some(action) = next {
            next = match action {
                AckAction::Feed { feed, receipt } => {
                    feed.delete(&receipt).await?;
                    debug!(receipt = %receipt, "notification acknowledged");
                    None
                },
                AckAction::Callback(f) => {
                    f();
                    None
                },
                AckAction::Shared(shared) => {
                    if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        shared.take()
                    } else {
                        None
                    }
                },
            };
        }
        Ok(())
    }

    /// Deliberately drops the token without acknowledging.
    pub fn withhold(mut self, reason: &str) {
        if self.action.take().is_some() {
            debug!(reason, "acknowledgment withheld");
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.action {
            None => "consumed",
            Some(AckAction::Feed { .. }) => "feed",
            Some(AckAction::Callback(_)) => "callback",
            Some(AckAction::Shared(_)) => "shared",
        };
        f.debug_tuple("Ack").field(&kind).finish()
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if self.action.is_some() {
            debug!("acknowledgment dropped without completion");
        }
    }
}
