//! Single-slot mailbox used for every cross-session notice.
//!
//! A message is published to a snapshot of recipients and stays Active until
//! each of them has consumed it, so notices are totally ordered across the
//! server: nothing new can be published while one is still draining.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;
use tracing::warn;

use crate::outbox::Outbox;
use crate::outbox::OutboxClosed;
use crate::registry::SessionRegistry;
use crate::session_id::SessionId;

pub type MessageId = u64;

/// Who a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every registered session, the sender included.
    All,
    /// A single session (`tell`).
    One(SessionId),
}

#[derive(Debug)]
struct Message {
    id: MessageId,
    sender: SessionId,
    text: String,
    is_exit: bool,
}

#[derive(Debug)]
enum State {
    Idle,
    Publishing,
    Active {
        message: Arc<Message>,
        // Recipients that have not consumed yet; its size is the countdown.
        pending: BTreeSet<SessionId>,
    },
}

#[derive(Debug)]
struct Inner {
    state: State,
    next_id: MessageId,
}

/// Outcome of a successful [`Mailbox::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    pub id: MessageId,
    /// The message was this session's own leave notice.
    pub own_exit: bool,
}

#[derive(Debug)]
pub struct Mailbox {
    inner: Mutex<Inner>,
    idle: Notify,
    stall_timeout: Duration,
}

impl Mailbox {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Idle,
                next_id: 1,
            }),
            idle: Notify::new(),
            stall_timeout,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `text` to `audience` and wake each recipient. Waits while a
    /// previous message is Active. Returns `None` when nobody is addressed.
    pub async fn publish(
        &self,
        sessions: &SessionRegistry,
        sender: SessionId,
        text: String,
        audience: Audience,
        is_exit: bool,
    ) -> Option<MessageId> {
        self.claim().await;

        let only = match audience {
            Audience::All => None,
            Audience::One(id) => Some(id),
        };
        let recipients = sessions.recipients(only);

        let id = {
            let mut inner = self.inner();
            if recipients.is_empty() {
                inner.state = State::Idle;
                None
            } else {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.state = State::Active {
                    message: Arc::new(Message {
                        id,
                        sender,
                        text,
                        is_exit,
                    }),
                    pending: recipients.iter().map(|(id, _)| *id).collect(),
                };
                Some(id)
            }
        };

        let Some(id) = id else {
            self.idle.notify_waiters();
            return None;
        };
        debug!(
            message = id,
            %sender,
            recipients = recipients.len(),
            is_exit,
            "mailbox message active"
        );
        for (_, wake) in recipients {
            wake.notify_one();
        }
        Some(id)
    }

    /// Move Idle -> Publishing, waiting for the current message to drain.
    async fn claim(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let stalled = {
                let mut inner = self.inner();
                if matches!(inner.state, State::Idle) {
                    inner.state = State::Publishing;
                    return;
                }
                match &inner.state {
                    State::Active { message, .. } => Some(message.id),
                    _ => None,
                }
            };

            let timed_out = tokio::time::timeout(self.stall_timeout, notified)
                .await
                .is_err();
            if timed_out {
                if let Some(id) = stalled {
                    self.reset_stalled(id);
                }
            }
        }
    }

    /// Deliver the Active message to `me` if `me` is still a pending
    /// recipient. The text is queued on `outbox` before the countdown is
    /// decremented, so once a message has drained every copy is queued.
    pub async fn consume(
        &self,
        me: SessionId,
        outbox: &Outbox,
    ) -> Result<Option<Consumed>, OutboxClosed> {
        let message = {
            let inner = self.inner();
            match &inner.state {
                State::Active { message, pending } if pending.contains(&me) => {
                    Arc::clone(message)
                }
                _ => return Ok(None),
            }
        };

        let written = outbox.send_text(message.text.clone()).await;
        self.acknowledge(me, message.id);
        written?;

        Ok(Some(Consumed {
            id: message.id,
            own_exit: message.is_exit && message.sender == me,
        }))
    }

    fn acknowledge(&self, me: SessionId, id: MessageId) {
        let drained = {
            let mut inner = self.inner();
            let drained = match &mut inner.state {
                State::Active { message, pending } if message.id == id => {
                    pending.remove(&me);
                    pending.is_empty()
                }
                _ => false,
            };
            if drained {
                inner.state = State::Idle;
            }
            drained
        };
        if drained {
            debug!(message = id, "mailbox message drained");
            self.idle.notify_waiters();
        }
    }

    /// Drop `me` from the Active message's recipients without delivering.
    /// Used when a session's consumer stops for good.
    pub fn forget(&self, me: SessionId) {
        let id = match &self.inner().state {
            State::Active { message, .. } => message.id,
            _ => return,
        };
        self.acknowledge(me, id);
    }

    pub fn is_active(&self, id: MessageId) -> bool {
        matches!(&self.inner().state, State::Active { message, .. } if message.id == id)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.inner().state, State::Idle)
    }

    /// Wait until message `id` has been consumed by every recipient.
    pub async fn wait_drained(&self, id: MessageId) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_active(id) {
                return;
            }
            if tokio::time::timeout(self.stall_timeout, notified)
                .await
                .is_err()
            {
                self.reset_stalled(id);
            }
        }
    }

    fn reset_stalled(&self, id: MessageId) {
        let reset = {
            let mut inner = self.inner();
            let reset = match &inner.state {
                State::Active { message, pending } if message.id == id => {
                    warn!(
                        message = id,
                        stuck = ?pending,
                        "mailbox message did not drain in time; resetting"
                    );
                    true
                }
                _ => false,
            };
            if reset {
                inner.state = State::Idle;
            }
            reset
        };
        if reset {
            self.idle.notify_waiters();
        }
    }
}
