// SPDX-License-Identifier: Apache-2.0
//! Multi-shot notification subscriptions.
//!
//! Some providers deliver values repeatedly through one registered callback
//! (value-changed notifications, interest notifications). A [`Subscription`]
//! hands the provider a token and the shared trampoline; every firing is
//! forwarded to the subscriber's receiver as a [`Notification`] until the
//! subscription is dropped. Firings that arrive after that are counted as
//! protocol violations, like duplicate completions on the bridge.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::bridge;
use crate::ffi::CompletionCallback;

/// One native firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub status: c_int,
    pub args: Vec<usize>,
}

enum Entry {
    Live {
        sender: mpsc::Sender<Notification>,
        stats: Arc<HubStats>,
    },
    Closed(Arc<HubStats>),
}

static SUBSCRIPTIONS: LazyLock<Mutex<FxHashMap<usize, Entry>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

fn subscriptions() -> MutexGuard<'static, FxHashMap<usize, Entry>> {
    SUBSCRIPTIONS.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HubStats {
    name: String,
    delivered: AtomicU64,
    lagged: AtomicU64,
    violations: AtomicU64,
    closed: AtomicBool,
    tombstones: Mutex<VecDeque<usize>>,
}

impl HubStats {
    /// Remember `token` as unsubscribed, evicting the oldest tombstone once
    /// the window is full. Called with the registry locked.
    fn bury(self: &Arc<Self>, token: usize, entries: &mut FxHashMap<usize, Entry>) {
        let mut tombstones = self.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        tombstones.push_back(token);
        entries.insert(token, Entry::Closed(Arc::clone(self)));
        if tombstones.len() > bridge::TOMBSTONE_WINDOW {
            if let Some(oldest) = tombstones.pop_front() {
                entries.remove(&oldest);
            }
        }
    }
}

unsafe extern "C" fn notification_trampoline(
    context: *mut c_void,
    status: c_int,
    args: *const usize,
    num_args: u32,
) {
    let args = if args.is_null() || num_args == 0 {
        Vec::new()
    } else {
        // SAFETY: the provider passes `num_args` readable words.
        unsafe { std::slice::from_raw_parts(args, num_args as usize) }.to_vec()
    };
    deliver(context as usize, Notification { status, args });
}

fn deliver(token: usize, notification: Notification) {
    let entries = subscriptions();
    match entries.get(&token) {
        Some(Entry::Live { sender, stats }) => match sender.try_send(notification) {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                stats.lagged.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("subscriber {token:#x} on '{}' is lagging; notification dropped", stats.name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("subscriber {token:#x} on '{}' stopped listening", stats.name);
            }
        },
        Some(Entry::Closed(stats)) => {
            stats.violations.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "protocol violation on '{}': notification for unsubscribed token {token:#x}; dropped",
                stats.name
            );
        }
        None => {
            bridge::note_unattributed();
            tracing::warn!("protocol violation: notification for unknown token {token:#x}; dropped");
        }
    }
}

/// Issues subscriptions and keeps their counters.
pub struct NotificationHub {
    stats: Arc<HubStats>,
}

impl NotificationHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            stats: Arc::new(HubStats {
                name: name.into(),
                delivered: AtomicU64::new(0),
                lagged: AtomicU64::new(0),
                violations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                tombstones: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Register a subscriber that buffers up to `capacity` notifications
    /// (at least one). Firings beyond that are dropped and counted as lagged.
    pub fn subscribe(&self, capacity: usize) -> (Subscription, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let token = bridge::next_token();
        subscriptions().insert(
            token,
            Entry::Live {
                sender,
                stats: Arc::clone(&self.stats),
            },
        );
        tracing::debug!("'{}' subscription {token:#x} opened", self.stats.name);
        (
            Subscription {
                token,
                stats: Arc::clone(&self.stats),
            },
            receiver,
        )
    }

    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn lagged(&self) -> u64 {
        self.stats.lagged.load(Ordering::Relaxed)
    }

    pub fn protocol_violations(&self) -> u64 {
        self.stats.violations.load(Ordering::Relaxed)
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.stats.closed.store(true, Ordering::Release);
        let mut entries = subscriptions();
        let mut tombstones = self.stats.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        for token in tombstones.drain(..) {
            entries.remove(&token);
        }
    }
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("name", &self.stats.name)
            .field("delivered", &self.delivered())
            .field("lagged", &self.lagged())
            .field("protocol_violations", &self.protocol_violations())
            .finish()
    }
}

/// A registered callback. Hand [`Subscription::callback`] and
/// [`Subscription::context`] to the provider; dropping the subscription
/// unsubscribes.
pub struct Subscription {
    token: usize,
    stats: Arc<HubStats>,
}

impl Subscription {
    pub fn callback(&self) -> CompletionCallback {
        notification_trampoline
    }

    pub fn context(&self) -> *mut c_void {
        self.token as *mut c_void
    }

    pub fn token(&self) -> usize {
        self.token
    }

    /// Stop forwarding. Later firings for this token are protocol violations.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut entries = subscriptions();
        if self.stats.closed.load(Ordering::Acquire) {
            entries.remove(&self.token);
        } else {
            self.stats.bury(self.token, &mut entries);
        }
        tracing::debug!("'{}' subscription {:#x} closed", self.stats.name, self.token);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("hub", &self.stats.name)
            .field("token", &format_args!("{:#x}", self.token))
            .finish()
    }
}
