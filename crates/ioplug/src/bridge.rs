// SPDX-License-Identifier: Apache-2.0
//! Completion bridging.
//!
//! Providers finish long-running operations by calling a C callback with the
//! opaque context they were given at submission. [`AsyncCompletionBridge`]
//! turns that protocol into a [`PendingCompletion`] which resolves exactly
//! once:
//!
//! ```text
//!  submit ──▶ token registered ──▶ provider call ──▶ … ──▶ callback(token, status, args)
//!               │ owns buffer                                  │
//!               └──────────────── removed, buffer moved ◀──────┘
//!                                 into the resolution
//! ```
//!
//! The context handed to the provider is a token, not a pointer, so a
//! provider that fires twice hits a tombstone instead of freed memory. The
//! second firing is logged as a protocol violation and counted; callers
//! never see it.
//!
//! Buffers passed with a submission are owned by the registry until the
//! callback fires, whether or not the caller still holds the future. Their
//! heap address never changes while the provider may touch them.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::config::ProviderConfig;
use crate::error::{NegotiationError, Result};
use crate::ffi::{self, CompletionCallback};

/// Resolved tokens remembered per bridge for duplicate detection.
pub(crate) const TOMBSTONE_WINDOW: usize = 1024;

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Heap memory lent to the provider for the duration of one operation.
pub struct OwnedBuffer {
    data: Box<[u8]>,
    on_reclaim: Option<Box<dyn FnOnce() + Send>>,
}

impl OwnedBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
            on_reclaim: None,
        }
    }

    /// Run `hook` when the buffer's memory is reclaimed, e.g. to return it
    /// to a pool.
    pub fn on_reclaim(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_reclaim = Some(Box::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data).into_vec()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if let Some(hook) = self.on_reclaim.take() {
            hook();
        }
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("len", &self.data.len())
            .field("addr", &self.data.as_ptr())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Typed results
// ---------------------------------------------------------------------------

/// Conversion from the machine words a completion callback delivers.
pub trait FromCompletionArgs: Sized {
    /// `None` when the words do not carry a `Self`.
    fn from_args(args: &[usize]) -> Option<Self>;
}

impl FromCompletionArgs for () {
    fn from_args(_args: &[usize]) -> Option<Self> {
        Some(())
    }
}

impl FromCompletionArgs for usize {
    fn from_args(args: &[usize]) -> Option<Self> {
        args.first().copied()
    }
}

impl FromCompletionArgs for u32 {
    fn from_args(args: &[usize]) -> Option<Self> {
        usize::from_args(args).and_then(|word| u32::try_from(word).ok())
    }
}

impl FromCompletionArgs for Vec<usize> {
    fn from_args(args: &[usize]) -> Option<Self> {
        Some(args.to_vec())
    }
}

/// A successful completion.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    /// The buffer lent at submission, handed back after the provider is done
    /// with it.
    pub buffer: Option<OwnedBuffer>,
}

// ---------------------------------------------------------------------------
// Token registry
// ---------------------------------------------------------------------------

struct Resolution {
    status: c_int,
    args: Vec<usize>,
    buffer: Option<OwnedBuffer>,
}

struct PendingOperation {
    label: &'static str,
    buffer: Option<OwnedBuffer>,
    sender: oneshot::Sender<Resolution>,
    stats: Arc<BridgeStats>,
}

enum Slot {
    Pending(PendingOperation),
    Resolved(Arc<BridgeStats>),
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);
static REGISTRY: LazyLock<Mutex<FxHashMap<usize, Slot>>> = LazyLock::new(|| Mutex::new(FxHashMap::default()));
static UNATTRIBUTED_VIOLATIONS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_token() -> usize {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

fn registry() -> MutexGuard<'static, FxHashMap<usize, Slot>> {
    // Never panic on the provider's callback thread.
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn note_unattributed() {
    UNATTRIBUTED_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
}

/// Protocol violations that could not be attributed to a live bridge, such
/// as firings for tokens that were never issued.
pub fn unattributed_violations() -> u64 {
    UNATTRIBUTED_VIOLATIONS.load(Ordering::Relaxed)
}

struct BridgeStats {
    name: String,
    pending: AtomicUsize,
    resolved: AtomicU64,
    violations: AtomicU64,
    closed: AtomicBool,
    tombstones: Mutex<VecDeque<usize>>,
}

impl BridgeStats {
    /// Remember `token` as resolved, evicting the oldest tombstone once the
    /// window is full. Called with the registry locked.
    fn bury(self: &Arc<Self>, token: usize, slots: &mut FxHashMap<usize, Slot>) {
        let mut tombstones = self.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        tombstones.push_back(token);
        slots.insert(token, Slot::Resolved(Arc::clone(self)));
        if tombstones.len() > TOMBSTONE_WINDOW {
            if let Some(oldest) = tombstones.pop_front() {
                slots.remove(&oldest);
            }
        }
    }
}

/// The callback every submission hands to the provider.
unsafe extern "C" fn completion_trampoline(
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
    resolve(context as usize, status, args);
}

fn resolve(token: usize, status: c_int, args: Vec<usize>) {
    let op = {
        let mut slots = registry();
        match slots.remove(&token) {
            Some(Slot::Pending(op)) => {
                if !op.stats.closed.load(Ordering::Acquire) {
                    op.stats.bury(token, &mut slots);
                }
                op
            }
            Some(Slot::Resolved(stats)) => {
                slots.insert(token, Slot::Resolved(Arc::clone(&stats)));
                drop(slots);
                stats.violations.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "protocol violation on bridge '{}': token {token:#x} completed again (status {status:#x}); dropped",
                    stats.name
                );
                return;
            }
            None => {
                drop(slots);
                note_unattributed();
                tracing::warn!("protocol violation: completion for unknown token {token:#x} (status {status:#x}); dropped");
                return;
            }
        }
    };

    op.stats.pending.fetch_sub(1, Ordering::AcqRel);
    op.stats.resolved.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(
        "'{}' token {token:#x} resolved with status {status:#x}",
        op.label
    );

    let resolution = Resolution {
        status,
        args,
        buffer: op.buffer,
    };
    if op.sender.send(resolution).is_err() {
        // Caller gave up on the result; the buffer is reclaimed here, after
        // the provider is done with it.
        tracing::trace!("'{}' completed after its caller went away", op.label);
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Provider-side limits passed with a submission. There is no cancellation
/// once submitted; these are the only latency bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Overall completion timeout in milliseconds (`0` means none).
    pub timeout_ms: u32,
    /// Timeout for the provider to start moving data (`0` means none).
    pub no_data_timeout_ms: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            no_data_timeout_ms: 0,
        }
    }
}

/// Everything the provider call needs to report completion.
#[derive(Debug, Clone, Copy)]
pub struct NativeCompletion {
    pub callback: CompletionCallback,
    pub context: *mut c_void,
    /// Start of the lent buffer, or null.
    pub buffer: *mut u8,
    pub buffer_len: usize,
    pub options: SubmitOptions,
}

/// Bridges provider completion callbacks to single-resolution futures.
pub struct AsyncCompletionBridge {
    stats: Arc<BridgeStats>,
    default_options: SubmitOptions,
}

impl AsyncCompletionBridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            stats: Arc::new(BridgeStats {
                name: name.into(),
                pending: AtomicUsize::new(0),
                resolved: AtomicU64::new(0),
                violations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                tombstones: Mutex::new(VecDeque::new()),
            }),
            default_options: SubmitOptions::default(),
        }
    }

    /// A bridge named after the provider, using its configured timeout.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.symbol_prefix.clone()).with_default_options(SubmitOptions {
            timeout_ms: config.default_timeout_ms,
            ..SubmitOptions::default()
        })
    }

    pub fn with_default_options(mut self, options: SubmitOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn default_options(&self) -> SubmitOptions {
        self.default_options
    }

    /// Submit with the bridge's default options. See [`Self::submit_with`].
    pub fn submit<T, F>(&self, label: &'static str, buffer: Option<OwnedBuffer>, issue: F) -> Result<PendingCompletion<T>>
    where
        T: FromCompletionArgs,
        F: FnOnce(NativeCompletion) -> c_int,
    {
        self.submit_with(label, buffer, self.default_options, issue)
    }

    /// Register a completion token, lend `buffer`, and start the operation.
    ///
    /// `issue` performs the provider call with the callback, context and
    /// buffer it is given, and returns the provider's immediate status. A
    /// failing status unregisters the token and is returned as
    /// [`NegotiationError::NativeError`]; the provider is then assumed never
    /// to fire.
    pub fn submit_with<T, F>(
        &self,
        label: &'static str,
        mut buffer: Option<OwnedBuffer>,
        options: SubmitOptions,
        issue: F,
    ) -> Result<PendingCompletion<T>>
    where
        T: FromCompletionArgs,
        F: FnOnce(NativeCompletion) -> c_int,
    {
        let token = next_token();
        let (ptr, len) = buffer
            .as_mut()
            .map_or((std::ptr::null_mut(), 0), |b| (b.as_mut_ptr(), b.len()));
        let (sender, receiver) = oneshot::channel();

        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        registry().insert(
            token,
            Slot::Pending(PendingOperation {
                label,
                buffer,
                sender,
                stats: Arc::clone(&self.stats),
            }),
        );
        tracing::trace!("'{label}' submitted as token {token:#x} ({len}-byte buffer)");

        // The registry lock is not held here: the provider may complete
        // synchronously on this thread.
        let status = issue(NativeCompletion {
            callback: completion_trampoline,
            context: token as *mut c_void,
            buffer: ptr,
            buffer_len: len,
            options,
        });

        if !ffi::is_success(status) {
            let mut slots = registry();
            match slots.remove(&token) {
                Some(Slot::Pending(op)) => {
                    drop(slots);
                    self.stats.pending.fetch_sub(1, Ordering::AcqRel);
                    drop(op);
                }
                Some(resolved @ Slot::Resolved(_)) => {
                    slots.insert(token, resolved);
                    drop(slots);
                    self.stats.violations.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "protocol violation on bridge '{}': '{label}' completed but its submission failed",
                        self.stats.name
                    );
                }
                None => {}
            }
            return Err(NegotiationError::NativeError(status));
        }

        Ok(PendingCompletion {
            receiver,
            label,
            stats: Arc::clone(&self.stats),
            _result: PhantomData,
        })
    }

    /// Operations submitted through this bridge that have not completed.
    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::Acquire)
    }

    /// Operations that resolved.
    pub fn resolved(&self) -> u64 {
        self.stats.resolved.load(Ordering::Relaxed)
    }

    /// Duplicate or otherwise out-of-contract firings absorbed so far.
    pub fn protocol_violations(&self) -> u64 {
        self.stats.violations.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.stats.name
    }
}

impl Drop for AsyncCompletionBridge {
    fn drop(&mut self) {
        self.stats.closed.store(true, Ordering::Release);
        let mut slots = registry();
        let mut tombstones = self.stats.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        for token in tombstones.drain(..) {
            slots.remove(&token);
        }
        let pending = self.stats.pending.load(Ordering::Acquire);
        if pending > 0 {
            tracing::debug!(
                "bridge '{}' dropped with {pending} operations in flight; their buffers stay lent",
                self.stats.name
            );
        }
    }
}

impl fmt::Debug for AsyncCompletionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCompletionBridge")
            .field("name", &self.stats.name)
            .field("pending", &self.pending())
            .field("resolved", &self.resolved())
            .field("protocol_violations", &self.protocol_violations())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Futures
// ---------------------------------------------------------------------------

/// The result of one submitted operation.
///
/// Dropping it does not cancel the operation; the lent buffer stays alive
/// until the provider completes.
#[must_use = "the completion carries the operation's result and buffer"]
pub struct PendingCompletion<T> {
    receiver: oneshot::Receiver<Resolution>,
    label: &'static str,
    stats: Arc<BridgeStats>,
    _result: PhantomData<fn() -> T>,
}

impl<T: FromCompletionArgs> PendingCompletion<T> {
    /// Block the current thread until the operation completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; await
    /// the completion there instead.
    pub fn wait(self) -> Result<Completed<T>> {
        let received = self.receiver.blocking_recv();
        finish(self.label, &self.stats, received)
    }
}

/// Turn a resolution into the caller's result. Completions that cannot be
/// read as a `T` are counted as protocol violations and reported to the
/// caller as a generic native failure.
fn finish<T: FromCompletionArgs>(
    label: &'static str,
    stats: &BridgeStats,
    received: std::result::Result<Resolution, oneshot::error::RecvError>,
) -> Result<Completed<T>> {
    let Ok(resolution) = received else {
        tracing::debug!("'{label}' on bridge '{}' was abandoned without completing", stats.name);
        return Err(NegotiationError::NativeError(ffi::STATUS_ABORTED));
    };
    if !ffi::is_success(resolution.status) {
        // The buffer is reclaimed here, once the failure has been observed.
        return Err(NegotiationError::NativeError(resolution.status));
    }
    match T::from_args(&resolution.args) {
        Some(value) => Ok(Completed {
            value,
            buffer: resolution.buffer,
        }),
        None => {
            stats.violations.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "protocol violation on bridge '{}': '{label}' succeeded with unreadable result words {:?}",
                stats.name,
                resolution.args
            );
            Err(NegotiationError::NativeError(ffi::STATUS_ERROR))
        }
    }
}

impl<T: FromCompletionArgs> Future for PendingCompletion<T> {
    type Output = Result<Completed<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| finish(this.label, &this.stats, received))
    }
}

impl<T> fmt::Debug for PendingCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCompletion")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
