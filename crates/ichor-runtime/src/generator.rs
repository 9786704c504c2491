//! Single-producer, single-consumer rendezvous generator.
//!
//! An [`AsyncGenerator`] pairs a producer coroutine (an `async` body holding a
//! [`Yield`] handle) with a consumer that pulls values via [`AsyncGenerator::resume`].
//! There is no buffering: a yielded value parks the producer until the consumer
//! asks for the next one. Both sides run on the same OS thread by contract; the
//! state word is still atomic because a producer body may migrate threads
//! mid-future, so consumer-side reloads use acquire and its writes release.
//!
//! The dispatcher couples to a generator through exactly three queries:
//! [`AsyncGenerator::has_suspended`], [`AsyncGenerator::is_finished`] and
//! [`AsyncGenerator::state`].

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};

/// Rendezvous protocol state.
///
/// Initial state is [`GeneratorState::ValueReadyProducerSuspended`]: the
/// producer is parked at its entry point, ready to run as soon as the consumer
/// asks for a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneratorState {
    /// Consumer is driving the producer; no value available yet.
    ValueNotReadyConsumerActive = 0,
    /// Consumer gave up its timeslice waiting for the producer.
    ValueNotReadyConsumerSuspended = 1,
    /// Producer published a value and is still running.
    ValueReadyProducerActive = 2,
    /// Producer parked; a value (or the entry point) is ready for the consumer.
    ValueReadyProducerSuspended = 3,
    /// Generator was dropped before exhaustion; the producer frame is dead.
    Cancelled = 4,
}

fn state_from_u8(raw: u8) -> GeneratorState {
    match raw {
        0 => GeneratorState::ValueNotReadyConsumerActive,
        1 => GeneratorState::ValueNotReadyConsumerSuspended,
        2 => GeneratorState::ValueReadyProducerActive,
        3 => GeneratorState::ValueReadyProducerSuspended,
        4 => GeneratorState::Cancelled,
        other => unreachable!("invalid generator state {other}"),
    }
}

/// Shared cell between the producer body and the owning generator.
struct Rendezvous<T> {
    state: AtomicU8,
    slot: RefCell<Option<T>>,
    /// Tri-state suspension flag with sticky-true semantics. `None` means the
    /// producer never reached a suspension point and must be treated as
    /// suspended by the dispatcher; see [`AsyncGenerator::has_suspended`].
    has_suspended: Cell<Option<bool>>,
    finished: Cell<bool>,
}

impl<T> Rendezvous<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(GeneratorState::ValueReadyProducerSuspended as u8),
            slot: RefCell::new(None),
            has_suspended: Cell::new(None),
            finished: Cell::new(false),
        }
    }

    fn load_state(&self) -> GeneratorState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn store_state(&self, next: GeneratorState, order: Ordering) {
        self.state.store(next as u8, order);
    }

    fn transition(&self, from: GeneratorState, to: GeneratorState) -> Result<(), GeneratorState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::Release, Ordering::Acquire)
            .map(|_| ())
            .map_err(state_from_u8)
    }

    fn mark_suspended(&self) {
        self.has_suspended.set(Some(true));
    }

    fn mark_synchronous_if_unset(&self) {
        if self.has_suspended.get().is_none() {
            self.has_suspended.set(Some(false));
        }
    }
}

/// Producer-side handle for publishing intermediate values.
pub struct Yield<T> {
    chan: Rc<Rendezvous<T>>,
}

impl<T> Yield<T> {
    /// Publish `value` and park the producer until the consumer asks for the
    /// next one.
    pub fn yield_item(&self, value: T) -> YieldFuture<T> {
        YieldFuture {
            chan: self.chan.clone(),
            value: Some(value),
        }
    }
}

/// Future returned by [`Yield::yield_item`].
pub struct YieldFuture<T> {
    chan: Rc<Rendezvous<T>>,
    value: Option<T>,
}

impl<T> Unpin for YieldFuture<T> {}

impl<T> Future for YieldFuture<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some(value) = this.value.take() {
            // First poll: hand the value over and park the producer.
            match this.chan.load_state() {
                GeneratorState::Cancelled => Poll::Pending,
                GeneratorState::ValueNotReadyConsumerActive => {
                    *this.chan.slot.borrow_mut() = Some(value);
                    match this.chan.transition(
                        GeneratorState::ValueNotReadyConsumerActive,
                        GeneratorState::ValueReadyProducerSuspended,
                    ) {
                        Ok(()) => {
                            if !this.chan.finished.get() {
                                this.chan.mark_suspended();
                            }
                            Poll::Pending
                        }
                        // Lost a race against cancellation; the frame is about
                        // to be destroyed, never deliver.
                        Err(_) => Poll::Pending,
                    }
                }
                other => {
                    debug_assert!(false, "yield from invalid state {other:?}");
                    Poll::Pending
                }
            }
        } else {
            // Re-polled: the consumer requested the next value.
            match this.chan.load_state() {
                GeneratorState::ValueNotReadyConsumerActive => Poll::Ready(()),
                _ => Poll::Pending,
            }
        }
    }
}

/// Outcome of a single [`AsyncGenerator::resume`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Resumed<T> {
    /// The producer published a value (possibly its final one).
    Value(T),
    /// The producer parked on an inner future without publishing; re-enter
    /// after its waker fires.
    Suspended,
    /// End of sequence; every value has already been delivered.
    Finished,
}

/// Outcome of [`drive`]: run a generator as far as it will go right now.
#[derive(Debug, PartialEq, Eq)]
pub enum Driven<T> {
    /// Generator ran to completion; this is its final value.
    Completed(T),
    /// Generator parked at least once and must be retained for re-entry.
    Suspended,
    /// Generator had already finished before this call.
    Exhausted,
}

/// Resume `generator` until it either completes or parks.
///
/// Intermediate yielded values are consumed and dropped: lifecycle and handler
/// generators communicate through their final value, intermediate yields only
/// donate the timeslice back.
pub fn drive<T: 'static>(generator: &mut AsyncGenerator<T>) -> Driven<T> {
    loop {
        match generator.resume() {
            Resumed::Value(value) => {
                if generator.is_finished() {
                    return Driven::Completed(value);
                }
            }
            Resumed::Suspended => return Driven::Suspended,
            Resumed::Finished => return Driven::Exhausted,
        }
    }
}

/// A suspendable producer/consumer sequence.
///
/// Created from an async body that receives a [`Yield`] handle and returns its
/// final value. Dropping the generator before exhaustion cancels it: the state
/// flips to [`GeneratorState::Cancelled`] and the producer frame is destroyed,
/// running destructors of its locals.
pub struct AsyncGenerator<T> {
    producer: Option<Pin<Box<dyn Future<Output = T>>>>,
    chan: Rc<Rendezvous<T>>,
    waker: Waker,
}

impl<T: 'static> AsyncGenerator<T> {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Yield<T>) -> Fut,
        Fut: Future<Output = T> + 'static,
    {
        let chan = Rc::new(Rendezvous::new());
        let producer = Box::pin(body(Yield { chan: chan.clone() }));
        Self {
            producer: Some(producer),
            chan,
            waker: Waker::noop().clone(),
        }
    }

    /// A generator that completes synchronously with `value`. Used by handlers
    /// with nothing to await.
    pub fn ready(value: T) -> Self {
        let chan = Rc::new(Rendezvous::new());
        *chan.slot.borrow_mut() = Some(value);
        chan.finished.set(true);
        chan.has_suspended.set(Some(false));
        Self {
            producer: None,
            chan,
            waker: Waker::noop().clone(),
        }
    }

    /// Install the waker inner futures see on the next resume. The dispatcher
    /// points this at the owning event queue so a wake re-enters the generator
    /// on a later dispatch tick.
    pub fn set_waker(&mut self, waker: Waker) {
        self.waker = waker;
    }

    /// Current protocol state.
    pub fn state(&self) -> GeneratorState {
        self.chan.load_state()
    }

    /// Whether the producer ran to completion (its final value may still be
    /// pending delivery).
    pub fn is_finished(&self) -> bool {
        self.chan.finished.get()
    }

    /// Whether the dispatcher must retain this generator for re-entry.
    ///
    /// True once the producer parked at any suspension point, and also while
    /// it has never engaged one at all: a body that immediately awaits an
    /// inner future skips the yield protocol entirely, and the only safe
    /// interpretation is "suspended". False only after a completion observed
    /// with no suspension in between.
    pub fn has_suspended(&self) -> bool {
        self.chan.has_suspended.get().unwrap_or(true)
    }

    /// Pull the next value out of the producer.
    ///
    /// A panic in the producer body is re-raised here, at the consumer's
    /// resume site; afterwards the generator reports finished.
    pub fn resume(&mut self) -> Resumed<T> {
        if self.chan.finished.get() {
            if let Some(value) = self.chan.slot.borrow_mut().take() {
                return Resumed::Value(value);
            }
            return Resumed::Finished;
        }
        let Some(producer) = self.producer.as_mut() else {
            return Resumed::Finished;
        };

        match self.chan.load_state() {
            GeneratorState::ValueReadyProducerSuspended
            | GeneratorState::ValueNotReadyConsumerSuspended => {
                // Same-thread wake-up of the producer: relaxed is sufficient.
                self.chan
                    .store_state(GeneratorState::ValueNotReadyConsumerActive, Ordering::Relaxed);
            }
            GeneratorState::Cancelled => return Resumed::Finished,
            GeneratorState::ValueNotReadyConsumerActive => {}
            GeneratorState::ValueReadyProducerActive => {
                debug_assert!(false, "producer active while consumer resumes");
            }
        }

        let mut cx = Context::from_waker(&self.waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| producer.as_mut().poll(&mut cx)));

        match polled {
            Err(payload) => {
                self.chan.finished.set(true);
                self.chan
                    .store_state(GeneratorState::ValueReadyProducerSuspended, Ordering::Release);
                self.producer = None;
                panic::resume_unwind(payload);
            }
            Ok(Poll::Ready(value)) => {
                self.chan.finished.set(true);
                self.chan.mark_synchronous_if_unset();
                self.chan
                    .store_state(GeneratorState::ValueReadyProducerSuspended, Ordering::Release);
                self.producer = None;
                Resumed::Value(value)
            }
            Ok(Poll::Pending) => {
                // The producer may have migrated threads mid-body: reload with
                // acquire before inspecting the slot.
                let state = self.chan.load_state();
                if let Some(value) = self.chan.slot.borrow_mut().take() {
                    debug_assert_eq!(state, GeneratorState::ValueReadyProducerSuspended);
                    return Resumed::Value(value);
                }
                // Parked on an inner future without yielding: suspend the
                // consumer side. A concurrent yield wins the race table and
                // we deliver instead.
                match self.chan.transition(
                    GeneratorState::ValueNotReadyConsumerActive,
                    GeneratorState::ValueNotReadyConsumerSuspended,
                ) {
                    Ok(()) => Resumed::Suspended,
                    Err(_) => match self.chan.slot.borrow_mut().take() {
                        Some(value) => Resumed::Value(value),
                        None => Resumed::Suspended,
                    },
                }
            }
        }
    }
}

impl<T> Drop for AsyncGenerator<T> {
    fn drop(&mut self) {
        // The producer frame is dropped with `self.producer`; a parked body
        // never runs again and its locals are destroyed now.
        self.chan
            .state
            .swap(GeneratorState::Cancelled as u8, Ordering::AcqRel);
    }
}

impl<T> std::fmt::Debug for AsyncGenerator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncGenerator")
            .field("state", &self.chan.load_state())
            .field("finished", &self.chan.finished.get())
            .field("has_suspended", &self.chan.has_suspended.get())
            .finish()
    }
}
