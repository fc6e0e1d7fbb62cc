// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::LazyLock;

use nm::Event;
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::{CharBuffer, Error, Result};

/// The minimum character capacity of buffers lent by [`CharBufferPool::cached_invoke()`].
///
/// Guaranteeing some capacity up front spares callers from special-casing an empty buffer,
/// e.g. when doubling the capacity on retry.
pub const DEFAULT_INVOKE_CAPACITY: u32 = 50;

type Factory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// A pool that keeps up to a fixed number of idle instances for reuse.
///
/// [`acquire()`][Self::acquire] hands out an idle instance if there is one and creates a new
/// one otherwise, so it never blocks and never fails because the pool is exhausted. The
/// returned [`Pooled`] guard gives the instance back when dropped. The pool retains it if
/// fewer than `max_retained` instances are idle and drops it otherwise.
///
/// A pool with `max_retained` of zero is a valid configuration that never retains anything.
///
/// # Examples
///
/// ```
/// use nativebuf::ObjectPool;
///
/// let pool = ObjectPool::new(2, || Ok(Vec::<u8>::with_capacity(1024)));
///
/// {
///     let mut scratch = pool.acquire()?;
///     scratch.extend_from_slice(b"temporary");
/// }
///
/// assert_eq!(pool.retained(), 1);
/// # Ok::<(), nativebuf::Error>(())
/// ```
pub struct ObjectPool<T> {
    max_retained: usize,
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
}

impl<T> ObjectPool<T> {
    /// Creates a pool that retains up to `max_retained` idle instances and creates new ones
    /// with `factory`.
    pub fn new<F>(max_retained: usize, factory: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            max_retained,
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            reset: None,
        }
    }

    /// Sets a function that prepares released instances for reuse before they are retained.
    #[must_use]
    pub fn with_reset<F>(mut self, reset: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    /// The maximum number of idle instances the pool retains.
    #[must_use]
    pub const fn max_retained(&self) -> usize {
        self.max_retained
    }

    /// The number of idle instances currently retained.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.idle.lock().len()
    }

    /// Takes an idle instance from the pool or creates a new one.
    ///
    /// # Errors
    ///
    /// Returns the error of the factory if a new instance is needed and cannot be created.
    /// The pool is unaffected in that case.
    pub fn acquire(&self) -> Result<Pooled<'_, T>> {
        let reused = self.idle.lock().pop();

        let item = match reused {
            Some(item) => {
                ACQUIRE_REUSED.with(|e| e.observe(1));
                item
            }
            None => {
                let item = (self.factory)()?;
                ACQUIRE_CREATED.with(|e| e.observe(1));
                item
            }
        };

        Ok(Pooled {
            pool: self,
            item: ManuallyDrop::new(item),
        })
    }

    /// Returns an instance to the pool, or drops it if the pool is full.
    ///
    /// The instance does not need to have come from this pool.
    pub fn release(&self, mut item: T) {
        if let Some(reset) = &self.reset {
            reset(&mut item);
        }

        {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_retained {
                idle.push(item);
                return;
            }
        }

        event!(
            Level::DEBUG,
            message = "pool is full, discarding released item",
            max_retained = self.max_retained
        );
        drop(item);
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("max_retained", &self.max_retained)
            .field("retained", &self.retained())
            .finish_non_exhaustive()
    }
}

/// An instance acquired from an [`ObjectPool`], returned to the pool when dropped.
///
/// The instance is returned on every exit path, including unwinding.
/// Use [`into_inner()`][Self::into_inner] to keep the instance instead.
pub struct Pooled<'a, T> {
    pool: &'a ObjectPool<T>,
    item: ManuallyDrop<T>,
}

impl<T> Pooled<'_, T> {
    /// Detaches the instance from the pool. It will not be returned when dropped.
    #[must_use]
    pub fn into_inner(self) -> T {
        let mut this = ManuallyDrop::new(self);

        // SAFETY: `this` is never dropped, so the item is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.item) }
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard is being dropped, so the item is never accessed again.
        let item = unsafe { ManuallyDrop::take(&mut self.item) };
        self.pool.release(item);
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&*self.item).finish()
    }
}

/// A pool of [`CharBuffer`]s for the calls that need a scratch character buffer.
///
/// Released buffers are cleared but keep their capacity, so a retained buffer is ready to
/// receive output of the size it last grew to.
///
/// # Examples
///
/// ```
/// use nativebuf::CharBufferPool;
///
/// let pool = CharBufferPool::new(4);
///
/// let greeting = pool.cached_invoke(|buffer| {
///     buffer.append_str("hello", 0, None)?;
///     buffer.to_string()
/// })??;
///
/// assert_eq!(greeting, "hello");
/// assert_eq!(pool.retained(), 1);
/// # Ok::<(), nativebuf::Error>(())
/// ```
#[derive(Debug)]
pub struct CharBufferPool {
    pool: ObjectPool<CharBuffer>,
}

impl CharBufferPool {
    /// Creates a pool that retains up to `max_buffers` idle buffers.
    #[must_use]
    pub fn new(max_buffers: usize) -> Self {
        Self {
            pool: ObjectPool::new(max_buffers, || Ok(CharBuffer::new())).with_reset(|buffer| buffer.clear()),
        }
    }

    /// The process-wide pool, created on first use.
    ///
    /// It retains no idle buffers, so every release frees the buffer immediately. Create a
    /// dedicated pool with [`new()`][Self::new] to get reuse.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: LazyLock<CharBufferPool> = LazyLock::new(|| CharBufferPool::new(0));
        &GLOBAL
    }

    /// The maximum number of idle buffers the pool retains.
    #[must_use]
    pub const fn max_buffers(&self) -> usize {
        self.pool.max_retained()
    }

    /// The number of idle buffers currently retained.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.pool.retained()
    }

    /// Takes a buffer with at least `min_capacity` character slots from the pool.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the capacity cannot be provided. The buffer involved is
    /// not returned to the pool in that case.
    pub fn acquire(&self, min_capacity: u32) -> Result<Pooled<'_, CharBuffer>> {
        let buffer = self.pool.acquire()?;

        if let Err(error) = buffer.ensure_char_capacity(min_capacity) {
            drop(buffer.into_inner());
            return Err(error);
        }

        Ok(buffer)
    }

    /// Returns a buffer to the pool, clearing it, or frees it if the pool is full.
    ///
    /// The buffer does not need to have come from this pool.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn release(&self, buffer: CharBuffer) {
        self.pool.release(buffer);
    }

    /// Calls `f` with a pooled buffer of at least [`DEFAULT_INVOKE_CAPACITY`] character slots.
    ///
    /// The buffer goes back to the pool on every exit path, including a panic in `f`.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if no buffer can be provided. Errors of `f` are part of
    /// its own return value.
    pub fn cached_invoke<R>(&self, f: impl FnOnce(&CharBuffer) -> R) -> Result<R> {
        self.cached_invoke_with(DEFAULT_INVOKE_CAPACITY, f)
    }

    /// Calls `f` with a pooled buffer of at least `min_capacity` character slots.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if no buffer can be provided.
    pub fn cached_invoke_with<R>(&self, min_capacity: u32, f: impl FnOnce(&CharBuffer) -> R) -> Result<R> {
        let buffer = self.acquire(min_capacity)?;
        Ok(f(&buffer))
    }

    /// Materializes the content of the buffer and returns it to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if the content is too
    /// long for a string. The buffer is returned to the pool either way.
    pub fn to_string_and_release(&self, buffer: CharBuffer) -> Result<String> {
        let content = buffer.to_string();
        self.release(buffer);
        content
    }

    /// Runs a native-style call that fills a character buffer and reports the count.
    ///
    /// `invoker` receives a pooled buffer and returns either the number of characters it wrote,
    /// or the capacity it needs (including the null terminator) if the buffer was too small.
    /// While the returned count exceeds the character capacity, the buffer grows to that count
    /// and `invoker` runs again. The final count becomes the length of the result.
    ///
    /// # Errors
    ///
    /// Returns the error of `invoker`, or an allocation error converted into `E`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nativebuf::{CharBuffer, CharBufferPool, Error};
    ///
    /// const VALUE: &str = "a value longer than the default capacity of a pooled buffer";
    ///
    /// fn native_get_value(buffer: &CharBuffer) -> Result<u32, Error> {
    ///     let units: Vec<u16> = VALUE.encode_utf16().collect();
    ///     let required = u32::try_from(units.len()).unwrap() + 1;
    ///
    ///     if buffer.char_capacity() < required {
    ///         return Ok(required);
    ///     }
    ///
    ///     buffer.with_capacity_mut(|capacity| capacity[..units.len()].copy_from_slice(&units));
    ///     Ok(required - 1)
    /// }
    ///
    /// let value = CharBufferPool::global().cached_api_invoke(native_get_value)?;
    /// assert_eq!(value, VALUE);
    /// # Ok::<(), nativebuf::Error>(())
    /// ```
    pub fn cached_api_invoke<E>(&self, mut invoker: impl FnMut(&CharBuffer) -> std::result::Result<u32, E>) -> std::result::Result<String, E>
    where
        E: From<Error>,
    {
        let buffer = self.acquire(DEFAULT_INVOKE_CAPACITY)?;

        let mut count = invoker(&buffer)?;
        while count > buffer.char_capacity() {
            buffer.ensure_char_capacity(count)?;
            count = invoker(&buffer)?;
        }

        buffer.set_len(count)?;
        Ok(buffer.to_string()?)
    }
}

thread_local! {
    static ACQUIRE_REUSED: Event = Event::builder()
        .name("nativebuf_pool_acquire_reused")
        .build();

    static ACQUIRE_CREATED: Event = Event::builder()
        .name("nativebuf_pool_acquire_created")
        .build();
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use static_assertions::assert_impl_all;
    use tracing_test::traced_test;

    use super::*;
    use crate::ErrorKind;

    assert_impl_all!(ObjectPool<CharBuffer>: Send, Sync, fmt::Debug);
    assert_impl_all!(CharBufferPool: Send, Sync, fmt::Debug);

    /// A pool of numbered items that counts how many it has created.
    fn counting_pool(max_retained: usize) -> (ObjectPool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);

        let pool = ObjectPool::new(max_retained, move || Ok(counter.fetch_add(1, Ordering::SeqCst)));

        (pool, created)
    }

    #[test]
    fn acquire_creates_when_empty() {
        let (pool, created) = counting_pool(2);

        let item = pool.acquire().unwrap();

        assert_eq!(*item, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acquire_reuses_released() {
        let (pool, created) = counting_pool(2);

        drop(pool.acquire().unwrap());
        assert_eq!(pool.retained(), 1);

        let item = pool.acquire().unwrap();

        assert_eq!(*item, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn pool_bound_is_respected() {
        const MAX: usize = 3;
        let (pool, created) = counting_pool(MAX);

        let items: Vec<_> = (0..MAX + 5).map(|_| pool.acquire().unwrap().into_inner()).collect();
        assert_eq!(created.load(Ordering::SeqCst), MAX + 5);

        for item in items {
            pool.release(item);
            assert!(pool.retained() <= MAX);
        }

        assert_eq!(pool.retained(), MAX);

        let reused: Vec<_> = (0..MAX).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), MAX + 5, "retained items must be reused");

        let extra = pool.acquire().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), MAX + 6, "an exhausted pool must create a new item");

        drop(extra);
        drop(reused);
    }

    #[test]
    fn zero_bound_retains_nothing() {
        let (pool, created) = counting_pool(0);

        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());

        assert_eq!(pool.retained(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_accepts_foreign_items() {
        let (pool, created) = counting_pool(1);

        pool.release(42);

        assert_eq!(*pool.acquire().unwrap(), 42);
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn into_inner_detaches_from_pool() {
        let (pool, _) = counting_pool(1);

        let item = pool.acquire().unwrap().into_inner();

        assert_eq!(item, 0);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn released_on_panic() {
        let (pool, _) = counting_pool(1);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _item = pool.acquire().unwrap();
            panic!("caller failure");
        }));

        assert!(result.is_err());
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn factory_failure_propagates() {
        let pool: ObjectPool<CharBuffer> = ObjectPool::new(1, || Err(Error::out_of_memory(16)));

        let error = pool.acquire().unwrap_err();

        assert_eq!(error.kind(), ErrorKind::OutOfMemory);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn reset_runs_before_retaining() {
        let pool = ObjectPool::new(1, || Ok(vec![1, 2, 3])).with_reset(Vec::clear);

        drop(pool.acquire().unwrap());

        assert!(pool.acquire().unwrap().is_empty());
    }

    #[test]
    #[traced_test]
    fn full_pool_logs_discard() {
        let (pool, _) = counting_pool(0);

        pool.release(1);

        assert!(logs_contain("pool is full, discarding released item"));
    }

    #[test]
    fn concurrent_acquire_release_stays_bounded() {
        const MAX: usize = 4;
        let (pool, _) = counting_pool(MAX);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        let item = pool.acquire().unwrap();
                        assert!(pool.retained() <= MAX);
                        drop(item);
                    }
                });
            }
        });

        assert!(pool.retained() <= MAX);
    }

    #[test]
    fn char_buffer_acquire_ensures_capacity() {
        let pool = CharBufferPool::new(1);

        let buffer = pool.acquire(10).unwrap();

        assert!(buffer.char_capacity() >= 10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn char_buffer_release_clears_length() {
        let pool = CharBufferPool::new(1);

        {
            let buffer = pool.acquire(0).unwrap();
            buffer.append_str("leftover", 0, None).unwrap();
        }

        let buffer = pool.acquire(0).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.char_capacity(), 9, "capacity is kept across reuse");
    }

    #[test]
    fn cached_invoke_provides_default_capacity() {
        let pool = CharBufferPool::new(1);

        let capacity = pool.cached_invoke(CharBuffer::char_capacity).unwrap();

        assert!(capacity >= DEFAULT_INVOKE_CAPACITY);
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn cached_invoke_with_capacity() {
        let pool = CharBufferPool::new(1);

        let capacity = pool.cached_invoke_with(500, CharBuffer::char_capacity).unwrap();

        assert!(capacity >= 500);
    }

    #[test]
    fn cached_invoke_releases_on_panic() {
        let pool = CharBufferPool::new(1);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.cached_invoke(|buffer| {
                buffer.push(u16::from(b'x')).unwrap();
                panic!("caller failure");
            })
        }));

        assert!(result.is_err());
        assert_eq!(pool.retained(), 1);
        assert!(pool.acquire(0).unwrap().is_empty());
    }

    #[test]
    fn to_string_and_release() {
        let pool = CharBufferPool::new(1);
        let buffer: CharBuffer = "content".parse().unwrap();

        assert_eq!(pool.to_string_and_release(buffer).unwrap(), "content");
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn cached_api_invoke_grows_until_output_fits() {
        let pool = CharBufferPool::new(1);
        let value: String = "0123456789".repeat(12);
        let units: Vec<u16> = value.encode_utf16().collect();
        let required = u32::try_from(units.len() + 1).unwrap();
        let mut calls = 0;

        let result = pool
            .cached_api_invoke(|buffer| {
                calls += 1;

                if buffer.char_capacity() < required {
                    return Ok::<_, Error>(required);
                }

                buffer.with_capacity_mut(|capacity| capacity[..units.len()].copy_from_slice(&units));
                Ok(required - 1)
            })
            .unwrap();

        assert_eq!(result, value);
        assert_eq!(calls, 2);
    }

    #[test]
    fn cached_api_invoke_empty_result() {
        let pool = CharBufferPool::new(1);

        let result = pool.cached_api_invoke(|_| Ok::<_, Error>(0)).unwrap();

        assert_eq!(result, "");
    }

    #[test]
    fn cached_api_invoke_propagates_invoker_error() {
        #[derive(Debug, PartialEq)]
        enum CallError {
            Native(u32),
            Buffer(ErrorKind),
        }

        impl From<Error> for CallError {
            fn from(error: Error) -> Self {
                Self::Buffer(error.kind())
            }
        }

        let pool = CharBufferPool::new(1);

        let error = pool.cached_api_invoke(|_| Err(CallError::Native(5))).unwrap_err();

        assert_eq!(error, CallError::Native(5));
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn global_pool_retains_nothing() {
        let pool = CharBufferPool::global();

        assert!(std::ptr::eq(pool, CharBufferPool::global()));
        assert_eq!(pool.max_buffers(), 0);

        let value = pool.cached_invoke(CharBuffer::char_capacity).unwrap();

        assert!(value >= DEFAULT_INVOKE_CAPACITY);
        assert_eq!(pool.retained(), 0);
    }
}
