// gpu/queue.rs — command queue pool.
//
// wgpu exposes one hardware queue per device. The pool hands out N
// independent *submission channels* on top of it. Each channel tracks its
// own outstanding work with completion tokens, so a caller can wait for
// "everything I submitted on channel 2" without waiting on channels 0, 1
// and 3. The library orders nothing across channels. When work on one
// channel depends on work on another, the caller waits on the producer's
// `Completion` before submitting the consumer.
//
// The pool is generic over the channel type so its bookkeeping (one-shot
// initialization, atomic round-robin, finish-all) is testable without a
// device.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::gpu::device::DeviceContext;

/// What the pool needs from a submission channel.
pub trait SubmissionChannel: Send + Sync {
    /// Position of this channel in the pool.
    fn index(&self) -> usize;
    /// Block until all work submitted on this channel has completed.
    fn finish(&self) -> Result<()>;
    /// Push pending work to the device without waiting.
    fn flush(&self);
}

// ---------------------------------------------------------------------------
// Completion tokens
// ---------------------------------------------------------------------------

/// Marks the point in a channel's submission stream at which it was
/// created. Completes once the device has finished everything submitted
/// up to that point.
#[derive(Clone)]
pub struct Completion {
    done: Arc<AtomicBool>,
    device: Arc<wgpu::Device>,
}

impl Completion {
    /// Token for all work already submitted to `queue`.
    pub fn after_submitted(device: &Arc<wgpu::Device>, queue: &wgpu::Queue) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
        Completion { done, device: Arc::clone(device) }
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block until complete. There is no timeout: a hung device blocks the
    /// caller.
    pub fn wait(&self) {
        while !self.is_complete() {
            self.device.poll(wgpu::Maintain::Wait);
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("done", &self.is_complete()).finish()
    }
}

// ---------------------------------------------------------------------------
// wgpu-backed channel
// ---------------------------------------------------------------------------

/// One submission channel over the device queue.
pub struct CommandQueue {
    index: usize,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    outstanding: Mutex<Vec<Completion>>,
}

impl CommandQueue {
    pub fn new(ctx: &DeviceContext, index: usize) -> Self {
        CommandQueue {
            index,
            device: Arc::clone(&ctx.device),
            queue: Arc::clone(&ctx.queue),
            outstanding: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn raw(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Submit command buffers on this channel and return a token for them.
    ///
    /// Buffer writes staged with `raw().write_buffer` before this call are
    /// part of the submission.
    pub fn submit<I>(&self, commands: I) -> Completion
    where
        I: IntoIterator<Item = wgpu::CommandBuffer>,
    {
        self.queue.submit(commands);
        let token = Completion::after_submitted(&self.device, &self.queue);
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|c| !c.is_complete());
        outstanding.push(token.clone());
        log::trace!("queue {}: submitted, {} outstanding", self.index, outstanding.len());
        token
    }

    /// Tokens not yet complete.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().iter().filter(|c| !c.is_complete()).count()
    }
}

impl SubmissionChannel for CommandQueue {
    fn index(&self) -> usize {
        self.index
    }

    fn finish(&self) -> Result<()> {
        let pending: Vec<Completion> = std::mem::take(&mut *self.outstanding.lock());
        for token in &pending {
            token.wait();
        }
        Ok(())
    }

    fn flush(&self) {
        // An empty submit pushes any staged writes to the device.
        self.queue.submit(std::iter::empty());
        self.device.poll(wgpu::Maintain::Poll);
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Fixed set of submission channels, assigned round-robin.
pub struct QueuePool<Q> {
    queues: OnceLock<Vec<Arc<Q>>>,
    cursor: AtomicUsize,
}

impl<Q> Default for QueuePool<Q> {
    fn default() -> Self {
        QueuePool { queues: OnceLock::new(), cursor: AtomicUsize::new(0) }
    }
}

impl<Q: SubmissionChannel> QueuePool<Q> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `size` channels with `make`. Fails if the pool is already
    /// initialized, if `size` is 0, or if any channel fails to build (in
    /// which case the pool stays uninitialized).
    pub fn initialize_with<F>(&self, size: usize, mut make: F) -> Result<()>
    where
        F: FnMut(usize) -> Result<Q>,
    {
        if self.queues.get().is_some() {
            return Err(EngineError::AlreadyInitialized { what: "queue pool" });
        }
        if size < 1 {
            return Err(EngineError::config("queue_count", "pool size must be at least 1"));
        }
        let queues = (0..size)
            .map(|i| make(i).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        self.queues
            .set(queues)
            .map_err(|_| EngineError::AlreadyInitialized { what: "queue pool" })?;
        log::debug!("queue pool initialized with {size} channel(s)");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.queues.get().is_some()
    }

    fn queues(&self) -> Result<&[Arc<Q>]> {
        self.queues
            .get()
            .map(Vec::as_slice)
            .ok_or(EngineError::NotInitialized { what: "queue pool" })
    }

    /// Number of channels (0 before initialization).
    pub fn len(&self) -> usize {
        self.queues.get().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next channel in round-robin order. Safe to call from many threads.
    pub fn next_queue(&self) -> Result<Arc<Q>> {
        let queues = self.queues()?;
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % queues.len();
        Ok(Arc::clone(&queues[i]))
    }

    /// Channel at `index`.
    pub fn queue(&self, index: usize) -> Result<Arc<Q>> {
        let queues = self.queues()?;
        queues.get(index).cloned().ok_or_else(|| {
            EngineError::config("queue index", format!("{index} out of range 0..{}", queues.len()))
        })
    }

    /// Block until every channel's outstanding work has completed.
    pub fn finish_all(&self) -> Result<()> {
        for q in self.queues()? {
            q.finish()?;
        }
        Ok(())
    }

    /// Block until channel `index` has drained.
    pub fn finish(&self, index: usize) -> Result<()> {
        self.queue(index)?.finish()
    }

    /// Push pending work on every channel without waiting.
    pub fn flush_all(&self) -> Result<()> {
        for q in self.queues()? {
            q.flush();
        }
        Ok(())
    }
}

impl QueuePool<CommandQueue> {
    /// Create `size` wgpu-backed channels.
    pub fn initialize(&self, ctx: &DeviceContext, size: usize) -> Result<()> {
        self.initialize_with(size, |i| Ok(CommandQueue::new(ctx, i)))
    }
}
