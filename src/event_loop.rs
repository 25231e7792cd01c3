//! One-thread-per-loop reactor. An `EventLoop` is a per-thread singleton by construction:
//! the owning thread's id is captured when the loop is created, and every mutating method asserts
//! (in debug builds) that it is running on that thread, or re-posts the work via `queue_in_loop`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use mio::Token;
use slab::Slab;

use crate::channel::{Channel, SharedChannel};
use crate::interest::Interest;
use crate::poll::{self, ChannelState, Demultiplexer};
use crate::timer::{TimerId, TimerQueue};

type Task = Box<dyn FnOnce() + Send>;

/// The registration table and demultiplexer, reachable both from the owning loop's `run` and from
/// any `EventLoopHandle`, so that a connection's `send`/`shutdown` (always invoked on the loop
/// thread itself, having gotten there via `run_in_loop`) can push an interest-mask change without
/// needing a `&mut EventLoop` in scope.
struct Registry {
    demux: Box<dyn Demultiplexer + Send>,
    channels: Slab<SharedChannel>,
}

/// State shared between an `EventLoop` and the [`EventLoopHandle`]s foreign threads use to post
/// work to it.
struct Shared {
    thread_id: ThreadId,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    wake_write_fd: RawFd,
    registry: Mutex<Registry>,
    timers: Mutex<TimerQueue>,
}

/// A thread-safe, cloneable handle to an `EventLoop`, usable from any thread to post work or
/// request shutdown. This is what `TcpConnection::send`, `EventLoop::quit`, and friends are built
/// on.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    /// True if the calling thread is the loop's owning thread.
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Runs `task` inline if called from the loop's own thread, otherwise queues it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending list and wakes the loop if necessary. Waking is needed
    /// whenever the call comes from a foreign thread (the loop may be blocked in `poll`); it is
    /// also needed when called while the loop is already draining its pending list, so that the
    /// newly queued task is not missed until the *next* wakeup.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        self.wakeup();
    }

    /// Requests that the loop quit after draining any pending tasks from the current iteration.
    /// Thread-safe; wakes the loop if called from a foreign thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Writes a single byte to the loop's self-pipe, causing a blocked `poll` to return.
    pub fn wakeup(&self) {
        let byte: [u8; 1] = [1];
        // SAFETY: `wake_write_fd` is a valid, open pipe write end for the lifetime of the loop;
        // a `write` of one byte cannot partially fail in a way that matters here.
        unsafe {
            libc::write(self.shared.wake_write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Registers a new channel, returning the token it was assigned.
    pub fn register_channel(&self, channel: SharedChannel) -> Token {
        let mut registry = self.shared.registry.lock().unwrap();
        Token(registry.channels.insert(channel))
    }

    /// Pushes this channel's current interest mask to the demultiplexer.
    pub fn update_channel(&self, token: Token) -> std::io::Result<()> {
        let mut registry = self.shared.registry.lock().unwrap();
        let (fd, interest) = {
            let channel = registry
                .channels
                .get(token.0)
                .expect("unknown channel token");
            let c = channel.lock().unwrap();
            (c.fd(), c.interest())
        };
        registry.demux.update(fd, token, interest)?;
        registry
            .channels
            .get(token.0)
            .unwrap()
            .lock()
            .unwrap()
            .set_state(ChannelState::Added);
        Ok(())
    }

    /// Removes a channel from both the demultiplexer and the loop's table.
    pub fn remove_channel(&self, token: Token) -> std::io::Result<()> {
        let mut registry = self.shared.registry.lock().unwrap();
        if let Some(channel) = registry.channels.try_remove(token.0) {
            let fd = channel.lock().unwrap().fd();
            registry.demux.remove(fd, token)?;
        }
        Ok(())
    }

    /// Schedules `callback` to run once at `when`. Thread-safe: the timer queue lives behind a
    /// lock shared with the owning loop's `run`, and a blocked `poll` is woken so it notices the
    /// new deadline promptly.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.shared.timers.lock().unwrap().run_at(when, Box::new(callback));
        self.wakeup();
        id
    }

    /// Schedules `callback` to run once after `delay`. Thread-safe; see [`EventLoopHandle::run_at`].
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.shared.timers.lock().unwrap().run_after(delay, Box::new(callback));
        self.wakeup();
        id
    }

    /// Schedules `callback` to run every `interval`. Thread-safe; see [`EventLoopHandle::run_at`].
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.shared.timers.lock().unwrap().run_every(interval, Box::new(callback));
        self.wakeup();
        id
    }

    /// Cancels a previously scheduled timer. Thread-safe; a cancel racing with an about-to-fire
    /// timer is resolved by `TimerQueue` itself via its `cancelling` set.
    pub fn cancel_timer(&self, id: TimerId) {
        self.shared.timers.lock().unwrap().cancel(id);
    }
}

/// Owns one demultiplexer, one wakeup channel, a timer facility, and a queue of cross-thread
/// tasks; runs forever on one thread until `quit()` has been posted.
pub struct EventLoop {
    shared: Arc<Shared>,
    calling_pending_tasks: bool,
    wake_read_fd: RawFd,
    active_channel: Option<Token>,
}

impl EventLoop {
    /// Creates a new loop bound to the calling thread. Fails only on fatal setup errors, which
    /// callers are expected to treat as unrecoverable.
    pub fn new() -> std::io::Result<Self> {
        let demux = poll::default_backend()?;

        let mut pipe_fds = [0 as RawFd; 2];
        // SAFETY: `pipe_fds` is a valid 2-element buffer for `pipe(2)` to populate.
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (wake_read_fd, wake_write_fd) = (pipe_fds[0], pipe_fds[1]);
        set_nonblocking(wake_read_fd);
        set_nonblocking(wake_write_fd);

        let shared = Arc::new(Shared {
            thread_id: std::thread::current().id(),
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            wake_write_fd,
            registry: Mutex::new(Registry {
                demux,
                channels: Slab::new(),
            }),
            timers: Mutex::new(TimerQueue::new()),
        });

        let loop_ = EventLoop {
            shared,
            calling_pending_tasks: false,
            wake_read_fd,
            active_channel: None,
        };

        let wake_channel = Arc::new(Mutex::new(Channel::new(wake_read_fd)));
        {
            let mut c = wake_channel.lock().unwrap();
            c.enable_reading();
            let read_fd = wake_read_fd;
            c.set_read_callback(Box::new(move |_now| {
                drain_wakeup_pipe(read_fd);
            }));
        }
        let handle = loop_.handle();
        let wake_token = handle.register_channel(wake_channel);
        handle.update_channel(wake_token)?;

        Ok(loop_)
    }

    /// A cloneable, `Send` handle other threads can use to reach this loop.
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// True if the calling thread is this loop's owning thread.
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Asserts (always, not just in debug builds) that the calling thread owns this loop.
    /// Violating this indicates a bug in the embedding application, not a recoverable runtime
    /// condition.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop method called from a non-owning thread"
        );
    }

    /// Registers a new channel, returning the token it was assigned. Thread-safe; see
    /// [`EventLoopHandle::register_channel`].
    pub fn register_channel(&self, channel: SharedChannel) -> Token {
        self.handle().register_channel(channel)
    }

    /// Pushes this channel's current interest mask to the demultiplexer. Thread-safe; see
    /// [`EventLoopHandle::update_channel`].
    pub fn update_channel(&self, token: Token) -> std::io::Result<()> {
        self.handle().update_channel(token)
    }

    /// Removes a channel from both the demultiplexer and this loop's table. Thread-safe; see
    /// [`EventLoopHandle::remove_channel`].
    pub fn remove_channel(&self, token: Token) -> std::io::Result<()> {
        self.handle().remove_channel(token)
    }

    /// Schedules `callback` to run once at `when`. Prefer calling this directly on loop-thread
    /// code; see [`EventLoopHandle::run_at`] for the thread-safe entry point foreign threads use.
    pub fn run_at(&mut self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.handle().run_at(when, callback)
    }

    /// Schedules `callback` to run once after `delay`. See [`EventLoop::run_at`].
    pub fn run_after(&mut self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.handle().run_after(delay, callback)
    }

    /// Schedules `callback` to run every `interval`. See [`EventLoop::run_at`].
    pub fn run_every(&mut self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.handle().run_every(interval, callback)
    }

    /// Cancels a previously scheduled timer.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.assert_in_loop_thread();
        self.handle().cancel_timer(id);
    }

    /// Runs `task` inline (this is always called from the loop thread, since `EventLoop` itself
    /// is `!Send` in spirit — use [`EventLoopHandle`] from foreign threads).
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.assert_in_loop_thread();
        task();
    }

    /// Token identifying the channel most recently dispatched, for diagnostic use during dispatch.
    pub fn active_channel(&self) -> Option<Token> {
        self.active_channel
    }

    /// Runs the loop forever, until `quit()` has been posted and `poll` subsequently wakes up.
    pub fn run(&mut self) {
        self.assert_in_loop_thread();
        log::debug!("EventLoop started on {:?}", self.shared.thread_id);

        while !self.shared.quit.load(Ordering::SeqCst) {
            let now = Instant::now();
            let timeout = self.shared.timers.lock().unwrap().next_timeout(now);

            let (poll_time, ready) = match self
                .shared
                .registry
                .lock()
                .unwrap()
                .demux
                .poll(timeout)
            {
                Ok(r) => r,
                Err(e) => {
                    log::error!("demultiplexer poll failed: {e}");
                    continue;
                }
            };

            for event in &ready {
                self.active_channel = Some(event.token);
                let channel = self
                    .shared
                    .registry
                    .lock()
                    .unwrap()
                    .channels
                    .get(event.token.0)
                    .cloned();
                if let Some(channel) = channel {
                    let mut c = channel.lock().unwrap();
                    c.handle_event_tied(poll_time, event.ready, event.hup, event.error);
                }
            }
            self.active_channel = None;

            self.shared.timers.lock().unwrap().run_expired(Instant::now());
            self.drain_pending_tasks();
        }

        log::debug!("EventLoop on {:?} quitting", self.shared.thread_id);
    }

    fn drain_pending_tasks(&mut self) {
        self.calling_pending_tasks = true;
        let tasks = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending_tasks = false;
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // SAFETY: both ends of the self-pipe were opened by this loop in `new` and are not
        // shared with any other owner at drop time.
        unsafe {
            libc::close(self.wake_read_fd);
            libc::close(self.shared.wake_write_fd);
        }
    }
}

fn drain_wakeup_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: `buf` is a valid buffer of the given length; the fd is non-blocking so this
        // loop terminates once `EAGAIN`/`EWOULDBLOCK` is returned.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    // SAFETY: `fd` is a valid, open descriptor owned by this loop.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        event_loop.run_in_loop(move || f.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_tasks_from_a_foreign_thread_run_in_fifo_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let quit_handle = handle.clone();
        let o1 = order.clone();
        let o2 = order.clone();

        let poster = std::thread::spawn(move || {
            handle.queue_in_loop(move || o1.lock().unwrap().push(1));
            handle.queue_in_loop(move || o2.lock().unwrap().push(2));
            handle.queue_in_loop(move || {});
        });

        // Run a few iterations then quit; the queued tasks should have executed in order.
        let quit_order = order.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        quit_handle.queue_in_loop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        poster.join().unwrap();

        // Give ourselves one more queued task whose execution we can observe to know the loop
        // made at least one pass after the above were queued, then quit.
        let quit_handle2 = quit_handle.clone();
        quit_handle.queue_in_loop(move || quit_handle2.quit());

        event_loop.run();

        assert_eq!(vec![1, 2], *quit_order.lock().unwrap());
    }
}
