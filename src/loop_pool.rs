//! A fixed pool of IO loops, each running on its own thread, with round-robin assignment.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::event_loop::{EventLoop, EventLoopHandle};

/// Owns `n` background IO loops and hands out their handles round-robin. The loop that creates a
/// `LoopPool` (typically a `TcpServer`'s own acceptor loop) is not part of the pool; when the pool
/// has zero loops, `get_next_loop` returns that base loop's own handle instead.
pub struct LoopPool {
    base_loop: EventLoopHandle,
    loops: Vec<EventLoopHandle>,
    threads: Vec<JoinHandle<()>>,
    next: Mutex<usize>,
}

impl LoopPool {
    /// Creates a pool of `num_threads` loops, each spawned on its own OS thread and already
    /// running by the time this returns.
    pub fn start(base_loop: EventLoopHandle, num_threads: usize) -> std::io::Result<Self> {
        let mut loops = Vec::with_capacity(num_threads);
        let mut threads = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let (tx, rx) = std::sync::mpsc::channel();
            let handle = std::thread::Builder::new()
                .name(format!("io-loop-{i}"))
                .spawn(move || {
                    let mut event_loop = match EventLoop::new() {
                        Ok(l) => l,
                        Err(e) => {
                            log::error!("io-loop-{i} failed to start: {e}");
                            return;
                        }
                    };
                    let _ = tx.send(event_loop.handle());
                    event_loop.run();
                })?;
            threads.push(handle);
            loops.push(rx.recv().expect("loop thread dropped its handle sender"));
        }

        Ok(LoopPool {
            base_loop,
            loops,
            threads,
            next: Mutex::new(0),
        })
    }

    /// Returns the next loop handle, round-robin, or the base loop if the pool has no threads of
    /// its own.
    pub fn get_next_loop(&self) -> EventLoopHandle {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }

        let mut next = self.next.lock().unwrap();
        let handle = self.loops[*next].clone();
        *next = (*next + 1) % self.loops.len();
        handle
    }

    /// All loop handles in the pool, in assignment order.
    pub fn loops(&self) -> &[EventLoopHandle] {
        &self.loops
    }

    /// Requests every loop in the pool to quit and joins their threads.
    pub fn stop(&mut self) {
        for l in &self.loops {
            l.quit();
        }
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared handle to a running `LoopPool`, for components (e.g. `Acceptor`'s new-connection
/// callback) that need `get_next_loop` but don't own the pool itself.
pub type SharedLoopPool = Arc<LoopPool>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_robins_across_loops() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopPool::start(base.handle(), 3).unwrap();

        assert_eq!(3, pool.loops().len());
        // Six draws over three loops should exercise every loop exactly twice; nothing here
        // panics or blocks if round-robin assignment wraps correctly.
        for _ in 0..6 {
            let handle = pool.get_next_loop();
            handle.run_in_loop(|| {});
        }
        pool.stop();
    }

    #[test]
    fn zero_threads_returns_base_loop() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopPool::start(base.handle(), 0).unwrap();
        let got = pool.get_next_loop();
        assert!(got.is_in_loop_thread());
        pool.stop();
    }
}
