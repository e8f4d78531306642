// SPDX-License-Identifier: GPL-3.0-only

//! Poller thread
//!
//! Blocks on a set of device descriptors on behalf of a listener. When the
//! poll returns, the set is partitioned into devices with data (active) and
//! without (inactive) and the listener is notified synchronously. A listener
//! answering [`PollOutcome::Retry`] gets the inactive subset polled again
//! under the same request id.
//!
//! A self-pipe is part of every poll set so [`Poller::flush`] can interrupt a
//! blocking poll.

use crate::errors::{HalError, HalResult};
use crate::message_queue::{MessageQueue, Reply, reply};
use crate::v4l2::device::poll_descriptors;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// A descriptor to poll, tagged with a caller-defined id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTarget {
    pub id: u32,
    pub fd: RawFd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEvent {
    pub request_id: u32,
    pub active: Vec<PollTarget>,
    pub inactive: Vec<PollTarget>,
    /// Everything this round polled
    pub polled: Vec<PollTarget>,
    pub timed_out: bool,
}

impl PollEvent {
    pub fn is_active(&self, id: u32) -> bool {
        self.active.iter().any(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Event consumed
    Done,
    /// Poll the inactive devices again
    Retry,
}

pub trait PollEventListener: Send + Sync {
    fn notify_poll_event(&self, event: &PollEvent) -> HalResult<PollOutcome>;
}

enum PollerMessage {
    Poll {
        request_id: u32,
        targets: Vec<PollTarget>,
        timeout_ms: i32,
    },
    Flush {
        reply: Option<Reply<()>>,
    },
    Exit,
}

struct FlushPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl FlushPipe {
    fn new() -> HalResult<Self> {
        let mut fds = [0; 2];
        // SAFETY: fds is a valid two-element array
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret != 0 {
            return Err(HalError::last_os_error("pipe2"));
        }
        // SAFETY: pipe2 returned two fresh descriptors that nothing else owns
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    fn wake(&self) {
        // SAFETY: one byte from a valid buffer to a descriptor we own
        let n = unsafe { libc::write(self.write.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        if n < 0 {
            // EAGAIN means a wake-up is already pending
            debug!(error = %std::io::Error::last_os_error(), "Flush pipe write");
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        // SAFETY: reading into a local buffer from a non-blocking descriptor we own
        while unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }
}

pub struct Poller {
    name: String,
    queue: MessageQueue<PollerMessage>,
    pipe: Arc<FlushPipe>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn start(name: &str, listener: Arc<dyn PollEventListener>) -> HalResult<Self> {
        let queue = MessageQueue::new("poller");
        let pipe = Arc::new(FlushPipe::new()?);
        let worker = PollerWorker {
            name: name.to_string(),
            queue: queue.clone(),
            pipe: Arc::clone(&pipe),
            listener,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-poller", name))
            .spawn(move || worker.run())
            .map_err(|e| HalError::from_io("spawn", &e))?;
        info!(name = %name, "Poller thread started");
        Ok(Self {
            name: name.to_string(),
            queue,
            pipe,
            thread: Some(thread),
        })
    }

    /// Poll `targets` asynchronously; the listener is notified on completion
    pub fn poll_request(&self, request_id: u32, targets: Vec<PollTarget>, timeout_ms: i32) -> HalResult<()> {
        if targets.is_empty() {
            return Err(HalError::InvalidArgument("poll request with no devices".to_string()));
        }
        self.queue.send(PollerMessage::Poll {
            request_id,
            targets,
            timeout_ms,
        })
    }

    /// Drop pending poll requests and interrupt a blocking poll
    ///
    /// With `sync` the call returns once the poller thread has processed the
    /// flush, so no notification for a discarded request can follow it.
    pub fn flush(&self, sync: bool) -> HalResult<()> {
        let dropped = self
            .queue
            .remove_matching(|m| matches!(m, PollerMessage::Poll { .. }))
            .len();
        debug!(name = %self.name, dropped, sync, "Flushing poller");
        self.pipe.wake();
        if sync {
            self.queue.request(|tx| PollerMessage::Flush { reply: Some(tx) })
        } else {
            self.queue.send(PollerMessage::Flush { reply: None })
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.queue.remove_matching(|m| matches!(m, PollerMessage::Poll { .. }));
        if self.queue.send(PollerMessage::Exit).is_ok() {
            self.pipe.wake();
        }
        self.queue.close();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "Poller thread panicked");
            }
        }
        debug!(name = %self.name, "Poller stopped");
    }
}

struct PollerWorker {
    name: String,
    queue: MessageQueue<PollerMessage>,
    pipe: Arc<FlushPipe>,
    listener: Arc<dyn PollEventListener>,
}

impl PollerWorker {
    fn run(self) {
        while let Some(message) = self.queue.receive() {
            match message {
                PollerMessage::Poll {
                    request_id,
                    targets,
                    timeout_ms,
                } => self.handle_poll(request_id, targets, timeout_ms),
                PollerMessage::Flush { reply: tx } => {
                    self.pipe.drain();
                    if let Some(tx) = tx {
                        reply(tx, Ok(()));
                    }
                }
                PollerMessage::Exit => break,
            }
        }
        debug!(name = %self.name, "Poller thread exiting");
    }

    fn handle_poll(&self, request_id: u32, mut targets: Vec<PollTarget>, timeout_ms: i32) {
        loop {
            let mut fds: Vec<libc::pollfd> = targets
                .iter()
                .map(|t| libc::pollfd {
                    fd: t.fd,
                    events: libc::POLLPRI | libc::POLLIN | libc::POLLERR,
                    revents: 0,
                })
                .collect();
            fds.push(libc::pollfd {
                fd: self.pipe.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });

            let ready = match poll_descriptors(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    error!(name = %self.name, request_id, error = %e, "Poll failed");
                    return;
                }
            };

            let (pipe_fd, device_fds) = fds.split_last().map_or((None, &fds[..]), |(p, rest)| (Some(p), rest));
            if pipe_fd.is_some_and(|p| p.revents & libc::POLLIN != 0) {
                debug!(name = %self.name, request_id, "Poll interrupted by flush");
                self.pipe.drain();
                return;
            }

            let mut event = PollEvent {
                request_id,
                active: Vec::new(),
                inactive: Vec::new(),
                polled: targets.clone(),
                timed_out: ready == 0,
            };
            for (target, pfd) in targets.iter().zip(device_fds) {
                if pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                    event.active.push(*target);
                } else {
                    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                        warn!(name = %self.name, id = target.id, revents = pfd.revents, "Device error while polling");
                    }
                    event.inactive.push(*target);
                }
            }
            if event.timed_out {
                warn!(name = %self.name, request_id, timeout_ms, "Poll timed out");
            }

            match self.listener.notify_poll_event(&event) {
                Ok(PollOutcome::Retry) if !event.inactive.is_empty() => {
                    debug!(name = %self.name, request_id, retry = event.inactive.len(), "Re-polling inactive devices");
                    targets = event.inactive;
                }
                Ok(_) => return,
                Err(e) => {
                    warn!(name = %self.name, request_id, error = %e, "Poll listener failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder {
        events: mpsc::Sender<PollEvent>,
        retry_once: Mutex<bool>,
    }

    impl PollEventListener for Recorder {
        fn notify_poll_event(&self, event: &PollEvent) -> HalResult<PollOutcome> {
            let _ = self.events.send(event.clone());
            let mut retry = self.retry_once.lock().unwrap();
            if *retry {
                *retry = false;
                return Ok(PollOutcome::Retry);
            }
            Ok(PollOutcome::Done)
        }
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let p = FlushPipe::new().unwrap();
        (p.read, p.write)
    }

    fn signal(fd: &OwnedFd) {
        let n = unsafe { libc::write(fd.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn partitions_active_and_inactive() {
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Recorder {
            events: tx,
            retry_once: Mutex::new(false),
        });
        let poller = Poller::start("test", listener).unwrap();
        let (a_read, a_write) = pipe();
        let (b_read, _b_write) = pipe();
        signal(&a_write);

        let targets = vec![
            PollTarget { id: 1, fd: a_read.as_raw_fd() },
            PollTarget { id: 2, fd: b_read.as_raw_fd() },
        ];
        poller.poll_request(7, targets, 500).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.request_id, 7);
        assert!(event.is_active(1));
        assert_eq!(event.inactive.len(), 1);
        assert_eq!(event.inactive[0].id, 2);
        assert!(!event.timed_out);
    }

    #[test]
    fn retry_polls_only_inactive_devices() {
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Recorder {
            events: tx,
            retry_once: Mutex::new(true),
        });
        let poller = Poller::start("test", listener).unwrap();
        let (a_read, a_write) = pipe();
        let (b_read, b_write) = pipe();
        signal(&a_write);
        poller
            .poll_request(
                1,
                vec![
                    PollTarget { id: 1, fd: a_read.as_raw_fd() },
                    PollTarget { id: 2, fd: b_read.as_raw_fd() },
                ],
                2000,
            )
            .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.polled.len(), 2);
        signal(&b_write);
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second.polled.len(), 1);
        assert_eq!(second.polled[0].id, 2);
        assert!(second.is_active(2));
    }

    #[test]
    fn timeout_is_reported() {
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Recorder {
            events: tx,
            retry_once: Mutex::new(false),
        });
        let poller = Poller::start("test", listener).unwrap();
        let (read, _write) = pipe();
        poller
            .poll_request(3, vec![PollTarget { id: 1, fd: read.as_raw_fd() }], 20)
            .unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.timed_out);
        assert!(event.active.is_empty());
    }

    #[test]
    fn flush_interrupts_blocking_poll() {
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Recorder {
            events: tx,
            retry_once: Mutex::new(false),
        });
        let poller = Poller::start("test", listener).unwrap();
        let (read, _write) = pipe();
        poller
            .poll_request(4, vec![PollTarget { id: 1, fd: read.as_raw_fd() }], 10_000)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        poller.flush(true).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
