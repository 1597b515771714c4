//! Readiness notification: epoll-like event sets over protocol sockets and
//!  plain OS sockets.
//!
//! Protocol-socket readiness is driven by the core posting edges through
//!  [`ReadinessService::update_events`] whenever a readiness condition flips
//!  (backlog non-empty, receive data available, send buffer drained, broken).
//!  OS sockets are checked with a non-blocking `poll(2)` on every wait
//!  iteration, which gives the level-triggered semantics callers expect from
//!  a select-style interface.

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::socket_id::SocketId;

pub type EventSetId = i32;

/// A set of readiness conditions, used both as an interest mask and as a
///  current-ready mask.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
    pub error: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
        error: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
        error: false,
    };
    pub const ERROR: Interest = Interest {
        read: false,
        write: false,
        error: true,
    };
    pub const ALL: Interest = Interest {
        read: true,
        write: true,
        error: true,
    };

    pub fn any(&self) -> bool {
        self.read || self.write || self.error
    }
}

/// What a wait call observed. An error condition is reported as both readable
///  and writable so that callers watching either direction wake up.
#[derive(Default, Debug)]
pub struct ReadyReport {
    pub readable: Vec<SocketId>,
    pub writable: Vec<SocketId>,
    pub sys_readable: Vec<RawFd>,
    pub sys_writable: Vec<RawFd>,
}

impl ReadyReport {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty()
            && self.writable.is_empty()
            && self.sys_readable.is_empty()
            && self.sys_writable.is_empty()
    }
}

struct UsockEntry {
    interest: Interest,
    ready: Interest,
}

struct SsockEntry {
    interest: Interest,
}

#[derive(Default)]
struct EventSet {
    usocks: FxHashMap<SocketId, UsockEntry>,
    ssocks: FxHashMap<RawFd, SsockEntry>,
}

struct ReadinessInner {
    next_id: EventSetId,
    sets: FxHashMap<EventSetId, EventSet>,
}

pub struct ReadinessService {
    inner: Mutex<ReadinessInner>,
    /// Signalled on every posted readiness edge.
    notify: Notify,
    /// Wait granularity while an event set contains OS sockets, whose state
    ///  changes arrive without a notification.
    poll_granularity: Duration,
}

impl ReadinessService {
    pub fn new(poll_granularity: Duration) -> ReadinessService {
        ReadinessService {
            inner: Mutex::new(ReadinessInner {
                next_id: 1,
                sets: FxHashMap::default(),
            }),
            notify: Notify::new(),
            poll_granularity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadinessInner> {
        self.inner.lock().expect("readiness lock poisoned")
    }

    pub fn create(&self) -> EventSetId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sets.insert(id, EventSet::default());
        debug!("created event set {}", id);
        id
    }

    pub fn release(&self, eid: EventSetId) -> Result<(), TransportError> {
        match self.lock().sets.remove(&eid) {
            Some(_) => {
                self.notify.notify_waiters();
                Ok(())
            }
            None => Err(TransportError::InvalidParam("unknown event set")),
        }
    }

    pub fn add_usock(
        &self,
        eid: EventSetId,
        id: SocketId,
        interest: Interest,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let set = Self::set_mut(&mut inner, eid)?;
        set.usocks.insert(
            id,
            UsockEntry {
                interest,
                ready: Interest::default(),
            },
        );
        Ok(())
    }

    pub fn update_usock(
        &self,
        eid: EventSetId,
        id: SocketId,
        interest: Interest,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let set = Self::set_mut(&mut inner, eid)?;
        match set.usocks.get_mut(&id) {
            Some(entry) => {
                entry.interest = interest;
                Ok(())
            }
            None => Err(TransportError::InvalidParam("socket not in event set")),
        }
    }

    pub fn remove_usock(&self, eid: EventSetId, id: SocketId) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let set = Self::set_mut(&mut inner, eid)?;
        set.usocks.remove(&id);
        Ok(())
    }

    pub fn add_ssock(
        &self,
        eid: EventSetId,
        fd: RawFd,
        interest: Interest,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let set = Self::set_mut(&mut inner, eid)?;
        set.ssocks.insert(fd, SsockEntry { interest });
        Ok(())
    }

    pub fn update_ssock(
        &self,
        eid: EventSetId,
        fd: RawFd,
        interest: Interest,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let set = Self::set_mut(&mut inner, eid)?;
        match set.ssocks.get_mut(&fd) {
            Some(entry) => {
                entry.interest = interest;
                Ok(())
            }
            None => Err(TransportError::InvalidParam("socket not in event set")),
        }
    }

    pub fn remove_ssock(&self, eid: EventSetId, fd: RawFd) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let set = Self::set_mut(&mut inner, eid)?;
        set.ssocks.remove(&fd);
        Ok(())
    }

    fn set_mut<'a>(
        inner: &'a mut ReadinessInner,
        eid: EventSetId,
    ) -> Result<&'a mut EventSet, TransportError> {
        inner
            .sets
            .get_mut(&eid)
            .ok_or(TransportError::InvalidParam("unknown event set"))
    }

    /// Post a readiness edge for a protocol socket or group. Called by the
    ///  core after the state change that caused it.
    pub fn update_events(&self, subject: SocketId, events: Interest, enable: bool) {
        let mut signal = false;
        {
            let mut inner = self.lock();
            for set in inner.sets.values_mut() {
                if let Some(entry) = set.usocks.get_mut(&subject) {
                    if events.read {
                        entry.ready.read = enable;
                    }
                    if events.write {
                        entry.ready.write = enable;
                    }
                    if events.error {
                        entry.ready.error = enable;
                    }
                    signal = true;
                }
            }
        }
        if signal {
            trace!("readiness edge {:?} for {} -> {}", events, subject, enable);
            self.notify.notify_waiters();
        }
    }

    /// Drop a subject from every event set, so a reclaimed socket can never
    ///  surface from a wait again.
    pub fn scrub_subject(&self, subject: SocketId) {
        let mut inner = self.lock();
        for set in inner.sets.values_mut() {
            set.usocks.remove(&subject);
        }
    }

    /// Wait for readiness on the given event set.
    ///
    /// `timeout` of `Some(Duration::ZERO)` polls once; `None` blocks until
    ///  something becomes ready. An empty report means the timeout elapsed.
    pub async fn wait(
        &self,
        eid: EventSetId,
        timeout: Option<Duration>,
    ) -> Result<ReadyReport, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // register for edge notifications before checking, so an edge
            //  posted concurrently with the check is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (report, has_ssocks) = {
                let inner = self.lock();
                let set = inner
                    .sets
                    .get(&eid)
                    .ok_or(TransportError::InvalidParam("unknown event set"))?;
                (Self::collect(set), !set.ssocks.is_empty())
            };

            if !report.is_empty() {
                return Ok(report);
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(report);
                }
            }

            // OS socket state changes arrive silently, so their presence caps
            //  how long we may sleep between checks
            let max_sleep = deadline.map(|d| d - now);
            let slice = if has_ssocks {
                Some(match max_sleep {
                    Some(rest) => rest.min(self.poll_granularity),
                    None => self.poll_granularity,
                })
            }
            else {
                max_sleep
            };

            match slice {
                Some(slice) => {
                    select! {
                        _ = &mut notified => {}
                        _ = sleep(slice) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn collect(set: &EventSet) -> ReadyReport {
        let mut report = ReadyReport::default();

        for (id, entry) in &set.usocks {
            let error = entry.ready.error && entry.interest.error;
            if (entry.ready.read && entry.interest.read) || error {
                report.readable.push(*id);
            }
            if (entry.ready.write && entry.interest.write) || error {
                report.writable.push(*id);
            }
        }
        report.readable.sort();
        report.writable.sort();

        if !set.ssocks.is_empty() {
            Self::poll_ssocks(set, &mut report);
        }

        report
    }

    /// One non-blocking `poll(2)` over the set's OS sockets.
    fn poll_ssocks(set: &EventSet, report: &mut ReadyReport) {
        let mut pollfds: Vec<libc::pollfd> = set
            .ssocks
            .iter()
            .map(|(fd, entry)| {
                let mut events = 0;
                if entry.interest.read {
                    events |= libc::POLLIN;
                }
                if entry.interest.write {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 0) };
        if rc <= 0 {
            return;
        }

        for pfd in &pollfds {
            let error = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            if pfd.revents & libc::POLLIN != 0 || error {
                report.sys_readable.push(pfd.fd);
            }
            if pfd.revents & libc::POLLOUT != 0 || error {
                report.sys_writable.push(pfd.fd);
            }
        }
    }
}
