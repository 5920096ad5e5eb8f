//! Scriptable in-memory channel for unit testing
//!
//! Mirrors the role a simulated ECU plays in hardware-less tests: a
//! callback maps each request to an optional response, the channel
//! records everything it saw, and an optional failure point simulates a
//! mid-scan disconnect.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{ChannelError, ChannelResult, DiagChannel};

type Handler = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Shared scripted ECU behaviour behind one or more [MockChannel]s
pub struct MockEcu {
    handler: Handler,
    requests: Vec<Vec<u8>>,
}

impl std::fmt::Debug for MockEcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEcu")
            .field("requests_seen", &self.requests.len())
            .finish()
    }
}

impl MockEcu {
    /// Creates a scripted ECU from a request handler. Returning `None`
    /// simulates an ECU that stays silent.
    pub fn new<F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static>(handler: F) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            handler: Box::new(handler),
            requests: Vec::new(),
        }))
    }

    /// All requests observed so far, in order
    pub fn requests(&self) -> &[Vec<u8>] {
        &self.requests
    }

    /// Number of requests observed for one service id
    pub fn count_for_service(&self, sid: u8) -> usize {
        self.requests.iter().filter(|r| r.first() == Some(&sid)).count()
    }
}

/// In-memory channel backed by a [MockEcu]
pub struct MockChannel {
    ecu: Arc<Mutex<MockEcu>>,
    rx: VecDeque<Vec<u8>>,
    open: bool,
    /// Simulated link failure after this many sends, if set
    fail_after: Option<usize>,
    sent: usize,
    mtu: usize,
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("open", &self.open)
            .field("sent", &self.sent)
            .finish()
    }
}

impl MockChannel {
    /// Creates a channel over shared scripted behaviour
    pub fn new(ecu: Arc<Mutex<MockEcu>>) -> Self {
        Self {
            ecu,
            rx: VecDeque::new(),
            open: false,
            fail_after: None,
            sent: 0,
            mtu: 4095,
        }
    }

    /// Simulate a disconnect after `n` successful sends
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl DiagChannel for MockChannel {
    fn open(&mut self) -> ChannelResult<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.open = false;
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        if let Some(limit) = self.fail_after {
            if self.sent >= limit {
                self.open = false;
                return Err(ChannelError::Disconnected);
            }
        }
        self.sent += 1;
        let mut ecu = self.ecu.lock().unwrap();
        ecu.requests.push(payload.to_vec());
        if let Some(resp) = (ecu.handler)(payload) {
            self.rx.push_back(resp);
        }
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> ChannelResult<Vec<u8>> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        self.rx.pop_front().ok_or(ChannelError::ReadTimeout)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
