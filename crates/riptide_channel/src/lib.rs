#![doc = include_str!("../README.md")]

use core::fmt::{self, Display};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};

use riptide::transport::{Transport, TransportEvent};

/// Address of one [`ChannelTransport`] on a [`ChannelNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelAddr(u64);

impl Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error type for operations on a [`ChannelTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The destination address is not (or no longer) on the network.
    #[error("no route to endpoint")]
    NoRoute,
    /// This transport has been shut down.
    #[error("transport closed")]
    Closed,
}

type Registry = Arc<Mutex<HashMap<ChannelAddr, Sender<(Bytes, ChannelAddr)>>>>;

/// A process-local datagram network.
///
/// Cheap to clone; all clones share the same address space.
#[derive(Debug, Clone, Default)]
pub struct ChannelNetwork {
    registry: Registry,
    next_addr: Arc<Mutex<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a poisoned registry only means another test thread panicked; the data
    // (a map of senders) cannot be left inconsistent by that
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ChannelNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transport on this network under a fresh address.
    #[must_use]
    pub fn open(&self) -> ChannelTransport {
        let addr = {
            let mut next = lock(&self.next_addr);
            *next += 1;
            ChannelAddr(*next)
        };
        let (send, recv) = crossbeam_channel::unbounded();
        lock(&self.registry).insert(addr, send);
        ChannelTransport {
            addr,
            registry: Arc::clone(&self.registry),
            recv,
            open: true,
        }
    }
}

/// Implementation of [`Transport`] moving datagrams over in-memory MPSC
/// channels.
///
/// See the [crate-level documentation](crate).
#[derive(Debug)]
pub struct ChannelTransport {
    addr: ChannelAddr,
    registry: Registry,
    recv: Receiver<(Bytes, ChannelAddr)>,
    open: bool,
}

impl ChannelTransport {
    /// Gets this transport's own address on the network.
    #[must_use]
    pub const fn addr(&self) -> ChannelAddr {
        self.addr
    }
}

impl Transport for ChannelTransport {
    type Endpoint = ChannelAddr;
    type Error = ChannelError;

    fn send(&mut self, datagram: &[u8], to: Self::Endpoint) -> Result<(), Self::Error> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        let sender = lock(&self.registry)
            .get(&to)
            .cloned()
            .ok_or(ChannelError::NoRoute)?;
        sender
            .send((Bytes::copy_from_slice(datagram), self.addr))
            .map_err(|_| ChannelError::NoRoute)
    }

    fn poll(&mut self) -> Option<TransportEvent<Self::Endpoint, Self::Error>> {
        if !self.open {
            return None;
        }
        match self.recv.try_recv() {
            Ok((datagram, from)) => Some(TransportEvent::Recv { datagram, from }),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                // our own sender left the registry: shutdown already reported
                self.open = false;
                Some(TransportEvent::Error {
                    endpoint: None,
                    error: ChannelError::Closed,
                })
            }
        }
    }

    fn close(&mut self, _endpoint: Self::Endpoint) {
        // no per-endpoint resources to release
    }

    fn shutdown(&mut self) {
        lock(&self.registry).remove(&self.addr);
        self.open = false;
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if self.open {
            lock(&self.registry).remove(&self.addr);
        }
    }
}
