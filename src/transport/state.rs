//! Channel lifecycle and the websocket state derived from it.

use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Lifecycle of the underlying duplex channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ChannelLifecycle {
    Created = 0,
    Opening = 1,
    Opened = 2,
    Closing = 3,
    Closed = 4,
    Faulted = 5,
}

impl ChannelLifecycle {
    /// Closed and faulted channels never come back.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

/// Raw lifecycle value that does not name a [`ChannelLifecycle`].
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("unknown channel lifecycle value {0}")]
pub struct UnknownLifecycle(pub u8);

impl TryFrom<u8> for ChannelLifecycle {
    type Error = UnknownLifecycle;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Created),
            1 => Ok(Self::Opening),
            2 => Ok(Self::Opened),
            3 => Ok(Self::Closing),
            4 => Ok(Self::Closed),
            5 => Ok(Self::Faulted),
            other => Err(UnknownLifecycle(other)),
        }
    }
}

/// Websocket-style connection state reported to callers.
///
/// A connecting state is not modeled; channels that are still being created
/// or opened report [`ConnectionState::None`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    None,
    Open,
    CloseReceived,
    Closed,
    Aborted,
}

impl From<ChannelLifecycle> for ConnectionState {
    fn from(lifecycle: ChannelLifecycle) -> Self {
        match lifecycle {
            ChannelLifecycle::Created | ChannelLifecycle::Opening => Self::None,
            ChannelLifecycle::Opened => Self::Open,
            ChannelLifecycle::Closing => Self::CloseReceived,
            ChannelLifecycle::Closed => Self::Closed,
            ChannelLifecycle::Faulted => Self::Aborted,
        }
    }
}

/// Atomic lifecycle cell shared between a client and its channel worker.
#[derive(Debug)]
pub(crate) struct LifecycleCell {
    raw: AtomicU8,
}

impl LifecycleCell {
    pub(crate) fn new() -> Self {
        Self {
            raw: AtomicU8::new(ChannelLifecycle::Created as u8),
        }
    }

    /// Current lifecycle.
    ///
    /// Panics if the cell holds a value outside [`ChannelLifecycle`]; only
    /// this module writes to it, so that is a programming error.
    pub(crate) fn load(&self) -> ChannelLifecycle {
        let raw = self.raw.load(Ordering::Acquire);
        match ChannelLifecycle::try_from(raw) {
            Ok(lifecycle) => lifecycle,
            Err(err) => unreachable!("{err}"),
        }
    }

    /// Moves to `next` unless the current lifecycle is terminal.
    ///
    /// Returns the lifecycle observed before the transition attempt.
    pub(crate) fn advance(&self, next: ChannelLifecycle) -> ChannelLifecycle {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            let lifecycle = match ChannelLifecycle::try_from(current) {
                Ok(lifecycle) => lifecycle,
                Err(err) => unreachable!("{err}"),
            };
            if lifecycle.is_terminal() {
                return lifecycle;
            }
            match self.raw.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return lifecycle,
                Err(observed) => current = observed,
            }
        }
    }

    #[cfg(test)]
    fn store_raw(&self, raw: u8) {
        self.raw.store(raw, Ordering::Release);
    }
}
