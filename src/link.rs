// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervised Handles
//!
//! A supervisor publishes its state and its current handle together through a
//! `tokio::sync::watch` channel. Readers always see a consistent
//! `(state, handle)` pair and never a handle that has already been replaced.

use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// Lifecycle of a supervised connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
        };
        f.write_str(state)
    }
}

/// State of a supervised resource plus its handle while connected.
pub struct Link<T: ?Sized> {
    pub state: LinkState,
    pub handle: Option<Arc<T>>,
}

impl<T: ?Sized> Link<T> {
    /// No handle, `Disconnected`.
    pub fn disconnected() -> Self {
        Self {
            state: LinkState::Disconnected,
            handle: None,
        }
    }

    /// `Connected` through `handle`.
    pub fn connected(handle: Arc<T>) -> Self {
        Self {
            state: LinkState::Connected,
            handle: Some(handle),
        }
    }

    /// No handle, in `state`.
    pub fn with_state(state: LinkState) -> Self {
        Self {
            state,
            handle: None,
        }
    }

    /// True while connected through exactly `handle`.
    fn holds(&self, handle: &Arc<T>) -> bool {
        self.state == LinkState::Connected
            && self
                .handle
                .as_ref()
                .is_some_and(|current| same_handle(current, handle))
    }
}

impl<T: ?Sized> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            handle: self.handle.clone(),
        }
    }
}

/// Compares handles by address, ignoring trait-object metadata.
pub fn same_handle<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Read side of a supervised resource.
pub struct LinkWatcher<T: ?Sized> {
    name: String,
    rx: watch::Receiver<Link<T>>,
}

impl<T: ?Sized> Clone for LinkWatcher<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: ?Sized> LinkWatcher<T> {
    pub(crate) fn new(name: &str, rx: watch::Receiver<Link<T>>) -> Self {
        Self {
            name: name.to_owned(),
            rx,
        }
    }

    /// Name of the supervised resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published state.
    pub fn state(&self) -> LinkState {
        self.rx.borrow().state
    }

    /// Current handle, if connected.
    pub fn current(&self) -> Option<Arc<T>> {
        let link = self.rx.borrow();
        match link.state {
            LinkState::Connected => link.handle.clone(),
            _ => None,
        }
    }

    /// Waits until a connected handle is published. Returns `None` once the
    /// supervisor is closed or gone.
    pub async fn connected(&mut self) -> Option<Arc<T>> {
        let link = self
            .rx
            .wait_for(|link| matches!(link.state, LinkState::Connected | LinkState::Closed))
            .await
            .ok()?;

        match link.state {
            LinkState::Connected => link.handle.clone(),
            _ => None,
        }
    }

    /// Resolves once `handle` is no longer the connected handle: the resource
    /// failed, was replaced, or the supervisor stopped.
    pub async fn lost(&mut self, handle: &Arc<T>) {
        let _ = self.rx.wait_for(|link| !link.holds(handle)).await;
    }

    /// Waits until the supervisor reaches `state`.
    pub async fn reached(&mut self, state: LinkState) -> bool {
        self.rx.wait_for(|link| link.state == state).await.is_ok()
    }
}
