// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Supervision
//!
//! A `ChannelSupervisor` keeps one logical channel open on top of a
//! [`ConnectionSupervisor`](crate::connection::ConnectionSupervisor). It only
//! opens a channel on a connection handle the connection supervisor currently
//! publishes as connected, and drops its channel as stale as soon as that
//! handle is lost, then reopens on the replacement without intervention.

use crate::{
    broker::{BrokerChannel, BrokerConnection, CloseNotifier},
    errors::AmqpError,
    link::{Link, LinkState, LinkWatcher},
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

enum Event {
    ChannelFailed(String),
    ConnectionLost,
    Stop,
}

pub struct ChannelSupervisor {
    name: String,
    connection: LinkWatcher<dyn BrokerConnection>,
    backoff: Duration,
    link: watch::Sender<Link<dyn BrokerChannel>>,
    stop: watch::Sender<bool>,
    opened: AtomicU64,
}

impl ChannelSupervisor {
    /// Creates a supervisor for the channel `name` on the connection seen
    /// through `connection`.
    ///
    /// # Parameters
    /// * `name` - Configuration key of the channel
    /// * `connection` - Watcher of the owning connection supervisor
    /// * `backoff` - Delay before retrying a failed channel open
    pub fn new(
        name: &str,
        connection: LinkWatcher<dyn BrokerConnection>,
        backoff: Duration,
    ) -> Self {
        let (link, _) = watch::channel(Link::disconnected());
        let (stop, _) = watch::channel(false);

        Self {
            name: name.to_owned(),
            connection,
            backoff,
            link,
            stop,
            opened: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last state published to watchers.
    pub fn state(&self) -> LinkState {
        self.link.borrow().state
    }

    /// Number of channels opened so far.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Subscribes to state and handle changes. Consumers and the producer
    /// read the current channel through it.
    pub fn watch(&self) -> LinkWatcher<dyn BrokerChannel> {
        LinkWatcher::new(&self.name, self.link.subscribe())
    }

    /// Supervises the channel until [`ChannelSupervisor::close`] is called or
    /// the owning connection supervisor closes.
    pub async fn start(&self) -> Result<(), AmqpError> {
        info!(
            name = %self.name,
            connection = %self.connection.name(),
            "starting channel watcher"
        );
        let mut stop = self.stop.subscribe();
        let mut parent = self.connection.clone();

        while !*stop.borrow() {
            let conn = tokio::select! {
                conn = parent.connected() => conn,
                _ = stop.wait_for(|stopped| *stopped) => break,
            };

            let Some(conn) = conn else {
                warn!(
                    name = %self.name,
                    connection = %parent.name(),
                    "connection closed, stopping the channel watcher"
                );
                break;
            };

            self.link.send_replace(Link::with_state(LinkState::Connecting));

            let Some((channel, mut notifier)) = self.open(conn.as_ref()).await else {
                self.link.send_replace(Link::disconnected());
                if self.sleep_or_stop(&mut stop).await {
                    break;
                }
                continue;
            };

            self.link.send_replace(Link::connected(channel.clone()));

            let event = tokio::select! {
                reason = notifier.recv() => Event::ChannelFailed(
                    reason.map_or_else(|| "notifier dropped".to_owned(), |err| err.to_string()),
                ),
                _ = parent.lost(&conn) => Event::ConnectionLost,
                _ = stop.wait_for(|stopped| *stopped) => Event::Stop,
            };

            match event {
                Event::Stop => break,
                Event::ConnectionLost => {
                    warn!(
                        name = %self.name,
                        connection = %parent.name(),
                        "connection lost, waiting for it to come back before reopening the channel"
                    );
                    self.link.send_replace(Link::disconnected());
                    release(channel.as_ref(), conn.as_ref(), &self.name).await;
                }
                Event::ChannelFailed(reason) => {
                    error!(
                        name = %self.name,
                        connection = %parent.name(),
                        error = reason,
                        "channel closed, reconnecting"
                    );
                    self.link.send_replace(Link::disconnected());
                    release(channel.as_ref(), conn.as_ref(), &self.name).await;

                    if self.sleep_or_stop(&mut stop).await {
                        break;
                    }
                }
            }
        }

        info!(name = %self.name, "stopping the channel watcher");
        self.shutdown().await;
        Ok(())
    }

    /// Signals shutdown and closes the current channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.stop.send_replace(true);
        self.shutdown().await;
        Ok(())
    }

    async fn open(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Option<(Arc<dyn BrokerChannel>, CloseNotifier)> {
        match conn.create_channel().await {
            Ok(channel) => {
                self.opened.fetch_add(1, Ordering::Relaxed);
                let notifier = channel.notify_close();
                info!(
                    name = %self.name,
                    connection = %self.connection.name(),
                    "created channel to rabbitmq"
                );
                Some((channel, notifier))
            }
            Err(err) => {
                error!(
                    name = %self.name,
                    connection = %self.connection.name(),
                    error = err.to_string(),
                    backoff = ?self.backoff,
                    "failed to create channel, retrying"
                );
                None
            }
        }
    }

    async fn sleep_or_stop(&self, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => false,
            _ = stop.wait_for(|stopped| *stopped) => true,
        }
    }

    async fn shutdown(&self) {
        let mut previous = None;
        let changed = self.link.send_if_modified(|link| {
            if link.state == LinkState::Closed {
                return false;
            }
            previous = link.handle.take();
            link.state = LinkState::Closing;
            true
        });

        if !changed {
            return;
        }

        if let Some(channel) = previous {
            if !channel.is_closed() {
                match channel.close().await {
                    Ok(_) => info!(
                        channel = %self.name,
                        connection = %self.connection.name(),
                        "closed channel to rabbitmq"
                    ),
                    Err(err) => warn!(
                        channel = %self.name,
                        error = err.to_string(),
                        "failure to close channel"
                    ),
                }
            }
        }

        self.link.send_replace(Link::with_state(LinkState::Closed));
    }
}

/// Closes a channel that is still open on a live connection.
async fn release(channel: &dyn BrokerChannel, conn: &dyn BrokerConnection, name: &str) {
    if channel.is_closed() || conn.is_closed() {
        debug!(name, "channel already closed");
        return;
    }

    if let Err(err) = channel.close().await {
        warn!(name, error = err.to_string(), "failure to close channel");
    }
}
