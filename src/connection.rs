// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! A `ConnectionSupervisor` owns one physical broker connection for the
//! lifetime of the process. It dials, waits for the broker's failure
//! notification, and redials after a fixed backoff until it is told to stop.
//! Dial failures are logged and retried, never surfaced to callers.
//!
//! Every new connection replaces the previous handle through the supervisor's
//! [`LinkWatcher`]; dependents never hold on to a handle the supervisor has
//! already given up.

use crate::{
    broker::{Broker, BrokerConnection, CloseNotifier},
    configs::ConnectionConfig,
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
use tracing::{error, info, warn};

enum Event {
    Failed(String),
    Stop,
}

pub struct ConnectionSupervisor {
    name: String,
    service_name: String,
    config: ConnectionConfig,
    broker: Arc<dyn Broker>,
    backoff: Duration,
    link: watch::Sender<Link<dyn BrokerConnection>>,
    stop: watch::Sender<bool>,
    attempts: AtomicU64,
}

impl ConnectionSupervisor {
    /// Creates a supervisor for the connection `name`. Nothing is dialed
    /// until [`ConnectionSupervisor::start`] runs.
    ///
    /// `service_name` is announced to the broker as the connection name.
    pub fn new(
        name: &str,
        service_name: &str,
        config: ConnectionConfig,
        broker: Arc<dyn Broker>,
        backoff: Duration,
    ) -> Self {
        let (link, _) = watch::channel(Link::disconnected());
        let (stop, _) = watch::channel(false);

        Self {
            name: name.to_owned(),
            service_name: service_name.to_owned(),
            config,
            broker,
            backoff,
            link,
            stop,
            attempts: AtomicU64::new(0),
        }
    }

    /// Configuration key of the connection, not the name announced to the
    /// broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last state published to watchers.
    pub fn state(&self) -> LinkState {
        self.link.borrow().state
    }

    /// Number of dial attempts so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Subscribes to state and handle changes.
    ///
    /// # Returns
    /// A watcher that sees the current connection and every replacement, used
    /// by channel supervisors to open channels on the live connection
    pub fn watch(&self) -> LinkWatcher<dyn BrokerConnection> {
        LinkWatcher::new(&self.name, self.link.subscribe())
    }

    /// Supervises the connection until [`ConnectionSupervisor::close`] is called.
    pub async fn start(&self) -> Result<(), AmqpError> {
        info!(
            name = %self.name,
            "starting connection watcher for rabbitmq connection"
        );
        let mut stop = self.stop.subscribe();

        while !*stop.borrow() {
            self.link.send_replace(Link::with_state(LinkState::Connecting));

            let dialed = tokio::select! {
                dialed = self.connect() => dialed,
                _ = stop.wait_for(|stopped| *stopped) => break,
            };

            let Some((conn, mut notifier)) = dialed else {
                self.link.send_replace(Link::disconnected());
                if self.sleep_or_stop(&mut stop).await {
                    break;
                }
                continue;
            };

            self.link.send_replace(Link::connected(conn.clone()));

            let event = tokio::select! {
                reason = notifier.recv() => Event::Failed(
                    reason.map_or_else(|| "notifier dropped".to_owned(), |err| err.to_string()),
                ),
                _ = stop.wait_for(|stopped| *stopped) => Event::Stop,
            };

            match event {
                Event::Stop => break,
                Event::Failed(reason) => {
                    error!(
                        host = %self.config.host,
                        name = %self.name,
                        error = reason,
                        "connection closed"
                    );
                    self.link.send_replace(Link::disconnected());
                    release(conn.as_ref(), &self.name).await;

                    if self.sleep_or_stop(&mut stop).await {
                        break;
                    }
                }
            }
        }

        info!(name = %self.name, "stopping the connection watcher");
        self.shutdown().await;
        Ok(())
    }

    /// Signals shutdown and releases the current connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.stop.send_replace(true);
        self.shutdown().await;
        Ok(())
    }

    async fn connect(&self) -> Option<(Arc<dyn BrokerConnection>, CloseNotifier)> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        info!(
            host = %self.config.host,
            name = %self.name,
            "connecting to rabbitmq"
        );

        match self.broker.connect(&self.service_name, &self.config).await {
            Ok(conn) => {
                let notifier = conn.notify_close();
                info!(
                    host = %self.config.host,
                    name = %self.name,
                    "connected to rabbitmq"
                );
                Some((conn, notifier))
            }
            Err(err) => {
                error!(
                    host = %self.config.host,
                    name = %self.name,
                    error = err.to_string(),
                    backoff = ?self.backoff,
                    "failed to connect to rabbitmq, retrying"
                );
                None
            }
        }
    }

    /// Sleeps for the backoff. Returns true when interrupted by the stop signal.
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

        if let Some(conn) = previous {
            release(conn.as_ref(), &self.name).await;
            info!(
                host = %self.config.host,
                name = %self.name,
                "closed connection to rabbitmq"
            );
        }

        self.link.send_replace(Link::with_state(LinkState::Closed));
    }
}

async fn release(conn: &dyn BrokerConnection, name: &str) {
    if conn.is_closed() {
        return;
    }

    if let Err(err) = conn.close().await {
        warn!(name, error = err.to_string(), "failure to close connection");
    }
}
