//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailroom.
//
// Mailroom is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailroom is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailroom. If not, see <http://www.gnu.org/licenses/>.

//! The long-lived task that drives outbound delivery.
//!
//! There is exactly one worker. Anything that queues mail pokes it through a
//! `QueueSignal`; otherwise it sleeps until the next retry is due.

use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::prelude::*;
use log::{error, info};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::courier::Courier;
use crate::mail::store::{self, Mail, StoreRef};
use crate::mail::Services;
use crate::support::error::Error;

/// How long the worker waits after a store error before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);
/// How many candidate mails to consider per cycle.
const CANDIDATES: usize = 100;

/// The wake-up channel of the queue worker.
///
/// Clones share state.
#[derive(Clone)]
pub struct QueueSignal {
    state: Arc<Mutex<SignalState>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct SignalState {
    busy: bool,
    alarm: Option<Instant>,
}

impl QueueSignal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Asks the worker to look for work.
    ///
    /// Wakes made while the worker is busy are dropped, since the worker
    /// always looks for more work before parking.
    pub fn wake_up(&self) {
        if self.state.lock().unwrap().busy {
            return;
        }
        self.notify.notify_one();
    }

    fn begin_work(&self) {
        let mut state = self.state.lock().unwrap();
        state.busy = true;
        state.alarm = None;
    }

    fn end_work(&self, alarm: Option<Instant>) {
        let mut state = self.state.lock().unwrap();
        state.busy = false;
        state.alarm = alarm;
    }

    /// Waits until woken or until the alarm set by `end_work` goes off.
    async fn park(&self) {
        let alarm = self.state.lock().unwrap().alarm;
        match alarm {
            None => self.notify.notified().await,
            Some(alarm) => tokio::select! {
                _ = self.notify.notified() => (),
                _ = tokio::time::sleep_until(alarm) => (),
            },
        }
    }

    /// Consumes a pending wake, returning whether there was one.
    #[cfg(test)]
    pub fn take_wake(&self) -> bool {
        use futures::future::FutureExt as _;

        self.notify.notified().now_or_never().is_some()
    }
}

/// How long to wait after attempt number `attempts` before trying again.
pub fn retry_delay(attempts: u32) -> Duration {
    const MINUTE: u64 = 60;
    Duration::from_secs(match attempts {
        0 => 0,
        1..=4 => 10 * MINUTE,
        5..=9 => 30 * MINUTE,
        _ => 60 * MINUTE,
    })
}

/// When the next delivery attempt of `mail` is due.
pub fn next_attempt(mail: &Mail) -> DateTime<Utc> {
    match mail.last_attempted_at {
        None => mail.received_at.0,
        Some(last) => {
            last.0
                + chrono::Duration::from_std(retry_delay(mail.attempt_count))
                    .unwrap_or_else(|_| chrono::Duration::zero())
        },
    }
}

/// Runs the queue worker forever.
pub async fn run(services: Rc<Services>, courier: Courier) {
    let signal = services.mailman.queue_signal().clone();
    info!("Queue worker started");

    loop {
        work(&services, &courier, &signal).await;
        signal.park().await;
    }
}

/// Runs one cycle, returning the alarm left on `signal`.
async fn work(
    services: &Services,
    courier: &Courier,
    signal: &QueueSignal,
) -> Option<Instant> {
    signal.begin_work();
    let alarm = match cycle(services, courier).await {
        Ok(alarm) => alarm,
        Err(e) => {
            error!("Queue worker failed: {e}");
            Some(Instant::now() + ERROR_BACKOFF)
        },
    };
    signal.end_work(alarm);
    alarm
}

/// Attempts delivery of the mail that is due first, if any is due.
///
/// Returns when the worker should next look, `None` if only a wake-up can
/// produce more work.
async fn cycle(
    services: &Services,
    courier: &Courier,
) -> Result<Option<Instant>, Error> {
    let Some(mail) = earliest_due(&services.store)? else {
        return Ok(None);
    };

    let due = next_attempt(&mail);
    let now = Utc::now();
    if due > now {
        let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
        return Ok(Some(Instant::now() + wait));
    }

    let result = courier.send(&mail).await?;
    info!("Delivery attempt of mail {}: {result:?}", mail.id);
    services.cleaner.clean()?;

    // There may be more due right away.
    Ok(Some(Instant::now()))
}

fn earliest_due(store: &StoreRef) -> Result<Option<Mail>, Error> {
    let mut store = store.borrow_mut();
    let tx = store.read_tx()?;
    let candidates = store::fetch_pending_mails(&tx, CANDIDATES)?;
    Ok(candidates.into_iter().min_by_key(next_attempt))
}
