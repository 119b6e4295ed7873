//! Runs a [`Broadcaster`] on one tokio task.
//!
//! Commands, radio callbacks and timer expiries are all handled by that task,
//! one at a time, so the broadcaster needs no locking. Callers talk to it
//! through a [`BroadcastHandle`].

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::radio::{RadioEvent, RadioEvents};
use crate::scheduler::{BroadcastStatus, Broadcaster};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast worker is no longer running")]
    WorkerGone,
}

pub(crate) enum Message {
    Start { device_id: u32, interval_sec: i64 },
    Stop { ack: oneshot::Sender<()> },
    Status { reply: oneshot::Sender<BroadcastStatus> },
    Radio(RadioEvent),
    Shutdown { ack: oneshot::Sender<()> },
}

/// The mailbox of a worker that has not been spawned yet.
pub struct Worker {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Worker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Hand this to the radio so its callbacks land on the worker.
    pub fn radio_events(&self) -> RadioEvents {
        RadioEvents::new(self.tx.clone())
    }

    pub fn spawn(self, broadcaster: Broadcaster) -> (BroadcastHandle, JoinHandle<()>) {
        let handle = BroadcastHandle { tx: self.tx };
        let task = tokio::spawn(run(broadcaster, self.rx));
        (handle, task)
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(mut broadcaster: Broadcaster, mut rx: mpsc::UnboundedReceiver<Message>) {
    loop {
        let next_tick = broadcaster.next_tick();
        tokio::select! {
            // Drain messages before firing the timer, so a queued stop wins over a due tick
            biased;
            message = rx.recv() => {
                let Some(message) = message else { break };
                match message {
                    Message::Start { device_id, interval_sec } => {
                        broadcaster.start(device_id, interval_sec, Instant::now())
                    }
                    Message::Stop { ack } => {
                        broadcaster.stop();
                        let _ = ack.send(());
                    }
                    Message::Status { reply } => {
                        let _ = reply.send(broadcaster.status());
                    }
                    Message::Radio(event) => broadcaster.on_radio_event(event),
                    Message::Shutdown { ack } => {
                        broadcaster.stop();
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            _ = sleep_until(next_tick.unwrap_or_else(Instant::now)), if next_tick.is_some() => {
                broadcaster.on_tick(Instant::now());
            }
        }
    }
    broadcaster.stop();
    log::debug!("Broadcast worker exited");
}

/// Commands for a running worker. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl BroadcastHandle {
    /// Begin broadcasting. Returns at once; whether the radio came up shows in [`Self::status`].
    pub fn start(&self, device_id: u32, interval_sec: i64) -> Result<(), BroadcastError> {
        self.send(Message::Start { device_id, interval_sec })
    }

    /// Stop broadcasting. When this returns nothing more will be advertised.
    pub async fn stop(&self) -> Result<(), BroadcastError> {
        let (ack, done) = oneshot::channel();
        self.send(Message::Stop { ack })?;
        done.await.map_err(|_| BroadcastError::WorkerGone)
    }

    pub async fn status(&self) -> Result<BroadcastStatus, BroadcastError> {
        let (reply, status) = oneshot::channel();
        self.send(Message::Status { reply })?;
        status.await.map_err(|_| BroadcastError::WorkerGone)
    }

    /// Stop and end the worker task.
    pub async fn shutdown(&self) -> Result<(), BroadcastError> {
        let (ack, done) = oneshot::channel();
        self.send(Message::Shutdown { ack })?;
        done.await.map_err(|_| BroadcastError::WorkerGone)
    }

    fn send(&self, message: Message) -> Result<(), BroadcastError> {
        self.tx.send(message).map_err(|_| BroadcastError::WorkerGone)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::frame::Layout;
    use crate::publisher::Publication;
    use crate::radio::RadioError;
    use crate::scheduler::test_support::{Call, CountingWakeLock, FakeRadio, Rig};
    use crate::scheduler::BroadcastState;

    use super::*;

    struct Spawned {
        radio: FakeRadio,
        wake_lock: CountingWakeLock,
        handle: BroadcastHandle,
        events: RadioEvents,
        _published: mpsc::UnboundedReceiver<Publication>,
    }

    fn spawn(layout: Layout) -> Spawned {
        let worker = Worker::new();
        let events = worker.radio_events();
        let Rig { broadcaster, radio, wake_lock, published } = Rig::new(layout);
        let (handle, _task) = worker.spawn(broadcaster);
        Spawned { radio, wake_lock, handle, events, _published: published }
    }

    /// Let the worker catch up. The paused clock moves on to any timer due in the meantime.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop_never_advertises() {
        let Spawned { radio, wake_lock, handle, .. } = spawn(Layout::Legacy);
        handle.start(1, 5).unwrap();
        handle.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(radio.starts().is_empty());
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, BroadcastState::Stopped);
        assert!(!status.is_running);
        assert!(!wake_lock.held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_interval() {
        let Spawned { radio, handle, events, .. } = spawn(Layout::Versioned);
        handle.start(3, 5).unwrap();
        settle().await;
        assert_eq!(radio.starts().len(), 1);

        events.advertise_started(0);
        settle().await;
        assert_eq!(handle.status().await.unwrap().state, BroadcastState::Advertising);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(radio.starts().len(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(radio.starts().len(), 2);

        let frames = radio.starts();
        assert_eq!(frames[1].sequence(), 1);
        assert_eq!(&frames[1].as_bytes()[..4], &[0xBB, 0xAA, 0x03, 0x00]);

        handle.shutdown().await.unwrap();
        assert!(handle.status().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_radio_keeps_retrying() {
        let Spawned { radio, handle, .. } = spawn(Layout::Legacy);
        radio.set_ready(Some(RadioError::RadioAbsent));
        handle.start(1, 2).unwrap();
        tokio::time::sleep(Duration::from_millis(4_100)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, BroadcastState::RadioUnavailable);
        assert_eq!(status.error_message, "No Bluetooth adapter");
        assert!(status.is_running);

        radio.set_ready(None);
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(radio.starts().len(), 1);
        // Three failed ticks went before, each consumed a sequence number
        assert_eq!(radio.starts()[0].sequence(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_on_through_worker() {
        let Spawned { radio, handle, events, .. } = spawn(Layout::Legacy);
        handle.start(1, 60).unwrap();
        settle().await;
        events.advertise_started(0);
        settle().await;
        radio.clear();

        radio.set_powered(false);
        events.power_changed(false);
        settle().await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, BroadcastState::RadioUnavailable);
        assert!(!status.radio_power_on);
        assert_eq!(radio.calls(), vec![Call::Stop]);

        radio.set_powered(true);
        events.power_changed(true);
        settle().await;
        assert_eq!(radio.starts().len(), 1);
        events.advertise_started(1);
        settle().await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, BroadcastState::Advertising);
        assert!(status.radio_power_on);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_stop_matches_single_stop() {
        let Spawned { handle, .. } = spawn(Layout::Legacy);
        handle.start(1, 5).unwrap();
        settle().await;
        handle.stop().await.unwrap();
        let once = handle.status().await.unwrap();
        handle.stop().await.unwrap();
        assert_eq!(handle.status().await.unwrap(), once);
    }
}
