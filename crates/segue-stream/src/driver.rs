#![forbid(unsafe_code)]

//! Tokio driver: pumps the 100 ms tick, bus events, and commands into
//! the scheduler on a single task.

use std::time::{Duration, Instant};

use bytes::Bytes;
use segue_core::FragKey;
use segue_events::EventBus;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{StreamError, StreamResult},
    loader::TransmuxResult,
    media::Media,
    scheduler::Scheduler,
};

/// Scheduler tick period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Commands accepted by the driver. Collaborator completions are
/// delivered through the same channel so every scheduler input runs on
/// one execution context — handlers never race a tick.
pub enum StreamCommand {
    Start { position: Option<f64> },
    Stop,
    Seek { position: f64 },
    SetLevel { level: usize },
    ImmediateLevelSwitch,
    NextLevelSwitch,
    AttachMedia(Box<dyn Media>),
    DetachMedia,
    MediaSeeking,
    MediaSeeked,
    MediaEnded,
    FragLoaded { frag: FragKey, data: Bytes },
    InitLoaded { level: usize, data: Bytes },
    TransmuxComplete(TransmuxResult),
}

impl std::fmt::Debug for StreamCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start { .. } => "Start",
            Self::Stop => "Stop",
            Self::Seek { .. } => "Seek",
            Self::SetLevel { .. } => "SetLevel",
            Self::ImmediateLevelSwitch => "ImmediateLevelSwitch",
            Self::NextLevelSwitch => "NextLevelSwitch",
            Self::AttachMedia(_) => "AttachMedia",
            Self::DetachMedia => "DetachMedia",
            Self::MediaSeeking => "MediaSeeking",
            Self::MediaSeeked => "MediaSeeked",
            Self::MediaEnded => "MediaEnded",
            Self::FragLoaded { .. } => "FragLoaded",
            Self::InitLoaded { .. } => "InitLoaded",
            Self::TransmuxComplete(_) => "TransmuxComplete",
        };
        f.write_str(name)
    }
}

/// Cloneable handle for feeding the driver.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<StreamCommand>,
}

impl DriverHandle {
    pub async fn send(&self, command: StreamCommand) -> StreamResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    pub async fn start(&self, position: Option<f64>) -> StreamResult<()> {
        self.send(StreamCommand::Start { position }).await
    }

    pub async fn stop(&self) -> StreamResult<()> {
        self.send(StreamCommand::Stop).await
    }

    pub async fn seek(&self, position: f64) -> StreamResult<()> {
        self.send(StreamCommand::Seek { position }).await
    }

    pub async fn set_level(&self, level: usize) -> StreamResult<()> {
        self.send(StreamCommand::SetLevel { level }).await
    }

    pub async fn attach_media(&self, media: Box<dyn Media>) -> StreamResult<()> {
        self.send(StreamCommand::AttachMedia(media)).await
    }
}

/// Owns the scheduler and multiplexes its inputs.
pub struct StreamDriver {
    scheduler: Scheduler,
    bus: EventBus,
    commands: mpsc::Receiver<StreamCommand>,
    cancel: CancellationToken,
}

impl StreamDriver {
    pub fn new(
        scheduler: Scheduler,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> (Self, DriverHandle) {
        let (tx, commands) = mpsc::channel(16);
        (
            Self {
                scheduler,
                bus,
                commands,
                cancel,
            },
            DriverHandle { tx },
        )
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut events = self.bus.subscribe();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("driver cancelled");
                    self.scheduler.stop_load();
                    break;
                }
                _ = ticker.tick() => {
                    self.scheduler.tick(Instant::now());
                }
                event = events.recv() => match event {
                    Ok(event) => self.scheduler.handle_event(&event, Instant::now()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event bus lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("command channel closed, stopping driver");
                        self.scheduler.stop_load();
                        break;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: StreamCommand) {
        let now = Instant::now();
        match command {
            StreamCommand::Start { position } => self.scheduler.start_load(position, now),
            StreamCommand::Stop => self.scheduler.stop_load(),
            StreamCommand::Seek { position } => self.scheduler.seek(position, now),
            StreamCommand::SetLevel { level } => self.scheduler.set_level(level, now),
            StreamCommand::ImmediateLevelSwitch => self.scheduler.immediate_level_switch(now),
            StreamCommand::NextLevelSwitch => self.scheduler.next_level_switch(now),
            StreamCommand::AttachMedia(media) => self.scheduler.attach_media(media, now),
            StreamCommand::DetachMedia => self.scheduler.detach_media(),
            StreamCommand::MediaSeeking => self.scheduler.on_media_seeking(now),
            StreamCommand::MediaSeeked => self.scheduler.on_media_seeked(now),
            StreamCommand::MediaEnded => self.scheduler.on_media_ended(now),
            StreamCommand::FragLoaded { frag, data } => {
                self.scheduler.on_frag_loaded(frag, data, now);
            }
            StreamCommand::InitLoaded { level, data } => {
                self.scheduler.on_init_loaded(level, data, now);
            }
            StreamCommand::TransmuxComplete(result) => {
                self.scheduler.on_transmux_complete(result, now);
            }
        }
    }
}
