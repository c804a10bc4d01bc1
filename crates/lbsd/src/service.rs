//! Bootstrap service — owns the engine and serialises every stimulus.
//!
//! Link indications, confirmations, admin requests and the periodic tick
//! all arrive on one task, so the engine needs no locking. Callers talk to
//! it through a cloneable `ServiceHandle`.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use lbs_core::{DeviceIdentity, ShortAddress};
use lbs_services::{Confirmation, Indication, RegistryEntry};

use crate::engine::slot::SlotStatus;
use crate::engine::{BootstrapEngine, EngineError, ParamStatus, RekeyError, RekeyProgress};

/// Depth of the command queue between the bridge and the engine.
pub const COMMAND_QUEUE: usize = 256;

#[derive(Debug)]
pub enum Command {
    Indication(Indication),
    Confirmation(Confirmation),
    LaunchRekey {
        reply: oneshot::Sender<Result<(), RekeyError>>,
    },
    RekeyProgress {
        reply: oneshot::Sender<Option<RekeyProgress>>,
    },
    Kick {
        address: ShortAddress,
        reply: oneshot::Sender<Result<DeviceIdentity, EngineError>>,
    },
    JoinedCount {
        reply: oneshot::Sender<usize>,
    },
    Device {
        index: usize,
        reply: oneshot::Sender<Option<RegistryEntry>>,
    },
    Slots {
        reply: oneshot::Sender<Vec<SlotStatus>>,
    },
    GetParam {
        attribute: u8,
        index: u16,
        reply: oneshot::Sender<Result<Vec<u8>, ParamStatus>>,
    },
    SetParam {
        attribute: u8,
        index: u16,
        value: Vec<u8>,
        reply: oneshot::Sender<ParamStatus>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("bootstrap service has stopped")]
    Stopped,
}

pub struct BootstrapService {
    engine: BootstrapEngine,
    commands: mpsc::Receiver<Command>,
    tick: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl BootstrapService {
    pub fn new(
        engine: BootstrapEngine,
        tick: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, ServiceHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let service = Self {
            engine,
            commands,
            tick,
            shutdown,
        };
        (service, ServiceHandle { tx })
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) -> BootstrapEngine {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "bootstrap service starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("bootstrap service shutting down");
                    break;
                }

                _ = interval.tick() => {
                    self.engine.tick(now());
                }

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.dispatch(cmd),
                    None => {
                        tracing::info!("all service handles dropped");
                        break;
                    }
                },
            }
        }
        self.engine
    }

    fn dispatch(&mut self, cmd: Command) {
        let engine = &mut self.engine;
        // A dropped reply receiver only means the caller gave up waiting.
        match cmd {
            Command::Indication(ind) => engine.handle_indication(&ind, now()),
            Command::Confirmation(conf) => engine.handle_confirmation(&conf, now()),
            Command::LaunchRekey { reply } => {
                let _ = reply.send(engine.launch_rekey(now()));
            }
            Command::RekeyProgress { reply } => {
                let _ = reply.send(engine.rekey_progress());
            }
            Command::Kick { address, reply } => {
                let _ = reply.send(engine.kick(address, now()));
            }
            Command::JoinedCount { reply } => {
                let _ = reply.send(engine.joined_count());
            }
            Command::Device { index, reply } => {
                let _ = reply.send(engine.device_at(index));
            }
            Command::Slots { reply } => {
                let _ = reply.send(engine.slots());
            }
            Command::GetParam {
                attribute,
                index,
                reply,
            } => {
                let _ = reply.send(engine.get_param(attribute, index));
            }
            Command::SetParam {
                attribute,
                index,
                value,
                reply,
            } => {
                let _ = reply.send(engine.set_param(attribute, index, &value));
            }
            Command::Reset { reply } => {
                let _ = reply.send(engine.reset());
            }
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Command>,
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn indication(&self, indication: Indication) -> Result<(), ServiceError> {
        self.tx
            .send(Command::Indication(indication))
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    pub async fn confirmation(&self, confirmation: Confirmation) -> Result<(), ServiceError> {
        self.tx
            .send(Command::Confirmation(confirmation))
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    pub async fn launch_rekey(&self) -> Result<Result<(), RekeyError>, ServiceError> {
        self.request(|reply| Command::LaunchRekey { reply }).await
    }

    pub async fn rekey_progress(&self) -> Result<Option<RekeyProgress>, ServiceError> {
        self.request(|reply| Command::RekeyProgress { reply }).await
    }

    pub async fn kick(
        &self,
        address: ShortAddress,
    ) -> Result<Result<DeviceIdentity, EngineError>, ServiceError> {
        self.request(|reply| Command::Kick { address, reply }).await
    }

    pub async fn joined_count(&self) -> Result<usize, ServiceError> {
        self.request(|reply| Command::JoinedCount { reply }).await
    }

    pub async fn device(&self, index: usize) -> Result<Option<RegistryEntry>, ServiceError> {
        self.request(|reply| Command::Device { index, reply }).await
    }

    pub async fn slots(&self) -> Result<Vec<SlotStatus>, ServiceError> {
        self.request(|reply| Command::Slots { reply }).await
    }

    pub async fn get_param(
        &self,
        attribute: u8,
        index: u16,
    ) -> Result<Result<Vec<u8>, ParamStatus>, ServiceError> {
        self.request(|reply| Command::GetParam {
            attribute,
            index,
            reply,
        })
        .await
    }

    pub async fn set_param(
        &self,
        attribute: u8,
        index: u16,
        value: Vec<u8>,
    ) -> Result<ParamStatus, ServiceError> {
        self.request(|reply| Command::SetParam {
            attribute,
            index,
            value,
            reply,
        })
        .await
    }

    pub async fn reset(&self) -> Result<Result<(), EngineError>, ServiceError> {
        self.request(|reply| Command::Reset { reply }).await
    }
}
