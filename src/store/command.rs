//! Mutation commands from outside the control thread.
//!
//! External callers (the request-handler layer) hold a [`StoreHandle`] and
//! enqueue commands over a channel. The tick executor drains the queue at the
//! top of each tick and applies commands in FIFO order; a caller that must
//! observe its own write awaits the one-shot acknowledgement answered after
//! the tick boundary.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, SyncSender, channel, sync_channel};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{FixtureId, GroupId, SceneId};
use crate::overrides::{OverrideProperty, OverrideTarget};
use crate::store::TransitionSpec;

#[derive(Clone, Debug)]
pub enum StoreCommand {
    SetFixtureBrightness {
        id: FixtureId,
        value: f64,
        spec: TransitionSpec,
    },
    SetFixtureCct {
        id: FixtureId,
        kelvin: u32,
        spec: TransitionSpec,
    },
    SetGroupBrightness {
        id: GroupId,
        value: f64,
        spec: TransitionSpec,
    },
    SetGroupCct {
        id: GroupId,
        kelvin: u32,
        spec: TransitionSpec,
    },
    SetGroupCircadianEnabled {
        id: GroupId,
        enabled: bool,
    },
    AddFixtureToGroup {
        fixture: FixtureId,
        group: GroupId,
    },
    RemoveFixtureFromGroup {
        fixture: FixtureId,
        group: GroupId,
    },
    UnregisterGroup {
        id: GroupId,
    },
    RecallScene {
        id: SceneId,
    },
    CaptureScene {
        id: SceneId,
        name: Option<String>,
        scope: Option<GroupId>,
    },
    SetOverride {
        target: OverrideTarget,
        property: OverrideProperty,
        value: f64,
        /// Defaults to the configured override TTL.
        ttl: Option<Duration>,
    },
    ClearOverride {
        target: OverrideTarget,
        property: OverrideProperty,
    },
    /// Build a fresh config snapshot and swap it in between ticks. With no
    /// path, the file the daemon started from is re-read. A failed load
    /// keeps the previous snapshot.
    ReloadConfig {
        path: Option<PathBuf>,
    },
}

/// A command plus its optional acknowledgement path. The ack carries the
/// number of entities the command touched.
pub struct CommandEnvelope {
    pub command: StoreCommand,
    pub ack: Option<SyncSender<usize>>,
}

/// Cloneable entry point for enqueueing mutations onto the tick executor.
#[derive(Clone)]
pub struct StoreHandle {
    sender: Sender<CommandEnvelope>,
}

impl StoreHandle {
    pub fn new() -> (Self, Receiver<CommandEnvelope>) {
        let (sender, receiver) = channel();
        (Self { sender }, receiver)
    }

    /// Fire and forget.
    pub fn submit(&self, command: StoreCommand) -> Result<()> {
        self.sender
            .send(CommandEnvelope { command, ack: None })
            .ok()
            .context("tick executor is gone")
    }

    /// Enqueue and wait for the command to be applied at the next tick
    /// boundary. Returns the number of entities the command touched.
    pub fn submit_sync(&self, command: StoreCommand, timeout: Duration) -> Result<usize> {
        let (ack_sender, ack_receiver) = sync_channel(1);
        self.sender
            .send(CommandEnvelope {
                command,
                ack: Some(ack_sender),
            })
            .ok()
            .context("tick executor is gone")?;
        ack_receiver
            .recv_timeout(timeout)
            .context("timed out waiting for tick to apply command")
    }
}
