//! Switch auto-discovery.
//!
//! Watches unconfigured I/O channels for activity; enough reading changes
//! inside a time window means something is wired there, and a
//! `switch_discovered` event invites the config surface to claim it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::info;
use ordermap::OrderMap;

use crate::broadcast::{Broadcaster, Event};
use crate::hardware::HardwareManager;

/// Channels the I/O device exposes.
const CHANNEL_COUNT: u8 = 16;

struct WatchedChannel {
    last_reading: Option<bool>,
    changes: VecDeque<Instant>,
    /// Suppress repeat announcements until the window rolls over.
    announced_at: Option<Instant>,
}

pub struct SwitchDiscovery {
    watched: OrderMap<u8, WatchedChannel>,
    change_threshold: usize,
    window: Duration,
}

impl SwitchDiscovery {
    /// Watch every channel not claimed by a configured switch.
    pub fn new(claimed: &[u8], change_threshold: usize, window: Duration) -> Self {
        let watched = (0..CHANNEL_COUNT)
            .filter(|channel| !claimed.contains(channel))
            .map(|channel| {
                (
                    channel,
                    WatchedChannel {
                        last_reading: None,
                        changes: VecDeque::new(),
                        announced_at: None,
                    },
                )
            })
            .collect();
        Self {
            watched,
            change_threshold,
            window,
        }
    }

    /// One scan pass, run from a periodic scheduler job.
    pub fn scan(&mut self, hw: &mut HardwareManager, broadcaster: &Broadcaster, now: Instant) {
        for (channel, watched) in self.watched.iter_mut() {
            let Some(reading) = hw.read_digital(*channel) else {
                continue;
            };
            let changed = watched
                .last_reading
                .map(|last| last != reading)
                .unwrap_or(false);
            watched.last_reading = Some(reading);
            if !changed {
                continue;
            }

            watched.changes.push_back(now);
            while let Some(oldest) = watched.changes.front() {
                if now.duration_since(*oldest) > self.window {
                    watched.changes.pop_front();
                } else {
                    break;
                }
            }

            if watched.changes.len() >= self.change_threshold {
                let recently_announced = watched
                    .announced_at
                    .map(|at| now.duration_since(at) < self.window)
                    .unwrap_or(false);
                if !recently_announced {
                    watched.announced_at = Some(now);
                    info!(
                        "activity on unconfigured channel {channel}: {} change(s)",
                        watched.changes.len()
                    );
                    broadcaster.publish(Event::SwitchDiscovered {
                        channel: *channel,
                        is_digital: true,
                        change_count: watched.changes.len() as u32,
                    });
                }
            }
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}
