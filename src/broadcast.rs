//! Change broadcasting.
//!
//! A publish channel delivering typed events to any number of subscribers,
//! each with an optional kind filter. Hot-path publishers (dim holds,
//! continuous rotary motion) use the throttled entry point, which enforces a
//! floor between events with the same (kind, target) key. A slow subscriber
//! is disconnected without affecting the others.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{info, warn};
use number::UnipolarFloat;
use serde::Serialize;
use strum_macros::{Display, EnumIter};

use crate::config::{FixtureId, GroupId, SceneId};
use crate::error::CoreError;

/// Broadcast CCT values are clamped into this contractual range.
const CCT_RANGE: std::ops::RangeInclusive<u32> = 1000..=10000;

/// Queue depth per subscriber; a subscriber that falls this far behind is
/// considered dead.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Connection,
    FixtureStateChanged,
    GroupStateChanged,
    SceneRecalled,
    CircadianChanged,
    SystemStatus,
    SwitchDiscovered,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Welcome message carrying the assigned subscriber id.
    Connection {
        subscriber_id: usize,
    },
    FixtureStateChanged {
        fixture_id: FixtureId,
        brightness: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        color_temp: Option<u32>,
    },
    GroupStateChanged {
        group_id: GroupId,
        brightness: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        color_temp: Option<u32>,
    },
    SceneRecalled {
        scene_id: SceneId,
        name: String,
    },
    CircadianChanged {
        group_id: GroupId,
        brightness_multiplier: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        color_temp: Option<u32>,
    },
    SystemStatus {
        status: serde_json::Value,
    },
    SwitchDiscovered {
        channel: u8,
        is_digital: bool,
        change_count: u32,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection { .. } => EventKind::Connection,
            Self::FixtureStateChanged { .. } => EventKind::FixtureStateChanged,
            Self::GroupStateChanged { .. } => EventKind::GroupStateChanged,
            Self::SceneRecalled { .. } => EventKind::SceneRecalled,
            Self::CircadianChanged { .. } => EventKind::CircadianChanged,
            Self::SystemStatus { .. } => EventKind::SystemStatus,
            Self::SwitchDiscovered { .. } => EventKind::SwitchDiscovered,
        }
    }

    /// The throttle key target, for events that have one.
    fn target_id(&self) -> Option<u32> {
        match self {
            Self::FixtureStateChanged { fixture_id, .. } => Some(fixture_id.0),
            Self::GroupStateChanged { group_id, .. }
            | Self::CircadianChanged { group_id, .. } => Some(group_id.0),
            Self::SceneRecalled { scene_id, .. } => Some(scene_id.0),
            Self::SwitchDiscovered { channel, .. } => Some(*channel as u32),
            Self::Connection { .. } | Self::SystemStatus { .. } => None,
        }
    }

    /// Pull out-of-range values back into contract. Never rejects.
    fn clamped(mut self) -> Self {
        match &mut self {
            Self::FixtureStateChanged {
                brightness,
                color_temp,
                ..
            }
            | Self::GroupStateChanged {
                brightness,
                color_temp,
                ..
            } => {
                clamp_brightness(brightness);
                clamp_cct(color_temp);
            }
            Self::CircadianChanged {
                brightness_multiplier,
                color_temp,
                ..
            } => {
                clamp_brightness(brightness_multiplier);
                clamp_cct(color_temp);
            }
            _ => {}
        }
        self
    }
}

fn clamp_brightness(brightness: &mut f64) {
    let clamped = UnipolarFloat::new(*brightness).val();
    if clamped != *brightness {
        warn!(
            "{}",
            CoreError::InvariantViolation(format!(
                "broadcast brightness {brightness} clamped to {clamped}"
            ))
        );
        *brightness = clamped;
    }
}

fn clamp_cct(color_temp: &mut Option<u32>) {
    if let Some(cct) = color_temp {
        let clamped = (*cct).clamp(*CCT_RANGE.start(), *CCT_RANGE.end());
        if clamped != *cct {
            warn!(
                "{}",
                CoreError::InvariantViolation(format!(
                    "broadcast CCT {cct}K clamped to {clamped}K"
                ))
            );
            *cct = clamped;
        }
    }
}

/// The wire envelope: `{type, timestamp, ...payload}`.
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    id: usize,
    /// None subscribes to everything.
    filter: Option<HashSet<EventKind>>,
    sender: SyncSender<Envelope>,
}

/// A live subscription.
pub struct Subscription {
    pub id: usize,
    pub receiver: Receiver<Envelope>,
}

/// The publish channel.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicUsize,
    throttle: Mutex<HashMap<(EventKind, u32), Instant>>,
    throttle_floor: Mutex<Duration>,
    events_published: AtomicU64,
    messages_delivered: AtomicU64,
}

impl Broadcaster {
    pub fn new(throttle_floor: Duration) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            throttle: Mutex::new(HashMap::new()),
            throttle_floor: Mutex::new(throttle_floor),
            events_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
        }
    }

    pub fn set_throttle_floor(&self, floor: Duration) {
        *self.throttle_floor.lock().unwrap() = floor;
    }

    /// Register a subscriber, optionally filtered to certain event kinds.
    /// The welcome message is already queued when this returns.
    pub fn subscribe(&self, filter: Option<HashSet<EventKind>>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = sync_channel(SUBSCRIBER_QUEUE_DEPTH);
        // The welcome bypasses filters so every client learns its id.
        let _ = sender.try_send(Envelope {
            event: Event::Connection { subscriber_id: id },
            timestamp: Utc::now(),
        });
        self.subscribers.lock().unwrap().push(Subscriber {
            id,
            filter,
            sender,
        });
        info!("broadcast subscriber {id} connected");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: usize) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Publish unconditionally.
    pub fn publish(&self, event: Event) {
        self.deliver(event.clamped());
    }

    /// Publish from a hot path: events with the same (kind, target) key are
    /// dropped until `throttle_floor` has elapsed since the last one sent.
    pub fn publish_throttled(&self, event: Event, now: Instant) {
        let Some(target) = event.target_id() else {
            self.publish(event);
            return;
        };
        let key = (event.kind(), target);
        let floor = *self.throttle_floor.lock().unwrap();
        {
            let mut throttle = self.throttle.lock().unwrap();
            if let Some(last) = throttle.get(&key) {
                if now.duration_since(*last) < floor {
                    return;
                }
            }
            throttle.insert(key, now);
        }
        self.deliver(event.clamped());
    }

    fn deliver(&self, event: Event) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            event,
            timestamp: Utc::now(),
        };

        // Snapshot the matching senders so delivery happens outside the
        // subscriber table's critical section.
        let targets: Vec<(usize, SyncSender<Envelope>)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .iter()
                .filter(|subscriber| {
                    subscriber
                        .filter
                        .as_ref()
                        .map(|kinds| kinds.contains(&envelope.event.kind()))
                        .unwrap_or(true)
                })
                .map(|subscriber| (subscriber.id, subscriber.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(envelope.clone()) {
                Ok(()) => {
                    self.messages_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            warn!("{}", CoreError::BroadcastDrop(id));
            self.unsubscribe(id);
        }
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FLOOR: Duration = Duration::from_millis(100);

    fn fixture_event(brightness: f64) -> Event {
        Event::FixtureStateChanged {
            fixture_id: FixtureId(1),
            brightness,
            color_temp: Some(3000),
        }
    }

    #[test]
    fn test_welcome_message() {
        let broadcaster = Broadcaster::new(FLOOR);
        let subscription = broadcaster.subscribe(None);
        let envelope = subscription.receiver.try_recv().unwrap();
        assert_eq!(
            Event::Connection {
                subscriber_id: subscription.id
            },
            envelope.event
        );
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new(FLOOR);
        let first = broadcaster.subscribe(None);
        let second = broadcaster.subscribe(None);
        broadcaster.publish(fixture_event(0.5));
        for subscription in [&first, &second] {
            let _welcome = subscription.receiver.try_recv().unwrap();
            let envelope = subscription.receiver.try_recv().unwrap();
            assert_eq!(EventKind::FixtureStateChanged, envelope.event.kind());
        }
    }

    #[test]
    fn test_kind_filter() {
        let broadcaster = Broadcaster::new(FLOOR);
        let subscription =
            broadcaster.subscribe(Some(HashSet::from([EventKind::SceneRecalled])));
        let _welcome = subscription.receiver.try_recv().unwrap();
        broadcaster.publish(fixture_event(0.5));
        assert!(subscription.receiver.try_recv().is_err());
        broadcaster.publish(Event::SceneRecalled {
            scene_id: SceneId(4),
            name: "evening".into(),
        });
        let envelope = subscription.receiver.try_recv().unwrap();
        assert_eq!(EventKind::SceneRecalled, envelope.event.kind());
    }

    #[test]
    fn test_out_of_range_values_clamped_not_rejected() {
        let broadcaster = Broadcaster::new(FLOOR);
        let subscription = broadcaster.subscribe(None);
        let _welcome = subscription.receiver.try_recv().unwrap();
        broadcaster.publish(Event::FixtureStateChanged {
            fixture_id: FixtureId(1),
            brightness: 1.8,
            color_temp: Some(20_000),
        });
        let envelope = subscription.receiver.try_recv().unwrap();
        match envelope.event {
            Event::FixtureStateChanged {
                brightness,
                color_temp,
                ..
            } => {
                assert_eq!(1.0, brightness);
                assert_eq!(Some(10_000), color_temp);
            }
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn test_throttle_floor_per_key() {
        let broadcaster = Broadcaster::new(FLOOR);
        let subscription = broadcaster.subscribe(None);
        let _welcome = subscription.receiver.try_recv().unwrap();

        let start = Instant::now();
        broadcaster.publish_throttled(fixture_event(0.1), start);
        broadcaster.publish_throttled(fixture_event(0.2), start + Duration::from_millis(50));
        broadcaster.publish_throttled(fixture_event(0.3), start + Duration::from_millis(150));

        let received: Vec<Envelope> = subscription.receiver.try_iter().collect();
        assert_eq!(2, received.len());
    }

    #[test]
    fn test_throttle_keys_are_independent() {
        let broadcaster = Broadcaster::new(FLOOR);
        let subscription = broadcaster.subscribe(None);
        let _welcome = subscription.receiver.try_recv().unwrap();

        let start = Instant::now();
        broadcaster.publish_throttled(fixture_event(0.1), start);
        broadcaster.publish_throttled(
            Event::GroupStateChanged {
                group_id: GroupId(1),
                brightness: 0.5,
                color_temp: None,
            },
            start,
        );
        assert_eq!(2, subscription.receiver.try_iter().count());
    }

    #[test]
    fn test_slow_subscriber_disconnected_alone() {
        let broadcaster = Broadcaster::new(FLOOR);
        let slow = broadcaster.subscribe(None);
        let healthy = broadcaster.subscribe(None);
        assert_eq!(2, broadcaster.subscriber_count());

        // Never drain `slow`; overflow its queue.
        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 8) {
            broadcaster.publish(fixture_event(0.5));
            // Keep the healthy subscriber drained.
            while healthy.receiver.try_recv().is_ok() {}
        }
        assert_eq!(1, broadcaster.subscriber_count());
        drop(slow);
        // The healthy subscriber still gets events.
        broadcaster.publish(fixture_event(0.9));
        assert!(healthy.receiver.try_recv().is_ok());
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope {
            event: fixture_event(0.5),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!("fixture_state_changed", json["type"]);
        assert_eq!(0.5, json["brightness"]);
        assert_eq!(1, json["fixture_id"]);
        assert!(json["timestamp"].is_string());
    }
}
