//! Device-event queue consumer feeding the enforcement engine.

use crate::context::Platform;
use crate::enforcement::EnforcementEngine;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use usb_enforcer_provider::DeviceProperties;

/// What the hotplug layer observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device appeared, or its properties changed.
    Added(DeviceProperties),
    Removed(String),
    /// Stop the consumer even while senders are still alive.
    Shutdown,
}

impl DeviceEvent {
    pub fn path(&self) -> &str {
        match self {
            DeviceEvent::Added(props) => &props.path,
            DeviceEvent::Removed(path) => path,
            DeviceEvent::Shutdown => "",
        }
    }
}

/// Drops repeated add events for one path inside the coalescing window.
///
/// An add only counts as a duplicate when its properties match the last one
/// processed, so a genuine change is never swallowed.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: HashMap<String, (DeviceProperties, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn admit(&mut self, event: &DeviceEvent, now: Instant) -> bool {
        match event {
            DeviceEvent::Removed(path) => {
                self.last.remove(path);
                true
            }
            DeviceEvent::Shutdown => true,
            DeviceEvent::Added(props) => {
                if let Some((seen, at)) = self.last.get(&props.path) {
                    if seen == props && now.saturating_duration_since(*at) < self.window {
                        return false;
                    }
                }
                self.last
                    .insert(props.path.clone(), (props.clone(), now));
                true
            }
        }
    }
}

/// Apply one event to the engine. Failures are logged and contained.
pub fn dispatch<P: Platform>(engine: &EnforcementEngine<P>, event: DeviceEvent) {
    match event {
        DeviceEvent::Added(props) => {
            let path = props.path.clone();
            if let Err(err) = engine.device_added(props) {
                warn!("enforcement for {path} failed: {err}");
            }
        }
        DeviceEvent::Removed(path) => engine.device_removed(&path),
        DeviceEvent::Shutdown => {}
    }
}

/// Drain `events` until every sender is gone or a [`DeviceEvent::Shutdown`] arrives.
pub fn run_event_loop<P: Platform>(engine: &EnforcementEngine<P>, events: Receiver<DeviceEvent>) {
    let mut debouncer = Debouncer::new(engine.context().config().debounce_window());
    info!("device event loop started");
    for event in events {
        if event == DeviceEvent::Shutdown {
            break;
        }
        debouncer.set_window(engine.context().config().debounce_window());
        if !debouncer.admit(&event, Instant::now()) {
            debug!("coalesced duplicate add for {}", event.path());
            continue;
        }
        dispatch(engine, event);
    }
    info!("device event loop stopped");
}
