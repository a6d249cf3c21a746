use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::buffer::Message;

/// Terminal events a peer reports for its connections.
///
/// A `Data` event owns a message handle; dropping the event releases it back
/// to the pool, so a consumer that only cares about some events can drop the
/// rest without leaking buffers.
#[derive(Debug)]
pub enum Event {
    Connected(u32),
    Disconnected(u32),
    Data(u32, Message),
}

/// Dispatch seam between the transport and the application.
///
/// Callbacks run on the session tasks, so implementations must be cheap and
/// must not block; hand the work off (the [`EventQueue`] default does
/// exactly that) when it is anything more than bookkeeping.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_connected(&self, connection_id: u32);
    fn on_disconnected(&self, connection_id: u32);
    /// The handler owns the message handle and releases it by dropping it.
    fn on_data_received(&self, connection_id: u32, message: Message);
}

/// The default pull-model handler: events pile up in a thread-safe queue
/// and the application drains them on its own schedule.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue::default()
    }

    pub fn try_next_event(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    /// Drains everything queued so far into `out`, cheaper than popping one
    /// at a time when a single consumer thread does the draining.
    pub fn drain_events(&self, out: &mut Vec<Event>) {
        let mut events = self.events.lock();
        out.extend(events.drain(..));
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl MessageHandler for EventQueue {
    fn on_connected(&self, connection_id: u32) {
        self.events.lock().push_back(Event::Connected(connection_id));
    }

    fn on_disconnected(&self, connection_id: u32) {
        self.events
            .lock()
            .push_back(Event::Disconnected(connection_id));
    }

    fn on_data_received(&self, connection_id: u32, message: Message) {
        self.events
            .lock()
            .push_back(Event::Data(connection_id, message));
    }
}
