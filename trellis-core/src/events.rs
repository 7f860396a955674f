//! Fan-out of application events to subscribers.

use crossbeam_channel::{Receiver, Sender};
use trellis_types::Event;

/// Delivers every published event, in order, to each live subscriber.
/// Subscribers that dropped their receiver are forgotten on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Sender<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_publish_order() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(Event::Booting);
        bus.publish(Event::Booted);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Event::Booting, Event::Booted]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(Event::Quit);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), Event::Quit);
    }

    #[test]
    fn late_subscribers_miss_earlier_events() {
        let mut bus = EventBus::new();
        bus.publish(Event::Booting);
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }
}
