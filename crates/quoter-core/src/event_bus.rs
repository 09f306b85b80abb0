//! Event bus for inter-service communication.
//!
//! A thin wrapper over a broadcast channel. Publishing never blocks; a
//! publish with no live subscribers is not an error.

use quoter_types::PipelineEvent;
use tokio::sync::broadcast;

/// Broadcast bus carrying pipeline events to all subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
	/// Creates a bus with the given channel capacity.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Publishes an event to all current subscribers.
	pub fn publish(&self, event: PipelineEvent) {
		// A send error only means nobody is listening right now
		let _ = self.sender.send(event);
	}

	/// Creates a new subscription starting at the current position.
	pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1000)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use quoter_types::{QuoteStatus, RequestEvent};

	#[tokio::test]
	async fn subscribers_receive_published_events() {
		let bus = EventBus::new(16);
		let mut rx = bus.subscribe();
		bus.publish(PipelineEvent::Request(RequestEvent::Completed {
			request_id: "r1".into(),
			status: QuoteStatus::Done,
		}));
		let event = rx.recv().await.unwrap();
		assert!(matches!(
			event,
			PipelineEvent::Request(RequestEvent::Completed { .. })
		));
	}

	#[test]
	fn publish_without_subscribers_is_fine() {
		let bus = EventBus::new(16);
		bus.publish(PipelineEvent::Request(RequestEvent::Started {
			request_id: "r1".into(),
			attempt: 1,
		}));
	}
}
