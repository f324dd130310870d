use tokio::sync::mpsc;

/// Events emitted while a device-code or project-selection flow is in
/// progress, for external listeners such as the web dashboard.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlowEvent {
    DeviceCodeReceived {
        session_id: String,
        user_code: String,
        verification_url: String,
    },
    DeviceCodeCompleted {
        session_id: String,
    },
    DeviceCodeFailed {
        session_id: String,
        reason: String,
    },
    ProjectSelectionRequested {
        session_id: String,
        prompt: String,
    },
}

const EVENT_BUFFER: usize = 32;

/// Bounded per-session event bus. The driver owns the sender and drops it
/// when the flow settles, which closes the stream for subscribers. Sends
/// never block the flow: a full buffer drops the event.
#[derive(Clone, Debug)]
pub struct FlowEventBus {
    tx: mpsc::Sender<FlowEvent>,
}

impl FlowEventBus {
    pub fn channel() -> (Self, mpsc::Receiver<FlowEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (Self { tx }, rx)
    }

    /// A bus with no listener; every publish is a no-op.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::debug!(error = %err, "flow event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_and_close_with_the_bus() {
        let (bus, mut rx) = FlowEventBus::channel();
        bus.publish(FlowEvent::DeviceCodeReceived {
            session_id: "s1".to_string(),
            user_code: "ABCD-1234".to_string(),
            verification_url: "https://example.com/device".to_string(),
        });
        bus.publish(FlowEvent::DeviceCodeCompleted {
            session_id: "s1".to_string(),
        });
        drop(bus);

        assert!(matches!(
            rx.recv().await,
            Some(FlowEvent::DeviceCodeReceived { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(FlowEvent::DeviceCodeCompleted { .. })
        ));
        assert_eq!(rx.recv().await, None, "bus drop closes the stream");
    }
}
