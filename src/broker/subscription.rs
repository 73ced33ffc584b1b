use tokio::sync::mpsc::UnboundedReceiver;

use super::message::Delivery;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Ask the broker to preserve publish order for this subscription.
    pub ordered: bool,
}

/// An open handle on a broker subscription.
///
/// Deliveries are pulled with [`Subscription::recv`]; `None` means the broker
/// side went away or another handle took over the subscription.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    topic: String,
    options: SubscriptionOptions,
    receiver: UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        options: SubscriptionOptions,
        receiver: UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            options,
            receiver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn options(&self) -> SubscriptionOptions {
        self.options
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Stops receiving. Deliveries published afterwards are kept by the
    /// broker for the next handle opened on this subscription.
    pub fn close(mut self) {
        self.receiver.close();
        tracing::debug!(subscription = %self.name, "subscription closed");
    }
}
