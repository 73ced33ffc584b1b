use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Client {
    /// Connection id, used in logs.
    pub id: String,
    /// Opaque author identity attached to this client's posts.
    pub name: String,
    /// Outbound frames for this connection.
    pub sender: UnboundedSender<WsMessage>,
}

impl Client {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        let id = Uuid::new_v4();
        let name = format!("guest-{}", &id.simple().to_string()[..8]);
        Self {
            id: id.to_string(),
            name,
            sender,
        }
    }

    /// Queues a text frame. Returns false once the connection is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.sender.send(WsMessage::text(text)).is_ok()
    }
}
