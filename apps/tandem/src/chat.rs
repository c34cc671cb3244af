use parking_lot::Mutex;
use signal_proto::ChatEntry;

/// Receives chat lines relayed next to the call signaling.
pub trait ChatSink: Send + Sync {
    fn deliver(&self, sender: &str, body: &str);
}

/// Prints chat to stdout the way the terminal client shows it.
#[derive(Debug, Default)]
pub struct StdoutChat;

impl ChatSink for StdoutChat {
    fn deliver(&self, sender: &str, body: &str) {
        if sender.is_empty() {
            println!("{body}");
        } else {
            println!("{sender}: {body}");
        }
    }
}

/// Keeps every delivered line in arrival order.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Mutex<Vec<ChatEntry>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.entries.lock().clone()
    }
}

impl ChatSink for ChatLog {
    fn deliver(&self, sender: &str, body: &str) {
        self.entries.lock().push(ChatEntry {
            sender: sender.to_string(),
            message: body.to_string(),
        });
    }
}
