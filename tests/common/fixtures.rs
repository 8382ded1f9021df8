//! Sample inspector workloads

use inspector_engine::TaskFailure;
use std::time::Duration;

/// A fetched chat message as the inspector sees it
#[derive(Clone, Debug)]
pub struct Message {
    pub id: u64,
    pub text: String,
    pub media: Option<String>,
}

/// `count` messages; every tenth carries a photo, every seventh a link
pub fn sample_messages(count: u64) -> Vec<Message> {
    (0..count)
        .map(|id| Message {
            id,
            text: if id % 7 == 0 {
                format!("message {id} see https://t.me/rustlang")
            } else {
                format!("message {id}")
            },
            media: (id % 10 == 0).then(|| format!("photo_{id}.jpg")),
        })
        .collect()
}

/// What analysis extracts from one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Analysis {
    pub id: u64,
    pub words: usize,
    pub has_link: bool,
}

/// Analyze a message after an id-dependent delay so completion order differs from input order
pub async fn analyze(message: &Message) -> Result<Analysis, TaskFailure> {
    tokio::time::sleep(Duration::from_millis(message.id % 5)).await;
    Ok(Analysis {
        id: message.id,
        words: message.text.split_whitespace().count(),
        has_link: message.text.contains("t.me/"),
    })
}
