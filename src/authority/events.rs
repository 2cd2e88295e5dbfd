use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use walletbridge_types::PageMessage;

/// Who an event is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connected pages, through their relays.
    Page,
    /// The approval UI.
    Approval,
}

/// Something the authority announces after a state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WalletEvent {
    AccountsChanged {
        accounts: Vec<String>,
    },
    ChainChanged {
        #[serde(rename = "chainId")]
        chain_id: String,
    },
    ApprovalRequested {
        #[serde(rename = "requestId")]
        request_id: u64,
        method: String,
    },
    PendingCountChanged {
        count: usize,
    },
    ConnectRequested,
}

impl WalletEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::AccountsChanged { .. } | Self::ChainChanged { .. } => Topic::Page,
            Self::ApprovalRequested { .. }
            | Self::PendingCountChanged { .. }
            | Self::ConnectRequested => Topic::Approval,
        }
    }

    /// The page-side broadcast for this event, if pages see it at all.
    pub fn to_page_message(&self) -> Option<PageMessage> {
        match self {
            Self::AccountsChanged { accounts } => Some(PageMessage::AccountsChanged {
                accounts: accounts.clone(),
            }),
            Self::ChainChanged { chain_id } => Some(PageMessage::ChainChanged {
                chain_id: chain_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Fan-out of authority events to any number of observers.
pub struct EventHub {
    global_tx: broadcast::Sender<WalletEvent>,
    topic_txs: DashMap<Topic, broadcast::Sender<WalletEvent>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("global_subscribers", &self.global_tx.receiver_count())
            .field("topic_count", &self.topic_txs.len())
            .finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (global_tx, _) = broadcast::channel(256);
        Self {
            global_tx,
            topic_txs: DashMap::new(),
        }
    }

    /// Subscribe to every event
    pub fn subscribe_global(&self) -> broadcast::Receiver<WalletEvent> {
        self.global_tx.subscribe()
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<WalletEvent> {
        let tx = self.topic_txs.entry(topic).or_insert_with(|| {
            let (tx, _) = broadcast::channel(64);
            tx
        });
        tx.subscribe()
    }

    /// Publish to global and topic subscribers. Nobody listening is fine.
    pub fn publish(&self, event: WalletEvent) {
        let topic = event.topic();
        let _ = self.global_tx.send(event.clone());
        if let Some(tx) = self.topic_txs.get(&topic) {
            let _ = tx.send(event);
        }
    }

    pub fn global_subscriber_count(&self) -> usize {
        self.global_tx.receiver_count()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_txs
            .get(&topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
