use serde::Serialize;
use tokio::sync::watch;

use hearth_shared::ContainerId;

use crate::containers::ContainerSummary;
use crate::model::Message;

/// Read-only snapshot of one chat, republished after every change.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub container_id: ContainerId,
    pub messages: Vec<Message>,
    pub pinned_messages: Vec<Message>,
    pub loading: bool,
    pub sending: bool,
    pub load_failed: bool,
}

impl ChatView {
    pub fn empty(container_id: ContainerId) -> Self {
        Self {
            container_id,
            messages: Vec::new(),
            pinned_messages: Vec::new(),
            loading: false,
            sending: false,
            load_failed: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboxView {
    pub conversations: Vec<ContainerSummary>,
    pub loading: bool,
    pub load_failed: bool,
}

/// Replace the published view. Having no subscriber is fine.
pub fn publish<V>(tx: &watch::Sender<V>, view: V) {
    tx.send_replace(view);
}
