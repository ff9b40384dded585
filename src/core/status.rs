//! # Status Table Module / 状态表模块
//!
//! One write-once slot per node. Masters wait on exactly the slots of the
//! nodes they depend on, so no lock is held across a master's execution.
//!
//! 每个节点一个只写一次的槽位。主节点只等待其依赖节点的槽位，
//! 因此在主节点执行期间不持有任何锁。

use tokio::sync::watch;

use crate::core::models::{NodeIndex, TerminalStatus};

#[derive(Debug)]
pub struct StatusTable {
    slots: Vec<watch::Sender<Option<TerminalStatus>>>,
}

impl StatusTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| watch::Sender::new(None)).collect(),
        }
    }

    /// Records the terminal status of a node. The first write wins; later
    /// writes are ignored and reported by returning `false`.
    pub fn publish(&self, node: NodeIndex, status: TerminalStatus) -> bool {
        self.slots[node.0].send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            true
        })
    }

    pub fn get(&self, node: NodeIndex) -> Option<TerminalStatus> {
        *self.slots[node.0].borrow()
    }

    /// Waits until the node is terminal.
    pub async fn wait(&self, node: NodeIndex) -> TerminalStatus {
        let mut rx = self.slots[node.0].subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => {
                let value: Option<TerminalStatus> = *status;
                value.unwrap_or(TerminalStatus::Cancelled)
            }
            // The sender lives in `self`, so the channel cannot close while
            // we hold a reference.
            Err(_) => TerminalStatus::Cancelled,
        }
    }

    /// Waits on several nodes and returns their statuses in the same order.
    pub async fn wait_all(&self, nodes: &[NodeIndex]) -> Vec<TerminalStatus> {
        let mut statuses = Vec::with_capacity(nodes.len());
        for &node in nodes {
            statuses.push(self.wait(node).await);
        }
        statuses
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
