#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use tokio::task::JoinHandle;
use tokio::time::Duration;

use meshdht::{Keypair, MemoryNetwork, MemoryStorage, Node, NodeConfig};

/// Allow time for async operations
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static PORT_COUNTER: AtomicU16 = AtomicU16::new(1000);

fn next_addr() -> String {
    format!("mem:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// Node config with timeouts short enough for tests.
pub fn test_config(listen_addrs: Vec<String>) -> NodeConfig {
    NodeConfig {
        k: 8,
        reply_timeout: Duration::from_secs(5),
        introduction_timeout: Duration::from_secs(5),
        per_query_timeout: Duration::from_secs(5),
        listen_addrs,
        ..NodeConfig::default()
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub storage: Arc<MemoryStorage>,
    pub addr: Option<String>,
    acceptor: Option<JoinHandle<()>>,
}

impl TestNode {
    pub fn seed_list(&self) -> Vec<String> {
        self.addr.iter().cloned().collect()
    }

    pub async fn shutdown(mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        self.node.shutdown().await;
    }
}

/// In-process network of nodes sharing one [`MemoryNetwork`].
#[derive(Clone, Default)]
pub struct TestNetwork {
    pub network: MemoryNetwork,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A node with a listen address, started against `seeds`.
    pub async fn listening(&self, seeds: &[String]) -> TestNode {
        let addr = next_addr();
        let mut incoming = self.network.listen(&addr).await.expect("listen failed");
        let mut test_node = self.build(test_config(vec![addr.clone()]), seeds).await;

        let node = test_node.node.clone();
        test_node.acceptor = Some(tokio::spawn(async move {
            while let Some(transport) = incoming.recv().await {
                if node.accept(transport).await.is_err() {
                    break;
                }
            }
        }));
        test_node.addr = Some(addr);
        test_node
    }

    /// A node without a listen address: reachable only through signaling.
    pub async fn unreachable(&self, seeds: &[String]) -> TestNode {
        self.build(test_config(Vec::new()), seeds).await
    }

    async fn build(&self, config: NodeConfig, seeds: &[String]) -> TestNode {
        let storage = Arc::new(MemoryStorage::new());
        let node = Arc::new(Node::spawn(
            Keypair::generate(),
            config,
            storage.clone(),
            Arc::new(self.network.connector()),
        ));
        node.startup(seeds).await.expect("startup failed");
        TestNode {
            node,
            storage,
            addr: None,
            acceptor: None,
        }
    }
}
