//! Process lifecycle: wires configuration, transport and storage into a
//! running [`Node`].

use crate::config::NodeConfig;
use crate::net::TcpTransport;
use anyhow::{Context, Result};
use hiera_consensus::{ConsensusEvent, Node, DEFAULT_INBOX_CAPACITY};
use hiera_storage::FileLogProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// A started node with its TCP transport.
pub struct NodeService {
    node: Node,
    transport: Arc<TcpTransport>,
}

impl NodeService {
    /// Binds the transport, opens every configured channel and joins
    /// consensus.
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let keypair = config.keypair()?;

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;

        let (transport, inbox) =
            TcpTransport::bind(keypair.public_key(), config.listen, DEFAULT_INBOX_CAPACITY)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
        for peer in &config.peers {
            transport.add_peer(peer.public_key, peer.address);
        }
        let transport = Arc::new(transport);

        let logs = Arc::new(FileLogProvider::new(config.log_dir()));
        let node = Node::start(
            keypair,
            transport.clone(),
            inbox,
            logs,
            config.runtime(),
        );

        for channel in config.channel_configs() {
            let id = channel.id.clone();
            node.create_channel(channel)
                .with_context(|| format!("failed to open channel {id}"))?;
            match node.get_chain_tip(&id)? {
                Some(tip) => tracing::info!(
                    channel = %id,
                    sequence = tip.sequence,
                    block = %tip.hash.short(),
                    "channel opened"
                ),
                None => tracing::info!(channel = %id, "channel opened empty"),
            }
        }

        Ok(Self { node, transport })
    }

    /// The consensus node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Peer listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// The TCP transport, for adding peers at runtime.
    pub fn transport(&self) -> &Arc<TcpTransport> {
        &self.transport
    }

    /// Logs events until `shutdown` resolves, then stops the node.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let mut events = self.node.subscribe();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(ConsensusEvent::ChannelHalted { channel, reason }) => {
                        tracing::warn!(channel = %channel, reason = %reason, "restart required to resume channel");
                    }
                    Ok(ConsensusEvent::FaultDetected { channel, fault }) => {
                        tracing::debug!(channel = %channel, fault = %fault, "fault event");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.node.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelSettings, NodeConfig};
    use hiera_msp::{IdentityIssuer, LocalAuthority, Organization};
    use hiera_types::{Keypair, Payload, Role, Transaction};
    use std::time::Duration;

    fn single_node_config(dir: &std::path::Path) -> (NodeConfig, LocalAuthority) {
        let authority = LocalAuthority::root(Keypair::from_seed(50));
        let keypair = Keypair::from_seed(51);
        let mut config = NodeConfig {
            private_key: keypair.secret_hex(),
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        config.consensus.batch_size = 2;
        config.channels.push(ChannelSettings {
            id: "main".into(),
            parent: None,
            organizations: vec![Organization::new("org", authority.public_key())],
            validators: vec![authority.issue_role(keypair.public_key(), Role::Endorser)],
            policy: None,
            genesis_previous_hash: Default::default(),
        });
        (config, authority)
    }

    #[tokio::test]
    async fn test_single_validator_commits_and_restarts() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, authority) = single_node_config(dir.path());
        let client_key = Keypair::from_seed(52);
        let client = authority.issue_role(client_key.public_key(), Role::Client);

        let tip = {
            let service = NodeService::start(&config).await.unwrap();
            let mut events = service.node().subscribe();
            for i in 0..2u64 {
                let tx = Transaction::signed(
                    "main".into(),
                    Payload::Inline(vec![i as u8]),
                    i,
                    client.clone(),
                    &client_key,
                );
                service.node().submit(tx).unwrap();
            }
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    if let Ok(ConsensusEvent::BlockCommitted { .. }) = events.recv().await {
                        break;
                    }
                }
            })
            .await
            .unwrap();
            let tip = service.node().get_chain_tip(&"main".into()).unwrap();
            service.run_until(async {}).await;
            tip
        };
        assert_eq!(tip.map(|t| t.sequence), Some(0));

        let service = NodeService::start(&config).await.unwrap();
        assert_eq!(service.node().get_chain_tip(&"main".into()).unwrap(), tip);
    }
}
