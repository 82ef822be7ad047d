//! Node runtime: wires config, storage, the visor and the API together and
//! drives the periodic pool expiry and block publishing tasks.

use crate::api::{run_api_server, ApiContext};
use crate::config::Config;
use crate::crypto::KeyPair;
use crate::error::{ChainError, Result};
use crate::persistence::{Database, InMemoryPersistence, Persistence};
use crate::blockchain::ChainHead;
use crate::visor::{unix_now, Visor};
use std::fs;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Ready,
    Degraded,
}

pub struct Node {
    pub config: Config,
    pub visor: Arc<Visor>,
    pub state: Arc<RwLock<NodeState>>,
}

impl Node {
    /// Opens the database under `config.node.data_dir` and the ledger in it.
    pub fn init(config: Config) -> Result<Self> {
        info!(
            coin = %config.node.coin_name,
            data_dir = %config.node.data_dir,
            "starting fibercoin node"
        );

        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let persistence: Arc<dyn Persistence> = match Database::open(&db_path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(
                    path = %db_path.display(),
                    error = %e,
                    "failed to open database, falling back to in-memory persistence"
                );
                Arc::new(InMemoryPersistence::new())
            }
        };

        let visor = Arc::new(Visor::open(&config, persistence)?);
        let state = Arc::new(RwLock::new(NodeState::Booting));

        Ok(Self {
            config,
            visor,
            state,
        })
    }

    /// Runs until the process receives ctrl-c.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let api_addr = self.config.api_addr();
        // Fail fast if the API port is taken.
        drop(TcpListener::bind(&api_addr).map_err(|e| {
            ChainError::ConfigError(format!("API address {} unavailable: {}", api_addr, e))
        })?);

        let ctx = ApiContext::new(self.visor.clone()).with_state(self.state.clone());
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_api_server(ctx, &api_addr).await {
                error!(error = %e, "API server failed");
                *state.write().await = NodeState::Degraded;
            }
        });

        let visor = self.visor.clone();
        let check_every = self.config.pool.expire_check_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(check_every));
            loop {
                ticker.tick().await;
                let expired = visor.expire_pool(unix_now());
                if !expired.is_empty() {
                    info!(count = expired.len(), "expired unconfirmed transactions");
                }
            }
        });

        match self.config.publisher_key()? {
            Some(keypair) => {
                let visor = self.visor.clone();
                let interval = self.config.node.publish_interval_secs.max(1);
                tokio::spawn(publish_loop(visor, keypair, interval));
                info!(interval_secs = interval, "block publisher enabled");
            }
            None => info!("no blockchain secret key configured, not publishing blocks"),
        }

        *self.state.write().await = NodeState::Ready;

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        Ok(())
    }
}

async fn publish_loop(visor: Arc<Visor>, keypair: KeyPair, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;
        publish_tick(&visor, &keypair).await;
    }
}

/// Runs [`publish_once`] on the blocking pool so block creation and the
/// store write never stall the API tasks.
async fn publish_tick(visor: &Arc<Visor>, keypair: &KeyPair) -> Option<ChainHead> {
    let visor = visor.clone();
    let keypair = keypair.clone();
    match tokio::task::spawn_blocking(move || publish_once(&visor, &keypair, unix_now())).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            warn!(error = %e, class = ?e.class(), "block not published");
            None
        }
        Err(e) => {
            error!(error = %e, "block publisher task failed");
            None
        }
    }
}

/// Creates, signs and applies one block from the pool at `now`.
/// Returns `None` when there is nothing to publish.
pub fn publish_once(visor: &Visor, keypair: &KeyPair, now: u64) -> Result<Option<ChainHead>> {
    if visor.pool().is_empty() {
        return Ok(None);
    }
    let time = match visor.head() {
        Some(head) => now.max(head.time + 1),
        None => return Ok(None),
    };

    let block = visor.create_block(keypair, time)?;
    let head = visor.apply_block(&block)?;
    info!(
        seq = head.seq,
        hash = %hex::encode(head.hash),
        txs = block.transactions.len(),
        fee = block.header.fee,
        "published block"
    );
    Ok(Some(head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{GenesisParams, LedgerParams, PublicKeyAuthority};
    use crate::distribution::LockPolicy;
    use crate::mempool::PoolConfig;
    use crate::transaction::{Transaction, TransactionOutput, VerifyParams};

    const GENESIS_TIME: u64 = 1_637_895_025;

    fn setup() -> (KeyPair, KeyPair, Arc<Visor>) {
        let authority = KeyPair::generate();
        let owner = KeyPair::generate();
        let visor = Visor::open_with(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(PublicKeyAuthority::new(authority.public_key)),
            Arc::new(LockPolicy::unrestricted()),
            GenesisParams {
                address: owner.address(),
                coin_volume: 100_000_000,
                timestamp: GENESIS_TIME,
            },
            LedgerParams::default(),
            PoolConfig::default(),
            VerifyParams::default(),
        )
        .unwrap();
        (authority, owner, Arc::new(visor))
    }

    fn pool_payment(visor: &Visor, owner: &KeyPair) -> Transaction {
        let genesis = visor
            .ledger()
            .unspent()
            .outputs_for_address(&owner.address())
            .remove(0);
        let mut tx = Transaction::new(
            vec![genesis.id()],
            vec![TransactionOutput::new(KeyPair::generate().address(), genesis.coins, 0)],
        );
        tx.sign_inputs(&[owner]).unwrap();
        visor.submit_to_pool(tx.clone()).unwrap();
        tx
    }

    #[test]
    fn test_publish_once_confirms_pool() {
        let (authority, owner, visor) = setup();
        assert_eq!(publish_once(&visor, &authority, GENESIS_TIME + 5).unwrap(), None);

        let tx = pool_payment(&visor, &owner);
        let head = publish_once(&visor, &authority, GENESIS_TIME + 5).unwrap().unwrap();
        assert_eq!(head.seq, 1);
        assert_eq!(head.time, GENESIS_TIME + 5);
        assert!(visor.pool().is_empty());
        assert_eq!(visor.get_block(1).unwrap().unwrap().transactions, vec![tx]);
    }

    #[test]
    fn test_publish_once_never_reuses_head_time() {
        let (authority, owner, visor) = setup();
        pool_payment(&visor, &owner);
        let head = publish_once(&visor, &authority, GENESIS_TIME - 100).unwrap().unwrap();
        assert_eq!(head.time, GENESIS_TIME + 1);
    }

    #[test]
    fn test_publish_once_with_foreign_key_is_rejected() {
        let (_, owner, visor) = setup();
        pool_payment(&visor, &owner);
        let err = publish_once(&visor, &KeyPair::generate(), GENESIS_TIME + 5).unwrap_err();
        assert!(matches!(err, ChainError::UnauthorizedBlock(_)));
        assert_eq!(visor.head().unwrap().seq, 0);
        assert_eq!(visor.pool().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_publish_tick_applies_block() {
        let (authority, owner, visor) = setup();
        assert!(publish_tick(&visor, &authority).await.is_none());

        pool_payment(&visor, &owner);
        let head = publish_tick(&visor, &authority).await.unwrap();
        assert_eq!(head.seq, 1);
        assert_eq!(visor.head(), Some(head));
    }
}
