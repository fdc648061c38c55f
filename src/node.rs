use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{ChainParams, NodeConfig};
use crate::errors::{ChainError, ChainResult};
use crate::events::{EventPublisher, NodeViewEvent};
use crate::history::{FullConsensusEpochInfo, ProgressInfo, SidechainHistory};
use crate::interfaces::{ApplicationState, ApplicationWallet};
use crate::mempool::MemoryPool;
use crate::secret::PrivateKey25519;
use crate::state::SidechainState;
use crate::storage::NodeStorages;
use crate::types::{BlockId, SidechainBlock};
use crate::wallet::SidechainWallet;

const REQUEST_QUEUE_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The quadruple owned by the coordinator.
pub struct NodeView {
    pub history: SidechainHistory,
    pub state: SidechainState,
    pub wallet: SidechainWallet,
    pub mempool: MemoryPool,
}

pub enum NodeViewRequest {
    ApplyModifier {
        block: Box<SidechainBlock>,
        reply: oneshot::Sender<ChainResult<()>>,
    },
    GetDataFromCurrentNodeView(Box<dyn FnOnce(&NodeView) + Send>),
    ApplyFunctionOnNodeView(Box<dyn FnOnce(&mut NodeView) + Send>),
    ApplyBiFunctionOnNodeView(Box<dyn FnOnce(&mut NodeView) + Send>),
    LocallyGeneratedSecret {
        secret: Box<PrivateKey25519>,
        reply: oneshot::Sender<ChainResult<()>>,
    },
}

/// Serializes every mutation of the node view: one consumer task drains the
/// request channel and applies blocks across state, wallet and history in a
/// fixed order. A rollback failure halts the holder for good.
pub struct SidechainNodeViewHolder {
    view: NodeView,
    requests: mpsc::Receiver<NodeViewRequest>,
    events: EventPublisher,
    halted: bool,
}

#[derive(Clone)]
pub struct NodeViewHandle {
    sender: mpsc::Sender<NodeViewRequest>,
    events: EventPublisher,
}

impl SidechainNodeViewHolder {
    pub fn new(
        storages: &NodeStorages,
        params: ChainParams,
        mempool_limit: usize,
        application_state: Box<dyn ApplicationState>,
        application_wallet: Box<dyn ApplicationWallet>,
    ) -> ChainResult<(Self, NodeViewHandle)> {
        let history = SidechainHistory::restore(storages.history(), storages.consensus_data());
        let state = SidechainState::restore(
            storages.state(),
            storages.state_forger_boxes(),
            storages.utxo_merkle_tree(),
            params,
            application_state,
        );
        let wallet = SidechainWallet::restore(
            storages.wallet_boxes(),
            storages.wallet_transactions(),
            storages.forger_box_info(),
            storages.csw_data(),
            storages.secrets(),
            application_wallet,
        )?;
        let (sender, requests) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let events = EventPublisher::new(EVENT_CHANNEL_CAPACITY);
        let mut holder = Self {
            view: NodeView {
                history,
                state,
                wallet,
                mempool: MemoryPool::new(mempool_limit),
            },
            requests,
            events: events.clone(),
            halted: false,
        };
        holder.check_and_recover_storages()?;
        let handle = NodeViewHandle { sender, events };
        Ok((holder, handle))
    }

    pub fn from_config(
        config: &NodeConfig,
        application_state: Box<dyn ApplicationState>,
        application_wallet: Box<dyn ApplicationWallet>,
    ) -> ChainResult<(Self, NodeViewHandle)> {
        config.ensure_directories()?;
        let storages = NodeStorages::open(&config.db_path(), config.max_rollback_versions)?;
        Self::new(
            &storages,
            config.params.clone(),
            config.mempool_limit,
            application_state,
            application_wallet,
        )
    }

    pub async fn run(mut self) {
        info!("sidechain node view holder started");
        while let Some(request) = self.requests.recv().await {
            if self.halted {
                match request {
                    NodeViewRequest::ApplyModifier { reply, .. } => {
                        let _ = reply.send(Err(halted_error()));
                    }
                    NodeViewRequest::LocallyGeneratedSecret { reply, .. } => {
                        let _ = reply.send(Err(halted_error()));
                    }
                    _ => {}
                }
                continue;
            }
            match request {
                NodeViewRequest::ApplyModifier { block, reply } => {
                    let result = self.pmod_modify(*block);
                    let _ = reply.send(result);
                }
                NodeViewRequest::GetDataFromCurrentNodeView(function) => function(&self.view),
                NodeViewRequest::ApplyFunctionOnNodeView(function) => function(&mut self.view),
                NodeViewRequest::ApplyBiFunctionOnNodeView(function) => function(&mut self.view),
                NodeViewRequest::LocallyGeneratedSecret { secret, reply } => {
                    let _ = reply.send(self.view.wallet.add_secret(*secret));
                }
            }
        }
        info!("node view request channel closed");
    }

    /// Applies one offered block: history first, then per-block state and
    /// wallet updates, mempool reconciliation last.
    fn pmod_modify(&mut self, block: SidechainBlock) -> ChainResult<()> {
        let block_id = block.id();
        if self.view.history.contains(&block_id)? {
            debug!(block = %hex::encode(block_id), "modifier already in history, ignoring");
            return Ok(());
        }
        let progress = match self.view.history.append(&block) {
            Ok(progress) => progress,
            Err(err) => {
                self.events.publish(NodeViewEvent::SyntacticallyFailedModification(
                    block_id,
                    err.to_string(),
                ));
                return Err(err);
            }
        };
        if progress.to_apply.is_empty() {
            if !progress.to_download.is_empty() {
                self.events
                    .publish(NodeViewEvent::DownloadRequested(progress.to_download));
            }
            return Ok(());
        }
        let to_remove = progress.to_remove.clone();
        let applied = self.update_state_and_wallet(progress)?;
        self.view
            .mempool
            .update_after_application(&to_remove, &applied, &self.view.state)?;
        for applied_block in &applied {
            self.events
                .publish(NodeViewEvent::SemanticallySuccessfulModifier(applied_block.id()));
        }
        info!(
            block = %hex::encode(block_id),
            applied = applied.len(),
            "persistent modifier applied"
        );
        Ok(())
    }

    fn update_state_and_wallet(
        &mut self,
        mut progress: ProgressInfo,
    ) -> ChainResult<Vec<SidechainBlock>> {
        let mut suffix: Vec<SidechainBlock> = Vec::new();
        loop {
            if let Some(branch_point) = progress.branch_point {
                if self.view.state.version()? != Some(branch_point) {
                    if let Err(err) = self.rollback_state_and_wallet(branch_point) {
                        self.halted = true;
                        error!(%err, "rollback to branch point failed, halting");
                        self.events
                            .publish(NodeViewEvent::RollbackFailed(err.to_string()));
                        return Err(err);
                    }
                    // after the rollback only blocks up to and including the
                    // branch point remain applied
                    match suffix.iter().position(|kept| kept.id() == branch_point) {
                        Some(position) => suffix.truncate(position + 1),
                        None => suffix.clear(),
                    }
                }
            }
            match self.apply_state_and_wallet(&progress, &mut suffix)? {
                None => return Ok(suffix),
                Some(alternative) => {
                    if alternative.is_empty() {
                        return Ok(suffix);
                    }
                    progress = alternative;
                }
            }
        }
    }

    /// Applies each block of `progress.to_apply` to state and wallet. On a
    /// state rejection the block is reported invalid to history and the
    /// alternative progress (if any) is handed back for another round.
    fn apply_state_and_wallet(
        &mut self,
        progress: &ProgressInfo,
        suffix: &mut Vec<SidechainBlock>,
    ) -> ChainResult<Option<ProgressInfo>> {
        for block in &progress.to_apply {
            if self.view.state.is_switching_consensus_epoch(block)? {
                let (last_block_in_epoch, epoch_info) =
                    self.view.state.current_consensus_epoch_info()?;
                let nonce = self
                    .view
                    .history
                    .consensus_nonce_for_epoch(epoch_info.epoch, &last_block_in_epoch);
                let full_info = FullConsensusEpochInfo {
                    epoch: epoch_info.epoch,
                    stake_merkle_root: epoch_info.forging_stake_tree.root(),
                    forgers_stake_total: epoch_info.forgers_stake_total,
                    nonce,
                };
                self.view.history.apply_full_consensus_epoch_info(&full_info)?;
                // the wallet forger store now leads state by one version
                // until this block is scanned
                self.view.wallet.apply_consensus_epoch_info(&epoch_info)?;
            }
            match self.view.state.apply_modifier(block) {
                Err(ChainError::StateApply(reason)) => {
                    warn!(block = %hex::encode(block.id()), %reason, "state rejected block");
                    self.events.publish(NodeViewEvent::SemanticallyFailedModifier(
                        block.id(),
                        reason,
                    ));
                    let alternative = self
                        .view
                        .history
                        .report_modifier_is_invalid(block, progress)?;
                    return Ok(Some(alternative));
                }
                Err(err) => return Err(err),
                Ok(()) => {}
            }
            let epoch_info = self.view.state.withdrawal_epoch_info()?;
            let (fee_payments, utxo_view) = if self.view.state.is_withdrawal_epoch_last_index()? {
                let payments = self.view.state.get_fee_payments(epoch_info.epoch)?;
                self.view
                    .history
                    .update_fee_payments_info(&block.id(), &payments)?;
                let view = self.view.state.utxo_merkle_tree_view()?;
                (payments, Some(view))
            } else {
                (Vec::new(), None)
            };
            self.view.wallet.scan_persistent(
                block,
                epoch_info.epoch,
                &fee_payments,
                utxo_view.as_ref(),
            )?;
            // the best-block flip is the last write and the atomic crossing
            // point for restart recovery
            self.view.history.report_modifier_is_valid(block)?;
            suffix.push(block.clone());
        }
        Ok(None)
    }

    fn rollback_state_and_wallet(&mut self, to: BlockId) -> ChainResult<()> {
        self.view.state.rollback(to)?;
        self.view.wallet.rollback(to)?;
        Ok(())
    }

    /// Restores a consistent version across all stores after a restart. The
    /// history best-block write is the atomic crossing point: if history has
    /// not recorded a block, state and wallet may have crossed over and must
    /// retreat to the deepest active-chain ancestor of the state version.
    fn check_and_recover_storages(&mut self) -> ChainResult<()> {
        let history_version = match self.view.history.best_block_id()? {
            Some(version) => version,
            None => {
                if self.view.state.version()?.is_some() || self.view.wallet.version()?.is_some() {
                    return Err(ChainError::Consistency(
                        "state or wallet carries data but history has no best block".into(),
                    ));
                }
                return Ok(());
            }
        };
        self.view.state.ensure_storage_consistency_after_restore()?;
        let state_version = self
            .view
            .state
            .version()?
            .ok_or_else(|| ChainError::Consistency("state storage is empty".into()))?;
        if history_version == state_version {
            self.view.wallet.ensure_storage_consistency_after_restore()?;
            if self.view.wallet.version()? == Some(history_version) {
                info!(version = %hex::encode(history_version), "storages are consistent");
                return Ok(());
            }
            // the wallet is written before history flips the best block, so
            // a divergence here cannot come from a crash
            return Err(ChainError::Consistency(
                "state and history are consistent but the wallet diverges".into(),
            ));
        }
        warn!(
            history = %hex::encode(history_version),
            state = %hex::encode(state_version),
            "state and history diverge, rolling back"
        );
        let suffix = self
            .view
            .history
            .chain_back(
                state_version,
                SidechainHistory::is_in_active_chain,
                usize::MAX,
            )?
            .ok_or_else(|| {
                ChainError::Consistency(
                    "state version is not connected to the active chain".into(),
                )
            })?;
        let rollback_to = *suffix.first().ok_or_else(|| {
            ChainError::Consistency("empty recovery path from state version".into())
        })?;
        self.view.state.rollback(rollback_to)?;
        self.view.wallet.rollback(rollback_to)?;
        self.view.wallet.ensure_storage_consistency_after_restore()?;
        info!(version = %hex::encode(rollback_to), "storages recovered after restart");
        Ok(())
    }
}

impl NodeViewHandle {
    pub async fn apply_block(&self, block: SidechainBlock) -> ChainResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(NodeViewRequest::ApplyModifier {
                block: Box::new(block),
                reply,
            })
            .await
            .map_err(|_| unavailable())?;
        receiver.await.map_err(|_| unavailable())?
    }

    pub async fn get_data_from_current_node_view<T, F>(&self, function: F) -> ChainResult<T>
    where
        F: FnOnce(&NodeView) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let request = NodeViewRequest::GetDataFromCurrentNodeView(Box::new(move |view| {
            let _ = reply.send(function(view));
        }));
        self.sender.send(request).await.map_err(|_| unavailable())?;
        receiver.await.map_err(|_| unavailable())
    }

    pub async fn apply_function_on_node_view<T, F>(&self, function: F) -> ChainResult<T>
    where
        F: FnOnce(&mut NodeView) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let request = NodeViewRequest::ApplyFunctionOnNodeView(Box::new(move |view| {
            let _ = reply.send(function(view));
        }));
        self.sender.send(request).await.map_err(|_| unavailable())?;
        receiver.await.map_err(|_| unavailable())
    }

    pub async fn apply_bi_function_on_node_view<T, A, F>(
        &self,
        function: F,
        argument: A,
    ) -> ChainResult<T>
    where
        F: FnOnce(&mut NodeView, A) -> T + Send + 'static,
        A: Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let request = NodeViewRequest::ApplyBiFunctionOnNodeView(Box::new(move |view| {
            let _ = reply.send(function(view, argument));
        }));
        self.sender.send(request).await.map_err(|_| unavailable())?;
        receiver.await.map_err(|_| unavailable())
    }

    pub async fn add_secret(&self, secret: PrivateKey25519) -> ChainResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(NodeViewRequest::LocallyGeneratedSecret {
                secret: Box::new(secret),
                reply,
            })
            .await
            .map_err(|_| unavailable())?;
        receiver.await.map_err(|_| unavailable())?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeViewEvent> {
        self.events.subscribe()
    }
}

fn unavailable() -> ChainError {
    ChainError::Consistency("node view holder is not available".into())
}

fn halted_error() -> ChainError {
    ChainError::Consistency("node view holder halted after an unrecoverable failure".into())
}
