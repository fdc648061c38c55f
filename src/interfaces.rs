use crate::errors::ChainResult;
use crate::secret::{PrivateKey25519, PublicKey25519Proposition};
use crate::types::{BoxId, SidechainBlock, SidechainBox, Version, WalletBox};

/// Application extension point observing wallet mutations.
///
/// Every hook is permitted to fail; a failure from `on_change_boxes` aborts
/// the enclosing block application before any wallet store is written.
pub trait ApplicationWallet: Send {
    fn on_add_secret(&mut self, secret: &PrivateKey25519) -> ChainResult<()>;
    fn on_remove_secret(&mut self, proposition: &PublicKey25519Proposition) -> ChainResult<()>;
    fn on_change_boxes(
        &mut self,
        version: &Version,
        boxes_to_update: &[WalletBox],
        box_ids_to_remove: &[BoxId],
    ) -> ChainResult<()>;
    fn on_rollback(&mut self, version: &Version) -> ChainResult<()>;
    fn check_storages_version(&self, version: &Version) -> bool;
}

/// Application extension point observing state mutations.
pub trait ApplicationState: Send {
    fn validate_block(&self, block: &SidechainBlock) -> ChainResult<()>;
    fn on_apply_changes(
        &mut self,
        version: &Version,
        new_boxes: &[SidechainBox],
        removed_box_ids: &[BoxId],
    ) -> ChainResult<()>;
    fn on_rollback(&mut self, version: &Version) -> ChainResult<()>;
    fn check_storages_version(&self, version: &Version) -> bool;
}

#[derive(Default)]
pub struct DefaultApplicationWallet;

impl ApplicationWallet for DefaultApplicationWallet {
    fn on_add_secret(&mut self, _secret: &PrivateKey25519) -> ChainResult<()> {
        Ok(())
    }

    fn on_remove_secret(&mut self, _proposition: &PublicKey25519Proposition) -> ChainResult<()> {
        Ok(())
    }

    fn on_change_boxes(
        &mut self,
        _version: &Version,
        _boxes_to_update: &[WalletBox],
        _box_ids_to_remove: &[BoxId],
    ) -> ChainResult<()> {
        Ok(())
    }

    fn on_rollback(&mut self, _version: &Version) -> ChainResult<()> {
        Ok(())
    }

    fn check_storages_version(&self, _version: &Version) -> bool {
        true
    }
}

#[derive(Default)]
pub struct DefaultApplicationState;

impl ApplicationState for DefaultApplicationState {
    fn validate_block(&self, _block: &SidechainBlock) -> ChainResult<()> {
        Ok(())
    }

    fn on_apply_changes(
        &mut self,
        _version: &Version,
        _new_boxes: &[crate::types::SidechainBox],
        _removed_box_ids: &[BoxId],
    ) -> ChainResult<()> {
        Ok(())
    }

    fn on_rollback(&mut self, _version: &Version) -> ChainResult<()> {
        Ok(())
    }

    fn check_storages_version(&self, _version: &Version) -> bool {
        true
    }
}
