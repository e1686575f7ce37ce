//! Reply handles for in-flight callbacks.
//!
//! A ticket pairs the transfer keys of one callback with the
//! [`KernelTransfer`] channel able to answer it. Handlers either complete
//! the ticket or fail it with a terminal status; dropping a ticket without
//! answering leaves the kernel to time the request out, so the dispatcher
//! always answers.

use std::{path::PathBuf, sync::Arc};

use crate::{
    error::{Result, SyncErrorKind},
    kernel::{KernelTransfer, PlaceholderSpec, TransferKeys},
};

/// Reply handle for a fetch-data callback.
#[derive(Clone)]
pub struct FetchData {
    transfer: Arc<dyn KernelTransfer>,
    keys: TransferKeys,
}

impl FetchData {
    pub fn new(transfer: Arc<dyn KernelTransfer>, keys: TransferKeys) -> Self {
        Self { transfer, keys }
    }

    pub fn keys(&self) -> TransferKeys {
        self.keys
    }

    /// Delivers one chunk at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.transfer.transfer_data(self.keys, offset, data)
    }

    /// Reports `(completed, total)` to the provider-progress endpoint.
    pub fn progress(&self, total: u64, completed: u64) -> Result<()> {
        self.transfer.report_progress(self.keys, total, completed)
    }

    /// Terminates the fetch with zero bytes and the given status.
    pub fn fail(&self, status: SyncErrorKind) -> Result<()> {
        self.transfer.fail_data(self.keys, status)
    }
}

/// Reply handle for a fetch-placeholders callback.
#[derive(Clone)]
pub struct FetchPlaceholders {
    transfer: Arc<dyn KernelTransfer>,
    keys: TransferKeys,
    parent: PathBuf,
}

impl FetchPlaceholders {
    pub fn new(transfer: Arc<dyn KernelTransfer>, keys: TransferKeys, parent: PathBuf) -> Self {
        Self {
            transfer,
            keys,
            parent,
        }
    }

    pub fn keys(&self) -> TransferKeys {
        self.keys
    }

    /// Directory being populated.
    pub fn parent(&self) -> &std::path::Path {
        &self.parent
    }

    /// Answers the enumeration with the full child list.
    pub fn pass(&self, specs: Vec<PlaceholderSpec>) -> Result<()> {
        self.transfer
            .transfer_placeholders(self.keys, &self.parent, specs)
    }

    /// Answers the enumeration with an empty list and the given status.
    pub fn fail(&self, status: SyncErrorKind) -> Result<()> {
        self.transfer.fail_placeholders(self.keys, status)
    }
}

/// Reply handle for a pre-delete callback.
#[derive(Clone)]
pub struct Delete {
    transfer: Arc<dyn KernelTransfer>,
    keys: TransferKeys,
}

impl Delete {
    pub fn new(transfer: Arc<dyn KernelTransfer>, keys: TransferKeys) -> Self {
        Self { transfer, keys }
    }

    pub fn pass(&self) -> Result<()> {
        self.transfer.ack_delete(self.keys, Ok(()))
    }

    pub fn fail(&self, status: SyncErrorKind) -> Result<()> {
        self.transfer.ack_delete(self.keys, Err(status))
    }
}

/// Reply handle for a pre-rename callback.
#[derive(Clone)]
pub struct Rename {
    transfer: Arc<dyn KernelTransfer>,
    keys: TransferKeys,
}

impl Rename {
    pub fn new(transfer: Arc<dyn KernelTransfer>, keys: TransferKeys) -> Self {
        Self { transfer, keys }
    }

    pub fn pass(&self) -> Result<()> {
        self.transfer.ack_rename(self.keys, Ok(()))
    }

    pub fn fail(&self, status: SyncErrorKind) -> Result<()> {
        self.transfer.ack_rename(self.keys, Err(status))
    }
}
