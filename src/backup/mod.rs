/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable memory of the last committed prepare.
//!
//! Once a replica has broadcast a commit request for a block, it must never vote for a different block at
//! the same height, even across restarts. Before broadcasting the commit, the engine therefore hands the
//! committed prepare to the [`Backup`], which persists it under the [`COMMITTED_PREPARE_KEY`] in the
//! user-provided [`KVStore`](pluggables::KVStore). On start-up, the engine reads the key back and
//! re-proposes the prepare if the chain has not yet caught up with it.
//!
//! Writes happen on a dedicated writer thread, which is the only writer of the key. A failed write is
//! fatal: the engine stops rather than keep voting without a durable record of what it committed to.

pub mod pluggables;

use std::{
    fmt,
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::pbft::{implementation::FatalError, messages::PrepareReq};

use self::pluggables::{KVStore, KVStoreError, WriteBatch};

/// Key under which the committed prepare is stored.
pub const COMMITTED_PREPARE_KEY: &[u8] = b"committed";

/// Default minimum free space, in bytes, that the backup store's device must have at start-up.
pub const MIN_FREE_DISK_SPACE: u64 = 100 * 1024 * 1024;

enum BackupTask {
    Store(Vec<u8>),
    Flush(Sender<Result<(), BackupError>>),
}

pub(crate) struct Backup<K: KVStore> {
    kv_store: K,
    tasks: Option<Sender<BackupTask>>,
    failures: Receiver<BackupError>,
    writer: Option<JoinHandle<()>>,
}

impl<K: KVStore> Backup<K> {
    /// Check that the store has at least `min_free_disk_space` bytes available, then start the writer
    /// thread.
    pub(crate) fn open(kv_store: K, min_free_disk_space: u64) -> Result<Backup<K>, FatalError> {
        if let Some(available) = kv_store.available_space() {
            if available < min_free_disk_space {
                return Err(FatalError::InsufficientDiskSpace {
                    available,
                    required: min_free_disk_space,
                });
            }
        }

        let (tasks, task_receiver) = mpsc::channel();
        let (failure_sender, failures) = mpsc::channel();
        let writer = start_writer(kv_store.clone(), task_receiver, failure_sender);

        Ok(Backup {
            kv_store,
            tasks: Some(tasks),
            failures,
            writer: Some(writer),
        })
    }

    /// Read back the committed prepare, if one was stored and can be decoded.
    pub(crate) fn load_committed_prepare(&self) -> Option<PrepareReq> {
        let bytes = self.kv_store.get(COMMITTED_PREPARE_KEY)?;
        match PrepareReq::deserialize(&mut bytes.as_slice()) {
            Ok(prepare) => Some(prepare),
            Err(err) => {
                log::warn!("Ignoring undecodable committed prepare in backup: {}", err);
                None
            }
        }
    }

    /// Queue `prepare` to be written. Returns once the write is queued, not once it is applied.
    pub(crate) fn store_committed_prepare(&self, prepare: &PrepareReq) -> Result<(), FatalError> {
        // Safety: a PrepareReq is made up of types whose Borsh serialization does not fail.
        let bytes = prepare.try_to_vec().unwrap();
        self.send(BackupTask::Store(bytes))
    }

    /// Block until every queued write has been applied. Returns the first write error since the last flush.
    pub(crate) fn flush(&self) -> Result<(), FatalError> {
        let (reply, response) = mpsc::channel();
        self.send(BackupTask::Flush(reply))?;
        match response.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FatalError::Backup(err)),
            Err(_) => Err(FatalError::BackupWriterDisconnected),
        }
    }

    /// Check, without blocking, whether the writer has failed since this was last called.
    pub(crate) fn poll_failure(&self) -> Option<FatalError> {
        match self.failures.try_recv() {
            Ok(err) => Some(FatalError::Backup(err)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(FatalError::BackupWriterDisconnected),
        }
    }

    fn send(&self, task: BackupTask) -> Result<(), FatalError> {
        match &self.tasks {
            Some(tasks) => tasks.send(task).map_err(|_| FatalError::BackupWriterDisconnected),
            None => Err(FatalError::BackupWriterDisconnected),
        }
    }
}

impl<K: KVStore> Drop for Backup<K> {
    fn drop(&mut self) {
        // Closing the task channel stops the writer once it has applied every queued write.
        self.tasks = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn start_writer<K: KVStore>(
    mut kv_store: K,
    tasks: Receiver<BackupTask>,
    failures: Sender<BackupError>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut unreported: Option<BackupError> = None;
        while let Ok(task) = tasks.recv() {
            match task {
                BackupTask::Store(bytes) => {
                    let mut wb = K::WriteBatch::new();
                    wb.set(COMMITTED_PREPARE_KEY, &bytes);
                    if let Err(err) = kv_store.write(wb) {
                        let err = BackupError::from(err);
                        log::error!("Failed to write the committed prepare: {}", err);
                        let _ = failures.send(err.clone());
                        unreported.get_or_insert(err);
                    }
                }
                BackupTask::Flush(reply) => {
                    let _ = reply.send(match unreported.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    });
                }
            }
        }
    })
}

/// A write to the backup store failed.
#[derive(Debug, Clone)]
pub enum BackupError {
    KVStoreError(KVStoreError),
}

impl From<KVStoreError> for BackupError {
    fn from(value: KVStoreError) -> Self {
        BackupError::KVStoreError(value)
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::KVStoreError(err) => write!(f, "backup store write failed: {}", err),
        }
    }
}
