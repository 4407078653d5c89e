//! Parallel script checking
//!
//! Blocks are validated one request at a time, in submission order, with
//! the checks of a single block spread over a rayon pool. Responses come
//! back on a channel in the same order the requests went in.

use crate::blockchain::{short_hash, Hash256};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

/// One input to verify against the output it spends.
#[derive(Debug, Clone)]
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub locking_script: Vec<u8>,
    pub value: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Input {0} does not exist")]
    MissingInput(usize),

    #[error("Input {input_index} rejected: {reason}")]
    Rejected { input_index: usize, reason: String },
}

pub trait ScriptVerifier: Send + Sync {
    fn verify(&self, check: &ScriptCheck) -> std::result::Result<(), ScriptError>;
}

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub id: u64,
    pub block_hash: Hash256,
    pub checks: Vec<ScriptCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResponse {
    pub id: u64,
    pub block_hash: Hash256,
    pub result: std::result::Result<(), ScriptError>,
}

pub struct SignatureValidator {
    requests: Option<Sender<ValidationRequest>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl SignatureValidator {
    /// Start the dispatcher thread and its worker pool. `threads == 0`
    /// sizes the pool to the CPU count.
    pub fn spawn(
        verifier: Arc<dyn ScriptVerifier>,
        threads: usize,
        capacity: usize,
    ) -> Result<(Self, Receiver<ValidationResponse>)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("script-check-{i}"))
            .build()
            .map_err(|e| ChainError::Config(format!("Failed to build validation pool: {}", e)))?;

        let (request_tx, request_rx) = bounded::<ValidationRequest>(capacity);
        let (response_tx, response_rx) = bounded::<ValidationResponse>(capacity);

        let dispatcher = std::thread::Builder::new()
            .name("script-dispatch".to_string())
            .spawn(move || {
                for request in request_rx.iter() {
                    let result = pool.install(|| {
                        request
                            .checks
                            .par_iter()
                            .try_for_each(|check| verifier.verify(check))
                    });
                    if let Err(e) = &result {
                        warn!("Block {} failed script checks: {}", short_hash(&request.block_hash), e);
                    }
                    let response = ValidationResponse {
                        id: request.id,
                        block_hash: request.block_hash,
                        result,
                    };
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
                debug!("Script dispatcher stopped");
            })?;

        Ok((
            SignatureValidator {
                requests: Some(request_tx),
                dispatcher: Some(dispatcher),
            },
            response_rx,
        ))
    }

    /// Queue a block's checks. Blocks while the queue is full.
    pub fn submit(&self, request: ValidationRequest) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(ChainError::Shutdown)?;
        requests.send(request).map_err(|_| ChainError::Shutdown)
    }

    /// Stop accepting work, finish what is queued and join the dispatcher.
    pub fn shutdown(&mut self) {
        self.requests.take();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                warn!("Script dispatcher panicked");
            }
        }
    }
}

impl Drop for SignatureValidator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
