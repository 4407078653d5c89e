//! Messages exchanged with a peer, and the task serving one connection
//!
//! Framing and handshakes happen elsewhere; a connection reaches this crate
//! as a pair of channels carrying decoded messages.

use crate::blockchain::{short_hash, Block, BlockHeader, Hash256};
use crate::error::{ChainError, Result, Severity};
use crate::fetch::{BlockFetchDriver, ConnectionId};
use crate::headers::{HeaderSyncDriver, SyncState};
use crate::node::SyncContext;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Headers(Vec<BlockHeader>),
    Inventory(Vec<Hash256>),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    GetHeaders { locator: Vec<Hash256>, stop: Hash256 },
    GetBlocks { locator: Vec<Hash256>, stop: Hash256 },
    GetData(Vec<Hash256>),
    Disconnect(String),
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Serve one peer until it goes away, misbehaves, or `shutdown` flips.
/// A protocol violation is answered with [`OutboundMessage::Disconnect`]
/// and returned.
pub async fn run_connection(
    ctx: Arc<SyncContext>,
    connection: ConnectionId,
    inbound: mpsc::Receiver<InboundMessage>,
    outbound: mpsc::Sender<OutboundMessage>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut headers = HeaderSyncDriver::new(
        connection,
        ctx.tree.clone(),
        ctx.events.clone(),
        &ctx.config.network,
    )?;
    let mut blocks = BlockFetchDriver::new(
        connection,
        ctx.coordinator.clone(),
        ctx.cache.clone(),
        ctx.tree.clone(),
        ctx.events.clone(),
        ctx.config.fetch.clone(),
    );

    info!("{}: connected", connection);
    let result = serve(&ctx, &mut headers, &mut blocks, inbound, &outbound, shutdown).await;
    blocks.close();

    match result {
        Ok(()) | Err(ChainError::Shutdown) => {
            info!("{}: closed", connection);
            Ok(())
        }
        Err(e) if e.severity() == Severity::Disconnect => {
            warn!("{}: disconnecting: {}", connection, e);
            let _ = outbound.send(OutboundMessage::Disconnect(e.to_string())).await;
            Err(e)
        }
        Err(e) => {
            warn!("{}: stopped: {}", connection, e);
            Err(e)
        }
    }
}

async fn serve(
    ctx: &SyncContext,
    headers: &mut HeaderSyncDriver,
    blocks: &mut BlockFetchDriver,
    mut inbound: mpsc::Receiver<InboundMessage>,
    outbound: &mpsc::Sender<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if *shutdown.borrow() {
        return Ok(());
    }
    send(outbound, headers.start()).await?;

    let mut ticker = tokio::time::interval(ctx.config.fetch.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let messages = tokio::select! {
            _ = shutdown.changed() => break,
            message = inbound.recv() => match message {
                Some(message) => handle(ctx, headers, blocks, message)?,
                None => break,
            },
            _ = ctx.coordinator.wait_for_change() => blocks.fill_requests(Instant::now()),
            _ = ticker.tick() => blocks.on_tick(Instant::now()),
        };
        for message in messages {
            send(outbound, message).await?;
        }
    }
    Ok(())
}

fn handle(
    ctx: &SyncContext,
    headers: &mut HeaderSyncDriver,
    blocks: &mut BlockFetchDriver,
    message: InboundMessage,
) -> Result<Vec<OutboundMessage>> {
    let now = Instant::now();
    let mut out = Vec::new();
    match message {
        InboundMessage::Headers(list) => {
            if let Some(request) = headers.on_headers(&list, unix_now())? {
                out.push(request);
            }
        }
        InboundMessage::Inventory(hashes) => {
            blocks.on_inventory(&hashes, now);
            let unknown = {
                let tree = ctx.tree.lock();
                hashes.iter().find(|h| !tree.contains(h)).copied()
            };
            if let Some(hash) = unknown {
                if headers.state() == SyncState::Idle {
                    debug!("Announced block {} has no header yet", short_hash(&hash));
                    out.push(headers.start());
                }
            }
        }
        InboundMessage::Block(block) => blocks.on_block(block)?,
    }
    out.extend(blocks.fill_requests(now));
    Ok(out)
}

async fn send(outbound: &mpsc::Sender<OutboundMessage>, message: OutboundMessage) -> Result<()> {
    outbound.send(message).await.map_err(|_| ChainError::Shutdown)
}
