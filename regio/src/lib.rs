//! # Regio
//!
//! The server around the region scheduler: configuration, logging and process lifecycle.

use std::time::Duration;

use anyhow::Context;
use regio_core::chunk::TicketHandle;
use regio_core::scheduler::Services;
use regio_core::ticks::TickTimes;
use regio_core::{ChunkLevel, RegionScheduler, TicketType};
use regio_utils::ChunkPos;
use tokio::{select, signal, task, time};
use tokio_util::sync::CancellationToken;

use crate::config::RegioConfig;
use crate::packets::LoggingPacketSink;

/// The configuration file.
pub mod config;
/// Logging setup.
pub mod logger;
/// Packet sinks.
pub mod packets;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// The main server struct.
pub struct RegioServer {
    /// The cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// The running scheduler.
    pub scheduler: RegionScheduler,
    spawn_tickets: Vec<TicketHandle>,
}

impl RegioServer {
    /// Starts the scheduler and loads the spawn area.
    pub fn new(config: &RegioConfig) -> anyhow::Result<Self> {
        log::info!("Starting Regio server");
        let services = Services::default().with_packets(LoggingPacketSink);
        let scheduler = RegionScheduler::start(config.scheduler.clone(), services)
            .context("failed to start the region scheduler")?;

        let spawn_tickets = ChunkPos::new(0, 0)
            .square(config.spawn_radius)
            .map(|pos| {
                scheduler
                    .chunks()
                    .add_ticket(pos, TicketType::SpawnKeepAlive, ChunkLevel::EntityTicking)
            })
            .collect();

        Ok(Self {
            cancel_token: CancellationToken::new(),
            scheduler,
            spawn_tickets,
        })
    }

    /// Runs until [`RegioServer::stop`] is called or the process receives ctrl-c, then halts the
    /// scheduler and waits for every region to save.
    pub async fn start(&self) {
        log::info!(
            "Started Regio server with {} spawn chunks",
            self.spawn_tickets.len()
        );

        let mut status_timer = time::interval(STATUS_LOG_INTERVAL);
        status_timer.tick().await;
        loop {
            select! {
                () = self.cancel_token.cancelled() => break,
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => log::info!("Received ctrl-c, stopping"),
                        Err(err) => {
                            log::error!("Unable to listen for ctrl-c: {err}");
                            self.cancel_token.cancelled().await;
                        }
                    }
                    break;
                }
                _ = status_timer.tick() => self.log_status(),
            }
        }

        self.shutdown().await;
    }

    /// Requests a graceful stop.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    fn log_status(&self) {
        let status = self.scheduler.status();
        let global = self.scheduler.global_tick_report(TickTimes::SHORT_WINDOW);
        log::info!(
            "{} regions, {} chunks, {} entities, {} players; global {:.1} TPS, {:.2} MSPT",
            status.regions.len(),
            status.loaded_chunks,
            status.entities(),
            status.players(),
            global.tps,
            global.mspt_avg
        );
        for region in status.regions.iter().take(3) {
            log::debug!(
                "Region {}: {} chunks, {:.1} TPS, {:.2} MSPT, {:.0}% busy",
                region.id,
                region.stats.chunks,
                region.report.tps,
                region.report.mspt_avg,
                region.report.utilisation * 100.0
            );
        }
    }

    async fn shutdown(&self) {
        for ticket in &self.spawn_tickets {
            self.scheduler.chunks().remove_ticket(*ticket);
        }
        let scheduler = self.scheduler.clone();
        if let Err(err) = task::spawn_blocking(move || scheduler.halt(true)).await {
            log::error!("Halting the scheduler failed: {err}");
        }
        log::info!("Regio server stopped");
    }
}
