//! Reminder commands for CLI.

use std::sync::Arc;

use clap::Subcommand;
use dosewatch_core::{
    Config, ConsoleSink, LogSink, NotificationPoller, ReminderSink, SystemClock,
};
use tokio::sync::watch;

use super::{print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum RemindAction {
    /// Run one reminder pass and exit
    Check {
        /// Print the pass summary as JSON instead of reminder lines
        #[arg(long)]
        json: bool,
    },
    /// Keep polling for due doses until interrupted
    Watch,
}

fn poller(ctx: &Context, sink: Arc<dyn ReminderSink>) -> NotificationPoller {
    NotificationPoller::new(
        ctx.db.clone(),
        sink,
        Arc::new(SystemClock),
        ctx.config.schedule_rules(),
    )
    .with_interval(ctx.config.reminders.poll_interval())
    .with_tick_timeout(ctx.config.reminders.tick_timeout())
}

pub fn run(action: RemindAction, config: Config) -> CliResult {
    let ctx = Context::open(config)?;

    match action {
        RemindAction::Check { json: true } => {
            let report = poller(&ctx, Arc::new(LogSink)).tick()?;
            print_json(&report)?;
        }
        RemindAction::Check { json: false } => {
            let report = poller(&ctx, Arc::new(ConsoleSink)).tick()?;
            tracing::debug!(
                candidates = report.candidates,
                sent = report.sent.len(),
                "reminder pass finished"
            );
        }
        RemindAction::Watch => {
            if !ctx.config.reminders.enabled {
                return Err("reminders are disabled (set reminders.enabled = true)".into());
            }
            let poller = Arc::new(poller(&ctx, Arc::new(ConsoleSink)));
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(watch_until_interrupted(poller))?;
        }
    }
    Ok(())
}

async fn watch_until_interrupted(poller: Arc<NotificationPoller>) -> std::io::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = poller.spawn(shutdown_rx);

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "reminder poller task failed");
    }
    signal
}
