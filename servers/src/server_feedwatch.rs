use anyhow::{Context, Result};
use futures_util::StreamExt;
use lib_feedwatch::{Delivery, EventLog, MongoConnector, Registry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

mod feedwatch_logic;
use feedwatch_logic::{config, console, logger};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let targets = config.channel_targets()?;
    let filter = config.filter_spec()?;
    let format = config.output_format()?;
    let offset = config.timezone_offset.unwrap_or(0.0);

    let registry = Registry::new(Arc::new(MongoConnector::new(config.server_selection_timeout())));
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Delivery)>();
    let mut logs: BTreeMap<String, EventLog> = BTreeMap::new();

    for (channel, target) in targets {
        let handle = registry
            .subscribe(&channel, target)
            .with_context(|| format!("subscribing channel '{}'", channel))?;
        logs.insert(channel.clone(), EventLog::new());

        // Fan every channel into one queue so output lines never interleave.
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut deliveries = Box::pin(handle.into_stream());
            while let Some(delivery) = deliveries.next().await {
                if tx.send((channel.clone(), delivery)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    log::info!("Watching channels: {}", registry.active_channels().join(", "));
    if format == console::OutputFormat::Table {
        println!("{}", console::table_header());
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutdown signal received, closing change streams.");
                break;
            }
            next = rx.recv() => {
                let Some((channel, delivery)) = next else {
                    log::warn!("Every channel has ended.");
                    break;
                };
                match &delivery {
                    Delivery::Event(event) if filter.matches(event) => {
                        println!("{}", console::render_event(format, &channel, event, offset));
                    }
                    Delivery::Event(_) => {}
                    Delivery::Failed(error) => {
                        log::error!("[{}] Channel failed: {}", channel, error);
                        println!("{}", console::render_failure(format, &channel, error));
                    }
                }
                if let Some(history) = logs.get_mut(&channel) {
                    history.ingest(delivery);
                }
            }
        }
    }

    registry.shutdown().await;

    for (channel, history) in &logs {
        match history.last_error() {
            Some(error) => log::info!("[{}] {} events, failed: {}", channel, history.len(), error),
            None => log::info!("[{}] {} events", channel, history.len()),
        }
    }
    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term_signal.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Unable to listen for SIGTERM: {}", e);
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
