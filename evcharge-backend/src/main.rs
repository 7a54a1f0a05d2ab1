//! Main entry point for the application.

#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod config;
mod logging;
mod notify;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use evcharge_core::{
    controller::{ChargeController, ControllerConfig, POLL_INTERVAL},
    location::Location,
    services::{
        nordpool::NordpoolClient, persistent_state::PersistentStateDatabase,
        tesla::api::TeslaClient,
    },
    settings::PersistentSettings,
    spawn,
};
use tokio::sync::mpsc;
use tracing::{error, info};

const TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

fn run_token_refresh(tesla: Arc<TeslaClient>) {
    spawn(async move {
        let mut timer = tokio::time::interval(TOKEN_CHECK_INTERVAL);
        loop {
            timer.tick().await;
            tesla.check_token().await.unwrap_or_else(|err| {
                error!("Failed to refresh token: {err}");
            });
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    color_backtrace::install();

    let env = config::Environment::load().unwrap_or_else(|e| {
        panic!("Error loading environment: {e}");
    });

    let config = env.config().unwrap_or_else(|e| {
        panic!("Error loading config: {e}");
    });

    let _guard = logging::init_tracing_subscriber(&config.logging)?;

    let persistent_state_database = PersistentStateDatabase::new(&config.persistent_state)
        .unwrap_or_else(|e| {
            panic!("Error getting persistent state loader: {e}");
        });

    let tesla = Arc::new(TeslaClient::new(
        &config.tesla,
        persistent_state_database.for_name("tesla", "token"),
    )?);
    run_token_refresh(tesla.clone());

    let prices = Arc::new(NordpoolClient::new(&config.nordpool));
    let home = Location::new(config.home.latitude, config.home.longitude);

    let mut running = Vec::with_capacity(config.vehicles.len());
    for vehicle in config.vehicles {
        let settings = PersistentSettings::new(
            persistent_state_database.for_name(&vehicle.id, "settings"),
            vehicle.settings,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        notify::run(vehicle.name.clone(), rx);

        let controller_config = ControllerConfig {
            name: vehicle.name,
            vehicle_id: vehicle.vehicle_id,
            timezone: config.home.timezone,
            home,
            labels: vehicle.labels,
            initial_mode: vehicle.charge_mode,
        };

        let controller = ChargeController::new(
            controller_config,
            tesla.clone(),
            prices.clone(),
            Arc::new(settings),
            Arc::new(tx),
        )
        .with_persistent_state(persistent_state_database.for_name(&vehicle.id, "controller"));

        info!(id = vehicle.id, "Starting charge controller");
        running.push(controller.run(POLL_INTERVAL));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for (handle, task) in running {
        if let Err(err) = handle.shutdown().await {
            error!("Failed to stop controller: {err}");
        }
        task.await?;
    }

    Ok(())
}
