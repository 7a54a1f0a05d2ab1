//! Charge an electric vehicle during the cheapest hours of the day-ahead price curve.
#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::use_self)]

pub mod api_errors;
pub mod charge_plan;
pub mod controller;
pub mod datetime;
pub mod location;
pub mod prices;
pub mod services;
pub mod settings;

use std::{env, future::Future};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawn a task and automatically monitor its execution.
pub fn spawn<T>(future: T) -> JoinHandle<()>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    let task = tokio::spawn(future);

    tokio::spawn(async move {
        let rc = task.await;

        match rc {
            Ok(_rc) => {
                debug!("The thread terminated normally");
            }
            Err(err) => {
                error!("The thread aborted with error: {err}");
                std::process::exit(1);
            }
        };
    })
}

/// Is this application being run in debug mode?
///
/// In debug mode commands that change the vehicle are logged instead of sent.
///
/// If the environment variable `EVCHARGE_DEBUG` is set, its value decides. Otherwise
/// this is true for dev builds and false for release builds.
#[must_use]
pub fn is_debug_mode() -> bool {
    if let Ok(value) = env::var("EVCHARGE_DEBUG") {
        return value.to_lowercase() == "true";
    }

    cfg!(debug_assertions)
}
