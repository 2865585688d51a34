//! One run of the tool, from a validated configuration to an exit code.

use std::sync::Arc;

use log::{info, warn};
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::config::RunConfig;
use crate::console::{Console, ConsoleExit};
use crate::error::ServiceError;
use crate::lifecycle::LifecycleManager;
use crate::runtime::ContainerEngine;
use crate::service::ServiceHandle;
use crate::signal::Interrupt;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Starts the service, hands it to the one-shot command or the console,
/// then tears it down. Teardown runs exactly once on every path.
pub async fn run_service<R, W>(
    engine: Arc<dyn ContainerEngine>,
    run: &RunConfig,
    mut interrupt: Interrupt,
    input: R,
    output: W,
) -> Result<(), ServiceError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let handle = ServiceHandle::start(engine, run, &mut interrupt).await?;
    info!(
        "Service {:?} available at {} (user {:?})",
        handle.service_name(),
        handle.client_address(),
        handle.auth().user
    );

    let outcome = if run.command.is_empty() {
        let mut console = Console::new(input, output, interrupt.clone());
        match console.run(&handle).await {
            Ok(ConsoleExit::Interrupted) => Err(ServiceError::Interrupted { rollback: None }),
            Ok(_) => Ok(()),
            Err(e) => Err(ServiceError::Io(e)),
        }
    } else {
        handle
            .run_command(&run.command, &mut interrupt)
            .await
            .map(|code| {
                if code != 0 {
                    warn!("Command exited with code {}", code);
                }
            })
    };

    handle.close(outcome).await
}

/// Removes what an earlier run of `service_name` left behind.
pub async fn cleanup(
    engine: Arc<dyn ContainerEngine>,
    service_name: &str,
) -> Result<(), ServiceError> {
    // Polling is not used by cleanup.
    let manager = LifecycleManager::new(engine, Default::default());
    let removed = manager.remove_leftovers(service_name).await?;
    info!(
        "Removed {} container(s) of service {:?}",
        removed, service_name
    );
    Ok(())
}

pub fn exit_code(result: &Result<(), ServiceError>) -> i32 {
    match result {
        Ok(()) => EXIT_OK,
        Err(e) if e.is_interrupt() => EXIT_INTERRUPTED,
        Err(_) => EXIT_FAILURE,
    }
}
