//! Bounded polling around domain power transitions.

use crate::backend::Hypervisor;
use crate::config::Retry;
use crate::error::VirtupError;

/// A request the hypervisor rejects as "operation invalid" has already been
/// satisfied (starting a running domain, stopping a stopped one).
fn tolerate_invalid(result: Result<(), VirtupError>) -> Result<(), VirtupError> {
    match result {
        Err(VirtupError::OperationInvalid { name, message }) => {
            tracing::debug!(name, "ignoring: {message}");
            Ok(())
        }
        other => other,
    }
}

/// Power on `name` and wait until the hypervisor reports it running.
pub async fn start<H: Hypervisor>(hv: &H, name: &str, retry: Retry) -> Result<(), VirtupError> {
    if hv.is_active(name)? {
        return Ok(());
    }
    tracing::info!(name, "starting instance");
    tolerate_invalid(hv.start(name))?;

    for attempt in 1..=retry.attempts {
        if hv.is_active(name)? {
            return Ok(());
        }
        tracing::debug!(name, remaining = retry.attempts - attempt, "waiting for running state");
        if attempt < retry.attempts {
            tokio::time::sleep(retry.interval).await;
        }
    }
    Err(VirtupError::Timeout {
        name: name.into(),
        what: "running state".into(),
    })
}

/// Gracefully shut `name` down, repeating the request while waiting.
pub async fn stop<H: Hypervisor>(hv: &H, name: &str, retry: Retry) -> Result<(), VirtupError> {
    if !hv.is_active(name)? {
        return Ok(());
    }
    tracing::info!(name, "stopping instance");
    tolerate_invalid(hv.shutdown(name))?;

    for attempt in 1..=retry.attempts {
        if !hv.is_active(name)? {
            return Ok(());
        }
        tracing::debug!(name, remaining = retry.attempts - attempt, "waiting for shutdown");
        if attempt < retry.attempts {
            tokio::time::sleep(retry.interval).await;
            // Guests that are still booting ignore the first ACPI request.
            tolerate_invalid(hv.shutdown(name))?;
        }
    }
    Err(VirtupError::Timeout {
        name: name.into(),
        what: "shutdown".into(),
    })
}
