use crate::client::{ADMIN_TRIGGER_PATH, BATCH_PATH, Transport, TransportError};
use crate::models::device::{FieldKey, Fields, Value};
use crate::normalize::{extract, lookup, normalize_field};
use crate::shutdown::Shutdown;
use log::{debug, info, warn};
use serde_json::Value as Json;
use thiserror::Error;

/// Why a fetch cycle produced nothing publishable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("no liveness field (volume, temperature, battery) could be read ({})", describe_last(.last_error))]
    NoLiveData { last_error: Option<TransportError> },
    #[error("cycle cancelled by shutdown")]
    Cancelled,
}

impl From<TransportError> for CycleError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Cancelled { .. } => CycleError::Cancelled,
            other => CycleError::Transport(other),
        }
    }
}

fn describe_last(last: &Option<TransportError>) -> String {
    match last {
        Some(e) => format!("last error: {e}"),
        None => "device answered without data".to_string(),
    }
}

/// Which path produced a reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    Batch,
    PerField,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub fields: Fields,
    pub strategy: Strategy,
}

fn has_liveness(fields: &Fields) -> bool {
    FieldKey::LIVENESS.iter().any(|k| fields.contains_key(k))
}

fn normalize_batch(body: &Json) -> Fields {
    FieldKey::MAIN
        .iter()
        .filter_map(|&key| {
            let response_key = key.response_key()?;
            normalize_field(key, lookup(body, &response_key)).map(|v| (key, v))
        })
        .collect()
}

/// GET the dedicated endpoint of one register and normalize it.
fn fetch_register(transport: &dyn Transport, key: FieldKey) -> Result<Option<Value>, TransportError> {
    let (Some(path), Some(response_key)) = (key.path(), key.response_key()) else {
        return Ok(None);
    };
    let body = transport.get_json(&path)?;
    Ok(normalize_field(key, extract(&body, &response_key)))
}

/// One main-channel cycle: admin trigger, batch endpoint, per-field fallback.
pub fn fetch_main(transport: &dyn Transport, shutdown: &Shutdown) -> Result<Reading, CycleError> {
    match transport.fire_and_forget(ADMIN_TRIGGER_PATH) {
        Ok(()) => {}
        Err(TransportError::Cancelled { .. }) => return Err(CycleError::Cancelled),
        Err(e) => warn!("Assemble: admin trigger failed, continuing: {}", e),
    }

    match transport.get_json(BATCH_PATH) {
        Ok(body) if body.is_object() => {
            let fields = normalize_batch(&body);
            if has_liveness(&fields) {
                debug!("Assemble: batch response accepted ({} field(s))", fields.len());
                return Ok(Reading {
                    fields,
                    strategy: Strategy::Batch,
                });
            }
            debug!("Assemble: batch response has no liveness field; falling back to per-field requests");
        }
        Ok(body) => debug!(
            "Assemble: batch response is not an object ({}); falling back to per-field requests",
            body
        ),
        Err(TransportError::Cancelled { .. }) => return Err(CycleError::Cancelled),
        Err(e) => debug!("Assemble: batch request failed ({}); falling back to per-field requests", e),
    }

    fetch_per_field(transport, shutdown)
}

fn fetch_per_field(transport: &dyn Transport, shutdown: &Shutdown) -> Result<Reading, CycleError> {
    let mut fields = Fields::new();
    let mut last_error = None;
    let mut failed = 0usize;

    for key in FieldKey::MAIN {
        if shutdown.is_triggered() {
            return Err(CycleError::Cancelled);
        }
        match fetch_register(transport, key) {
            Ok(Some(value)) => {
                fields.insert(key, value);
            }
            Ok(None) => {}
            Err(TransportError::Cancelled { .. }) => return Err(CycleError::Cancelled),
            Err(e) => {
                warn!("Assemble: {} unavailable: {}", key, e);
                failed += 1;
                last_error = Some(e);
            }
        }
    }

    if !has_liveness(&fields) {
        return Err(CycleError::NoLiveData { last_error });
    }
    if failed > 0 {
        info!(
            "Assemble: per-field cycle completed with {} of {} register(s) failing",
            failed,
            FieldKey::MAIN.len()
        );
    }

    Ok(Reading {
        fields,
        strategy: Strategy::PerField,
    })
}

/// One pressure-channel cycle against its dedicated endpoint.
pub fn fetch_pressure(transport: &dyn Transport, shutdown: &Shutdown) -> Result<Reading, CycleError> {
    if shutdown.is_triggered() {
        return Err(CycleError::Cancelled);
    }
    let mut fields = Fields::new();
    if let Some(value) = fetch_register(transport, FieldKey::Pressure)? {
        fields.insert(FieldKey::Pressure, value);
    }
    Ok(Reading {
        fields,
        strategy: Strategy::PerField,
    })
}
