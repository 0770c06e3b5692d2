//! Docker compose rewriting for stack challenges.
//!
//! Every service's `ports` entries are rebound, in file order, to the host
//! ports allocated for the instance. `container_name` is dropped so the
//! backend derives container names from the (unique) stack name.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("invalid compose file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("compose file has no services")]
    NoServices,

    #[error("service {service} has an unsupported port mapping")]
    BadPort { service: String },

    #[error("compose file publishes {declared} ports but {allocated} were allocated")]
    PortCount { declared: usize, allocated: usize },
}

/// Number of published ports across all services.
pub fn port_count(compose: &str) -> Result<usize, ComposeError> {
    let document: Value = serde_yaml::from_str(compose)?;
    let services = services(&document)?;
    Ok(services
        .values()
        .filter_map(|service| service.get("ports"))
        .filter_map(Value::as_sequence)
        .map(Vec::len)
        .sum())
}

/// Rewrite `compose` so its published ports are exactly `ports`.
pub fn assign_ports(compose: &str, ports: &[u16]) -> Result<String, ComposeError> {
    let declared = port_count(compose)?;
    if declared != ports.len() {
        return Err(ComposeError::PortCount {
            declared,
            allocated: ports.len(),
        });
    }

    let mut document: Value = serde_yaml::from_str(compose)?;
    let services = document
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or(ComposeError::NoServices)?;

    let mut next = ports.iter();
    for (name, service) in services.iter_mut() {
        let Some(service) = service.as_mapping_mut() else {
            continue;
        };
        service.remove("container_name");

        let Some(mappings) = service.get_mut("ports").and_then(Value::as_sequence_mut) else {
            continue;
        };
        for mapping in mappings.iter_mut() {
            let internal = internal_port(mapping).ok_or_else(|| ComposeError::BadPort {
                service: name.as_str().unwrap_or_default().to_string(),
            })?;
            // Lengths were checked above.
            let Some(host) = next.next() else { break };
            *mapping = Value::String(format!("{host}:{internal}"));
        }
    }

    Ok(serde_yaml::to_string(&document)?)
}

fn services(document: &Value) -> Result<&Mapping, ComposeError> {
    document
        .get("services")
        .and_then(Value::as_mapping)
        .ok_or(ComposeError::NoServices)
}

/// Container side of a port mapping, protocol suffix included.
fn internal_port(mapping: &Value) -> Option<String> {
    match mapping {
        Value::Number(port) => Some(port.to_string()),
        Value::String(short) => short
            .rsplit(':')
            .next()
            .filter(|port| !port.is_empty())
            .map(str::to_string),
        Value::Mapping(long) => {
            let target = match long.get("target")? {
                Value::Number(port) => port.to_string(),
                Value::String(port) => port.clone(),
                _ => return None,
            };
            match long.get("protocol").and_then(Value::as_str) {
                Some(protocol) => Some(format!("{target}/{protocol}")),
                None => Some(target),
            }
        }
        _ => None,
    }
}
