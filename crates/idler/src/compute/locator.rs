use tracing::debug;

use super::{ComputeApi, InstanceRef};
use crate::{Error, Result};

/// Build the Compute Engine list filter for an instance identifier.
///
/// Numeric identifiers are instance ids, anything else is an instance name.
pub fn filter_for(identifier: &str) -> Result<String> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(Error::Config("instance identifier is empty".to_string()));
    }

    if identifier.chars().all(|c| c.is_ascii_digit()) {
        return Ok(format!("id = {}", identifier));
    }

    let valid_name = identifier
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_name {
        return Err(Error::Validation(format!(
            "'{}' is neither an instance id nor a valid instance name",
            identifier
        )));
    }
    Ok(format!("name = \"{}\"", identifier))
}

/// Resolve every VM matching the identifier. The result is expected to hold a
/// single instance but is returned as-is.
pub async fn locate(api: &dyn ComputeApi, identifier: &str) -> Result<Vec<InstanceRef>> {
    let filter = filter_for(identifier)?;
    let instances = api.list_instances(&filter).await?;
    debug!("Filter {} matched {} instance(s)", filter, instances.len());
    Ok(instances)
}
