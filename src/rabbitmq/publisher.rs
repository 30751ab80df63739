use serde::Serialize;
use tracing::{debug, error};

use super::envelope::Envelope;
use super::errors::{PubSubError, Result};
use super::transport::BrokerChannel;

/// Publishing keys are concrete; wildcard segments only make sense in a
/// binding pattern.
pub fn validate_publish_key(routing_key: &str) -> Result<()> {
    let has_wildcard = routing_key
        .split('.')
        .any(|segment| segment == "*" || segment == "#");

    if routing_key.is_empty() || has_wildcard {
        return Err(PubSubError::InvalidRoutingKey(routing_key.to_string()));
    }
    Ok(())
}

/// Serializes `value` to JSON and publishes it on `exchange` under
/// `routing_key`. Returns once the broker has accepted the write. Nothing
/// is retried: a serialization failure is a caller bug, a transport failure
/// is fatal to this publish.
pub async fn publish_json<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    Ch: BrokerChannel,
    T: Serialize + ?Sized,
{
    validate_publish_key(routing_key)?;
    let envelope = Envelope::encode(value)?;

    channel
        .publish(exchange, routing_key, &envelope)
        .await
        .map_err(|e| {
            error!(exchange, routing_key, "Failed to publish message: {}", e);
            PubSubError::TransportError(e)
        })?;

    debug!(
        exchange,
        routing_key,
        bytes = envelope.payload.len(),
        "Published message"
    );
    Ok(())
}
