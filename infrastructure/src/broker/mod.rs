//! Broker adapters.
//!
//! [`connector_for_url`] picks the adapter from the URL scheme: `amqp://` and
//! `amqps://` go to RabbitMQ, `memory://` to an in-process [`MemoryBroker`].

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

use relay_application::ports::broker::{BrokerConnector, BrokerError};
use relay_application::session::redact_url;
use std::sync::Arc;

/// URL schemes a connector exists for.
pub const SUPPORTED_SCHEMES: &[&str] = &["amqp", "amqps", memory::MEMORY_SCHEME];

/// Select the connector for `url`.
///
/// A `memory://` URL gets a fresh broker; share one [`MemoryBroker`]
/// explicitly when several sessions must meet on it.
pub fn connector_for_url(
    url: &str,
    publisher_confirms: bool,
) -> Result<Arc<dyn BrokerConnector>, BrokerError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some(memory::MEMORY_SCHEME) => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "amqp")]
        Some("amqp") | Some("amqps") => Ok(Arc::new(AmqpConnector::new(publisher_confirms))),
        #[cfg(not(feature = "amqp"))]
        Some("amqp") | Some("amqps") => {
            let _ = publisher_confirms;
            Err(BrokerError::Connection(
                "built without AMQP support (enable the `amqp` feature)".to_string(),
            ))
        }
        _ => Err(BrokerError::Connection(format!(
            "unsupported broker url '{}'",
            redact_url(url)
        ))),
    }
}
