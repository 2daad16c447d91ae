use tokio::time::Duration;

/// Options for the messaging client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Redelivery delay applied when an inbound message cannot be
    /// deserialized or its handler fails.
    pub unack_delay: Duration,

    /// Broker-side lifespan for sent messages. `Duration::ZERO` means
    /// messages never expire.
    pub default_lifespan: Duration,

    /// Delay between attempts to re-install a reply handler after its
    /// transport reported a failure.
    pub handler_reregister_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            unack_delay: Duration::from_secs(60),
            default_lifespan: Duration::ZERO,
            handler_reregister_interval: Duration::from_secs(60),
        }
    }
}
