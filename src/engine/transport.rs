//! Per-protocol HTTP client set with a fixed fallback order.
//!
//! Protocol selection is closed-set: each supported protocol gets its own
//! tuned `reqwest` client, and the preference policy produces a primary plus
//! an ordered fallback chain. Workers walk the chain on non-retryable
//! transport errors.

use std::time::Duration;

use crate::config::{ProtocolPreference, RuntimeOptions};
use crate::error::{Error, Result};

/// TCP dial timeout (covers the TLS handshake in reqwest)
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle pooled connections are dropped after this
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// TCP keep-alive interval
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Maximum redirects followed per request
const MAX_REDIRECTS: usize = 10;

/// Wire protocol of a client in the set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Protocol {
    /// HTTP/1.1
    H1,
    /// HTTP/2 (ALPN-negotiated over TLS)
    H2,
    /// HTTP/3 (QUIC)
    H3,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::H1 => write!(f, "http/1.1"),
            Protocol::H2 => write!(f, "h2"),
            Protocol::H3 => write!(f, "h3"),
        }
    }
}

/// One tuned client keyed by protocol
#[derive(Clone, Debug)]
pub(crate) struct ProtocolClient {
    /// Wire protocol this client speaks
    pub protocol: Protocol,
    /// The underlying reqwest client
    pub client: reqwest::Client,
}

/// The chosen primary client plus its ordered fallbacks.
#[derive(Clone, Debug)]
pub(crate) struct ClientSet {
    primary: ProtocolClient,
    fallbacks: Vec<ProtocolClient>,
}

impl ClientSet {
    /// Build the client set from the runtime options and probed protocol
    /// support.
    ///
    /// - `auto`: prefer H3 when supported, else H2, else H1; every lower
    ///   protocol stays in the chain.
    /// - `h2`/`h3`: attempt the preferred protocol with an H1 fallback.
    /// - `h1`: exclusively H1.
    ///
    /// A configured proxy disables H3 (QUIC over proxies is not modeled),
    /// as does building without the `http3` cargo feature.
    pub fn build(
        runtime: &RuntimeOptions,
        supports_h2: bool,
        supports_h3: bool,
    ) -> Result<Self> {
        let mut supports_h3 = supports_h3 && cfg!(feature = "http3");
        if runtime.proxy_url.is_some() && supports_h3 {
            tracing::debug!("HTTP/3 disabled because a proxy is configured");
            supports_h3 = false;
        }

        let h1 = ProtocolClient {
            protocol: Protocol::H1,
            client: build_client(runtime, Protocol::H1)?,
        };

        let set = match runtime.protocol_preference {
            ProtocolPreference::H1 => Self {
                primary: h1,
                fallbacks: Vec::new(),
            },
            ProtocolPreference::H2 => {
                if supports_h2 {
                    Self {
                        primary: ProtocolClient {
                            protocol: Protocol::H2,
                            client: build_client(runtime, Protocol::H2)?,
                        },
                        fallbacks: vec![h1],
                    }
                } else {
                    Self {
                        primary: h1,
                        fallbacks: Vec::new(),
                    }
                }
            }
            ProtocolPreference::H3 => {
                if supports_h3 {
                    Self {
                        primary: ProtocolClient {
                            protocol: Protocol::H3,
                            client: build_client(runtime, Protocol::H3)?,
                        },
                        fallbacks: vec![h1],
                    }
                } else {
                    Self {
                        primary: h1,
                        fallbacks: Vec::new(),
                    }
                }
            }
            ProtocolPreference::Auto => {
                let mut chain = Vec::new();
                if supports_h3 {
                    chain.push(ProtocolClient {
                        protocol: Protocol::H3,
                        client: build_client(runtime, Protocol::H3)?,
                    });
                }
                if supports_h2 {
                    chain.push(ProtocolClient {
                        protocol: Protocol::H2,
                        client: build_client(runtime, Protocol::H2)?,
                    });
                }
                chain.push(h1);
                let primary = chain.remove(0);
                Self {
                    primary,
                    fallbacks: chain,
                }
            }
        };

        tracing::debug!(
            preference = ?runtime.protocol_preference,
            supports_h2,
            supports_h3,
            chain = %set.describe(),
            "Transport selection"
        );

        Ok(set)
    }

    /// Primary first, then the fallbacks in order
    pub fn chain(&self) -> impl Iterator<Item = &ProtocolClient> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }

    /// The preferred client
    pub fn primary(&self) -> &ProtocolClient {
        &self.primary
    }

    /// Human-readable chain, e.g. `h3 -> h2 -> http/1.1`
    pub fn describe(&self) -> String {
        self.chain()
            .map(|c| c.protocol.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Build one tuned client for a protocol.
fn build_client(runtime: &RuntimeOptions, protocol: Protocol) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        // Slightly more pooled connections than workers to absorb bursts
        .pool_max_idle_per_host(runtime.max_connections_per_host + 2)
        .pool_idle_timeout(IDLE_CONN_TIMEOUT)
        .connect_timeout(DIAL_TIMEOUT)
        .tcp_keepalive(KEEP_ALIVE)
        // A read stuck longer than the stall timeout is dead at the
        // transport level too; the health monitor acts sooner
        .read_timeout(runtime.stall_timeout.max(Duration::from_secs(1)))
        // Headers (minus Range, which is set per request) survive redirects
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(runtime.user_agent.clone());

    match protocol {
        Protocol::H1 => {
            builder = builder.http1_only();
        }
        Protocol::H2 => {
            // Default ALPN negotiates h2 over TLS when the server offers it
        }
        Protocol::H3 => {
            #[cfg(feature = "http3")]
            {
                builder = builder.http3_prior_knowledge();
            }
            #[cfg(not(feature = "http3"))]
            {
                return Err(Error::Config {
                    message: "HTTP/3 client requested without the http3 feature".to_string(),
                    key: Some("protocol_preference".to_string()),
                });
            }
        }
    }

    if let Some(proxy_url) = &runtime.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| Error::Config {
            message: format!("invalid proxy URL {proxy_url}: {e}"),
            key: Some("proxy_url".to_string()),
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(Error::Network)
}
