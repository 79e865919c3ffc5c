//! HTTP server and middleware chain assembly

pub mod body;
pub mod exporter;
pub mod handler;
pub mod http;
pub mod proxy;
pub mod router;

pub use handler::{GatewayBody, GatewayRequest, GatewayResponse, Handler};
pub use http::run;
pub use proxy::UpstreamProxy;
pub use router::Router;

use std::sync::Arc;
use tracing::info;

use crate::auth::AuthMiddleware;
use crate::config::GatewayConfig;
use crate::dag::DagStore;
use crate::monitor::{HttpReporter, Reporter, UsageMonitor};
use crate::pin::{PinHandlers, PinIndex};
use crate::sentry::SentryMiddleware;
use crate::types::{GatewayError, Result};

/// Collaborators the chain is built around
pub struct Backends {
    pub content: Arc<dyn DagStore>,
    pub pins: Arc<dyn PinIndex>,
    /// Storage node handler for requests not served locally
    pub upstream: Arc<dyn Handler>,
    /// `None` disables metering
    pub reporter: Option<Arc<dyn Reporter>>,
}

impl Backends {
    /// Backends talking to the storage node and collector over HTTP
    pub fn connect(
        config: &GatewayConfig,
        client: reqwest::Client,
        pins: Arc<dyn PinIndex>,
    ) -> Result<Self> {
        let reporter: Option<Arc<dyn Reporter>> = match &config.collector_url {
            Some(url) => {
                let key = config.secret_key.clone().ok_or_else(|| {
                    GatewayError::Config("SECRET_KEY is required for metering".into())
                })?;
                Some(Arc::new(HttpReporter::new(client.clone(), url, key)))
            }
            None => None,
        };

        Ok(Self {
            content: Arc::new(crate::dag::UpstreamDagStore::new(
                client.clone(),
                &config.upstream_url,
            )),
            pins,
            upstream: Arc::new(UpstreamProxy::new(client, &config.upstream_url)),
            reporter,
        })
    }
}

/// Assemble `Auth → Monitor → Sentry → Router`
pub fn build_chain(config: Arc<GatewayConfig>, backends: Backends) -> Arc<dyn Handler> {
    let pins = PinHandlers::new(
        backends.pins,
        Arc::clone(&backends.content),
        Arc::clone(&backends.upstream),
    );
    let router: Arc<dyn Handler> = Arc::new(Router::new(&config, pins, backends.upstream));
    let sentry: Arc<dyn Handler> = Arc::new(SentryMiddleware::new(router));

    let metered: Arc<dyn Handler> = match backends.reporter {
        Some(reporter) => Arc::new(UsageMonitor::new(reporter, backends.content, sentry)),
        None => {
            info!("Usage metering disabled");
            sentry
        }
    };

    Arc::new(AuthMiddleware::new(config, metered))
}
