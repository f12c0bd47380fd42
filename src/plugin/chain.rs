//! Ordered, short-circuitable plugin chains.

use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};

use crate::{
    config::PluginSpec,
    core::{Endpoint, GatewayPlugin, GatewayResult, RequestContext},
};

use super::build_plugin;

/// The rest of a chain, handed to each plugin.
///
/// Running it invokes the next plugin, or the endpoint once every plugin has run.
pub struct Next<'a> {
    plugins: &'a [Arc<dyn GatewayPlugin>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(plugins: &'a [Arc<dyn GatewayPlugin>], endpoint: &'a dyn Endpoint) -> Self {
        Self { plugins, endpoint }
    }

    pub async fn run(
        self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response<Bytes>> {
        match self.plugins.split_first() {
            Some((plugin, rest)) => {
                let next = Next::new(rest, self.endpoint);
                plugin.handle(req, ctx, next).await
            }
            None => self.endpoint.call(req, ctx).await,
        }
    }
}

/// An immutable plugin sequence, cheap to clone and shared by every request of a snapshot.
#[derive(Clone, Default)]
pub struct FilterChain {
    plugins: Arc<[Arc<dyn GatewayPlugin>]>,
}

impl FilterChain {
    /// Build a chain in configuration order; any unknown or misconfigured plugin fails the build.
    pub fn build(specs: &[PluginSpec]) -> GatewayResult<Self> {
        let plugins = specs
            .iter()
            .map(|spec| {
                build_plugin(&spec.name, spec.config.clone()).map_err(|e| {
                    crate::config_error!("Failed to build plugin {}: {}", spec.name, e)
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            plugins: plugins.into(),
        })
    }

    pub fn from_plugins(plugins: Vec<Arc<dyn GatewayPlugin>>) -> Self {
        Self {
            plugins: plugins.into(),
        }
    }

    pub async fn dispatch(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        endpoint: &dyn Endpoint,
    ) -> GatewayResult<Response<Bytes>> {
        Next::new(&self.plugins, endpoint).run(req, ctx).await
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
