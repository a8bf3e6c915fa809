//! 作业层测试共用的 fake backend / probe
use crate::execution::backend::{BackendRegistry, ExecutionBackend};
use crate::execution::backoff::RetryPolicy;
use crate::execution::fallback::FallbackExecutor;
use crate::execution::model::{BackendOutcome, ExecutionContext, Target};
use crate::proxy::catalog::{CostInputs, Layer2Mode};
use crate::proxy::origin::{GeoLookup, GeoProbe, OriginVerifier, ProbeError};
use crate::proxy::resolver::{ProxyEndpoint, ProxyResolver, ProxySettings};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct StaticBackend {
    pub success: bool,
    pub calls: AtomicU32,
}

impl StaticBackend {
    pub fn new(success: bool) -> Arc<Self> {
        Arc::new(Self {
            success,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    async fn execute(
        &self,
        _target: &Target,
        endpoint: &ProxyEndpoint,
        _ctx: &ExecutionContext,
    ) -> BackendOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let cost = CostInputs {
            request_count: 1,
            bytes_transferred: 1024 * 1024,
            ..Default::default()
        };
        if self.success {
            BackendOutcome::ok(format!("payload via {}", endpoint.mode), cost)
        } else {
            BackendOutcome::failed(format!("{} blocked", endpoint.mode), false, cost)
        }
    }
}

/// 出口国家永远等于代理所在国家
pub struct EchoProbe;

#[async_trait]
impl GeoProbe for EchoProbe {
    async fn lookup(&self, endpoint: &ProxyEndpoint) -> Result<GeoLookup, ProbeError> {
        Ok(GeoLookup {
            ip: "203.0.113.7".to_string(),
            city: "Somewhere".to_string(),
            country: endpoint.country.to_uppercase(),
        })
    }
}

pub fn executor(registry: BackendRegistry) -> Arc<FallbackExecutor> {
    Arc::new(FallbackExecutor::new(
        Arc::new(ProxyResolver::new(ProxySettings::default())),
        OriginVerifier::new(Arc::new(EchoProbe)),
        Arc::new(registry),
        Duration::from_secs(5),
        RetryPolicy::default(),
    ))
}

/// direct / residential 失败，unlocker 成功
pub fn escalating_registry() -> BackendRegistry {
    BackendRegistry::new()
        .with(Layer2Mode::Direct, StaticBackend::new(false))
        .with(Layer2Mode::Residential, StaticBackend::new(false))
        .with(Layer2Mode::Unlocker, StaticBackend::new(true))
}
