use crate::execution::model::{BackendOutcome, ExecutionContext, Target};
use crate::proxy::catalog::Layer2Mode;
use crate::proxy::resolver::ProxyEndpoint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// 每个 Layer 2 模式对应一个执行后端
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        target: &Target,
        endpoint: &ProxyEndpoint,
        ctx: &ExecutionContext,
    ) -> BackendOutcome;
}

/// 启动时填充；缺失的模式在执行时按 BackendUnavailable 处理
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<Layer2Mode, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mode: Layer2Mode, backend: Arc<dyn ExecutionBackend>) {
        self.backends.insert(mode, backend);
    }

    pub fn with(mut self, mode: Layer2Mode, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.register(mode, backend);
        self
    }

    pub fn get(&self, mode: Layer2Mode) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(&mode).cloned()
    }

    /// 已注册的模式，按 rank 排序
    pub fn available_modes(&self) -> Vec<Layer2Mode> {
        Layer2Mode::ALL
            .iter()
            .copied()
            .filter(|m| self.backends.contains_key(m))
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .available_modes()
            .iter()
            .map(|m| format!("{}={}", m, self.backends[m].name()))
            .collect();
        write!(f, "<BackendRegistry [{}]>", names.join(", "))
    }
}
