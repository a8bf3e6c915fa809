use crate::execution::backend::{BackendRegistry, ExecutionBackend};
use crate::execution::backoff::RetryPolicy;
use crate::execution::model::{
    AttemptError, AttemptRecord, ExecutionContext, ExecutionRequest, ExecutionResult,
    ExecutorError, FailureKind, Target,
};
use crate::proxy::catalog::{cost_estimate, Layer2Mode};
use crate::proxy::origin::{OriginInfo, OriginVerifier};
use crate::proxy::resolver::{normalize_country, ProxyEndpoint, ProxyResolver};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 从起始模式开始，按 rank 单调向上；不允许回退时只含起始模式
pub fn attempt_chain(start: Layer2Mode, allow_fallback: bool) -> Vec<Layer2Mode> {
    let mut chain = vec![start];
    if allow_fallback {
        let mut cur = start;
        while let Some(next) = cur.next() {
            chain.push(next);
            cur = next;
        }
    }
    chain
}

/// 单个链节的运行结果
struct LinkRun {
    result: Result<String, AttemptError>,
    tries: u32,
    cost_usd: f64,
}

pub struct FallbackExecutor {
    resolver: Arc<ProxyResolver>,
    verifier: OriginVerifier,
    registry: Arc<BackendRegistry>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl FallbackExecutor {
    pub fn new(
        resolver: Arc<ProxyResolver>,
        verifier: OriginVerifier,
        registry: Arc<BackendRegistry>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            resolver,
            verifier,
            registry,
            timeout,
            retry,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &ProxyResolver {
        &self.resolver
    }

    pub async fn execute(
        &self,
        req: &ExecutionRequest,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started = Instant::now();
        let country = normalize_country(&req.country);
        let (start, mode_source) = req.selection.starting_mode(&req.target);

        // 起始模式解析失败直接判作业失败
        let mut first_endpoint = Some(self.resolver.resolve(&country, start)?);
        let chain = attempt_chain(start, req.allow_fallback);
        info!(
            "{} 执行 {} [{}] 起始模式 {} ({:?})，链: {:?}",
            ctx,
            req.target.query,
            country,
            start,
            mode_source,
            chain.iter().map(|m| m.as_str()).collect::<Vec<_>>()
        );

        let mut origins: HashMap<String, OriginInfo> = HashMap::new();
        let mut origin_used: Option<OriginInfo> = None;
        let mut warnings: Vec<String> = Vec::new();
        let mut attempted: Vec<AttemptRecord> = Vec::with_capacity(chain.len());
        let mut total_cost = 0.0;
        let mut last_error: Option<String> = None;

        for &mode in &chain {
            let resolved = match first_endpoint.take() {
                Some(ep) => Ok(ep),
                None => self.resolver.resolve(&country, mode),
            };
            let endpoint = match resolved {
                Ok(ep) => ep,
                Err(e) => {
                    let err = AttemptError::from(e);
                    warn!("{} {} 跳过: {}", ctx, mode, err);
                    last_error = Some(err.to_string());
                    attempted.push(AttemptRecord {
                        mode,
                        success: false,
                        tries: 0,
                        cost_usd: 0.0,
                        error: last_error.clone(),
                    });
                    continue;
                }
            };

            let Some(backend) = self.registry.get(mode) else {
                let err = AttemptError::BackendUnavailable(mode);
                warn!("{} {}", ctx, err);
                last_error = Some(err.to_string());
                attempted.push(AttemptRecord {
                    mode,
                    success: false,
                    tries: 0,
                    cost_usd: 0.0,
                    error: last_error.clone(),
                });
                continue;
            };

            if req.verify_origin {
                let origin = match origins.get(endpoint.hop()) {
                    Some(o) => o.clone(),
                    None => {
                        let o = self.verifier.verify(&endpoint, &country).await;
                        if let Some(w) = &o.warning {
                            if !warnings.contains(w) {
                                warnings.push(w.clone());
                            }
                        }
                        origins.insert(endpoint.hop().to_string(), o.clone());
                        o
                    }
                };
                origin_used = Some(origin);
            }

            let run = self
                .run_link(backend.as_ref(), mode, &req.target, &endpoint, ctx)
                .await;
            total_cost += run.cost_usd;

            match run.result {
                Ok(payload) => {
                    attempted.push(AttemptRecord {
                        mode,
                        success: true,
                        tries: run.tries,
                        cost_usd: run.cost_usd,
                        error: None,
                    });
                    let duration = started.elapsed();
                    info!(
                        "{} 成功: {} 次尝试，模式 {}，成本 ${:.4}，耗时 {:.2}s",
                        ctx,
                        attempted.len(),
                        mode,
                        total_cost,
                        duration.as_secs_f64()
                    );
                    return Ok(ExecutionResult {
                        success: true,
                        content_length: payload.len(),
                        payload: Some(payload),
                        country,
                        requested_mode: start,
                        mode_source,
                        mode_used: mode,
                        attempts: attempted.len() as u32,
                        attempted,
                        fallback_used: mode != start,
                        estimated_cost_usd: total_cost,
                        duration,
                        origin: origin_used,
                        warnings,
                        failure: None,
                        error: None,
                    });
                }
                Err(err) => {
                    warn!("{} {} 失败 ({} 次): {}", ctx, mode, run.tries, err);
                    last_error = Some(err.to_string());
                    attempted.push(AttemptRecord {
                        mode,
                        success: false,
                        tries: run.tries,
                        cost_usd: run.cost_usd,
                        error: last_error.clone(),
                    });
                }
            }
        }

        let mode_used = chain.last().copied().unwrap_or(start);
        let duration = started.elapsed();
        warn!(
            "{} 链耗尽: {} 个模式全部失败，成本 ${:.4}",
            ctx,
            attempted.len(),
            total_cost
        );
        Ok(ExecutionResult {
            success: false,
            payload: None,
            content_length: 0,
            country,
            requested_mode: start,
            mode_source,
            mode_used,
            attempts: attempted.len() as u32,
            attempted,
            fallback_used: mode_used != start,
            estimated_cost_usd: total_cost,
            duration,
            origin: origin_used,
            warnings,
            failure: Some(FailureKind::ChainExhausted),
            error: last_error,
        })
    }

    /// 在超时与重试策略下调用 backend；每次尝试的成本都计入
    async fn run_link(
        &self,
        backend: &dyn ExecutionBackend,
        mode: Layer2Mode,
        target: &Target,
        endpoint: &ProxyEndpoint,
        ctx: &ExecutionContext,
    ) -> LinkRun {
        let mut cost_usd = 0.0;
        let mut try_num = 0;
        loop {
            try_num += 1;
            let (err, retryable) =
                match tokio::time::timeout(self.timeout, backend.execute(target, endpoint, ctx))
                    .await
                {
                    Ok(outcome) => {
                        cost_usd += cost_estimate(mode, &outcome.cost_inputs);
                        if outcome.success {
                            return LinkRun {
                                result: Ok(outcome.payload.unwrap_or_default()),
                                tries: try_num,
                                cost_usd,
                            };
                        }
                        let message = outcome
                            .error
                            .unwrap_or_else(|| "backend reported failure".to_string());
                        (AttemptError::Execution { mode, message }, outcome.retryable)
                    }
                    Err(_) => (
                        AttemptError::Timeout {
                            mode,
                            secs: self.timeout.as_secs(),
                        },
                        true,
                    ),
                };

            if !retryable || try_num >= self.retry.max_tries {
                return LinkRun {
                    result: Err(err),
                    tries: try_num,
                    cost_usd,
                };
            }

            let delay = self.retry.delay_for(try_num);
            warn!(
                "{} {} 第 {}/{} 次失败: {}，{:?} 后重试",
                ctx,
                backend.name(),
                try_num,
                self.retry.max_tries,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
