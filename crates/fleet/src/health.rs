//! Health probing and the parallel readiness wait.

use {
    crate::{Engine, FleetConfig, FleetError, HealthTarget, PortEntry, Result, ServiceDescriptor},
    base::log,
    futures_util::future::join_all,
    serde_json::{Value, json},
    std::{collections::HashSet, fmt, future::Future, time::Duration},
    tokio::{net::TcpStream, time::Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Off,
    Startup,
    On,
    Busy,
    Unhealthy,
}

impl ServiceStatus {
    /// Serving requests, possibly at capacity.
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceStatus::On | ServiceStatus::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Off => "OFF",
            ServiceStatus::Startup => "STARTUP",
            ServiceStatus::On => "ON",
            ServiceStatus::Busy => "BUSY",
            ServiceStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe. `info` carries the model a service reports, when it reports one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Health {
    pub status: ServiceStatus,
    pub info: Option<String>,
}

impl Health {
    pub fn new(status: ServiceStatus) -> Self {
        Self { status, info: None }
    }

    pub fn with_info(status: ServiceStatus, info: impl Into<String>) -> Self {
        Self {
            status,
            info: Some(info.into()),
        }
    }
}

/// Network side of health checking and model management.
///
/// Probing never fails: every outcome maps onto a [`ServiceStatus`].
pub trait Endpoint: Send + Sync {
    fn probe(&self, entry: PortEntry) -> impl Future<Output = Health> + Send;

    /// Models the engine on `port` has available locally.
    fn models(&self, port: u16, engine: Engine) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn pull(&self, port: u16, model: &str, timeout: Duration) -> impl Future<Output = Result<()>> + Send;

    /// One throwaway inference to move weights onto the accelerator.
    fn warm_up(&self, service: &ServiceDescriptor) -> impl Future<Output = Result<()>> + Send;
}

/// Map an HTTP answer from a health target onto a status.
pub fn classify_response(code: u16, body: &str, target: HealthTarget) -> Health {
    let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let reported = json
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase);
    match code {
        200 => match target {
            HealthTarget::Speech => {
                let busy = json.get("busy").and_then(Value::as_bool).unwrap_or(false);
                let status = match reported.as_deref() {
                    Some("STARTUP") => ServiceStatus::Startup,
                    Some("BUSY") => ServiceStatus::Busy,
                    _ if busy => ServiceStatus::Busy,
                    _ => ServiceStatus::On,
                };
                Health {
                    status,
                    info: json.get("model").and_then(Value::as_str).map(str::to_string),
                }
            }
            HealthTarget::OllamaTags => Health::new(ServiceStatus::On),
            HealthTarget::OpenAiModels => Health {
                status: ServiceStatus::On,
                info: json
                    .pointer("/data/0/id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        },
        503 if target.is_llm() || reported.as_deref() == Some("STARTUP") => {
            Health::new(ServiceStatus::Startup)
        }
        _ => Health::new(ServiceStatus::Unhealthy),
    }
}

/// Probes over loopback HTTP.
#[derive(Clone, Debug)]
pub struct HttpEndpoint {
    client: reqwest::Client,
    host: String,
    probe_timeout: Duration,
    warm_up_timeout: Duration,
}

impl HttpEndpoint {
    pub fn new(config: &FleetConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            host: config.host.clone(),
            probe_timeout: config.probe_timeout,
            warm_up_timeout: config.startup_timeout,
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    async fn port_open(&self, port: u16) -> bool {
        let addr = format!("{}:{}", self.host, port);
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn get_json(&self, port: u16, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.url(port, path))
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_json(&self, port: u16, path: &str, body: Value, timeout: Duration) -> Result<()> {
        self.client
            .post(self.url(port, path))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Endpoint for HttpEndpoint {
    async fn probe(&self, entry: PortEntry) -> Health {
        if !self.port_open(entry.port).await {
            return Health::new(ServiceStatus::Off);
        }
        let url = self.url(entry.port, entry.target.path());
        match self.client.get(&url).timeout(self.probe_timeout).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                classify_response(code, &body, entry.target)
            }
            Err(e) => {
                log::debug!("probe {} failed with port open: {}", url, e);
                if entry.target.is_llm() {
                    Health::new(ServiceStatus::Startup)
                } else {
                    Health::new(ServiceStatus::Unhealthy)
                }
            }
        }
    }

    async fn models(&self, port: u16, engine: Engine) -> Result<Vec<String>> {
        let (path, list, key) = match engine {
            Engine::Ollama => ("/api/tags", "models", "name"),
            Engine::Vllm => ("/v1/models", "data", "id"),
        };
        let json = self.get_json(port, path).await?;
        Ok(json
            .get(list)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(key).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pull(&self, port: u16, model: &str, timeout: Duration) -> Result<()> {
        log::info!("pulling {} on port {}", model, port);
        self.post_json(
            port,
            "/api/pull",
            json!({ "model": model, "stream": false }),
            timeout,
        )
        .await
    }

    async fn warm_up(&self, service: &ServiceDescriptor) -> Result<()> {
        let (path, body) = match service.engine {
            Some(Engine::Ollama) => (
                "/api/generate",
                json!({
                    "model": service.model,
                    "prompt": "hi",
                    "stream": false,
                    "options": { "num_predict": 1 },
                }),
            ),
            Some(Engine::Vllm) => (
                "/v1/completions",
                json!({ "model": service.model, "prompt": "hi", "max_tokens": 1 }),
            ),
            None => return Ok(()),
        };
        self.post_json(service.port, path, body, self.warm_up_timeout)
            .await
            .map_err(|e| FleetError::Http(format!("warm-up of {}: {}", service.name(), e)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut { pending: Vec<u16> },
    /// The service on `port` was alive and then its port closed.
    Crashed { port: u16 },
}

/// Concurrent probing over a set of ports.
pub struct HealthReconciler<E> {
    endpoint: E,
    poll_interval: Duration,
}

impl<E: Endpoint> HealthReconciler<E> {
    pub fn new(endpoint: E, poll_interval: Duration) -> Self {
        Self {
            endpoint,
            poll_interval,
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub async fn status(&self, entry: PortEntry) -> Health {
        self.endpoint.probe(entry).await
    }

    /// Probe every entry at once; results are in input order.
    pub async fn snapshot(&self, entries: &[PortEntry]) -> Vec<(PortEntry, Health)> {
        let results = join_all(entries.iter().map(|e| self.endpoint.probe(*e))).await;
        entries.iter().copied().zip(results).collect()
    }

    /// Poll all entries concurrently until each is up, one of them crashes, or `timeout` elapses.
    pub async fn wait_all(&self, entries: &[PortEntry], timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut pending = entries.to_vec();
        let mut alive = HashSet::new();
        loop {
            let mut still = Vec::new();
            for (entry, health) in self.snapshot(&pending).await {
                match health.status {
                    ServiceStatus::On | ServiceStatus::Busy => {
                        log::info!("port {} is {}", entry.port, health.status);
                    }
                    ServiceStatus::Off if alive.contains(&entry.port) => {
                        log::error!("port {} closed while starting", entry.port);
                        return WaitOutcome::Crashed { port: entry.port };
                    }
                    ServiceStatus::Off => still.push(entry),
                    ServiceStatus::Startup | ServiceStatus::Unhealthy => {
                        alive.insert(entry.port);
                        still.push(entry);
                    }
                }
            }
            if still.is_empty() {
                return WaitOutcome::Ready;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut {
                    pending: still.iter().map(|e| e.port).collect(),
                };
            }
            pending = still;
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Poll until every entry reports OFF. Returns the ports still open at the deadline.
    pub async fn wait_closed(&self, entries: &[PortEntry], timeout: Duration) -> Vec<u16> {
        let deadline = Instant::now() + timeout;
        let mut pending = entries.to_vec();
        loop {
            pending = self
                .snapshot(&pending)
                .await
                .into_iter()
                .filter(|(_, health)| health.status != ServiceStatus::Off)
                .map(|(entry, _)| entry)
                .collect();
            let now = Instant::now();
            if pending.is_empty() || now >= deadline {
                return pending.iter().map(|e| e.port).collect();
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
