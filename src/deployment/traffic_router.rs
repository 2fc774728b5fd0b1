use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::deployment::environment::Color;
use crate::error::{AppError, Result};

/// The traffic entry point: decides which color receives requests.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Sends all traffic to `color` in one step.
    async fn route_to(&self, color: Color) -> Result<()>;
    /// The color currently receiving traffic, `None` if nothing is routed.
    async fn current_route(&self) -> Result<Option<Color>>;
    /// Stops new connections reaching `color`; open ones may finish.
    async fn drain(&self, color: Color) -> Result<()>;
    async fn active_connections(&self, color: Color) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Ready,
    Drain,
    Maint,
}

impl ServerState {
    fn as_str(self) -> &'static str {
        match self {
            ServerState::Ready => "ready",
            ServerState::Drain => "drain",
            ServerState::Maint => "maint",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub sessions: u32,
    pub weight: u32,
}

#[async_trait]
pub trait LoadBalancerAdapter: Send + Sync {
    /// Applies every weight in a single batch.
    async fn set_weights(&self, weights: &[(String, u32)]) -> Result<()>;
    async fn set_server_state(&self, server: &str, state: ServerState) -> Result<()>;
    async fn server_stats(&self, server: &str) -> Result<ServerStats>;
}

/// Talks to the HAProxy runtime API over its admin socket.
pub struct HAProxyAdapter {
    admin_socket_path: PathBuf,
    backend: String,
}

impl HAProxyAdapter {
    pub fn new(admin_socket_path: PathBuf, backend: impl Into<String>) -> Self {
        Self {
            admin_socket_path,
            backend: backend.into(),
        }
    }

    async fn send_haproxy_command(&self, command: &str) -> Result<String> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixStream;

        let mut stream = UnixStream::connect(&self.admin_socket_path).await.map_err(|e| {
            AppError::NetworkError(format!("Failed to connect to HAProxy admin socket: {}", e))
        })?;

        stream
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to send command to HAProxy: {}", e)))?;

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response from HAProxy: {}", e)))?;

        let lowered = response.to_ascii_lowercase();
        if lowered.contains("no such") || lowered.contains("unknown command") {
            return Err(AppError::ExternalServiceError(format!(
                "HAProxy rejected '{}': {}",
                command,
                response.trim()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl LoadBalancerAdapter for HAProxyAdapter {
    async fn set_weights(&self, weights: &[(String, u32)]) -> Result<()> {
        // The runtime API runs `;`-separated commands from one write in order
        let batch = weights
            .iter()
            .map(|(server, weight)| format!("set weight {}/{} {}", self.backend, server, weight))
            .collect::<Vec<_>>()
            .join("; ");
        self.send_haproxy_command(&batch).await?;
        Ok(())
    }

    async fn set_server_state(&self, server: &str, state: ServerState) -> Result<()> {
        let command = format!("set server {}/{} state {}", self.backend, server, state.as_str());
        self.send_haproxy_command(&command).await?;
        Ok(())
    }

    async fn server_stats(&self, server: &str) -> Result<ServerStats> {
        let response = self.send_haproxy_command("show stat").await?;
        parse_show_stat(&response, &self.backend, server)
    }
}

/// Extracts `scur` and `weight` for one server from `show stat` CSV output.
pub fn parse_show_stat(csv: &str, backend: &str, server: &str) -> Result<ServerStats> {
    let mut lines = csv.lines();
    let header = lines
        .next()
        .ok_or_else(|| AppError::ExternalServiceError("empty HAProxy stats".to_string()))?;
    let columns: Vec<&str> = header.trim_start_matches('#').trim().split(',').collect();

    let index_of = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| AppError::ExternalServiceError(format!("HAProxy stats missing '{}' column", name)))
    };
    let pxname = index_of("pxname")?;
    let svname = index_of("svname")?;
    let scur = index_of("scur")?;
    let weight = index_of("weight")?;

    for line in lines {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.get(pxname) == Some(&backend) && fields.get(svname) == Some(&server) {
            let number = |i: usize| fields.get(i).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
            return Ok(ServerStats {
                sessions: number(scur),
                weight: number(weight),
            });
        }
    }

    Err(AppError::NotFound(format!("server {}/{} not in HAProxy stats", backend, server)))
}

/// Routes by weighting one server per color.
pub struct LoadBalancedTrafficRouter {
    load_balancer: Arc<dyn LoadBalancerAdapter>,
    servers: HashMap<Color, String>,
    call_timeout: Duration,
}

impl LoadBalancedTrafficRouter {
    pub fn new(load_balancer: Arc<dyn LoadBalancerAdapter>, servers: HashMap<Color, String>, call_timeout: Duration) -> Self {
        Self {
            load_balancer,
            servers,
            call_timeout,
        }
    }

    fn server(&self, color: Color) -> Result<&str> {
        self.servers
            .get(&color)
            .map(String::as_str)
            .ok_or_else(|| AppError::ConfigurationError(format!("no load balancer server for {}", color)))
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| AppError::Timeout(format!("{} exceeded {:?}", what, self.call_timeout)))?
    }
}

#[async_trait]
impl TrafficRouter for LoadBalancedTrafficRouter {
    async fn route_to(&self, color: Color) -> Result<()> {
        let target = self.server(color)?.to_string();
        let other = self.server(color.opposite())?.to_string();

        self.bounded("enable server", self.load_balancer.set_server_state(&target, ServerState::Ready))
            .await?;
        self.bounded(
            "switch weights",
            self.load_balancer.set_weights(&[(target.clone(), 100), (other.clone(), 0)]),
        )
        .await?;

        info!(color = %color, server = %target, "Traffic routed");
        Ok(())
    }

    async fn current_route(&self) -> Result<Option<Color>> {
        let mut routed = Vec::new();
        for color in Color::ALL {
            let stats = self
                .bounded("read stats", self.load_balancer.server_stats(self.server(color)?))
                .await?;
            if stats.weight > 0 {
                routed.push(color);
            }
        }
        match routed.as_slice() {
            [] => Ok(None),
            [color] => Ok(Some(*color)),
            _ => {
                warn!("Both colors carry traffic weight");
                Err(AppError::ConflictingStateError("both colors carry traffic weight".to_string()))
            }
        }
    }

    async fn drain(&self, color: Color) -> Result<()> {
        let server = self.server(color)?.to_string();
        self.bounded("drain server", self.load_balancer.set_server_state(&server, ServerState::Drain))
            .await?;
        info!(color = %color, server = %server, "Server set to drain");
        Ok(())
    }

    async fn active_connections(&self, color: Color) -> Result<u32> {
        let stats = self
            .bounded("read stats", self.load_balancer.server_stats(self.server(color)?))
            .await?;
        Ok(stats.sessions)
    }
}

/// In-memory load balancer for tests.
pub struct MockLoadBalancerAdapter {
    weights: RwLock<HashMap<String, u32>>,
    states: RwLock<HashMap<String, ServerState>>,
    sessions: RwLock<HashMap<String, u32>>,
    fail_writes: RwLock<bool>,
    log: RwLock<Vec<String>>,
}

impl MockLoadBalancerAdapter {
    pub fn new() -> Self {
        Self {
            weights: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            fail_writes: RwLock::new(false),
            log: RwLock::new(Vec::new()),
        }
    }

    pub async fn set_sessions(&self, server: &str, count: u32) {
        self.sessions.write().await.insert(server.to_string(), count);
    }

    pub async fn set_failing(&self, fail: bool) {
        *self.fail_writes.write().await = fail;
    }

    pub async fn weight(&self, server: &str) -> u32 {
        self.weights.read().await.get(server).copied().unwrap_or(0)
    }

    pub async fn state(&self, server: &str) -> Option<ServerState> {
        self.states.read().await.get(server).copied()
    }

    pub async fn log(&self) -> Vec<String> {
        self.log.read().await.clone()
    }
}

impl Default for MockLoadBalancerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancerAdapter for MockLoadBalancerAdapter {
    async fn set_weights(&self, weights: &[(String, u32)]) -> Result<()> {
        if *self.fail_writes.read().await {
            return Err(AppError::NetworkError("mock load balancer unreachable".to_string()));
        }
        let mut current = self.weights.write().await;
        for (server, weight) in weights {
            current.insert(server.clone(), *weight);
            self.log.write().await.push(format!("weight:{}:{}", server, weight));
        }
        Ok(())
    }

    async fn set_server_state(&self, server: &str, state: ServerState) -> Result<()> {
        if *self.fail_writes.read().await {
            return Err(AppError::NetworkError("mock load balancer unreachable".to_string()));
        }
        self.states.write().await.insert(server.to_string(), state);
        self.log.write().await.push(format!("state:{}:{}", server, state.as_str()));
        Ok(())
    }

    async fn server_stats(&self, server: &str) -> Result<ServerStats> {
        Ok(ServerStats {
            sessions: self.sessions.read().await.get(server).copied().unwrap_or(0),
            weight: self.weights.read().await.get(server).copied().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(lb: Arc<MockLoadBalancerAdapter>) -> LoadBalancedTrafficRouter {
        let servers = HashMap::from([(Color::A, "app-a".to_string()), (Color::B, "app-b".to_string())]);
        LoadBalancedTrafficRouter::new(lb, servers, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_route_to_moves_all_weight() {
        let lb = Arc::new(MockLoadBalancerAdapter::new());
        let router = router(lb.clone());

        assert_eq!(router.current_route().await.unwrap(), None);

        router.route_to(Color::B).await.unwrap();
        assert_eq!(lb.weight("app-b").await, 100);
        assert_eq!(lb.weight("app-a").await, 0);
        assert_eq!(router.current_route().await.unwrap(), Some(Color::B));

        router.route_to(Color::A).await.unwrap();
        assert_eq!(router.current_route().await.unwrap(), Some(Color::A));
    }

    #[tokio::test]
    async fn test_drain_and_connection_count() {
        let lb = Arc::new(MockLoadBalancerAdapter::new());
        let router = router(lb.clone());
        lb.set_sessions("app-a", 7).await;

        router.drain(Color::A).await.unwrap();
        assert_eq!(lb.state("app-a").await, Some(ServerState::Drain));
        assert_eq!(router.active_connections(Color::A).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unreachable_load_balancer_surfaces_error() {
        let lb = Arc::new(MockLoadBalancerAdapter::new());
        lb.set_failing(true).await;
        let router = router(lb);

        assert!(matches!(router.route_to(Color::A).await, Err(AppError::NetworkError(_))));
    }

    #[test]
    fn test_parse_show_stat() {
        let csv = "# pxname,svname,qcur,qmax,scur,smax,slim,stot,bin,bout,dreq,dresp,ereq,econ,eresp,wretr,wredis,status,weight\n\
app,FRONTEND,,,3,10,,,,,,,,,,,,OPEN,\n\
app,app-a,0,0,12,20,,,,,,,,,,,,UP,100\n\
app,app-b,0,0,0,4,,,,,,,,,,,,UP,0\n";

        let a = parse_show_stat(csv, "app", "app-a").unwrap();
        assert_eq!(a, ServerStats { sessions: 12, weight: 100 });
        let b = parse_show_stat(csv, "app", "app-b").unwrap();
        assert_eq!(b.weight, 0);
        assert!(matches!(parse_show_stat(csv, "app", "app-c"), Err(AppError::NotFound(_))));
    }
}
