//! Session configuration

use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// 会话配置
///
/// 所有间隔/超时字段为 0 时表示禁用对应的定时器。
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 服务器地址 (e.g., "http://localhost:8080")
    pub base_url: String,
    /// WebSocket 路径
    pub socket_path: String,
    /// HTTP 回退传输的路径前缀 (`/establish`, `/message`)
    pub http_base_path: String,
    /// 连通性探测路径，响应体为 `OK` 视为可达
    pub status_path: String,
    /// 连接尝试超时
    pub connect_timeout: Duration,
    /// 稳定性检查间隔
    pub stability_interval: Duration,
    /// 存活窗口 (超过此时间无入站消息则认为断连)
    pub liveness_window: Duration,
    /// 会话 ping 间隔
    pub ping_interval: Duration,
    /// outbox 剩余请求的重试间隔
    pub outbox_retry_delay: Duration,
    /// 重连时探测间隔
    pub probe_interval: Duration,
    /// 挂起的重连超过此时间视为卡死，允许重新发起
    pub stale_reconnect_after: Duration,
    /// 失败次数超过此阈值时从 socket 切换到 HTTP
    pub failover_threshold: u32,
    /// 默认调用超时
    pub call_timeout: Duration,
    /// HTTP 回退传输的收件箱轮询间隔
    pub http_poll_interval: Duration,
    /// HTTP 链接关闭后继续轮询的宽限期
    pub http_close_grace: Duration,
    /// 单个 HTTP 请求超时 (回退传输与连通性探测)
    pub http_request_timeout: Duration,
    /// 自动登录超时
    pub login_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            socket_path: "/_seam/ws".to_string(),
            http_base_path: "/_seam/http".to_string(),
            status_path: "/api/status".to_string(),
            connect_timeout: Duration::from_millis(3500),
            stability_interval: Duration::from_secs(3),
            liveness_window: Duration::from_millis(7500),
            ping_interval: Duration::from_secs(5),
            outbox_retry_delay: Duration::from_millis(100),
            probe_interval: Duration::from_millis(500),
            stale_reconnect_after: Duration::from_secs(30),
            failover_threshold: 3,
            call_timeout: Duration::from_secs(10),
            http_poll_interval: Duration::from_secs(2),
            http_close_grace: Duration::from_secs(30),
            http_request_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given server
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base_url(base_url.into()),
            ..Self::default()
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_http_base_path(mut self, path: impl Into<String>) -> Self {
        self.http_base_path = path.into();
        self
    }

    pub fn with_status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = path.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the stability check interval and liveness window
    pub fn with_stability(mut self, interval: Duration, window: Duration) -> Self {
        self.stability_interval = interval;
        self.liveness_window = window;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_outbox_retry_delay(mut self, delay: Duration) -> Self {
        self.outbox_retry_delay = delay;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_failover_threshold(mut self, threshold: u32) -> Self {
        self.failover_threshold = threshold;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_http_poll_interval(mut self, interval: Duration) -> Self {
        self.http_poll_interval = interval;
        self
    }

    pub fn with_http_request_timeout(mut self, timeout: Duration) -> Self {
        self.http_request_timeout = timeout;
        self
    }

    /// HTTP client shared by the fallback link and the status probe
    pub(crate) fn http_client(&self) -> ClientResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if !self.http_request_timeout.is_zero() {
            builder = builder.timeout(self.http_request_timeout);
        }
        builder
            .build()
            .map_err(|e| ClientError::Connection(format!("Failed to build HTTP client: {}", e)))
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }
}

fn trim_base_url(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_strips_trailing_slashes() {
        let config = SessionConfig::new("https://api.example.com//");
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.failover_threshold, 3);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_http_client_builds_with_and_without_timeout() {
        let config = SessionConfig::new("http://localhost:8080");
        assert_eq!(config.http_request_timeout, Duration::from_secs(30));
        assert!(config.http_client().is_ok());

        let unbounded = config.with_http_request_timeout(Duration::ZERO);
        assert!(unbounded.http_client().is_ok());
    }
}
