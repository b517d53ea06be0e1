//! Purpose: Hold client-wide tunnel settings and their DSN text form.
//! Exports: `TunnelConfig`, `DEFAULT_CHUNK_SIZE`, `DEFAULT_REPLAY_LIMIT`.
//! Role: Single source of defaults for transports, sessions, and block writers.
//! Invariants: DSNs never carry credentials; unknown DSN parameters survive a round trip.
//! Invariants: Timeouts in DSNs are whole seconds; zero means unset.
#![allow(clippy::result_large_err)]

use std::time::Duration;

use url::Url;

use crate::api::retry::RetryPolicy;
use crate::core::compress::Compression;
use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_REPLAY_LIMIT: usize = 8 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub endpoint: Url,
    pub project: Option<String>,
    pub quota_name: Option<String>,
    pub connect_timeout: Duration,
    pub http_timeout: Option<Duration>,
    pub compression: Compression,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
    pub replay_limit: usize,
    pub extra: Vec<(String, String)>,
}

impl TunnelConfig {
    pub fn new(endpoint: &str) -> Result<Self, Error> {
        let endpoint = Url::parse(endpoint).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid tunnel endpoint {endpoint:?}"))
                .with_source(err)
        })?;
        Ok(Self {
            endpoint,
            project: None,
            quota_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            http_timeout: None,
            compression: Compression::None,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            extra: Vec::new(),
        })
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_quota_name(mut self, quota: impl Into<String>) -> Self {
        self.quota_name = Some(quota.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Zero disables replay; a failed stream then fails its block.
    pub fn with_replay_limit(mut self, bytes: usize) -> Self {
        self.replay_limit = bytes;
        self
    }

    pub fn from_dsn(dsn: &str) -> Result<Self, Error> {
        let mut url = Url::parse(dsn).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid tunnel dsn")
                .with_source(err)
        })?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("tunnel dsn must not embed credentials"));
        }
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);
        url.set_fragment(None);

        let mut config = TunnelConfig::new(url.as_str())?;
        for (key, value) in pairs {
            match key.as_str() {
                "project" => config.project = non_empty(value),
                "tunnelQuotaName" => config.quota_name = non_empty(value),
                "httpTimeout" => config.http_timeout = parse_seconds(&key, &value)?,
                "tcpConnectionTimeout" => {
                    if let Some(timeout) = parse_seconds(&key, &value)? {
                        config.connect_timeout = timeout;
                    }
                }
                "compression" => config.compression = value.parse()?,
                _ => config.extra.push((key, value)),
            }
        }
        Ok(config)
    }

    pub fn to_dsn(&self) -> String {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            if let Some(project) = &self.project {
                query.append_pair("project", project);
            }
            if let Some(quota) = &self.quota_name {
                query.append_pair("tunnelQuotaName", quota);
            }
            if let Some(timeout) = self.http_timeout {
                query.append_pair("httpTimeout", &timeout.as_secs().to_string());
            }
            query.append_pair(
                "tcpConnectionTimeout",
                &self.connect_timeout.as_secs().to_string(),
            );
            if self.compression != Compression::None {
                query.append_pair("compression", self.compression.name());
            }
            for (key, value) in &self.extra {
                query.append_pair(key, value);
            }
        }
        url.to_string()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn parse_seconds(key: &str, value: &str) -> Result<Option<Duration>, Error> {
    let seconds: u64 = value.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{key} must be whole seconds, got {value:?}"))
            .with_source(err)
    })?;
    Ok((seconds > 0).then(|| Duration::from_secs(seconds)))
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, TunnelConfig};
    use crate::core::compress::Compression;
    use crate::core::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn defaults_are_sane() {
        let config = TunnelConfig::new("http://127.0.0.1:8080/tunnel").expect("config");
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.http_timeout, None);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.compression, Compression::None);
    }

    #[test]
    fn dsn_round_trip() {
        let dsn = "http://tunnel.example.com/api?project=sales&tunnelQuotaName=q1\
                   &httpTimeout=15&tcpConnectionTimeout=5&compression=zstd&region=east";
        let config = TunnelConfig::from_dsn(dsn).expect("dsn");
        assert_eq!(config.endpoint.as_str(), "http://tunnel.example.com/api");
        assert_eq!(config.project.as_deref(), Some("sales"));
        assert_eq!(config.quota_name.as_deref(), Some("q1"));
        assert_eq!(config.http_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.compression, Compression::zstd());
        assert_eq!(config.extra, vec![("region".to_string(), "east".to_string())]);

        let again = TunnelConfig::from_dsn(&config.to_dsn()).expect("reparse");
        assert_eq!(again.project, config.project);
        assert_eq!(again.quota_name, config.quota_name);
        assert_eq!(again.http_timeout, config.http_timeout);
        assert_eq!(again.compression, config.compression);
        assert_eq!(again.extra, config.extra);
    }

    #[test]
    fn dsn_rejects_bad_values() {
        let err = TunnelConfig::from_dsn("http://h/?httpTimeout=soon").expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = TunnelConfig::from_dsn("http://h/?compression=lz4").expect_err("codec");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = TunnelConfig::from_dsn("http://user:pw@h/").expect_err("credentials");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
