// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use std::error::Error;
use tracing::error;

use crate::error::ConfigError;

/// Builds the client shared by every delivery worker and the blob uploader.
/// An invalid proxy falls back to a direct connection rather than failing startup.
#[must_use]
pub fn get_client(proxy_url: Option<&str>, timeout: Duration) -> reqwest::Client {
    match build_client(proxy_url, timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            build_client(None, timeout).unwrap_or_else(|inner| {
                error!(
                    "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                    inner
                );
                reqwest::Client::new()
            })
        }
    }
}

pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Appends `token` and `type` query parameters to the listener URL.
pub fn listener_url(
    endpoint_url: &str,
    token: &str,
    log_type: &str,
) -> Result<reqwest::Url, ConfigError> {
    let mut url = reqwest::Url::parse(endpoint_url).map_err(|_| ConfigError::InvalidValue {
        key: "LOGZIO_ENDPOINT_URL",
        value: endpoint_url.to_string(),
    })?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("type", log_type);
    Ok(url)
}
