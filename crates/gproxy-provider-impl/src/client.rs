use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `http://`, `https://` or `socks5://` proxy for every upstream call.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request timeout; `None` leaves long streams alone.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }
}

/// Builds the process-wide upstream client. Called once at startup.
pub fn build_client(options: &ClientOptions) -> Result<wreq::Client, wreq::Error> {
    let mut builder = wreq::Client::builder().connect_timeout(options.connect_timeout);
    if let Some(timeout) = options.request_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(proxy) = options
        .proxy
        .as_deref()
        .map(str::trim)
        .filter(|proxy| !proxy.is_empty())
    {
        builder = builder.proxy(wreq::Proxy::all(proxy)?);
    }
    builder.build()
}
