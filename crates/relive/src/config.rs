use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::auth::AuthContext;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by the locator, the rewind probes and the
/// segment fetcher. One client is built per session and reused everywhere.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// Per-request timeout applied to every segment fetch and probe so a
    /// single stalled request cannot stall the whole session.
    pub request_timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Custom headers merged over the defaults.
    pub headers: HeaderMap,

    /// Maximum idle connections to keep per host. Segment fetches hit one
    /// CDN host repeatedly, so connection reuse matters.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing.
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::default_headers(),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers
    }

    /// Build the session client, installing the auth context's cookie jar
    /// when one is supplied.
    pub fn build_client(&self, auth: Option<&AuthContext>) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(self.headers.clone())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout);

        if let Some(auth) = auth
            && !auth.is_empty()
        {
            builder = builder.cookie_provider(auth.to_jar());
        }

        builder.build()
    }
}

/// Capture-session options. Everything a caller can tune lives here; the
/// per-component structs below keep each concern separable in tests.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Bounded worker pool size for concurrent segment fetches.
    pub max_concurrency: usize,

    /// How far behind the live edge the rewind resolver may search,
    /// expressed as wall-clock time and converted to a segment count using
    /// the per-segment duration.
    pub rewind_window: Duration,

    /// Explicit start sequence. When supplied and retrievable it overrides
    /// rewind probing entirely.
    pub start_sequence: Option<u64>,

    /// Overrides the per-segment duration reported by the locator. Used
    /// when the broadcast metadata is known to be unreliable.
    pub segment_duration_override: Option<Duration>,

    /// Total fetch attempts per segment (first try included) before the
    /// segment is recorded as Missing.
    pub max_attempts: u32,

    /// Backoff schedule between attempts.
    pub retry: RetryPolicy,

    /// Consecutive not-found results at the live edge required before the
    /// broadcast is declared ended.
    pub edge_miss_threshold: u32,

    /// Name of the merged output artifact inside the output directory.
    pub output_file_name: String,

    /// Remove the per-segment files after a successful merge.
    pub remove_segments_after_merge: bool,

    /// Allowed deviation between the merged artifact's reported duration
    /// and segment count x per-segment duration.
    pub duration_tolerance: Duration,

    pub http: HttpConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            rewind_window: Duration::from_secs(4 * 3600),
            start_sequence: None,
            segment_duration_override: None,
            max_attempts: 5,
            retry: RetryPolicy::default(),
            edge_miss_threshold: 5,
            output_file_name: "recording.ts".to_owned(),
            remove_segments_after_merge: false,
            duration_tolerance: Duration::from_secs(10),
            http: HttpConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Convert the time-based rewind window into a segment count.
    pub fn rewind_window_segments(&self, segment_duration: Duration) -> u64 {
        let per_segment = segment_duration.as_secs_f64();
        if per_segment <= 0.0 {
            return 0;
        }
        (self.rewind_window.as_secs_f64() / per_segment).ceil() as u64
    }
}
