//! Opaque authentication context.
//!
//! Cookie file parsing belongs to the surrounding application; this module
//! only consumes the already-parsed material and installs it into the HTTP
//! client as a cookie jar.

use std::sync::Arc;

use reqwest::cookie::Jar;
use url::Url;

/// One pre-parsed cookie.
#[derive(Debug, Clone)]
pub struct AuthCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Defaults to `/` when absent.
    pub path: Option<String>,
}

impl AuthCookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: None,
        }
    }
}

/// Pre-parsed cookie-jar structure handed over by the caller.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    cookies: Vec<AuthCookie>,
}

impl AuthContext {
    pub fn new(cookies: Vec<AuthCookie>) -> Self {
        Self { cookies }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Materialize the cookies into a jar usable as a reqwest cookie provider.
    ///
    /// Cookies whose domain does not form a valid URL are skipped with a
    /// warning rather than failing client construction.
    pub(crate) fn to_jar(&self) -> Arc<Jar> {
        let jar = Jar::default();
        for cookie in &self.cookies {
            let origin = format!("https://{}", cookie.domain.trim_start_matches('.'));
            let Ok(url) = Url::parse(&origin) else {
                tracing::warn!(domain = %cookie.domain, name = %cookie.name, "Skipping cookie with unusable domain");
                continue;
            };
            let path = cookie.path.as_deref().unwrap_or("/");
            let header = format!(
                "{}={}; Domain={}; Path={}",
                cookie.name, cookie.value, cookie.domain, path
            );
            jar.add_cookie_str(&header, &url);
        }
        Arc::new(jar)
    }
}
