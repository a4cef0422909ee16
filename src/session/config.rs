//! Session configuration.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

/// Default session expiry (24 hours).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pluggable session identifier generator.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// How the session identifier travels between client and server.
#[derive(Debug, Clone)]
pub enum Carrier {
    /// A cookie with the given name and attributes.
    Cookie {
        name: String,
        options: CookieOptions,
    },
    /// A request/response header with the given name.
    Header { name: String },
}

impl Carrier {
    pub fn name(&self) -> &str {
        match self {
            Carrier::Cookie { name, .. } | Carrier::Header { name } => name,
        }
    }
}

/// Attributes applied to the session cookie.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    pub domain: Option<String>,
    pub path: String,
    pub same_site: SameSite,
    pub secure: bool,
    pub http_only: bool,
    /// Max-Age override in seconds; defaults to the session TTL.
    pub max_age: Option<u64>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            domain: None,
            path: "/".to_string(),
            same_site: SameSite::Strict,
            secure: true,
            http_only: true,
            max_age: None,
        }
    }
}

/// Cookie SameSite policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Session behavior knobs with explicit defaults.
#[derive(Clone)]
pub struct SessionConfig {
    /// TTL written for freshly created sessions.
    pub ttl: Duration,
    /// Identifier carrier; defaults to a `session` cookie.
    pub carrier: Carrier,
    /// Identifier generator; defaults to random UUIDs.
    pub generator: IdGenerator,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            carrier: Carrier::Cookie {
                name: "session".to_string(),
                options: CookieOptions::default(),
            },
            generator: Arc::new(|| Uuid::new_v4().to_string()),
        }
    }
}

impl SessionConfig {
    /// Cookie-carried sessions with default attributes.
    pub fn cookie(name: impl Into<String>) -> Self {
        Self {
            carrier: Carrier::Cookie {
                name: name.into(),
                options: CookieOptions::default(),
            },
            ..Self::default()
        }
    }

    /// Header-carried sessions.
    pub fn header(name: impl Into<String>) -> Self {
        Self {
            carrier: Carrier::Header { name: name.into() },
            ..Self::default()
        }
    }

    /// Set the fresh-session TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.ttl = ttl;
        }
        self
    }

    /// Set the cookie attributes; no-op for header carriers.
    #[must_use]
    pub fn with_cookie_options(mut self, options: CookieOptions) -> Self {
        if let Carrier::Cookie {
            options: existing, ..
        } = &mut self.carrier
        {
            *existing = options;
        }
        self
    }

    /// Replace the identifier generator.
    #[must_use]
    pub fn with_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.generator = Arc::new(generator);
        self
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("ttl", &self.ttl)
            .field("carrier", &self.carrier)
            .finish()
    }
}
