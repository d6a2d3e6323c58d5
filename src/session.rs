//! UI session manager.
//!
//! Holds the hash of the configured UI password and the process-wide
//! session flag:
//!
//! ```text
//! Unauthenticated ──valid password──▶ Authenticated
//!        ▲                                 │
//!        └──── logout / lifetime elapsed ──┘
//! ```
//!
//! A wrong password never moves the state. The session token handed out by
//! `/auth/login` is an HMAC of the password hash under a per-process key and
//! the current session generation, so a logout invalidates every token
//! issued before it.
//!
//! Rate limiting of password attempts is not done here.

use std::time::{Duration, Instant};

use hmac::{Hmac, KeyInit, Mac};
use parking_lot::Mutex;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No valid credential seen since start, logout or expiry.
    Unauthenticated,
    /// A valid credential was seen at `last_validated`.
    Authenticated {
        /// Time of the most recent successful validation.
        last_validated: Instant,
    },
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    generation: u64,
}

/// Password-derived UI session.
pub struct SessionManager {
    password_hash: [u8; 32],
    token_key: [u8; 32],
    lifetime: Option<Duration>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("lifetime", &self.lifetime)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager for `password`. A `lifetime` of `None` means
    /// sessions only end on logout.
    #[must_use]
    pub fn new(password: &str, lifetime: Option<Duration>) -> Self {
        Self {
            password_hash: Sha256::digest(password.as_bytes()).into(),
            token_key: rand::rng().random(),
            lifetime,
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                generation: 0,
            }),
        }
    }

    /// Constant-time check of `password` against the configured hash.
    ///
    /// A match (re)activates the session.
    pub fn validate(&self, password: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        let ok: bool = presented
            .as_slice()
            .ct_eq(self.password_hash.as_slice())
            .into();
        if ok {
            self.touch();
        }
        ok
    }

    /// Session token for the current generation.
    ///
    /// Only meaningful after a successful [`validate`](Self::validate).
    #[must_use]
    pub fn issue_token(&self) -> String {
        let generation = self.inner.lock().generation;
        hex::encode(self.token_for(generation))
    }

    /// Check a token issued by [`issue_token`](Self::issue_token).
    ///
    /// Tokens are accepted only while the session is active; a successful
    /// check extends the session.
    pub fn validate_token(&self, token: &str) -> bool {
        let Ok(presented) = hex::decode(token.trim()) else {
            return false;
        };
        // Held through the refresh: a concurrent logout stays in effect
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if !self.check_active(&mut inner, now) {
            return false;
        }
        let expected = self.token_for(inner.generation);
        let ok: bool = presented.as_slice().ct_eq(expected.as_slice()).into();
        if ok {
            inner.state = SessionState::Authenticated {
                last_validated: now,
            };
        }
        ok
    }

    /// Whether a credential validated within the configured lifetime.
    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    fn is_active_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        self.check_active(&mut inner, now)
    }

    /// Expire the session in place if its lifetime has elapsed.
    fn check_active(&self, inner: &mut Inner, now: Instant) -> bool {
        match inner.state {
            SessionState::Unauthenticated => false,
            SessionState::Authenticated { last_validated } => {
                let expired = self
                    .lifetime
                    .is_some_and(|lifetime| now.saturating_duration_since(last_validated) >= lifetime);
                if expired {
                    debug!("UI session expired");
                    inner.state = SessionState::Unauthenticated;
                    inner.generation += 1;
                }
                !expired
            }
        }
    }

    /// End the session and invalidate issued tokens.
    pub fn logout(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Authenticated { .. }) {
            info!("UI session logged out");
        }
        inner.state = SessionState::Unauthenticated;
        inner.generation += 1;
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn touch(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Unauthenticated) {
            info!("UI session authenticated");
        }
        inner.state = SessionState::Authenticated {
            last_validated: Instant::now(),
        };
    }

    fn token_for(&self, generation: u64) -> [u8; 32] {
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.token_key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(&self.password_hash);
        mac.update(&generation.to_be_bytes());
        mac.finalize().into_bytes().into()
    }
}
