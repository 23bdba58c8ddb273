/// Rotating egress address pool
///
/// Spreads outbound requests over a fixed set of proxy identities. Identities
/// that fail are parked in a soft failure set until the whole pool has failed,
/// at which point the set is cleared and a random identity is picked so that
/// the same dead proxy is not always hammered first.
use crate::config::ProxyConfig;
use crate::error::{IngestError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default interval after which `current()` rotates even without failures
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

/// Connection parameters of one proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One egress network identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressIdentity {
    /// Position in the pool, 0-based
    pub index: usize,
    /// `None` means requests go out directly
    pub endpoint: Option<ProxyEndpoint>,
}

impl AddressIdentity {
    pub fn direct(index: usize) -> Self {
        Self { index, endpoint: None }
    }

    pub fn is_direct(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Proxy URL suitable for reqwest and yt-dlp, credentials included
    pub fn proxy_url(&self) -> Option<String> {
        let endpoint = self.endpoint.as_ref()?;
        let auth = match (&endpoint.username, &endpoint.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            _ => String::new(),
        };
        Some(format!("http://{}{}:{}", auth, endpoint.host, endpoint.port))
    }
}

impl fmt::Display for AddressIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            None => write!(f, "direct#{}", self.index),
            Some(ep) => match &ep.username {
                Some(user) => write!(f, "{}@{}:{}", user, ep.host, ep.port),
                None => write!(f, "{}:{}", ep.host, ep.port),
            },
        }
    }
}

/// Explicit state of the rotation machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// At least one identity is usable; the index is the current one
    Healthy(usize),
    /// Every identity has failed since the last reset
    AllFailed { last: usize },
}

impl PoolPhase {
    fn index(&self) -> usize {
        match *self {
            PoolPhase::Healthy(index) => index,
            PoolPhase::AllFailed { last } => last,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    phase: PoolPhase,
    failed_set: BTreeSet<usize>,
    last_rotation: Instant,
}

/// Diagnostic snapshot of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub current_index: usize,
    pub current_identity: String,
    pub failed_indices: Vec<usize>,
    pub pool_size: usize,
    pub all_failed: bool,
    pub rotation_interval_secs: u64,
    pub seconds_since_rotation: f64,
}

/// Thread-safe pool of egress identities
#[derive(Debug)]
pub struct AddressPool {
    identities: Vec<AddressIdentity>,
    rotation_interval: Duration,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create a pool over explicit identities. An empty pool is a fatal configuration error.
    pub fn new(identities: Vec<AddressIdentity>, rotation_interval: Duration) -> Result<Self> {
        if identities.is_empty() {
            return Err(IngestError::config("address pool must contain at least one identity"));
        }

        // Identities are addressed by position
        let identities = identities
            .into_iter()
            .enumerate()
            .map(|(index, identity)| AddressIdentity { index, ..identity })
            .collect();

        Ok(Self {
            identities,
            rotation_interval,
            state: Mutex::new(PoolState {
                phase: PoolPhase::Healthy(0),
                failed_set: BTreeSet::new(),
                last_rotation: Instant::now(),
            }),
        })
    }

    /// Single identity that does not use a proxy
    pub fn direct() -> Self {
        Self {
            identities: vec![AddressIdentity::direct(0)],
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            state: Mutex::new(PoolState {
                phase: PoolPhase::Healthy(0),
                failed_set: BTreeSet::new(),
                last_rotation: Instant::now(),
            }),
        }
    }

    /// Rotating proxy service: identity `i` authenticates as `<username>-<i+1>`
    pub fn rotating(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        size: usize,
        rotation_interval: Duration,
    ) -> Result<Self> {
        if size == 0 {
            return Err(IngestError::config("proxy pool_size must be greater than 0"));
        }

        let identities = (0..size)
            .map(|index| AddressIdentity {
                index,
                endpoint: Some(ProxyEndpoint {
                    host: host.to_string(),
                    port,
                    username: Some(format!("{}-{}", username, index + 1)),
                    password: Some(password.to_string()),
                }),
            })
            .collect();

        Self::new(identities, rotation_interval)
    }

    /// Build the pool described by the proxy section of the configuration
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let interval = Duration::from_secs(config.rotation_interval_secs);

        if config.pool_size == 0 {
            return Err(IngestError::config("proxy pool_size must be greater than 0"));
        }

        if let (Some(host), Some(username), Some(password)) =
            (&config.host, &config.username, &config.password)
        {
            let pool = Self::rotating(host, config.port, username, password, config.pool_size, interval)?;
            info!("🌐 Rotating proxy pool: {} identities via {}:{}", pool.size(), host, config.port);
            return Ok(pool);
        }

        if let Some(legacy) = &config.legacy_proxy {
            let (host, port) = parse_host_port(legacy)?;
            info!("🌐 Using single legacy proxy {}:{}", host, port);
            return Self::new(
                vec![AddressIdentity {
                    index: 0,
                    endpoint: Some(ProxyEndpoint { host, port, username: None, password: None }),
                }],
                interval,
            );
        }

        warn!("🔴 No proxy configured, requests go out directly");
        Ok(Self::direct())
    }

    pub fn size(&self) -> usize {
        self.identities.len()
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    pub fn identities(&self) -> &[AddressIdentity] {
        &self.identities
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock cannot leave the state half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identity to use for the next request.
    ///
    /// Rotates implicitly when the current identity has been marked failed,
    /// when the whole pool has failed, or when the rotation interval elapsed.
    pub fn current(&self) -> AddressIdentity {
        let mut state = self.lock();

        let needs_rotation = match state.phase {
            PoolPhase::AllFailed { .. } => true,
            PoolPhase::Healthy(index) => {
                if state.failed_set.contains(&index) {
                    true
                } else if state.last_rotation.elapsed() > self.rotation_interval {
                    debug!("⏱️ Rotation interval elapsed, rotating proactively");
                    true
                } else {
                    false
                }
            }
        };

        let index = if needs_rotation {
            self.rotate_locked(&mut state)
        } else {
            state.phase.index()
        };

        self.identities[index].clone()
    }

    /// Advance to the next identity not in the failure set
    pub fn rotate(&self) -> AddressIdentity {
        let mut state = self.lock();
        let index = self.rotate_locked(&mut state);
        self.identities[index].clone()
    }

    fn rotate_locked(&self, state: &mut PoolState) -> usize {
        let size = self.identities.len();

        let next = match state.phase {
            PoolPhase::AllFailed { .. } => {
                warn!("⚠️ All {} identities failed, resetting failure set", size);
                state.failed_set.clear();
                let pick = rand::thread_rng().gen_range(0..size);
                info!("🔄 Reset to random identity {}", self.identities[pick]);
                pick
            }
            PoolPhase::Healthy(current) => {
                // Stepping `size` times wraps back to `current` if it is the only survivor
                let next = (1..=size)
                    .map(|step| (current + step) % size)
                    .find(|candidate| !state.failed_set.contains(candidate))
                    .unwrap_or(current);
                debug!("🔄 Rotated to identity {}", self.identities[next]);
                next
            }
        };

        state.phase = PoolPhase::Healthy(next);
        state.last_rotation = Instant::now();
        next
    }

    /// Put an identity into the failure set for the current cycle
    pub fn mark_failed(&self, identity: &AddressIdentity) {
        let size = self.identities.len();
        if identity.index >= size {
            warn!("Ignoring failure report for unknown identity index {}", identity.index);
            return;
        }

        let mut state = self.lock();
        state.failed_set.insert(identity.index);
        debug!("🔴 Marked identity {} as failed ({}/{})", identity, state.failed_set.len(), size);

        if state.failed_set.len() >= size {
            let last = state.phase.index();
            state.phase = PoolPhase::AllFailed { last };
        }
    }

    pub fn elapsed_since_last_rotation(&self) -> Duration {
        self.lock().last_rotation.elapsed()
    }

    pub fn phase(&self) -> PoolPhase {
        self.lock().phase
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.lock().failed_set.iter().copied().collect()
    }

    /// Clear failures and go back to the first identity
    pub fn reset(&self) {
        let mut state = self.lock();
        state.failed_set.clear();
        state.phase = PoolPhase::Healthy(0);
        state.last_rotation = Instant::now();
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        let index = state.phase.index();
        PoolStatus {
            current_index: index,
            current_identity: self.identities[index].to_string(),
            failed_indices: state.failed_set.iter().copied().collect(),
            pool_size: self.identities.len(),
            all_failed: matches!(state.phase, PoolPhase::AllFailed { .. }),
            rotation_interval_secs: self.rotation_interval.as_secs(),
            seconds_since_rotation: state.last_rotation.elapsed().as_secs_f64(),
        }
    }

    #[cfg(test)]
    fn backdate_rotation(&self, by: Duration) {
        let mut state = self.lock();
        if let Some(earlier) = Instant::now().checked_sub(by) {
            state.last_rotation = earlier;
        }
    }
}

fn parse_host_port(value: &str) -> Result<(String, u16)> {
    let trimmed = value
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let (host, port) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| IngestError::config(format!("proxy '{}' must be host:port", value)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| IngestError::config(format!("invalid proxy port in '{}'", value)))?;
    Ok((host.to_string(), port))
}
