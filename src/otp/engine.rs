//! OTP issuance, verification and cooldown enforcement.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::code::{constant_time_eq, generate_code, is_well_formed};
use super::error::{CooldownReason, OtpError};
use super::record::{CooldownRecord, OtpKey, OtpRecord};
use crate::clock::{Clock, SystemClock};
use crate::config::OtpConfig;
use crate::error::{Result, WardenError};
use crate::observability::Metrics;
use crate::ratelimit::BackoffPolicy;
use crate::store::{AtomicStore, StoreError, StoreResult, Swap};

/// Retry hint used when the issuance guard exists but its TTL is unreadable.
const DEFAULT_GUARD_RETRY: Duration = Duration::from_secs(60);

/// Rounds a verification may re-read the record after losing a
/// compare-and-swap to a concurrent caller.
const MAX_SWAP_ROUNDS: usize = 8;

/// A freshly issued code, handed to the caller for delivery.
#[derive(Clone)]
pub struct IssuedOtp {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// How long a repeat request will be refused.
    pub resend_after: Duration,
}

impl std::fmt::Debug for IssuedOtp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedOtp")
            .field("code", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("resend_after", &self.resend_after)
            .finish()
    }
}

/// A successful verification. Nothing about the code is echoed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub email: String,
    pub identifier: String,
    pub verified_at: DateTime<Utc>,
}

/// Issues and verifies one-time codes against the shared store.
///
/// Store failures surface as [`OtpError::Internal`]: verification is never
/// granted or silently skipped when the store cannot be consulted.
pub struct OtpEngine {
    store: Arc<dyn AtomicStore>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    code_length: usize,
    validity: Duration,
    max_attempts: u32,
    verified_grace: Duration,
    generation_window: Duration,
    cooldown_retention: Duration,
    backoff: BackoffPolicy,
    timeout: Duration,
}

fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

fn round_up_secs(d: Duration) -> Duration {
    if d.subsec_nanos() == 0 {
        d
    } else {
        Duration::from_secs(d.as_secs() + 1)
    }
}

impl OtpEngine {
    /// Create an engine driven by the system clock.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        metrics: Arc<Metrics>,
        config: &OtpConfig,
        timeout: Duration,
    ) -> Result<Self> {
        Self::with_clock(store, metrics, config, timeout, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock.
    pub fn with_clock(
        store: Arc<dyn AtomicStore>,
        metrics: Arc<Metrics>,
        config: &OtpConfig,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.code_length == 0 {
            return Err(WardenError::Config("OTP code length must be positive".into()));
        }
        if config.max_attempts == 0 {
            return Err(WardenError::Config("OTP max attempts must be positive".into()));
        }

        Ok(Self {
            store,
            metrics,
            clock,
            code_length: config.code_length,
            validity: config.validity(),
            max_attempts: config.max_attempts,
            verified_grace: config.verified_grace(),
            generation_window: config.generation_window(),
            cooldown_retention: config.cooldown_retention(),
            backoff: config.backoff(),
            timeout,
        })
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.metrics.track(operation, self.timeout, call).await
    }

    /// Store TTL of a record expiring at `expires_at`.
    ///
    /// Expired records are kept for one grace window so a late submission
    /// is reported as `Expired` rather than `NotFound`.
    fn record_ttl(&self, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Duration {
        until(now, expires_at) + self.verified_grace
    }

    /// Issue a new code for `email` as seen from `identifier`.
    pub async fn issue(&self, email: &str, identifier: &str) -> std::result::Result<IssuedOtp, OtpError> {
        let key = OtpKey::new(email, identifier)?;
        let now = self.clock.now();
        let guard_key = key.guard_key();

        // Claiming the guard is the only admission point, so concurrent
        // requests for the same key cannot both store a code.
        let claim = format!("{}#{}", now.to_rfc3339(), Uuid::new_v4().simple());
        let claimed = self
            .call(
                "otp_guard_claim",
                self.store
                    .set_if_absent(&guard_key, &claim, self.backoff.initial),
            )
            .await?;

        if !claimed {
            let retry_after = self
                .call("otp_guard_ttl", self.store.ttl(&guard_key))
                .await?
                .filter(|ttl| !ttl.is_zero())
                .map(round_up_secs)
                .unwrap_or(DEFAULT_GUARD_RETRY);
            let otp_expires_in = self.expires_in_at(&key, now).await?;

            // Hammering the endpoint lengthens the next backoff.
            self.bump_generation_count(&key).await?;

            debug!(key = %key, retry_after = ?retry_after, "OTP requested during issuance backoff");
            return Err(OtpError::Cooldown {
                reason: CooldownReason::RecentlyIssued,
                retry_after,
                cooldown_until: add(now, retry_after),
                otp_expires_in: Some(otp_expires_in),
            });
        }

        if let Some(cooldown) = self.load_cooldown(&key).await? {
            if cooldown.is_active(now) {
                // Only our own claim is released.
                self.call(
                    "otp_guard_release",
                    self.store.compare_and_swap(&guard_key, &claim, Swap::Delete),
                )
                .await?;
                debug!(key = %key, until = %cooldown.cooldown_until, "OTP requested during verification cooldown");
                return Err(OtpError::Cooldown {
                    reason: CooldownReason::VerificationFailures,
                    retry_after: round_up_secs(until(now, cooldown.cooldown_until)),
                    cooldown_until: cooldown.cooldown_until,
                    otp_expires_in: None,
                });
            }
        }

        let code = generate_code(self.code_length);
        let expires_at = add(now, self.validity);
        let record = OtpRecord {
            code: code.clone(),
            email: key.email().to_string(),
            identifier: key.identifier().to_string(),
            created_at: now,
            expires_at,
            attempts: 0,
            verified: false,
            last_attempt_at: now,
        };
        let json = serde_json::to_string(&record).map_err(StoreError::from)?;
        self.call(
            "otp_store",
            self.store.set(&key.code_key(), &json, self.record_ttl(now, expires_at)),
        )
        .await?;

        let issued = self.bump_generation_count(&key).await?;
        let resend_after = self.backoff.delay(issued);
        self.call(
            "otp_guard_arm",
            self.store.expire(&guard_key, resend_after),
        )
        .await?;

        info!(
            key = %key,
            expires_at = %expires_at,
            resend_after = ?resend_after,
            issued_this_window = issued,
            "OTP issued"
        );

        Ok(IssuedOtp {
            code,
            created_at: now,
            expires_at,
            resend_after,
        })
    }

    /// Check `submitted` against the live code.
    pub async fn verify(
        &self,
        email: &str,
        identifier: &str,
        submitted: &str,
    ) -> std::result::Result<Verification, OtpError> {
        let key = OtpKey::new(email, identifier)?;
        if !is_well_formed(submitted, self.code_length) {
            return Err(OtpError::Validation(format!(
                "code must be exactly {} digits",
                self.code_length
            )));
        }
        let code_key = key.code_key();

        for _ in 0..MAX_SWAP_ROUNDS {
            let now = self.clock.now();

            let Some(raw) = self.call("otp_load", self.store.get(&code_key)).await? else {
                // The record is deleted when the budget runs out; keep
                // reporting that while the cooldown it started is running.
                if let Some(cooldown) = self.load_cooldown(&key).await? {
                    if cooldown.is_active(now) {
                        return Err(self.attempts_exceeded(&cooldown, now));
                    }
                }
                return Err(OtpError::NotFound);
            };

            let mut record: OtpRecord = serde_json::from_str(&raw).map_err(StoreError::from)?;

            if record.verified {
                return Err(OtpError::AlreadyVerified);
            }

            if now > record.expires_at {
                self.call("otp_delete", self.store.delete(&code_key)).await?;
                debug!(key = %key, "Expired OTP submitted");
                return Err(OtpError::Expired);
            }

            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt_at = now;

            if record.attempts > self.max_attempts {
                if !self.swap(&code_key, &raw, Swap::Delete).await? {
                    continue;
                }
                let cooldown = self
                    .apply_cooldown(&key, record.attempts - self.max_attempts, now)
                    .await?;
                return Err(self.attempts_exceeded(&cooldown, now));
            }

            if !constant_time_eq(record.code.as_bytes(), submitted.as_bytes()) {
                let remaining_attempts = self.max_attempts - record.attempts;

                if remaining_attempts == 0 {
                    if !self.swap(&code_key, &raw, Swap::Delete).await? {
                        continue;
                    }
                    let cooldown = self.apply_cooldown(&key, 1, now).await?;
                    warn!(key = %key, "OTP attempts exhausted");
                    return Err(self.attempts_exceeded(&cooldown, now));
                }

                let updated = serde_json::to_string(&record).map_err(StoreError::from)?;
                let ttl = self.record_ttl(now, record.expires_at);
                if !self
                    .swap(&code_key, &raw, Swap::Set { value: &updated, ttl })
                    .await?
                {
                    continue;
                }

                debug!(key = %key, remaining_attempts, "Invalid OTP submitted");
                return Err(OtpError::Invalid { remaining_attempts });
            }

            record.verified = true;
            let updated = serde_json::to_string(&record).map_err(StoreError::from)?;
            let ttl = self.verified_grace;
            if !self
                .swap(&code_key, &raw, Swap::Set { value: &updated, ttl })
                .await?
            {
                continue;
            }

            // A successful verification forgives earlier failures and
            // issuance throttling.
            self.call("otp_cooldown_clear", self.store.delete(&key.cooldown_key()))
                .await?;
            self.call(
                "otp_generation_reset",
                self.store.delete(&key.generation_count_key()),
            )
            .await?;

            info!(key = %key, attempts = record.attempts, "OTP verified");
            return Ok(Verification {
                email: key.email().to_string(),
                identifier: key.identifier().to_string(),
                verified_at: now,
            });
        }

        warn!(key = %key, "OTP verification lost every compare-and-swap round");
        Err(OtpError::Internal(StoreError::Conflict { key: code_key }))
    }

    /// The running verification cooldown, if any. A finished one is removed.
    pub async fn check_cooldown(
        &self,
        email: &str,
        identifier: &str,
    ) -> std::result::Result<Option<CooldownRecord>, OtpError> {
        let key = OtpKey::new(email, identifier)?;
        let now = self.clock.now();

        match self.load_cooldown(&key).await? {
            Some(cooldown) if cooldown.is_active(now) => Ok(Some(cooldown)),
            Some(_) => {
                self.call("otp_cooldown_clear", self.store.delete(&key.cooldown_key()))
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Drop the live code, e.g. after the flow completed another way.
    pub async fn invalidate(&self, email: &str, identifier: &str) -> std::result::Result<(), OtpError> {
        let key = OtpKey::new(email, identifier)?;
        self.call("otp_delete", self.store.delete(&key.code_key())).await?;
        debug!(key = %key, "OTP invalidated");
        Ok(())
    }

    /// Remaining validity of the live code; zero when there is none.
    pub async fn otp_expires_in(
        &self,
        email: &str,
        identifier: &str,
    ) -> std::result::Result<Duration, OtpError> {
        let key = OtpKey::new(email, identifier)?;
        Ok(self.expires_in_at(&key, self.clock.now()).await?)
    }

    async fn expires_in_at(&self, key: &OtpKey, now: DateTime<Utc>) -> StoreResult<Duration> {
        let Some(raw) = self.call("otp_load", self.store.get(&key.code_key())).await? else {
            return Ok(Duration::ZERO);
        };
        let record: OtpRecord = serde_json::from_str(&raw)?;
        Ok(Duration::from_secs(until(now, record.expires_at).as_secs()))
    }

    async fn load_cooldown(&self, key: &OtpKey) -> StoreResult<Option<CooldownRecord>> {
        let raw = self
            .call("otp_cooldown_load", self.store.get(&key.cooldown_key()))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Count one more issuance request in the rolling window.
    async fn bump_generation_count(&self, key: &OtpKey) -> StoreResult<u32> {
        let count_key = key.generation_count_key();
        let count = self.call("otp_generation_incr", self.store.incr(&count_key)).await?;
        self.call(
            "otp_generation_expire",
            self.store.expire(&count_key, self.generation_window),
        )
        .await?;
        Ok(u32::try_from(count.max(1)).unwrap_or(u32::MAX))
    }

    /// Start or extend the verification cooldown.
    ///
    /// Failures accumulate on top of a retained record, so the delay keeps
    /// doubling while failures are consecutive; `cooldown_until` never moves
    /// backwards.
    async fn apply_cooldown(
        &self,
        key: &OtpKey,
        failures: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<CooldownRecord> {
        let previous = self.load_cooldown(key).await?;
        let failed_attempts = previous
            .as_ref()
            .map_or(0, |p| p.failed_attempts)
            .saturating_add(failures);

        let delay = self.backoff.delay(failed_attempts);
        let mut cooldown_until = add(now, delay);
        if let Some(previous) = &previous {
            cooldown_until = cooldown_until.max(previous.cooldown_until);
        }

        let cooldown = CooldownRecord {
            failed_attempts,
            cooldown_until,
            last_failed_at: now,
        };
        let json = serde_json::to_string(&cooldown)?;
        let ttl = until(now, cooldown_until) + self.cooldown_retention;
        self.call("otp_cooldown_set", self.store.set(&key.cooldown_key(), &json, ttl))
            .await?;

        warn!(
            key = %key,
            failed_attempts,
            cooldown = ?delay,
            until = %cooldown_until,
            "OTP verification cooldown applied"
        );
        Ok(cooldown)
    }

    fn attempts_exceeded(&self, cooldown: &CooldownRecord, now: DateTime<Utc>) -> OtpError {
        OtpError::AttemptsExceeded {
            retry_after: round_up_secs(until(now, cooldown.cooldown_until)),
            cooldown_until: cooldown.cooldown_until,
        }
    }

    async fn swap(&self, key: &str, expected: &str, replacement: Swap<'_>) -> StoreResult<bool> {
        let swapped = self
            .call(
                "otp_swap",
                self.store.compare_and_swap(key, expected, replacement),
            )
            .await?;
        if !swapped {
            debug!(key = %key, "OTP record changed concurrently, re-reading");
        }
        Ok(swapped)
    }
}
