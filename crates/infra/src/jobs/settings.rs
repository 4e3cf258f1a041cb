//! Operator-tunable queue settings, persisted in the store's `config` table.

use core::str::FromStr;

use queuectl_core::{DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES, DomainError, RetryPolicy};

use super::store::{JobStore, JobStoreError};

/// Known setting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// Retry ceiling for jobs enqueued without an explicit `max_retries`.
    MaxRetries,
    /// Base of the exponential backoff (`base ^ attempts` seconds).
    BackoffBase,
}

impl SettingKey {
    pub const ALL: [SettingKey; 2] = [SettingKey::MaxRetries, SettingKey::BackoffBase];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::MaxRetries => "max-retries",
            SettingKey::BackoffBase => "backoff-base",
        }
    }

    pub fn default_value(&self) -> u32 {
        match self {
            SettingKey::MaxRetries => DEFAULT_MAX_RETRIES,
            SettingKey::BackoffBase => DEFAULT_BACKOFF_BASE,
        }
    }

    /// Validate a raw value for this key and return its canonical form.
    pub fn parse_value(&self, raw: &str) -> Result<u32, DomainError> {
        let value: u32 = raw.trim().parse().map_err(|_| {
            DomainError::validation(format!(
                "{} must be a non-negative integer, got '{raw}'",
                self.as_str()
            ))
        })?;
        if *self == SettingKey::BackoffBase {
            RetryPolicy::new(value)?;
        }
        Ok(value)
    }
}

impl core::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('_', "-").as_str() {
            "max-retries" => Ok(SettingKey::MaxRetries),
            "backoff-base" => Ok(SettingKey::BackoffBase),
            other => Err(DomainError::validation(format!(
                "unknown config key '{other}' (expected max-retries or backoff-base)"
            ))),
        }
    }
}

/// Effective queue settings: persisted values over built-in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub backoff_base: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl QueueSettings {
    /// Load settings from the store, falling back to defaults for unset keys.
    pub async fn load<S: JobStore + ?Sized>(store: &S) -> Result<Self, JobStoreError> {
        Ok(Self {
            max_retries: load_one(store, SettingKey::MaxRetries).await?,
            backoff_base: load_one(store, SettingKey::BackoffBase).await?,
        })
    }

    /// Validate and persist one setting.
    pub async fn set<S: JobStore + ?Sized>(
        store: &S,
        key: SettingKey,
        raw: &str,
    ) -> Result<u32, JobStoreError> {
        let value = key.parse_value(raw)?;
        store.set_setting(key, &value.to_string()).await?;
        Ok(value)
    }

    pub fn get(&self, key: SettingKey) -> u32 {
        match key {
            SettingKey::MaxRetries => self.max_retries,
            SettingKey::BackoffBase => self.backoff_base,
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, DomainError> {
        RetryPolicy::new(self.backoff_base)
    }
}

async fn load_one<S: JobStore + ?Sized>(store: &S, key: SettingKey) -> Result<u32, JobStoreError> {
    match store.get_setting(key).await? {
        Some(raw) => key
            .parse_value(&raw)
            .map_err(|e| JobStoreError::Corrupt(format!("config '{key}': {e}"))),
        None => Ok(key.default_value()),
    }
}
