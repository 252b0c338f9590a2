use std::{env, str::FromStr};

use crate::{error::SyncError, rwlock::RwLockBackendKind};

pub const RWLOCK_BACKEND_VAR: &str = "SYNC_EXECUTIVE_RWLOCK_BACKEND";
pub const TRACE_WAITS_VAR: &str = "SYNC_EXECUTIVE_TRACE_WAITS";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutiveConfig {
    /// Backend of the read-write locks made by [super::Executive::create_read_write_lock].
    pub rwlock_backend: RwLockBackendKind,
    /// Emit a `trace!` event for every contended wait.
    pub trace_waits: bool,
}

impl ExecutiveConfig {
    /// Defaults, overridden by whatever is set in the environment.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    // split out so tests don't have to touch the process environment
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let mut config = Self::default();
        if let Some(backend) = lookup(RWLOCK_BACKEND_VAR) {
            config.rwlock_backend = RwLockBackendKind::from_str(backend.trim()).map_err(|_| {
                SyncError::InvalidConfig(format!("{RWLOCK_BACKEND_VAR}: unknown backend `{backend}'"))
            })?;
        }
        if let Some(trace) = lookup(TRACE_WAITS_VAR) {
            config.trace_waits = match trace.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(SyncError::InvalidConfig(format!(
                        "{TRACE_WAITS_VAR}: expected a boolean, got `{other}'"
                    )))
                }
            };
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_lookup() {
        let config = ExecutiveConfig::from_lookup(|name| match name {
            RWLOCK_BACKEND_VAR => Some("native".into()),
            TRACE_WAITS_VAR => Some("1".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.rwlock_backend, RwLockBackendKind::Native);
        assert!(config.trace_waits);

        assert_eq!(
            ExecutiveConfig::from_lookup(|_| None).unwrap(),
            ExecutiveConfig::default()
        );
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let err = ExecutiveConfig::from_lookup(|name| {
            (name == RWLOCK_BACKEND_VAR).then(|| "srwlock".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));

        let err =
            ExecutiveConfig::from_lookup(|name| (name == TRACE_WAITS_VAR).then(|| "maybe".to_string()))
                .unwrap_err();
        assert!(err.to_string().contains("maybe"));
    }
}
