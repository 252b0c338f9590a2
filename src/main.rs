use std::env::args;
use std::str::FromStr;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use sync_executive::{Executive, ExecutiveConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let executive = Executive::new(ExecutiveConfig::from_env().map_err(|e| e.to_string())?);
    args()
        .nth(1)
        .ok_or(format!(
            "no demo supplied, use one of {} or see unit tests",
            Demo::iter()
                .map(|d| d.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| Demo::from_str(&selector).map_err(|e| e.to_string()))
        .and_then(|demo| {
            let result = match demo {
                Demo::SpinLock => {
                    sync_executive::spin_lock::run(&executive);
                    Ok(())
                }
                Demo::ReadWriteLock => {
                    sync_executive::rwlock::run(&executive);
                    Ok(())
                }
                Demo::Reentrant => sync_executive::reentrant::run(&executive),
                Demo::ConditionVariable => sync_executive::condvar::run(&executive),
                Demo::Barrier => sync_executive::barrier::run(&executive),
                Demo::Layouts => {
                    sync_executive::executive::run(&executive);
                    Ok(())
                }
            };
            result.map_err(|e| e.to_string())
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Demo {
    SpinLock,
    ReadWriteLock,
    Reentrant,
    ConditionVariable,
    Barrier,
    Layouts,
}
