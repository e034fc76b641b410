use chrono::{DateTime, SubsecRound, Utc};

/// Current time at the precision Postgres stores, so values read back compare equal.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
