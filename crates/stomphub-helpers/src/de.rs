use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Accepts either a bare number of milliseconds or a humantime string
/// (`"1s"`, `"250ms"`); empty or absent values deserialize to `None`.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(RawDuration::Text(value)) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }
            humantime::parse_duration(value)
                .map(Some)
                .map_err(D::Error::custom)
        }
    }
}
