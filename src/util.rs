pub(crate) mod serde_helper {
    /// Human readable durations (`"30s"`, `"10m"`) in configuration files.
    pub(crate) mod duration {
        use crate::time::parse_duration;
        use serde::de::Error;
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = String::deserialize(deserializer)?;
            parse_duration(&raw).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::serde_helper::duration;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("\"90s\"", Duration::from_secs(90))]
    #[case("\"2m 30s\"", Duration::from_secs(150))]
    fn test_deserialize_duration(#[case] test_value: &str, #[case] expected: Duration) {
        let mut deserializer = serde_json::Deserializer::from_str(test_value);
        assert_eq!(duration::deserialize(&mut deserializer).unwrap(), expected);
    }

    #[test]
    fn test_deserialize_duration_rejects_numbers() {
        let mut deserializer = serde_json::Deserializer::from_str("90");
        assert!(duration::deserialize(&mut deserializer).is_err());
    }
}
