use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// Read a variable, treating empty and whitespace-only values as unset.
pub(crate) fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Accepts true/false, 1/0, yes/no and on/off in any case.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_bool(key: &str, default: bool) -> Result<bool, Box<dyn std::error::Error>> {
    match env_var(key) {
        Some(value) => parse_bool(&value)
            .ok_or_else(|| format!("Invalid {key}: '{value}' is not a boolean").into()),
        None => Ok(default),
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(env_parse_opt(key)?.unwrap_or(default))
}

pub(crate) fn env_parse_opt<T>(key: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: Display,
{
    match env_var(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {key}: {e}").into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
