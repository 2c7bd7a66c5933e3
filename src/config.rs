use ::config::Config;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

/// Looks up an optional key: a missing key is `Ok(None)`, a present key with
/// the wrong type is still an error.
pub(crate) fn get_optional<T>(
    result: Result<T, config::ConfigError>,
) -> Result<Option<T>, config::ConfigError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config::builder()
            .set_default("max_read_size", 4096)
            .unwrap()
            .set_default("edge.max_read_size", 512)
            .unwrap()
            .set_default("tls_server_cert", "global.pem")
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn namespaced_key_wins_over_global() {
        let config = sample();
        assert_eq!(get_namespaced_usize(&config, "edge", "max_read_size").unwrap(), 512);
        assert_eq!(get_namespaced_usize(&config, "", "max_read_size").unwrap(), 4096);
    }

    #[test]
    fn falls_back_to_global_key() {
        let config = sample();
        assert_eq!(
            get_namespaced_string(&config, "edge", "tls_server_cert").unwrap(),
            "global.pem"
        );
    }

    #[test]
    fn optional_missing_key_is_none() {
        let config = sample();
        let value = get_optional(get_namespaced_u64(&config, "edge", "tls_handshake_timeout_ms"));
        assert!(matches!(value, Ok(None)));
    }
}
