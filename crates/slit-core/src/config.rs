use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use thiserror::Error;

/// Settings of a single configuration section, as raw strings.
///
/// Values are parsed on access with [`FromStr`], so every observation point
/// declares its own vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    inner: BTreeMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    pub fn get_raw(&self, field: &str) -> Option<&str> {
        self.inner.get(field).map(String::as_str)
    }

    pub fn optional<T>(&self, field: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(field)
            .map(|value| parse(value.trim(), field))
            .transpose()
    }

    pub fn with_default<T>(&self, field: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(field)?.unwrap_or(default))
    }

    /// Comma separated list of values. Empty if the field is missing.
    pub fn get_list<T>(&self, field: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(field)
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(item, field))
            .collect()
    }

    /// Like [`ModuleConfig::get_list`], but `default` is used when the field is missing.
    /// A present but empty field means an empty list.
    pub fn get_list_with_default<T>(&self, field: &str, default: Vec<T>) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        if self.inner.contains_key(field) {
            self.get_list(field)
        } else {
            Ok(default)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, field: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn typed_values() {
        let config: ModuleConfig = [("enabled", "false"), ("perf_pages", " 32 ")]
            .into_iter()
            .collect();
        assert!(!config.with_default("enabled", true).unwrap());
        assert_eq!(config.with_default("perf_pages", 64usize).unwrap(), 32);
        assert_eq!(config.with_default("missing", 7u32).unwrap(), 7);
        assert_eq!(
            config.optional::<u32>("enabled"),
            Err(ConfigError::InvalidValue {
                field: "enabled".to_string(),
                value: "false".to_string(),
                err: "invalid digit found in string".to_string(),
            })
        );
    }

    #[test]
    fn lists() {
        let config: ModuleConfig = [("ports", "80, 443,,8080"), ("empty", "")]
            .into_iter()
            .collect();
        assert_eq!(config.get_list::<u16>("ports").unwrap(), vec![80, 443, 8080]);
        assert!(config.get_list::<u16>("missing").unwrap().is_empty());
        assert_eq!(
            config.get_list_with_default::<u16>("missing", vec![22]).unwrap(),
            vec![22]
        );
        assert!(
            config
                .get_list_with_default::<u16>("empty", vec![22])
                .unwrap()
                .is_empty()
        );
        assert!(config.get_list::<u16>("nope").is_ok());
        assert!(
            [("ports", "80,http")]
                .into_iter()
                .collect::<ModuleConfig>()
                .get_list::<u16>("ports")
                .is_err()
        );
    }
}
