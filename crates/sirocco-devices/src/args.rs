use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgsError {
    #[error("missing required device argument `{0}`")]
    Missing(&'static str),
}

/// `key=value` device arguments from the simulator command line, e.g.
/// `img=disk.raw,mode=snapshot` split into individual `key=value` items.
///
/// Items without a `=` are ignored; the first occurrence of a key wins.
#[derive(Debug, Clone, Default)]
pub struct DeviceArgs {
    map: BTreeMap<String, String>,
}

impl DeviceArgs {
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for arg in args {
            let arg = arg.as_ref();
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            map.entry(key.to_owned()).or_insert_with(|| value.to_owned());
        }
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &'static str) -> Result<&str, ArgsError> {
        self.get(key).ok_or(ArgsError::Missing(key))
    }
}
