use bytes::Bytes;

use crate::Stat;

/// Local view of one configuration node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNode {
    pub path: String,
    pub value: Bytes,
    /// Store version the value was read at; meaningless when `exists` is false
    pub version: u64,
    pub exists: bool,
    /// Modification sequence of the read, used to order observations
    pub mzxid: u64,
}

impl ConfigNode {
    pub(crate) fn from_stat(
        path: &str,
        value: Bytes,
        stat: &Stat,
    ) -> Self {
        Self {
            path: path.to_string(),
            value,
            version: stat.version,
            exists: true,
            mzxid: stat.mzxid,
        }
    }

    pub(crate) fn absent(path: &str) -> Self {
        Self {
            path: path.to_string(),
            value: Bytes::new(),
            version: 0,
            exists: false,
            mzxid: 0,
        }
    }

    /// Value as UTF-8, lossy
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}
