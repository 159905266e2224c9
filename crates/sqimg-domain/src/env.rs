use std::collections::BTreeMap;

/// Parse `KEY=VALUE` environment entries into a map.
///
/// Each entry is split on its first `=`, so `A=B=C` yields key `A` with value
/// `B=C`. Entries without any `=` are dropped silently. When a key appears more
/// than once the later entry wins. An entry such as `=value` is kept under the
/// empty key.
pub fn parse_env<I, S>(entries: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut env = BTreeMap::new();
    for entry in entries {
        if let Some((key, value)) = entry.as_ref().split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}
