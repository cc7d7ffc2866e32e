use crate::pooladapter::{PropertySource, PropertyValue};

/// Namespace every custom user property lives under, per the external
/// interface contract. Kept as the literal prefix since it is part of the
/// on-disk/wire contract, not a cosmetic choice.
pub const NAMESPACE: &str = "com.ubuntu.zsys:";

pub const BOOTFS: &str = "com.ubuntu.zsys:bootfs";
pub const LAST_USED: &str = "com.ubuntu.zsys:last-used";
pub const LAST_BOOTED_KERNEL: &str = "com.ubuntu.zsys:last-booted-kernel";
pub const BOOTFS_DATASETS: &str = "com.ubuntu.zsys:bootfs-datasets";
pub const MOUNTPOINT_MIRROR: &str = "com.ubuntu.zsys:mountpoint";
pub const CANMOUNT_MIRROR: &str = "com.ubuntu.zsys:canmount";

/// Encode a property value and its source as the `"<value>:<source>"` form
/// snapshots carry, since snapshots cannot hold the native properties
/// mutably and need the source preserved for later cloning.
pub fn encode(value: &str, source: PropertySource) -> String {
    format!("{}:{}", value, source)
}

/// Decode a `"<value>:<source>"` mirror back into a typed property value.
/// Falls back to `Unknown` source if the encoding is malformed, which
/// should not happen for anything this crate itself wrote.
pub fn decode(encoded: &str) -> PropertyValue {
    match encoded.rsplit_once(':') {
        Some((value, source)) => {
            let source = source.parse().unwrap_or(PropertySource::Unknown);
            PropertyValue::new(value, source)
        }
        None => PropertyValue::new(encoded, PropertySource::Unknown),
    }
}

/// Split a colon-separated `bootfs-datasets` property into its member
/// system-state ids, ignoring empty segments.
pub fn split_bootfs_datasets(value: &str) -> Vec<String> {
    value.split(':').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

pub fn join_bootfs_datasets(ids: &[String]) -> String {
    ids.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_value_and_source() {
        let encoded = encode("/", PropertySource::Local);
        assert_eq!(encoded, "/:local");
        let decoded = decode(&encoded);
        assert_eq!(decoded.value, "/");
        assert_eq!(decoded.source, PropertySource::Local);
    }

    #[test]
    fn bootfs_datasets_round_trip() {
        let ids = vec!["init".to_string(), "abcdef".to_string()];
        let joined = join_bootfs_datasets(&ids);
        assert_eq!(joined, "init:abcdef");
        assert_eq!(split_bootfs_datasets(&joined), ids);
    }
}
