use rand::Rng;

/// Generate a random state id: 6 lowercase `[a-z0-9]` characters.
pub fn generate_id() -> String {
    generate_id_of_length(6)
}

pub fn generate_id_of_length(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Extract the machine id from a dataset name: everything after the last
/// underscore up to the next `/`, e.g. `rpool/ROOT/ubuntu_1234/var` -> `1234`.
pub fn machine_id(name: &str) -> Option<&str> {
    let component = name.split('/').find(|c| c.contains('_'))?;
    component.rsplit('_').next().filter(|s| !s.is_empty())
}

/// Derive a clone's target root name from a snapshot source and a new
/// suffix, per the clone name derivation rule:
/// - if the owning filesystem's name contains `_`, replace everything from
///   the first `_` up to the next `/` with `_<suffix>`;
/// - otherwise append `_<suffix>`.
/// Subpath components past the root are preserved.
pub fn derive_clone_target(source_snapshot: &str, suffix: &str) -> Option<String> {
    let (dataset, _tag) = source_snapshot.split_once('@')?;
    match dataset.find('_') {
        Some(underscore_idx) => {
            let tail_from_underscore = &dataset[underscore_idx..];
            let end = tail_from_underscore
                .find('/')
                .map(|i| underscore_idx + i)
                .unwrap_or_else(|| dataset.len());
            Some(format!("{}_{}{}", &dataset[..underscore_idx], suffix, &dataset[end..]))
        }
        None => Some(format!("{}_{}", dataset, suffix)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_six_lowercase_alphanumerics() {
        let id = generate_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn derives_clone_target_with_subpath() {
        let target = derive_clone_target("pool/ROOT/ubuntu_1234/var@snap", "abcd").unwrap();
        assert_eq!(target, "pool/ROOT/ubuntu_abcd/var");
    }

    #[test]
    fn derives_clone_target_at_root() {
        let target = derive_clone_target("pool/ROOT/ubuntu@snap", "abcd").unwrap();
        assert_eq!(target, "pool/ROOT/ubuntu_abcd");
    }

    #[test]
    fn derives_clone_target_trailing_underscore() {
        let target = derive_clone_target("pool/ROOT/ubuntu_@snap", "abcd").unwrap();
        assert_eq!(target, "pool/ROOT/ubuntu_abcd");
    }

    #[test]
    fn extracts_machine_id() {
        assert_eq!(machine_id("rpool/ROOT/ubuntu_1234/var"), Some("1234"));
        assert_eq!(machine_id("rpool/ROOT/ubuntu_1234"), Some("1234"));
    }
}
