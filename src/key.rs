//! Cache keys for layers.
//!
//! A key is the base snapshot's digest, then its id, then the operation
//! descriptor, concatenated. Nothing is hashed: the key is only as unique as
//! its inputs, and file contents never take part in it.

/// Derive the cache key for applying `descriptor` on top of a base snapshot.
pub fn derive(base_digest: Option<&str>, base_id: &str, descriptor: &str) -> String {
    let digest = base_digest.unwrap_or("");
    let mut key = String::with_capacity(digest.len() + base_id.len() + descriptor.len());
    key.push_str(digest);
    key.push_str(base_id);
    key.push_str(descriptor);
    key
}

/// Descriptor for a `copy` layer.
pub fn copy_descriptor(src: &str, dest: &str) -> String {
    format!("copy-{src}-{dest}")
}

/// Descriptor for a `do` layer: the instructions followed by the names of
/// every verification check, so changing the required checks is a new key.
pub fn do_descriptor<'a>(instructions: &str, check_names: impl IntoIterator<Item = &'a str>) -> String {
    let names: Vec<&str> = check_names.into_iter().collect();
    format!("{instructions}{}", names.join(","))
}

/// Descriptor for a `resize` layer. Unset sizes are spelled out so that
/// "keep the current value" stays distinct from any concrete size.
pub fn resize_descriptor(vcpus: Option<u32>, memory: Option<u64>, disk_size: Option<u64>) -> String {
    fn part<T: std::fmt::Display>(value: Option<T>) -> String {
        value.map_or_else(|| "none".to_string(), |v| v.to_string())
    }
    format!("resize-{}-{}-{}", part(vcpus), part(memory), part(disk_size))
}
