//! Remote resource names and tags.
//!
//! Names must be unique per account and at most 32 characters, so they are
//! `<cluster>-<hash>` where the hash covers the Ingress identifier (and the
//! service name for target groups).

use pkg_cloud::model::Tag;
use pkg_constants::alb::{
    MAX_RESOURCE_NAME_LEN, TAG_CLUSTER_NAME, TAG_INGRESS_NAME, TAG_SERVICE_NAME,
};

/// Stable 64-bit hash of `input`, hex encoded.
fn stable_hash(input: &str) -> String {
    let mut hash: u64 = 0;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    format!("{:016x}", hash)
}

fn bounded_name(cluster_name: &str, key: &str) -> String {
    let mut name = format!("{}-{}", cluster_name, stable_hash(key));
    name.truncate(MAX_RESOURCE_NAME_LEN);
    name
}

pub fn load_balancer_name(cluster_name: &str, ingress_id: &str) -> String {
    bounded_name(cluster_name, ingress_id)
}

pub fn target_group_name(cluster_name: &str, ingress_id: &str, service: &str) -> String {
    bounded_name(cluster_name, &format!("{}#{}", ingress_id, service))
}

pub fn load_balancer_tags(cluster_name: &str, ingress_id: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_CLUSTER_NAME, cluster_name),
        Tag::new(TAG_INGRESS_NAME, ingress_id),
    ]
}

pub fn target_group_tags(cluster_name: &str, ingress_id: &str, service: &str) -> Vec<Tag> {
    let mut tags = load_balancer_tags(cluster_name, ingress_id);
    tags.push(Tag::new(TAG_SERVICE_NAME, service));
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable_and_bounded() {
        let a = load_balancer_name("abcdefghijk", "some-long-namespace/some-long-ingress-name");
        let b = load_balancer_name("abcdefghijk", "some-long-namespace/some-long-ingress-name");
        assert_eq!(a, b);
        assert!(a.len() <= MAX_RESOURCE_NAME_LEN);
        assert!(a.starts_with("abcdefghijk-"));
    }

    #[test]
    fn test_names_differ_per_ingress_and_service() {
        assert_ne!(load_balancer_name("c", "default/a"), load_balancer_name("c", "default/b"));
        assert_ne!(
            target_group_name("c", "default/a", "svc-a"),
            target_group_name("c", "default/a", "svc-b")
        );
        assert_ne!(
            target_group_name("c", "default/a", "svc-a"),
            target_group_name("c", "default/b", "svc-a")
        );
    }
}
