//! Datasource discovery against seed directories and the builtin registry

use cloud_init_engine::datasources::{
    DatasourceContext, DatasourceRegistry, Dependency, DsMode, find_source,
    resolver::{Existing, load_cache, restore_from_checked_cache, write_cache},
};
use cloud_init_engine::state::CloudPaths;
use std::fs;
use tempfile::TempDir;

fn context(temp: &TempDir, sys_cfg: &str) -> DatasourceContext {
    DatasourceContext {
        sys_cfg: serde_yaml::from_str(sys_cfg).unwrap(),
        distro: "ubuntu".into(),
        paths: CloudPaths::with_root(temp.path()),
    }
}

fn list(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn seed(temp: &TempDir, dir: &str, meta_data: &str, user_data: Option<&str>) {
    let seed_dir = temp.path().join("var/lib/cloud/seed").join(dir);
    fs::create_dir_all(&seed_dir).unwrap();
    fs::write(seed_dir.join("meta-data"), meta_data).unwrap();
    if let Some(ud) = user_data {
        fs::write(seed_dir.join("user-data"), ud).unwrap();
    }
}

/// A NoCloud seed directory is found by the local search
#[tokio::test]
async fn test_nocloud_seed_directory() {
    let temp = TempDir::new().unwrap();
    seed(
        &temp,
        "nocloud",
        "instance-id: test-instance-001\nlocal-hostname: test-host\n",
        Some("#cloud-config\nhostname: configured-hostname\n"),
    );

    let ds = find_source(
        &DatasourceRegistry::builtin(),
        &context(&temp, "{}"),
        &[Dependency::Filesystem],
        &list(&["NoCloud", "None"]),
    )
    .await
    .unwrap();

    assert_eq!(ds.name(), "NoCloud");
    assert_eq!(ds.instance_id(), "test-instance-001");
    assert_eq!(ds.dsmode(), DsMode::Local);
    assert!(ds.description().starts_with("DataSourceNoCloud [seed-dir"));
    assert_eq!(
        ds.get_hostname(false, true).unwrap().hostname,
        "test-host"
    );
    assert!(ds.userdata_raw().unwrap().starts_with(b"#cloud-config"));
}

/// Seeds without an instance id get the NoCloud default
#[tokio::test]
async fn test_nocloud_default_instance_id() {
    let temp = TempDir::new().unwrap();
    seed(&temp, "nocloud", "local-hostname: h\n", Some(""));

    let ds = find_source(
        &DatasourceRegistry::builtin(),
        &context(&temp, "{}"),
        &[Dependency::Filesystem],
        &list(&["NoCloud"]),
    )
    .await
    .unwrap();
    assert_eq!(ds.instance_id(), "nocloud");
}

/// Inline seed from system config wins over seed directories
#[tokio::test]
async fn test_nocloud_inline_seed() {
    let temp = TempDir::new().unwrap();
    seed(&temp, "nocloud", "instance-id: from-dir\n", None);

    let sys_cfg = "datasource:\n  NoCloud:\n    meta-data: {instance-id: inline-1}\n    user-data: \"#cloud-config\\nfoo: bar\\n\"\n";
    let ds = find_source(
        &DatasourceRegistry::builtin(),
        &context(&temp, sys_cfg),
        &[Dependency::Filesystem],
        &list(&["NoCloud"]),
    )
    .await
    .unwrap();
    assert_eq!(ds.instance_id(), "inline-1");
    assert_eq!(ds.userdata_raw(), Some(&b"#cloud-config\nfoo: bar\n"[..]));
}

/// With nothing seeded the network search ends at the None fallback
#[tokio::test]
async fn test_network_search_falls_back_to_none() {
    let temp = TempDir::new().unwrap();
    let ds = find_source(
        &DatasourceRegistry::builtin(),
        &context(&temp, "{}"),
        &[Dependency::Filesystem, Dependency::Network],
        &list(&["NoCloudNet", "None"]),
    )
    .await
    .unwrap();
    assert_eq!(ds.name(), "None");
}

/// A local search over an empty list reports what it searched
#[tokio::test]
async fn test_not_found_lists_searched() {
    let temp = TempDir::new().unwrap();
    let err = find_source(
        &DatasourceRegistry::builtin(),
        &context(&temp, "{}"),
        &[Dependency::Filesystem],
        &list(&["NoCloud"]),
    )
    .await
    .err()
    .unwrap();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("NoCloud"));
}

/// The snapshot written for one stage is reused by the next
#[tokio::test]
async fn test_cache_round_trip_through_instance_link() {
    let temp = TempDir::new().unwrap();
    seed(&temp, "nocloud", "instance-id: cached-1\n", Some("#!/bin/sh\ntrue\n"));
    let ctx = context(&temp, "{}");
    let registry = DatasourceRegistry::builtin();

    let ds = find_source(&registry, &ctx, &[Dependency::Filesystem], &list(&["NoCloud"]))
        .await
        .unwrap();
    write_cache(&ctx.paths, "cached-1", ds.as_ref()).await.unwrap();
    std::os::unix::fs::symlink(
        ctx.paths.instance_dir("cached-1"),
        ctx.paths.instance_link(),
    )
    .unwrap();

    let snapshot = load_cache(&ctx.paths).await.unwrap().unwrap();
    assert_eq!(snapshot.dsname, "NoCloud");

    // the seed still names the same instance, so a checked restore succeeds
    let (restored, desc) =
        restore_from_checked_cache(&registry, &ctx, Existing::Check, None).await;
    let restored = restored.unwrap();
    assert!(desc.contains("checked cache"));
    assert_eq!(restored.instance_id(), "cached-1");
    assert_eq!(restored.userdata_raw(), Some(&b"#!/bin/sh\ntrue\n"[..]));
}

/// A changed seed invalidates the checked cache
#[tokio::test]
async fn test_checked_cache_rejects_new_instance() {
    let temp = TempDir::new().unwrap();
    seed(&temp, "nocloud", "instance-id: old\n", None);
    let ctx = context(&temp, "{}");
    let registry = DatasourceRegistry::builtin();

    let ds = find_source(&registry, &ctx, &[Dependency::Filesystem], &list(&["NoCloud"]))
        .await
        .unwrap();
    write_cache(&ctx.paths, "old", ds.as_ref()).await.unwrap();
    std::os::unix::fs::symlink(ctx.paths.instance_dir("old"), ctx.paths.instance_link()).unwrap();

    seed(&temp, "nocloud", "instance-id: new\n", None);
    let (restored, _) = restore_from_checked_cache(&registry, &ctx, Existing::Check, None).await;
    assert!(restored.is_none());

    let (trusted, _) = restore_from_checked_cache(&registry, &ctx, Existing::Trust, None).await;
    assert_eq!(trusted.unwrap().instance_id(), "old");
}
