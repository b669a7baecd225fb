use std::collections::HashMap;

/// builds the environment a user-space filesystem child process is spawned
/// with. Field names and defaults are grounded on
/// `original_source/trilio_dms/s3vaultfuse_manager.py::prepare_environment`.
/// `mount_path` always overrides any data-directory value present in
/// `credentials`, matching the original's explicit override rule.
pub fn build_environment(
    export: &str,
    mount_path: &std::path::Path,
    credentials: &HashMap<String, String>,
) -> HashMap<String, String> {
    let get = |key: &str, default: &str| -> String {
        credentials
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    let bucket = credentials
        .get("bucket")
        .or_else(|| credentials.get("vault_s3_bucket"))
        .cloned()
        .unwrap_or_else(|| export.to_string());

    let mut env: HashMap<String, String> = HashMap::new();

    env.insert("vault_s3_bucket".into(), bucket.clone());
    env.insert("vault_s3_region_name".into(), get("vault_s3_region_name", "us-west-2"));
    env.insert("vault_s3_auth_version".into(), get("vault_s3_auth_version", "DEFAULT"));
    env.insert(
        "vault_s3_signature_version".into(),
        get("vault_s3_signature_version", "default"),
    );
    env.insert("vault_s3_ssl".into(), get("vault_s3_ssl", "true").to_lowercase());
    env.insert(
        "vault_s3_ssl_verify".into(),
        get("vault_s3_ssl_verify", "true").to_lowercase(),
    );
    env.insert(
        "vault_storage_nfs_export".into(),
        credentials
            .get("vault_storage_nfs_export")
            .cloned()
            .unwrap_or(bucket),
    );
    env.insert("bucket_object_lock".into(), get("bucket_object_lock", "false"));
    env.insert("use_manifest_suffix".into(), get("use_manifest_suffix", "false"));
    env.insert("vault_s3_ssl_cert".into(), get("vault_s3_ssl_cert", ""));
    env.insert("vault_s3_endpoint_url".into(), get("vault_s3_endpoint_url", ""));
    env.insert(
        "vault_s3_max_pool_connections".into(),
        get("vault_s3_max_pool_connections", "500"),
    );
    env.insert("vault_data_directory_old".into(), "/var/triliovault".into());
    // always the caller-supplied mount path, never credential-sourced.
    env.insert(
        "vault_data_directory".into(),
        mount_path.to_string_lossy().into_owned(),
    );

    if let Some(key) = credentials.get("access_key_id") {
        env.insert("AWS_ACCESS_KEY_ID".into(), key.clone());
    }
    if let Some(secret) = credentials.get("secret_access_key") {
        env.insert("AWS_SECRET_ACCESS_KEY".into(), secret.clone());
    }

    env.insert(
        "log_config_append".into(),
        get(
            "log_config_append",
            "/etc/triliovault-object-store/object_store_logging.conf",
        ),
    );
    env.insert(
        "helper_command".into(),
        get(
            "helper_command",
            "sudo /usr/bin/workloadmgr-rootwrap /etc/triliovault-wlm/rootwrap.conf privsep-helper",
        ),
    );

    env.retain(|_, v| !v.is_empty());
    env
}

#[cfg(test)]
mod test {
    use super::build_environment;
    use std::collections::HashMap;
    use std::path::Path;

    #[test]
    fn mount_path_always_wins_over_credentials() {
        let mut creds = HashMap::new();
        creds.insert("vault_data_directory".to_string(), "/should/be/ignored".to_string());
        creds.insert("bucket".to_string(), "my-bucket".to_string());

        let env = build_environment("export-a", Path::new("/mnt/trilio/target-a"), &creds);

        assert_eq!(env.get("vault_data_directory").unwrap(), "/mnt/trilio/target-a");
        assert_eq!(env.get("vault_s3_bucket").unwrap(), "my-bucket");
    }

    #[test]
    fn defaults_applied_when_missing() {
        let env = build_environment("export-a", Path::new("/mnt/trilio/target-a"), &HashMap::new());

        assert_eq!(env.get("vault_s3_region_name").unwrap(), "us-west-2");
        assert_eq!(env.get("vault_s3_ssl").unwrap(), "true");
        assert_eq!(env.get("vault_s3_bucket").unwrap(), "export-a");
        assert!(!env.contains_key("AWS_ACCESS_KEY_ID"));
    }

    #[test]
    fn empty_values_are_stripped() {
        let mut creds = HashMap::new();
        creds.insert("vault_s3_ssl_cert".to_string(), "".to_string());
        let env = build_environment("export-a", Path::new("/mnt/a"), &creds);
        assert!(!env.contains_key("vault_s3_ssl_cert"));
    }
}
