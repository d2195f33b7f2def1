//! Integration tests for SyncConfig::from_env()
//!
//! Environment variables are process-global, so every test goes through
//! `with_env_vars`, which serializes access and restores the previous values.

use fleetwatch::config::SyncConfig;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// All environment variables read by SyncConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "FLEETWATCH_FULL_SYNC_SECS",
    "FLEETWATCH_WATCH_RECONNECT_SECS",
    "FLEETWATCH_DISCOVERY_SECS",
    "FLEETWATCH_TREE_RETRY_SECS",
    "FLEETWATCH_TREE_RESYNC_SECS",
    "FLEETWATCH_PIPELINE_WORKERS",
    "FLEETWATCH_WORKER_QUEUE",
    "FLEETWATCH_EVENT_QUEUE",
    "FLEETWATCH_COMPONENTS_CLUSTER",
    "FLEETWATCH_COMPONENT_PATHS",
    "FLEETWATCH_IMAGE_BASE",
    "FLEETWATCH_APP_NAME",
];

fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let all_originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in all_originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

#[test]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = SyncConfig::from_env().expect("Should parse config");
        assert_eq!(config.full_sync_interval, Duration::from_secs(30));
        assert_eq!(config.watch_reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.discovery_interval, Duration::from_secs(3));
        assert_eq!(config.pipeline_workers, 10);
        assert!(config.component_paths.is_empty());
        assert!(config.validate().is_ok());
    });
}

#[test]
fn test_from_env_cadences() {
    with_env_vars(
        &[
            ("FLEETWATCH_FULL_SYNC_SECS", "60"),
            ("FLEETWATCH_WATCH_RECONNECT_SECS", "2"),
            ("FLEETWATCH_DISCOVERY_SECS", "1"),
            ("FLEETWATCH_TREE_RETRY_SECS", "4"),
            ("FLEETWATCH_TREE_RESYNC_SECS", "8"),
        ],
        || {
            let config = SyncConfig::from_env().expect("Should parse config");
            assert_eq!(config.full_sync_interval, Duration::from_secs(60));
            assert_eq!(config.watch_reconnect_delay, Duration::from_secs(2));
            assert_eq!(config.discovery_interval, Duration::from_secs(1));
            assert_eq!(config.tree_retry_delay, Duration::from_secs(4));
            assert_eq!(config.tree_resync_interval, Duration::from_secs(8));
        },
    );
}

#[test]
fn test_from_env_capacities() {
    with_env_vars(
        &[
            ("FLEETWATCH_PIPELINE_WORKERS", "4"),
            ("FLEETWATCH_WORKER_QUEUE", "16"),
            ("FLEETWATCH_EVENT_QUEUE", "1024"),
        ],
        || {
            let config = SyncConfig::from_env().expect("Should parse config");
            assert_eq!(config.pipeline_workers, 4);
            assert_eq!(config.worker_queue_capacity, 16);
            assert_eq!(config.event_queue_capacity, 1024);
        },
    );
}

#[test]
fn test_from_env_component_paths_are_trimmed() {
    with_env_vars(
        &[(
            "FLEETWATCH_COMPONENT_PATHS",
            " gateway:/services/*/nodes , ,scheduler:/sched/leader ",
        )],
        || {
            let config = SyncConfig::from_env().expect("Should parse config");
            assert_eq!(
                config.component_paths,
                vec!["gateway:/services/*/nodes", "scheduler:/sched/leader"]
            );
            assert!(config.validate().is_ok());
        },
    );
}

#[test]
fn test_from_env_naming() {
    with_env_vars(
        &[
            ("FLEETWATCH_COMPONENTS_CLUSTER", "platform"),
            ("FLEETWATCH_IMAGE_BASE", "registry.example.com/obs"),
            ("FLEETWATCH_APP_NAME", "scraper"),
        ],
        || {
            let config = SyncConfig::from_env().expect("Should parse config");
            assert!(config.is_components_cluster("platform"));
            assert_eq!(config.collector_image_base, "registry.example.com/obs");
            assert_eq!(config.collector_app_name, "scraper");
        },
    );
}

#[test]
fn test_from_env_invalid_number_fails() {
    with_env_vars(&[("FLEETWATCH_FULL_SYNC_SECS", "soon")], || {
        let err = SyncConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("FLEETWATCH_FULL_SYNC_SECS"));
    });

    with_env_vars(&[("FLEETWATCH_PIPELINE_WORKERS", "-1")], || {
        assert!(SyncConfig::from_env().is_err());
    });
}

#[test]
fn test_from_env_bad_template_caught_by_validate() {
    with_env_vars(&[("FLEETWATCH_COMPONENT_PATHS", "gateway:relative/*")], || {
        let config = SyncConfig::from_env().expect("Should parse config");
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    });
}
