mod common;

use std::path::Path;
use std::sync::Arc;

use common::{TestEnvironment, known, stub};
use smoker::pkg_manager::testing::StubDefinition;
use smoker::pkg_manager::{AbortSignal, PkgManagerService, Plugin, PluginLoadError, PluginMetadata, ResolverState};

#[tokio::test]
async fn pinned_npm_resolves_to_known_definition() {
    let npm7 = Arc::new(
        StubDefinition::new("npm7", "npm", "^7.0.0 || ^8.0.0").with_known(&["7.24.0"]),
    );
    let env = TestEnvironment::new(vec![npm7]);

    let output = env.service.resolve_one("npm@7.24.0", &AbortSignal::never()).await;
    assert_eq!(output.state, ResolverState::Done);
    let envelope = output.envelope.expect("npm@7.24.0 should resolve");
    assert_eq!(envelope.spec.name(), "npm7");
    assert_eq!(envelope.spec.version().to_string(), "7.24.0");
    assert!(!envelope.spec.is_system());
    // Known versions never touch PATH
    assert!(env.exec.calls().is_empty());
}

#[tokio::test]
async fn system_yarn_is_bound_to_its_path() {
    let env = TestEnvironment::new(vec![stub("yarn-classic", "yarn", "^1.0.0")]);
    let path = env.install("yarn", "1.22.19");

    let output = env.service.resolve_one("system", &AbortSignal::never()).await;
    let envelope = output.envelope.expect("system yarn should resolve");
    assert_eq!(envelope.spec.bin(), Path::new(&path));
    assert_eq!(envelope.spec.version().to_string(), "1.22.19");
    assert!(envelope.spec.is_system());
}

#[tokio::test]
async fn missing_definition_is_unsupported() {
    let env = TestEnvironment::new(vec![known("npm", "npm", "*", &["9.8.1"])]);
    env.install("npm", "9.8.1");

    let output = env.service.resolve_one("pnpm@10", &AbortSignal::never()).await;
    assert!(output.envelope.is_none());
    assert!(output.error.is_none());

    let unsupported = output.unsupported();
    assert_eq!(unsupported.name.as_deref(), Some("pnpm"));
    assert_eq!(unsupported.version.as_deref(), Some("10"));
    assert_eq!(unsupported.requested_as, "pnpm@10");
}

#[tokio::test]
async fn resolve_all_reports_every_unsupported_request() {
    let env = TestEnvironment::new(vec![known("npm", "npm", "*", &["9.8.1"])]);

    let desired = vec!["npm@9.8.1".to_string(), "pnpm@10".to_string()];
    let err = env
        .service
        .resolve_all(&desired, &AbortSignal::never())
        .await
        .unwrap_err();
    assert!(err.is_all_unsupported());
    assert_eq!(err.unsupported.len(), 1);
    assert_eq!(err.unsupported[0].requested_as, "pnpm@10");
}

#[test]
fn colliding_plugins_fail_before_resolution() {
    let first = Plugin::new(PluginMetadata::new("acme")).with_definition(stub("npm", "npm", "*"));
    let second = Plugin::new(PluginMetadata::new("acme")).with_definition(stub("npm", "npm", "^9.0.0"));

    let err = PkgManagerService::builder(vec![first, second])
        .build()
        .err()
        .expect("second registration should collide");
    match err {
        PluginLoadError::Collision(collision) => {
            assert_eq!(collision.plugin_id, "acme");
            assert_eq!(collision.name, "npm");
        }
        other => panic!("expected a collision, got {:?}", other),
    }
}

#[tokio::test]
async fn resolution_is_deterministic() {
    let env = TestEnvironment::new(vec![
        known("npm-legacy", "npm", "^6.0.0 || ^7.0.0", &["7.24.0"]),
        known("npm7", "npm", "^7.0.0", &["7.24.0"]),
    ]);

    for _ in 0..5 {
        let envelope = env
            .service
            .resolve_one("npm@7.24.0", &AbortSignal::never())
            .await
            .envelope
            .unwrap();
        assert_eq!(envelope.spec.name(), "npm-legacy");
        assert_eq!(envelope.plugin_id(), "test");
    }
}

#[tokio::test]
async fn resolved_spec_keeps_accepted_name_and_version() {
    let env = TestEnvironment::new(vec![
        known("npm", "npm", "^9.0.0", &["9.8.1"]),
        stub("yarn-classic", "yarn", "^1.0.0"),
    ]);
    env.install("yarn", "1.22.19");

    let pinned = env.service.resolve_one("npm@9.8.1", &AbortSignal::never()).await;
    let pinned = pinned.envelope.unwrap();
    assert_eq!((pinned.spec.name(), pinned.spec.version().to_string().as_str()), ("npm", "9.8.1"));

    let system = env.service.resolve_one("yarn", &AbortSignal::never()).await;
    let system = system.envelope.unwrap();
    assert_eq!(
        (system.spec.name(), system.spec.version().to_string().as_str()),
        ("yarn-classic", "1.22.19")
    );
    assert_eq!(system.spec.requested_as(), Some("yarn"));
}

#[tokio::test]
async fn default_system_sticks_to_the_default_bin() {
    let env = TestEnvironment::new(vec![
        stub("yarn-classic", "yarn", "^1.0.0"),
        stub("npm", "npm", "*"),
    ]);
    env.install("yarn", "1.22.19");
    env.install("npm", "9.8.1");
    let signal = AbortSignal::never();

    env.service.resolve_one("yarn", &signal).await;
    assert_eq!(env.service.default_system().unwrap().spec.name(), "yarn-classic");

    env.service.resolve_one("npm", &signal).await;
    assert_eq!(env.service.default_system().unwrap().spec.name(), "npm");

    let yarn = env.service.resolve_one("yarn", &signal).await.envelope.unwrap();
    assert_eq!(yarn.spec.name(), "yarn-classic");
    assert_eq!(env.service.default_system().unwrap().spec.name(), "npm");
}

#[tokio::test]
async fn invalid_request_errors() {
    let env = TestEnvironment::new(vec![stub("npm", "npm", "*")]);
    let output = env.service.resolve_one("npm@", &AbortSignal::never()).await;
    assert_eq!(output.state, ResolverState::Errored);
    assert!(output.envelope.is_none());
    assert!(output.error.is_some());
}

#[tokio::test]
async fn default_named_default_survives_another_npm() {
    let env = TestEnvironment::new(vec![stub("npm", "npm", "*"), stub("npm-b", "npm", "*")]);
    env.install("npm", "9.8.1");
    let signal = AbortSignal::never();

    env.service.resolve_one("npm", &signal).await;
    let npm_b = env.service.resolve_one("npm-b", &signal).await.envelope.unwrap();
    assert_eq!(npm_b.spec.name(), "npm-b");
    assert_eq!(env.service.default_system().unwrap().spec.name(), "npm");
}
