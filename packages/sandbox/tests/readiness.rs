// ABOUTME: Readiness gating tests for image preparation at startup
// ABOUTME: Uses the scripted provider to simulate missing images and an absent daemon

use coderun_sandbox::test_utils::FakeProvider;
use coderun_sandbox::{ImagePreparer, LanguageRegistry, Readiness, ReadinessState};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn registry() -> Arc<LanguageRegistry> {
    Arc::new(LanguageRegistry::new().unwrap())
}

#[tokio::test]
async fn test_missing_images_are_pulled() {
    let provider = Arc::new(
        FakeProvider::new()
            .with_missing_image("gcc:latest")
            .with_missing_image("eclipse-temurin:17-jdk"),
    );
    let preparer = ImagePreparer::new(provider.clone(), registry());
    let state = ReadinessState::new();

    preparer.prepare_into(&state).await.unwrap();

    assert_eq!(
        provider.pulled(),
        vec!["gcc:latest".to_string(), "eclipse-temurin:17-jdk".to_string()]
    );
    assert_eq!(state.get().await, Readiness::Ready);
}

#[tokio::test]
async fn test_present_images_are_not_pulled() {
    let provider = Arc::new(FakeProvider::new());
    let preparer = ImagePreparer::new(provider.clone(), registry());

    preparer.prepare().await.unwrap();

    assert!(provider.pulled().is_empty());
}

#[tokio::test]
async fn test_unavailable_backend_marks_failed() {
    let provider = Arc::new(FakeProvider::unavailable());
    let preparer = ImagePreparer::new(provider.clone(), registry());
    let state = ReadinessState::new();

    let result = preparer.prepare_into(&state).await;

    assert!(result.is_err());
    assert!(!state.is_ready().await);
    match state.get().await {
        Readiness::Failed(message) => assert!(message.contains("Docker daemon"), "{}", message),
        other => panic!("expected failed readiness, got {:?}", other),
    }
}
