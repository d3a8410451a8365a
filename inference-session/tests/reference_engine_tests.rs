use inference_session::reference::{ReferenceEngine, ReferenceWeights};
use inference_session::{
    Backend, GenerationRequest, SamplingConfig, Session, SessionConfig, StopReason,
};
use tempfile::NamedTempFile;

fn model_file(seed: u64) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    ReferenceWeights::random(ReferenceWeights::demo_vocab(), 32, seed)
        .save(file.path())
        .unwrap();
    file
}

fn hello(seed: u64) -> GenerationRequest {
    GenerationRequest::new("Hello", 5).with_sampling(SamplingConfig {
        seed: Some(seed),
        top_k: 40,
        top_p: 0.95,
        temperature: 1.0,
    })
}

#[test]
fn test_seeded_generation_is_reproducible() {
    let file = model_file(0);
    let backend = Backend::new(ReferenceEngine::new());

    let mut session = Session::construct(&backend, file.path(), 4, 512).unwrap();
    let first = session.generate(&hello(42)).unwrap();
    let second = session.generate(&hello(42)).unwrap();
    assert!(first.token_count <= 5);
    assert_eq!(first.prompt_tokens, 2);
    assert_eq!(first.text, second.text);
    assert_eq!(first.token_count, second.token_count);
    assert_eq!(first.stop_reason, second.stop_reason);

    // A fresh session on a fresh backend reproduces it as well.
    let other_backend = Backend::new(ReferenceEngine::new());
    let mut other = Session::construct(&other_backend, file.path(), 4, 512).unwrap();
    let third = other.generate(&hello(42)).unwrap();
    assert_eq!(first.text, third.text);
    assert_eq!(first.token_count, third.token_count);
}

#[test]
fn test_token_count_never_exceeds_budget() {
    let file = model_file(3);
    let backend = Backend::new(ReferenceEngine::new());
    let mut session = Session::construct(&backend, file.path(), 2, 256).unwrap();

    for (seed, max_tokens) in [(1, 1), (2, 7), (3, 32), (4, 100)] {
        let before = backend.engine().evaluations();
        let request = GenerationRequest::new("how are you", max_tokens)
            .with_sampling(SamplingConfig::seeded(seed));
        let result = session.generate(&request).unwrap();
        assert!(result.token_count <= max_tokens);
        assert!(backend.engine().evaluations() - before <= max_tokens + 1);
        assert!(matches!(
            result.stop_reason,
            StopReason::Eos | StopReason::MaxTokens
        ));
    }
}

#[test]
fn test_greedy_generation_matches_across_sessions() {
    let file = model_file(9);
    let backend = Backend::new(ReferenceEngine::new());
    let mut a = Session::construct(&backend, file.path(), 1, 128).unwrap();
    let mut b = Session::construct(&backend, file.path(), 1, 128).unwrap();

    let request = GenerationRequest::new("what is your name", 12)
        .with_sampling(SamplingConfig::greedy());
    assert_eq!(
        a.generate(&request).unwrap().text,
        b.generate(&request).unwrap().text
    );
}

#[test]
fn test_generated_text_uses_vocabulary_words() {
    let file = model_file(5);
    let backend = Backend::new(ReferenceEngine::new());
    let mut session = Session::construct(&backend, file.path(), 1, 128).unwrap();
    let result = session.generate(&hello(8)).unwrap();

    let vocab = ReferenceWeights::demo_vocab();
    for word in result.text.split_whitespace() {
        assert!(vocab.iter().any(|w| w == word), "unexpected word {word:?}");
    }
}

#[test]
fn test_engine_counters_balance() {
    let file = model_file(1);
    let backend = Backend::new(ReferenceEngine::new());
    {
        let mut session = Session::construct(&backend, file.path(), 1, 64).unwrap();
        session.generate(&hello(1)).unwrap();
    }
    let engine = backend.engine();
    assert_eq!(engine.backend_inits(), 1);
    assert_eq!(engine.backend_frees(), 1);
    assert_eq!(engine.models_loaded(), engine.models_freed());
    assert_eq!(engine.contexts_created(), engine.contexts_freed());
}

#[test]
fn test_truncated_model_file_is_rejected() {
    let file = model_file(2);
    let bytes = std::fs::read(file.path()).unwrap();
    std::fs::write(file.path(), &bytes[..bytes.len() / 2]).unwrap();

    let backend = Backend::new(ReferenceEngine::new());
    let err = Session::construct(&backend, file.path(), 1, 64).unwrap_err();
    assert!(matches!(
        err,
        inference_session::ConstructionError::ModelLoad(
            inference_session::ModelLoadError::Rejected { .. }
        )
    ));
    assert!(!backend.is_initialized());
}

#[test]
fn test_config_drives_a_session() {
    let file = model_file(4);
    let config = SessionConfig {
        model_path: file.path().to_path_buf(),
        threads: 2,
        context_capacity: 64,
        ..Default::default()
    };
    let backend = Backend::with_numa(ReferenceEngine::new(), config.numa);
    let mut session = Session::construct(
        &backend,
        &config.model_path,
        config.threads,
        config.context_capacity,
    )
    .unwrap();

    let mut request = config.request("hello");
    request.max_tokens = 3;
    request.sampling.seed = Some(1);
    let result = session.generate(&request).unwrap();
    assert!(result.token_count <= 3);
}
