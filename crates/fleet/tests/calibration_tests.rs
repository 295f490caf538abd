use {
    fleet::{
        AdmissionConfig, AdmissionRequest, BudgetSource, CalibrationRecord, CalibrationStore,
        Engine, FleetError, GpuMemory, admit,
    },
    std::fs,
};

const QWEN_32B: &str = r#"{
    "id": "Qwen/Qwen2.5-32B-AWQ",
    "engine": "vllm",
    "constants": { "base_vram_gb": 18.0, "kv_cache_gb_per_10k": 0.03 },
    "metadata": {
        "calibrated_at": "2025-01-01T12:00:00",
        "gpu_vram_total_gb": 32.0,
        "source_tokens": 16384,
        "source_cache_gb": 0.05
    }
}"#;

fn record(model: &str, engine: Engine) -> CalibrationRecord {
    CalibrationRecord {
        model_id: model.into(),
        engine,
        base_vram_gb: 4.5,
        kv_cache_gb_per_10k_tokens: 0.4,
        calibrated_at: "2025-02-01T08:00:00".into(),
        gpu_total_vram_at_calibration: 24.0,
    }
}

#[test]
fn test_open_reads_records_and_skips_bad_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("vllm__qwen.json"), QWEN_32B).unwrap();
    fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
    fs::write(
        dir.path().join("negative.json"),
        QWEN_32B.replace("18.0", "-1.0"),
    )
    .unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let store = CalibrationStore::open(dir.path()).unwrap();
    assert_eq!(store.len(), 1);

    let found = store.get("qwen/qwen2.5-32b-awq", Engine::Vllm).unwrap();
    assert_eq!(found.base_vram_gb, 18.0);
    assert_eq!(found.kv_cache_gb_per_10k_tokens, 0.03);
    assert_eq!(found.gpu_total_vram_at_calibration, 32.0);
    assert!(store.get("Qwen/Qwen2.5-32B-AWQ", Engine::Ollama).is_none());
}

#[test]
fn test_lookup_ignores_loadout_flags() {
    let store = CalibrationStore::in_memory([record("llama3.1:8b", Engine::Ollama)]);
    assert!(store.get("llama3.1:8b#ctx=16k", Engine::Ollama).is_some());
    assert!(store.get("LLAMA3.1:8B", Engine::Ollama).is_some());
}

#[test]
fn test_missing_directory_is_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::open(dir.path().join("absent")).unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_record_persists_and_is_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = CalibrationStore::open(dir.path()).unwrap();

    let path = store.record(record("meta-llama/Llama-3.1-8B", Engine::Vllm)).unwrap();
    assert_eq!(path.file_name().unwrap(), "vllm__meta-llama_llama-3.1-8b.json");
    assert!(store.get("meta-llama/Llama-3.1-8B", Engine::Vllm).is_some());

    let err = store
        .record(record("meta-llama/Llama-3.1-8B", Engine::Vllm))
        .unwrap_err();
    assert!(matches!(err, FleetError::Calibration(_)));

    let reopened = CalibrationStore::open(dir.path()).unwrap();
    let found = reopened.get("meta-llama/llama-3.1-8b", Engine::Vllm).unwrap();
    assert_eq!(found.kv_cache_gb_per_10k_tokens, 0.4);
    assert_eq!(found.calibrated_at, "2025-02-01T08:00:00");
}

#[test]
fn test_record_rejects_invalid_constants() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = CalibrationStore::open(dir.path()).unwrap();

    let mut zero_base = record("a", Engine::Vllm);
    zero_base.base_vram_gb = 0.0;
    assert!(store.record(zero_base).is_err());

    let mut negative_kv = record("b", Engine::Vllm);
    negative_kv.kv_cache_gb_per_10k_tokens = -0.1;
    assert!(store.record(negative_kv).is_err());

    assert!(store.is_empty());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_in_memory_store_cannot_record() {
    let mut store = CalibrationStore::default();
    assert!(store.record(record("a", Engine::Ollama)).is_err());
}

#[test]
fn test_admission_from_loaded_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("qwen.json"), QWEN_32B).unwrap();
    let store = CalibrationStore::open(dir.path()).unwrap();
    let config = AdmissionConfig::default();

    let admission = admit(
        &AdmissionRequest {
            model: "Qwen/Qwen2.5-32B-AWQ",
            engine: Engine::Vllm,
            context: Some(16384),
        },
        &store,
        GpuMemory {
            total_gb: 32.0,
            used_gb: 0.5,
        },
        &config,
    );

    assert_eq!(admission.source, BudgetSource::Calibrated);
    let without_floor = admission.predicted_gb - config.static_floor_gb;
    assert!((without_floor - 18.0492).abs() < 1e-3);
    let utilization = admission.utilization.unwrap();
    assert!((0.10..=0.95).contains(&utilization));
}
