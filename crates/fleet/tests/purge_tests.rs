use {
    fleet::{
        AdmissionConfig, AdmissionRequest, CalibrationStore, Catalog, FleetConfig, GpuMemory,
        FleetError, Health, Launcher, Manifest, PortEntry, PurgeReason, ServiceDescriptor,
        ServiceStatus::{Busy, Off, On, Startup, Unhealthy},
        Supervisor, SystemLauncher, admit, plan_purge,
    },
    std::collections::HashMap,
};

fn setup(ids: &[&str]) -> (Vec<PortEntry>, Vec<ServiceDescriptor>) {
    let catalog = Catalog::new(FleetConfig::new("/models/ollama", "/models/hf"));
    let manifest = Manifest::parse(ids).unwrap();
    let admission = admit(
        &AdmissionRequest {
            model: &manifest.llm.model,
            engine: manifest.llm.engine,
            context: manifest.llm.context,
        },
        &CalibrationStore::default(),
        GpuMemory {
            total_gb: 24.0,
            used_gb: 0.0,
        },
        &AdmissionConfig::default(),
    );
    (catalog.registry(), catalog.required(&manifest, &admission))
}

fn snapshot(registry: &[PortEntry], live: &[(u16, Health)]) -> Vec<(PortEntry, Health)> {
    registry
        .iter()
        .map(|entry| {
            let health = live
                .iter()
                .find(|(port, _)| *port == entry.port)
                .map(|(_, h)| h.clone())
                .unwrap_or(Health::new(Off));
            (*entry, health)
        })
        .collect()
}

#[test]
fn test_quiet_host_needs_no_purge() {
    let (registry, required) = setup(&["whisper-tiny", "OL_demo-model", "tts-default"]);
    let plan = plan_purge(&required, &snapshot(&registry, &[]), &HashMap::new(), true);
    assert!(plan.is_empty());
}

#[test]
fn test_unhealthy_and_starting_services_are_killed() {
    let (registry, required) = setup(&["whisper-tiny", "OL_demo-model", "tts-default"]);
    let live = [(8001, Health::new(Startup)), (8002, Health::new(Unhealthy))];
    let plan = plan_purge(&required, &snapshot(&registry, &live), &HashMap::new(), false);
    assert_eq!(
        plan,
        vec![(8001, PurgeReason::Unhealthy), (8002, PurgeReason::Unhealthy)]
    );
}

#[test]
fn test_wrong_model_on_required_port_is_killed() {
    let (registry, required) = setup(&["whisper-large", "OL_demo-model", "tts-default"]);
    let live = [
        (8001, Health::with_info(On, "whisper-tiny")),
        (8002, Health::with_info(Busy, "tts-default")),
    ];
    let plan = plan_purge(&required, &snapshot(&registry, &live), &HashMap::new(), false);
    assert_eq!(plan, vec![(8001, PurgeReason::Mismatch)]);
}

#[test]
fn test_owned_services_match_by_descriptor_id() {
    let (registry, required) = setup(&["whisper-tiny", "OL_demo-model"]);
    let ollama = required.iter().find(|s| s.port == 11434).unwrap();
    let live = [
        (8001, Health::with_info(On, "whisper-tiny")),
        (11434, Health::new(On)),
    ];

    let resident = HashMap::from([(8001, "whisper-tiny".to_string()), (11434, ollama.id.clone())]);
    let plan = plan_purge(&required, &snapshot(&registry, &live), &resident, true);
    assert!(plan.is_empty());

    // same model, different context: the engine must be restarted
    let resident = HashMap::from([(11434, "OL_demo-model#ctx=2048".to_string())]);
    let plan = plan_purge(&required, &snapshot(&registry, &live), &resident, true);
    assert_eq!(plan, vec![(11434, PurgeReason::Mismatch)]);
}

#[test]
fn test_foreign_engine_without_model_info_is_replaced() {
    let (registry, required) = setup(&["OL_demo-model"]);
    let live = [(11434, Health::new(On))];
    let plan = plan_purge(&required, &snapshot(&registry, &live), &HashMap::new(), false);
    assert_eq!(plan, vec![(11434, PurgeReason::Mismatch)]);
}

#[test]
fn test_only_one_language_model_stays_resident() {
    let (registry, required) = setup(&["VL_Qwen/Qwen2.5-7B"]);
    let live = [
        (11434, Health::new(On)),
        (8000, Health::with_info(On, "Qwen/Qwen2.5-7B")),
    ];
    let plan = plan_purge(&required, &snapshot(&registry, &live), &HashMap::new(), false);
    assert_eq!(plan, vec![(11434, PurgeReason::SecondEngine)]);
}

#[test]
fn test_orphans_follow_purge_on_entry() {
    let (registry, required) = setup(&["OL_demo-model"]);
    let ollama = required[0].id.clone();
    let live = [
        (8002, Health::with_info(On, "kokoro")),
        (11434, Health::new(On)),
    ];
    let resident = HashMap::from([(11434, ollama)]);

    let plan = plan_purge(&required, &snapshot(&registry, &live), &resident, false);
    assert!(plan.is_empty());

    let plan = plan_purge(&required, &snapshot(&registry, &live), &resident, true);
    assert_eq!(plan, vec![(8002, PurgeReason::Orphan)]);
}

#[tokio::test]
async fn test_kill_without_port_tools_leaves_the_check_to_the_caller() {
    let launcher = SystemLauncher::new("no-such-docker").with_fuser("no-such-fuser");
    launcher.kill_port(39_217).await.unwrap();

    let logs = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(launcher, logs.path());
    supervisor.kill(39_217, PurgeReason::Orphan).await.unwrap();
}

#[tokio::test]
async fn test_kill_tool_that_cannot_run_is_a_port_conflict() {
    // a directory exists but cannot be executed
    let dir = tempfile::tempdir().unwrap();
    let launcher = SystemLauncher::new("no-such-docker").with_fuser(dir.path().to_string_lossy());
    let err = launcher.kill_port(39_218).await.unwrap_err();
    assert!(matches!(err, FleetError::PortConflict { port: 39_218, .. }), "got {err:?}");
}
