use crate::*;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use camino::{Utf8Path, Utf8PathBuf};
use mcdf_cache::{hash_bytes, CacheConfig, FileCacheStore};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One object standing in for every external service, recording each call.
#[derive(Default)]
struct MockHost {
    calls: Mutex<Vec<&'static str>>,
    fail_on: Mutex<Option<&'static str>>,
    draw_delay: Mutex<Duration>,
    slow_draws: Mutex<HashMap<TargetId, Duration>>,
    drawing: AtomicUsize,
    peak_drawing: AtomicUsize,
    next_collection: AtomicUsize,
    live_collections: Mutex<BTreeSet<String>>,
    mappings: Mutex<BTreeMap<String, String>>,
    appearance: Mutex<HashMap<TargetId, String>>,
    body_scale: Mutex<HashMap<TargetId, String>>,
    titles: Mutex<HashMap<TargetId, String>>,
}

impl MockHost {
    fn record(&self, call: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if *self.fail_on.lock().unwrap() == Some(call) {
            return Err(Error::service("mock", format!("{call} refused")));
        }
        Ok(())
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn fail_on(&self, call: &'static str) {
        *self.fail_on.lock().unwrap() = Some(call);
    }

    fn live_collections(&self) -> usize {
        self.live_collections.lock().unwrap().len()
    }

    fn appearance_of(&self, target: &TargetRef) -> Option<String> {
        self.appearance.lock().unwrap().get(&target.id).cloned()
    }

    fn services(self: &Arc<Self>) -> ServiceSet {
        ServiceSet::default()
            .with_appearance(self.clone())
            .with_mods(self.clone())
            .with_body_scale(self.clone())
            .with_redraw(self.clone())
            .with_title(self.clone())
    }
}

#[async_trait]
impl AppearanceService for MockHost {
    async fn query_version(&self) -> Result<ServiceVersion> {
        Ok(ServiceVersion::new(1, 3))
    }

    async fn get_appearance(&self, target: &TargetRef) -> Result<Option<String>> {
        self.record("get_appearance")?;
        Ok(self.appearance_of(target))
    }

    async fn apply_appearance(
        &self,
        target: &TargetRef,
        payload: &str,
        _lock: u32,
        _flags: ApplyFlags,
    ) -> Result<()> {
        self.record("apply_appearance")?;
        self.appearance
            .lock()
            .unwrap()
            .insert(target.id, payload.to_string());
        Ok(())
    }

    async fn revert_appearance(&self, target: &TargetRef, _lock: u32) -> Result<()> {
        self.record("revert_appearance")?;
        self.appearance.lock().unwrap().remove(&target.id);
        Ok(())
    }
}

#[async_trait]
impl ModService for MockHost {
    async fn query_version(&self) -> Result<ServiceVersion> {
        Ok(ServiceVersion::new(5, 2))
    }

    async fn create_temporary_collection(&self, name: &str) -> Result<CollectionId> {
        self.record("create_collection")?;
        let n = self.next_collection.fetch_add(1, Ordering::SeqCst);
        let id = format!("{name}#{n}");
        self.live_collections.lock().unwrap().insert(id.clone());
        Ok(CollectionId(id))
    }

    async fn assign_collection(&self, _collection: &CollectionId, _target: &TargetRef) -> Result<()> {
        self.record("assign_collection")
    }

    async fn set_file_mappings(
        &self,
        _collection: &CollectionId,
        mappings: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record("set_file_mappings")?;
        *self.mappings.lock().unwrap() = mappings.clone();
        Ok(())
    }

    async fn set_manipulation_data(&self, _collection: &CollectionId, _data: &[u8]) -> Result<()> {
        self.record("set_manipulation_data")
    }

    async fn remove_collection(&self, collection: &CollectionId) -> Result<()> {
        self.record("remove_collection")?;
        self.live_collections.lock().unwrap().remove(&collection.0);
        Ok(())
    }
}

#[async_trait]
impl BodyScaleService for MockHost {
    async fn query_version(&self) -> Result<ServiceVersion> {
        Ok(ServiceVersion::new(2, 0))
    }

    async fn set_body_scale(&self, target: &TargetRef, payload: &str) -> Result<Option<BodyScaleId>> {
        self.record("set_body_scale")?;
        self.body_scale
            .lock()
            .unwrap()
            .insert(target.id, payload.to_string());
        Ok(Some(BodyScaleId(format!("scale-{}", target.id))))
    }

    async fn revert_body_scale(&self, target: &TargetRef, _id: Option<&BodyScaleId>) -> Result<()> {
        self.record("revert_body_scale")?;
        self.body_scale.lock().unwrap().remove(&target.id);
        Ok(())
    }
}

#[async_trait]
impl RedrawService for MockHost {
    async fn trigger_redraw(&self, _target: &TargetRef) -> Result<()> {
        self.record("trigger_redraw")
    }

    async fn wait_for_draw_completion(&self, target: &TargetRef, _timeout: Duration) -> Result<()> {
        self.record("wait_for_draw")?;
        let delay = self
            .slow_draws
            .lock()
            .unwrap()
            .get(&target.id)
            .copied()
            .unwrap_or_else(|| *self.draw_delay.lock().unwrap());
        let _drawing = Drawing::new(self);
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Counts concurrent draw waits, including ones dropped by cancellation.
struct Drawing<'a>(&'a MockHost);

impl<'a> Drawing<'a> {
    fn new(host: &'a MockHost) -> Self {
        let now = host.drawing.fetch_add(1, Ordering::SeqCst) + 1;
        host.peak_drawing.fetch_max(now, Ordering::SeqCst);
        Self(host)
    }
}

impl Drop for Drawing<'_> {
    fn drop(&mut self) {
        self.0.drawing.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TitleService for MockHost {
    async fn query_version(&self) -> Result<ServiceVersion> {
        Ok(ServiceVersion::new(3, 1))
    }

    async fn set_title(&self, target: &TargetRef, payload: &str) -> Result<()> {
        self.record("set_title")?;
        self.titles
            .lock()
            .unwrap()
            .insert(target.id, payload.to_string());
        Ok(())
    }

    async fn clear_title(&self, target: &TargetRef) -> Result<()> {
        self.record("clear_title")?;
        self.titles.lock().unwrap().remove(&target.id);
        Ok(())
    }
}

fn encode_payload(value: Value) -> String {
    STANDARD.encode(serde_json::to_vec(&value).unwrap())
}

fn decode_payload(payload: &str) -> Value {
    serde_json::from_slice(&STANDARD.decode(payload).unwrap()).unwrap()
}

fn archive_appearance() -> String {
    encode_payload(json!({
        "FileVersion": 1,
        "Equipment": { "Body": { "ItemId": 7 } },
        "Customize": { "Race": { "Value": 1 }, "Clan": { "Value": 1 }, "Height": { "Value": 50 } }
    }))
}

fn live_appearance() -> String {
    encode_payload(json!({
        "FileVersion": 1,
        "Customize": { "Race": { "Value": 6 }, "Clan": { "Value": 12 }, "Height": { "Value": 90 } }
    }))
}

const TEXTURE: [u8; 1024] = [0x41; 1024];
const MODEL: &[u8] = b"model-bytes";
const BODY_SCALE: &str = "eyJzY2FsZSI6MS4xfQ==";
const TITLE: &str = "eyJ0aXRsZSI6IkhlcmEifQ==";

fn test_apply_config() -> ApplyConfig {
    ApplyConfig {
        max_concurrent_applies: 2,
        staging_timeout_ms: 2_000,
        draw_timeout_ms: 2_000,
        revert_delay_ms: 0,
        ..Default::default()
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    store: Arc<FileCacheStore>,
    host: Arc<MockHost>,
    bus: MessageBus,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = root.join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("texture.bin"), TEXTURE).unwrap();
        std::fs::write(cache.join("model.bin"), MODEL).unwrap();

        let store = Arc::new(
            FileCacheStore::open(CacheConfig::new(cache.clone(), root.join("file_cache.json"))).unwrap(),
        );
        store.scan_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(store.len(), 2);

        Self {
            _dir: dir,
            root,
            store,
            host: Arc::new(MockHost::default()),
            bus: MessageBus::new(),
        }
    }

    fn staging(&self) -> Utf8PathBuf {
        self.root.join("staging")
    }

    fn staged_count(&self) -> usize {
        std::fs::read_dir(self.staging())
            .map(|dir| dir.count())
            .unwrap_or(0)
    }

    fn builder(&self) -> ArchiveBuilder {
        ArchiveBuilder::new(Arc::clone(&self.store), 3)
    }

    fn loader(&self) -> ArchiveLoader {
        ArchiveLoader::new(self.staging())
    }

    fn orchestrator_with(&self, services: ServiceSet, config: ApplyConfig) -> ApplyOrchestrator {
        ApplyOrchestrator::new(
            services,
            self.loader(),
            self.bus.clone(),
            config,
            CancellationToken::new(),
        )
    }

    fn orchestrator(&self) -> ApplyOrchestrator {
        self.orchestrator_with(self.host.services(), test_apply_config())
    }

    fn snapshot(&self) -> CharacterSnapshot {
        let mut snapshot = CharacterSnapshot::new(archive_appearance())
            .with_replacement(FileReplacement::content(
                hash_bytes(&TEXTURE),
                vec!["chara/a.tex".into()],
            ))
            .with_replacement(FileReplacement::content(
                hash_bytes(MODEL),
                vec!["chara/b.mdl".into()],
            ))
            .with_replacement(FileReplacement::swap(vec!["chara/c.tex".into()], "chara/d.tex"));
        snapshot.body_scale_payload = Some(BODY_SCALE.into());
        snapshot.title = Some(TITLE.into());
        snapshot.manipulation_data = vec![1, 2, 3];
        snapshot
    }

    async fn export(&self, name: &str) -> LoadedArchive {
        let dest = self.root.join(name);
        self.builder()
            .export("test", &self.snapshot(), dest.clone())
            .await
            .unwrap();
        self.loader().read_header(&dest).unwrap()
    }
}

fn minion() -> TargetRef {
    TargetRef::new(1, "Minion", 201)
}

#[tokio::test]
async fn test_export_then_extract_round_trip() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;

    let descriptor = &archive.descriptor;
    assert_eq!(descriptor.description, "test");
    assert_eq!(descriptor.version, mcdf_format::CURRENT_VERSION);
    assert_eq!(descriptor.files.len(), 2);
    assert_eq!(descriptor.files[0].length, 1024);
    assert_eq!(descriptor.files[0].game_paths, vec!["chara/a.tex".to_string()]);
    assert_eq!(descriptor.file_swaps.len(), 1);
    assert_eq!(descriptor.body_scale_payload(), Some(BODY_SCALE));
    assert_eq!(descriptor.title_payload(), Some(TITLE));
    assert_eq!(descriptor.manipulation_data, vec![1, 2, 3]);
    assert_eq!(archive.expected_bytes, 1024 + MODEL.len() as u64);

    let staged = fx
        .loader()
        .extract(&archive, "owner", &CancellationToken::new())
        .unwrap();
    assert_eq!(std::fs::read(&staged.mappings["chara/a.tex"]).unwrap(), TEXTURE);
    assert_eq!(std::fs::read(&staged.mappings["chara/b.mdl"]).unwrap(), MODEL);
    assert!(!staged.mappings.contains_key("chara/c.tex"));
    assert!(!fx.root.join("look.mcdf.tmp").exists());
}

#[tokio::test]
async fn test_identical_sources_share_one_record() {
    let fx = Fixture::new().await;
    let hash = hash_bytes(&TEXTURE);
    let snapshot = CharacterSnapshot::new("")
        .with_replacement(FileReplacement::content(hash.clone(), vec!["chara/a.tex".into()]))
        .with_replacement(FileReplacement::content(
            hash.clone(),
            vec!["chara/a2.tex".into(), "chara/a.tex".into()],
        ));

    let descriptor = fx.builder().build("dup", &snapshot).unwrap();
    assert_eq!(descriptor.files.len(), 1);
    assert_eq!(
        descriptor.files[0].game_paths,
        vec!["chara/a.tex".to_string(), "chara/a2.tex".to_string()]
    );
    assert_eq!(descriptor.expected_body_len(), 1024);
}

#[tokio::test]
async fn test_unknown_hash_is_missing_source() {
    let fx = Fixture::new().await;
    let snapshot = CharacterSnapshot::new("").with_replacement(FileReplacement::content(
        "0".repeat(40),
        vec!["chara/missing.tex".into()],
    ));
    let dest = fx.root.join("missing.mcdf");

    let err = fx
        .builder()
        .export("missing", &snapshot, dest.clone())
        .await
        .unwrap_err();
    match err {
        Error::MissingSourceFile { game_paths, .. } => {
            assert_eq!(game_paths, vec!["chara/missing.tex".to_string()])
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_source_changed_before_save_leaves_no_file() {
    let fx = Fixture::new().await;
    let builder = fx.builder();
    let descriptor = builder.build("changed", &fx.snapshot()).unwrap();
    std::fs::write(fx.root.join("cache").join("texture.bin"), b"shorter").unwrap();

    let dest = fx.root.join("changed.mcdf");
    let err = builder.save(&descriptor, &dest).unwrap_err();
    assert!(matches!(err, Error::MissingSourceFile { .. }));
    assert!(!dest.exists());
    assert!(!Utf8Path::new(&format!("{dest}.tmp")).exists());
}

#[tokio::test]
async fn test_body_one_byte_short_is_end_of_stream() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let mut raw = zstd::decode_all(std::fs::File::open(&archive.path).unwrap()).unwrap();
    raw.pop();
    let short = fx.root.join("short.mcdf");
    std::fs::write(&short, zstd::encode_all(raw.as_slice(), 3).unwrap()).unwrap();

    let loader = fx.loader();
    let reread = loader.read_header(&short).unwrap();
    assert_eq!(reread.descriptor, archive.descriptor);

    let err = loader
        .extract(&reread, "owner", &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_end_of_stream(), "{err}");
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_truncated_archive_fails_and_cleans_up() {
    let fx = Fixture::new().await;
    let archive = fx.export("cut.mcdf").await;
    let len = std::fs::metadata(&archive.path).unwrap().len();
    std::fs::OpenOptions::new()
        .write(true)
        .open(&archive.path)
        .unwrap()
        .set_len(len - 1)
        .unwrap();

    let loader = fx.loader();
    let err = loader
        .read_header(&archive.path)
        .and_then(|reread| loader.extract(&reread, "owner", &CancellationToken::new()))
        .unwrap_err();
    assert!(err.is_end_of_stream(), "{err}");
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_apply_then_revert_restores_everything() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    fx.host
        .appearance
        .lock()
        .unwrap()
        .insert(target.id, live_appearance());
    let mut phases = fx.bus.subscribe(&[MessageKind::PhaseChanged]);
    let mut redraws = fx.bus.subscribe(&[MessageKind::Redraw]);

    orchestrator
        .apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(orchestrator.phase(target.id), ApplyPhase::Applied);
    assert_eq!(orchestrator.handled_targets().await, vec![target.clone()]);
    assert!(!orchestrator.is_working());
    assert_eq!(fx.host.live_collections(), 1);
    assert_eq!(fx.host.appearance_of(&target), Some(archive_appearance()));
    assert_eq!(fx.host.body_scale.lock().unwrap()[&target.id], BODY_SCALE);
    assert_eq!(fx.host.titles.lock().unwrap()[&target.id], TITLE);

    let mappings = fx.host.mappings.lock().unwrap().clone();
    assert_eq!(mappings["chara/c.tex"], "chara/d.tex");
    assert_eq!(std::fs::read(&mappings["chara/a.tex"]).unwrap(), TEXTURE);
    assert_eq!(fx.staged_count(), 2);

    let seen: Vec<ApplyPhase> = phases
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            Message::PhaseChanged { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(seen, vec![ApplyPhase::Staged, ApplyPhase::Applied]);
    assert_eq!(redraws.drain().len(), 2);

    assert!(orchestrator.revert(target.id).await.unwrap());
    assert_eq!(orchestrator.phase(target.id), ApplyPhase::Idle);
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.host.appearance_of(&target), Some(live_appearance()));
    assert!(fx.host.body_scale.lock().unwrap().is_empty());
    assert!(fx.host.titles.lock().unwrap().is_empty());
    assert_eq!(fx.staged_count(), 0);

    assert!(!orchestrator.revert(target.id).await.unwrap());
    assert!(orchestrator.handled_targets().await.is_empty());
}

#[tokio::test]
async fn test_second_apply_reverts_first() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    fx.host
        .appearance
        .lock()
        .unwrap()
        .insert(target.id, live_appearance());
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        orchestrator
            .apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &cancel)
            .await
            .unwrap();
    }

    assert_eq!(fx.host.count("create_collection"), 2);
    assert_eq!(fx.host.count("remove_collection"), 1);
    assert_eq!(fx.host.live_collections(), 1);

    let calls = fx.host.calls.lock().unwrap().clone();
    let removed_at = calls.iter().position(|c| *c == "remove_collection").unwrap();
    let second_create = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == "create_collection")
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(removed_at < second_create);
    // The appearance from before the first apply is kept for the whole chain.
    assert_eq!(fx.host.count("get_appearance"), 1);

    assert_eq!(orchestrator.remove_all().await.unwrap(), 1);
    assert_eq!(fx.host.appearance_of(&target), Some(live_appearance()));
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_concurrent_applies_to_one_target_serialize() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        orchestrator.apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &cancel),
        orchestrator.apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &cancel),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(orchestrator.handled_targets().await.len(), 1);
    assert_eq!(fx.host.live_collections(), 1);
}

#[tokio::test]
async fn test_failure_mid_pipeline_cleans_up() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    fx.host.fail_on("set_file_mappings");
    let mut notifications = fx.bus.subscribe(&[MessageKind::Notification]);

    let err = orchestrator
        .apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Service { .. }));
    assert!(orchestrator.handled_targets().await.is_empty());
    assert_eq!(orchestrator.phase(target.id), ApplyPhase::Idle);
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.host.count("apply_appearance"), 0);
    assert_eq!(fx.staged_count(), 0);

    let published = notifications.drain();
    assert_eq!(published.len(), 1);
    assert!(matches!(
        &published[0],
        Message::Notification { severity: Severity::Error, .. }
    ));
}

#[tokio::test]
async fn test_redraw_timeout_fails_the_apply() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    *fx.host.draw_delay.lock().unwrap() = Duration::from_secs(5);
    let config = ApplyConfig {
        draw_timeout_ms: 50,
        ..test_apply_config()
    };
    let orchestrator = fx.orchestrator_with(fx.host.services(), config);
    let target = minion();

    let err = orchestrator
        .apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TimedOut { step: "draw completion", .. }));
    assert_eq!(fx.host.live_collections(), 0);
    assert!(fx.host.appearance_of(&target).is_none());
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator
        .apply_archive(&minion(), &archive, ApplicationKind::EntireAppearance, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(fx.host.calls.lock().unwrap().is_empty());
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_title_failure_is_not_fatal() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    fx.host.fail_on("set_title");

    orchestrator
        .apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(orchestrator.phase(target.id), ApplyPhase::Applied);

    orchestrator.revert(target.id).await.unwrap();
    assert_eq!(fx.host.count("clear_title"), 0);
}

#[tokio::test]
async fn test_preserve_race_merges_live_traits() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    fx.host
        .appearance
        .lock()
        .unwrap()
        .insert(target.id, live_appearance());

    orchestrator
        .apply_archive(&target, &archive, ApplicationKind::PreserveRace, &CancellationToken::new())
        .await
        .unwrap();

    let applied = decode_payload(&fx.host.appearance_of(&target).unwrap());
    assert_eq!(applied["Customize"]["Race"]["Value"], 6);
    assert_eq!(applied["Customize"]["Clan"]["Value"], 12);
    assert_eq!(applied["Customize"]["Height"]["Value"], 50);
    assert_eq!(applied["Equipment"]["Body"]["ItemId"], 7);
}

#[tokio::test]
async fn test_partial_kinds_touch_only_their_services() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    let cancel = CancellationToken::new();

    orchestrator
        .apply_archive(&target, &archive, ApplicationKind::OnlyCustomizeData, &cancel)
        .await
        .unwrap();
    assert_eq!(fx.host.count("set_body_scale"), 1);
    assert_eq!(fx.host.count("create_collection"), 0);
    assert_eq!(fx.host.count("apply_appearance"), 0);
    assert_eq!(fx.host.count("trigger_redraw"), 0);
    assert_eq!(fx.staged_count(), 0);

    orchestrator
        .apply_archive(&target, &archive, ApplicationKind::OnlyModData, &cancel)
        .await
        .unwrap();
    assert_eq!(fx.host.count("create_collection"), 1);
    assert_eq!(fx.host.count("apply_appearance"), 0);
    assert_eq!(fx.host.count("set_title"), 0);
    assert_eq!(orchestrator.pending_kind(target.id).await, Some(ApplicationKind::OnlyModData));
}

#[tokio::test]
async fn test_missing_body_scale_is_reset() {
    let fx = Fixture::new().await;
    let snapshot = CharacterSnapshot::new(archive_appearance());
    let dest = fx.root.join("plain.mcdf");
    fx.builder().export("plain", &snapshot, dest.clone()).await.unwrap();
    let archive = fx.loader().read_header(&dest).unwrap();
    let target = minion();

    fx.orchestrator()
        .apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        fx.host.body_scale.lock().unwrap()[&target.id],
        crate::orchestrator::EMPTY_BODY_SCALE
    );
}

#[tokio::test]
async fn test_standalone_payload_request() {
    let fx = Fixture::new().await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    let payload = archive_appearance();

    orchestrator
        .apply_request(&target, &payload, ApplicationKind::OnlyGlamourerData, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fx.host.appearance_of(&target), Some(payload));
    assert_eq!(fx.host.count("create_collection"), 0);

    orchestrator.revert(target.id).await.unwrap();
    assert!(fx.host.appearance_of(&target).is_none());
}

#[tokio::test]
async fn test_standalone_payload_needs_appearance_service() {
    let fx = Fixture::new().await;
    let services = ServiceSet::default().with_mods(fx.host.clone());
    let orchestrator = fx.orchestrator_with(services, test_apply_config());

    let err = orchestrator
        .apply_standalone_payload(&minion(), "e30=", ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable("appearance")));
}

#[tokio::test]
async fn test_unreadable_archive_request_is_reported() {
    let fx = Fixture::new().await;
    let orchestrator = fx.orchestrator();
    let mut notifications = fx.bus.subscribe(&[MessageKind::Notification]);
    let path = fx.root.join("nope.MCDF");

    let err = orchestrator
        .apply_request(&minion(), path.as_str(), ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Format(_)));
    assert_eq!(notifications.drain().len(), 1);
    assert!(fx.host.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_all_reverts_every_target() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let cancel = CancellationToken::new();
    let first = TargetRef::new(1, "Minion", 201);
    let second = TargetRef::new(2, "Pet", 202);

    let (a, b) = tokio::join!(
        orchestrator.apply_archive(&first, &archive, ApplicationKind::EntireAppearance, &cancel),
        orchestrator.apply_archive(&second, &archive, ApplicationKind::EntireAppearance, &cancel),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(orchestrator.handled_targets().await, vec![first, second]);
    assert_eq!(fx.host.live_collections(), 2);

    assert_eq!(orchestrator.remove_all().await.unwrap(), 2);
    assert!(orchestrator.handled_targets().await.is_empty());
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_remove_all_with_racing_apply_keeps_original_look() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let cancel = CancellationToken::new();
    let first = TargetRef::new(1, "Minion", 201);
    let second = TargetRef::new(2, "Pet", 202);
    for target in [&first, &second] {
        fx.host
            .appearance
            .lock()
            .unwrap()
            .insert(target.id, live_appearance());
        orchestrator
            .apply_archive(target, &archive, ApplicationKind::EntireAppearance, &cancel)
            .await
            .unwrap();
    }
    *fx.host.draw_delay.lock().unwrap() = Duration::from_millis(50);

    // Re-apply to the second target while the first one is being reverted.
    let (removed, raced) = tokio::join!(orchestrator.remove_all(), async {
        while fx.host.count("revert_appearance") == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        orchestrator
            .apply_archive(&second, &archive, ApplicationKind::EntireAppearance, &cancel)
            .await
    });
    assert_eq!(removed.unwrap(), 2);
    raced.unwrap();
    assert!(orchestrator.handled_targets().await.is_empty());

    orchestrator.remove_all().await.unwrap();
    assert_eq!(fx.host.appearance_of(&first), Some(live_appearance()));
    assert_eq!(fx.host.appearance_of(&second), Some(live_appearance()));
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_applies_respect_concurrency_limit() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let cancel = CancellationToken::new();
    *fx.host.draw_delay.lock().unwrap() = Duration::from_millis(200);
    let targets: Vec<TargetRef> = (1..=4)
        .map(|id| TargetRef::new(id, format!("Target {id}"), 200 + id as u16))
        .collect();

    let (a, b, c, d) = tokio::join!(
        orchestrator.apply_archive(&targets[0], &archive, ApplicationKind::EntireAppearance, &cancel),
        orchestrator.apply_archive(&targets[1], &archive, ApplicationKind::EntireAppearance, &cancel),
        orchestrator.apply_archive(&targets[2], &archive, ApplicationKind::EntireAppearance, &cancel),
        orchestrator.apply_archive(&targets[3], &archive, ApplicationKind::EntireAppearance, &cancel),
    );
    for result in [a, b, c, d] {
        result.unwrap();
    }

    assert_eq!(fx.host.peak_drawing.load(Ordering::SeqCst), 2);
    assert_eq!(orchestrator.handled_targets().await, targets);
    assert!(!orchestrator.is_working());
}

#[tokio::test]
async fn test_queued_requests_do_not_block_other_targets() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let busy = TargetRef::new(1, "Minion", 201);
    let other = TargetRef::new(2, "Pet", 202);
    fx.host
        .slow_draws
        .lock()
        .unwrap()
        .insert(busy.id, Duration::from_secs(5));
    let busy_cancel = CancellationToken::new();

    let (running, queued, unrelated) = tokio::join!(
        orchestrator.apply_archive(&busy, &archive, ApplicationKind::EntireAppearance, &busy_cancel),
        orchestrator.apply_archive(&busy, &archive, ApplicationKind::EntireAppearance, &busy_cancel),
        async {
            let result = tokio::time::timeout(
                Duration::from_secs(2),
                orchestrator.apply_archive(
                    &other,
                    &archive,
                    ApplicationKind::EntireAppearance,
                    &CancellationToken::new(),
                ),
            )
            .await;
            fx.host.slow_draws.lock().unwrap().clear();
            busy_cancel.cancel();
            result
        },
    );

    unrelated
        .expect("second target waited behind the queued request")
        .unwrap();
    assert!(running.unwrap_err().is_cancelled());
    assert!(queued.unwrap_err().is_cancelled());
    assert_eq!(orchestrator.handled_targets().await, vec![other]);
}

#[tokio::test]
async fn test_cancel_mid_pipeline_cleans_up() {
    let fx = Fixture::new().await;
    let archive = fx.export("look.mcdf").await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    fx.host
        .appearance
        .lock()
        .unwrap()
        .insert(target.id, live_appearance());
    *fx.host.draw_delay.lock().unwrap() = Duration::from_secs(5);
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(
        orchestrator.apply_archive(&target, &archive, ApplicationKind::EntireAppearance, &cancel),
        async {
            while fx.host.count("wait_for_draw") == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            *fx.host.draw_delay.lock().unwrap() = Duration::ZERO;
            cancel.cancel();
        },
    );

    assert!(result.unwrap_err().is_cancelled());
    assert!(orchestrator.handled_targets().await.is_empty());
    assert_eq!(orchestrator.phase(target.id), ApplyPhase::Idle);
    assert_eq!(fx.host.count("remove_collection"), 1);
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.host.appearance_of(&target), Some(live_appearance()));
    assert_eq!(fx.staged_count(), 0);
}

#[tokio::test]
async fn test_payload_with_nothing_to_apply_registers_nothing() {
    let fx = Fixture::new().await;
    let orchestrator = fx.orchestrator();
    let target = minion();
    let cancel = CancellationToken::new();

    for kind in [ApplicationKind::OnlyModData, ApplicationKind::OnlyCustomizeData] {
        orchestrator
            .apply_standalone_payload(&target, &archive_appearance(), kind, &cancel)
            .await
            .unwrap();
        assert!(orchestrator.handled_targets().await.is_empty());
        assert_eq!(orchestrator.pending_kind(target.id).await, None);
        assert_eq!(orchestrator.phase(target.id), ApplyPhase::Idle);
    }
    assert_eq!(fx.host.count("apply_appearance"), 0);
    assert_eq!(fx.host.count("set_body_scale"), 0);
    assert!(!orchestrator.revert(target.id).await.unwrap());
}

struct OutdatedTitles;

#[async_trait]
impl TitleService for OutdatedTitles {
    async fn query_version(&self) -> Result<ServiceVersion> {
        Ok(ServiceVersion::new(2, 9))
    }

    async fn set_title(&self, _target: &TargetRef, _payload: &str) -> Result<()> {
        unreachable!("disabled by the probe")
    }

    async fn clear_title(&self, _target: &TargetRef) -> Result<()> {
        unreachable!("disabled by the probe")
    }
}

#[tokio::test]
async fn test_probe_disables_outdated_services() {
    let host = Arc::new(MockHost::default());
    let services = host
        .services()
        .with_title(Arc::new(OutdatedTitles))
        .probe()
        .await;
    assert!(services.title.is_none());
    assert!(services.mods.is_some());
    assert!(services.appearance.is_some());
}

#[tokio::test]
async fn test_context_export_apply_shutdown() {
    let fx = Fixture::new().await;
    let config = LoaderConfig {
        cache: CacheConfig::new(fx.root.join("cache"), fx.root.join("file_cache.json")),
        staging_folder: fx.staging(),
        compression_level: 3,
        apply: test_apply_config(),
    };
    let context = McdfContext::new(config, fx.host.services()).await.unwrap();
    assert_eq!(context.store().len(), 2);
    let mut rescans = context.bus().subscribe(&[MessageKind::CacheRescanned]);
    context.scan().await.unwrap();
    assert_eq!(rescans.drain().len(), 1);

    let dest = fx.root.join("ctx.mcdf");
    context.export("ctx", &fx.snapshot(), dest.clone()).await.unwrap();
    let loaded = context.load(dest.clone()).await.unwrap();
    assert_eq!(loaded.descriptor.description, "ctx");

    let target = minion();
    context
        .apply(&target, dest.as_str(), ApplicationKind::EntireAppearance, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fx.host.live_collections(), 1);

    assert_eq!(context.shutdown().await.unwrap(), 1);
    assert_eq!(fx.host.live_collections(), 0);
    assert_eq!(fx.staged_count(), 0);
}
