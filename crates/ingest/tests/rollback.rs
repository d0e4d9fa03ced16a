use async_trait::async_trait;
use atomstore_chunker::ChunkerConfig;
use atomstore_ingest::{CancelToken, IngestError, IngestState, IngestionPipeline, PipelineConfig};
use atomstore_store::{
    AtomStore, Fingerprint, MemoryPayloadStore, PayloadStore, StoreConfig, StoreError,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BLOCK: usize = 512;

fn block(seed: u8) -> Vec<u8> {
    (0..BLOCK)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed.wrapping_mul(97)) ^ seed)
        .collect()
}

fn blocks(seeds: &[u8]) -> Vec<u8> {
    seeds.iter().flat_map(|&seed| block(seed)).collect()
}

#[derive(Clone, Copy)]
enum OnPut {
    Pass,
    Cancel,
    Fail,
    Hang,
}

/// Payload store that misbehaves from the n-th write on
struct Scripted {
    inner: MemoryPayloadStore,
    puts: AtomicUsize,
    from_put: usize,
    action: OnPut,
    token: CancelToken,
}

impl Scripted {
    fn new(from_put: usize, action: OnPut) -> Self {
        Self {
            inner: MemoryPayloadStore::new(),
            puts: AtomicUsize::new(0),
            from_put,
            action,
            token: CancelToken::new(),
        }
    }
}

#[async_trait]
impl PayloadStore for Scripted {
    async fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> atomstore_store::Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        let action = if n >= self.from_put {
            self.action
        } else {
            OnPut::Pass
        };
        match action {
            OnPut::Pass => {}
            OnPut::Cancel => self.token.cancel(),
            OnPut::Fail => return Err(StoreError::unavailable("disk full")),
            OnPut::Hang => std::future::pending::<()>().await,
        }
        self.inner.put(fingerprint, data).await
    }

    async fn get(&self, fingerprint: &Fingerprint) -> atomstore_store::Result<Vec<u8>> {
        self.inner.get(fingerprint).await
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> atomstore_store::Result<()> {
        self.inner.delete(fingerprint).await
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> atomstore_store::Result<bool> {
        self.inner.contains(fingerprint).await
    }

    async fn list(&self) -> atomstore_store::Result<Vec<Fingerprint>> {
        self.inner.list().await
    }
}

fn pipeline_over(payloads: Arc<Scripted>) -> IngestionPipeline {
    let chunker = ChunkerConfig {
        min_size: BLOCK,
        target_size: BLOCK,
        max_size: BLOCK,
        window_size: 16,
    };
    let store = AtomStore::new(StoreConfig::default(), payloads).expect("store");
    IngestionPipeline::new(chunker, Arc::new(store), PipelineConfig::default()).expect("pipeline")
}

async fn assert_nothing_recorded(pipeline: &IngestionPipeline) {
    assert_eq!(pipeline.file_count(), 0);
    let stats = pipeline.stats(None);
    assert_eq!(stats.total_files, 0);
    assert_eq!(stats.unique_atoms, 0);
    assert_eq!(stats.total_atoms, 0);

    let report = pipeline.verify().await;
    assert!(
        report.invariants.is_quiescent(),
        "invariants: {:?}",
        report.invariants
    );
    assert!(report.stats.is_clean(), "stats: {:?}", report.stats);
}

#[tokio::test]
async fn cancel_token_rolls_back_acquired_atoms() {
    let payloads = Arc::new(Scripted::new(2, OnPut::Cancel));
    let pipeline = pipeline_over(payloads.clone());

    let err = pipeline
        .ingest_bytes_cancellable("doomed", blocks(&[1, 2, 3, 4]), &payloads.token)
        .await
        .unwrap_err();
    match err {
        IngestError::Cancelled { filename, state } => {
            assert_eq!(filename, "doomed");
            assert_eq!(state, IngestState::StoreLookup);
        }
        other => panic!("expected cancellation, got {other}"),
    }

    assert_nothing_recorded(&pipeline).await;
    assert_eq!(pipeline.verify().await.invariants.orphans, 2);

    let gc = pipeline.collect_garbage().await.expect("gc");
    assert_eq!(gc.evicted.len(), 2);
    assert!(payloads.inner.is_empty());
    assert_eq!(pipeline.verify().await.invariants.atoms_checked, 0);
}

#[tokio::test]
async fn dropped_ingestion_leaves_no_pending_atoms() {
    let payloads = Arc::new(Scripted::new(3, OnPut::Hang));
    let pipeline = pipeline_over(payloads.clone());

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        pipeline.ingest_bytes("abandoned", blocks(&[1, 2, 3, 4])),
    )
    .await;
    assert!(outcome.is_err(), "the third write never finishes");

    // The half-written third atom is gone; the first two are orphans.
    let report = pipeline.verify().await.invariants;
    assert_eq!(report.atoms_checked, 2);
    assert_eq!(report.orphans, 2);
    assert!(pipeline.store().is_empty());
    assert_nothing_recorded(&pipeline).await;

    let gc = pipeline.collect_garbage().await.expect("gc");
    assert_eq!(gc.evicted.len(), 2);
    assert!(payloads.inner.is_empty());
}

#[tokio::test]
async fn failed_write_reports_the_state() {
    let payloads = Arc::new(Scripted::new(2, OnPut::Fail));
    let pipeline = pipeline_over(payloads);

    let err = pipeline
        .ingest_bytes("unlucky", blocks(&[1, 2, 3]))
        .await
        .unwrap_err();
    assert!(!err.is_user_visible());
    match err {
        IngestError::Failed { state, reason, .. } => {
            assert_eq!(state, IngestState::StoreLookup);
            assert!(reason.contains("disk full"), "{reason}");
        }
        other => panic!("expected failure, got {other}"),
    }
    assert_nothing_recorded(&pipeline).await;
}

#[tokio::test]
async fn failed_ingestion_keeps_shared_atoms_alive() {
    // Writes 1..=3 belong to the first file, the fourth fails.
    let payloads = Arc::new(Scripted::new(4, OnPut::Fail));
    let pipeline = pipeline_over(payloads);

    let kept = pipeline
        .ingest_bytes("kept", blocks(&[1, 2, 3]))
        .await
        .expect("first file");
    let before = pipeline.stats(None);

    let err = pipeline
        .ingest_bytes("shares-two", blocks(&[1, 2, 9]))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Failed { .. }));

    assert_eq!(pipeline.stats(None), before);
    for atom in &kept.atom_sequence {
        let stored = pipeline.store().get(&atom.fingerprint).expect("atom");
        assert_eq!(stored.usage_count, 1);
    }
    let report = pipeline.verify().await;
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(report.invariants.orphans, 0);
    assert!(pipeline.collect_garbage().await.expect("gc").evicted.is_empty());

    assert_eq!(
        pipeline.read_file(&kept.file_id).await.expect("read"),
        blocks(&[1, 2, 3])
    );
}
