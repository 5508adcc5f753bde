use plateshift_core::{
    Batch, BatchId, BatchRequest, BatchStatus, ErrorKind, NativeToolMode, Operation, OperationId,
    OperationKind, TransferConfig, TransferError, TransferMode, WorkerConfig,
};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_request_to_batch_leaves_sizes_unread() {
    let dir = TempDir::new().unwrap();
    let plate = dir.path().join("bg.0001.exr");
    fs::write(&plate, vec![0u8; 4096]).unwrap();

    let json = format!(
        r#"{{
            "operations": [
                {{"source": {src:?}, "destination": "/out/bg.0001.exr", "sequence_id": "bg"}},
                {{"source": "/nowhere/fg.0001.exr", "destination": "/out/fg.0001.exr"}}
            ]
        }}"#,
        src = plate.to_string_lossy()
    );
    let batch = BatchRequest::from_json(&json).unwrap().into_batch().unwrap();

    assert_eq!(batch.mode, TransferMode::Copy);
    assert_eq!(batch.status, BatchStatus::Pending);
    assert!(!batch.batch_id.as_str().is_empty());
    assert_eq!(batch.operations[0].size_bytes, 0);
    assert_eq!(batch.operations[0].kind, OperationKind::SequenceMember);
    assert_eq!(batch.operations[1].size_bytes, 0);
    assert_eq!(batch.operations[1].id, OperationId(1));
    assert_eq!(batch.total_bytes(), 0);
}

#[test]
fn test_malformed_request() {
    let err = BatchRequest::from_json(r#"{"operations": "nope"}"#).unwrap_err();
    assert!(matches!(err, TransferError::InvalidRequest { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let err = BatchRequest::from_json(
        r#"{"operations": [
            {"id": 3, "source": "/a", "destination": "/b", "size": 1},
            {"id": 3, "source": "/c", "destination": "/d", "size": 1}
        ]}"#,
    )
    .unwrap()
    .into_batch()
    .unwrap_err();
    assert!(err.to_string().contains("duplicate operation id"));
}

#[test]
fn test_sequences_stay_together() {
    let ops = vec![
        Operation::sequence_member(0, "/in/fg.0001.exr", "/out/fg.0001.exr", 1, "fg"),
        Operation::sequence_member(1, "/in/bg.0001.exr", "/out/bg.0001.exr", 1, "bg"),
        Operation::sequence_member(2, "/in/fg.0002.exr", "/out/fg.0002.exr", 1, "fg"),
        Operation::file(3, "/in/edit.mov", "/out/edit.mov", 1),
        Operation::sequence_member(4, "/in/bg.0002.exr", "/out/bg.0002.exr", 1, "bg"),
    ];
    let batch = Batch::new(BatchId::new("seq"), ops, TransferMode::Move).unwrap();

    let order: Vec<u64> = batch.scheduling_order().iter().map(|op| op.id.0).collect();
    assert_eq!(order, vec![0, 2, 1, 4, 3]);
    assert!(batch.operation(OperationId(3)).is_some_and(|op| !op.is_sequence_member()));
}

#[test]
fn test_config_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = TransferConfig::new().with_workers(WorkerConfig::new(8, 2));
    config.native_tool = NativeToolMode::Auto;
    config.progress_interval_ms = 100;
    fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let loaded = TransferConfig::load(&path).unwrap();
    assert_eq!(loaded.workers, WorkerConfig::new(8, 2));
    assert_eq!(loaded.native_tool, NativeToolMode::Auto);
    assert_eq!(loaded.progress_interval_ms, 100);
    assert_eq!(loaded.chunk_size, config.chunk_size);

    let defaults = TransferConfig::load(&dir.path().join("missing.toml")).unwrap();
    assert_eq!(defaults.workers, WorkerConfig::default());
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "chunk_size = 16\n").unwrap();

    let err = TransferConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    fs::write(&path, "[workers]\nmax_file_concurrency = 0\n").unwrap();
    assert!(TransferConfig::load(&path).is_err());
}

#[test]
fn test_stream_budget_guideline() {
    assert_eq!(WorkerConfig::default().stream_budget(), 16);
    assert!(!WorkerConfig::new(8, 8).exceeds_guideline());
    assert!(WorkerConfig::new(16, 8).exceeds_guideline());
}
