//! Integration tests for the import engine.
//!
//! Verifies:
//! - Full export → import round trip of files and tables
//! - Compatibility and integrity failures leave the target untouched
//! - Database restore resumes mid-chunk, including from a stale job record
//! - A failure partway through the swap rolls tables and files back
//! - Pause, cancel, operator rollback and backup discard
//! - Commented schemas, indexes and triggers survive import and rollback
//! - History pruning never drops a job that still holds backups

#![allow(clippy::too_many_lines)]

mod common;

use common::{CountingDb, drive_import, export_package, store_for};
use teleport_core::{AllowAll, Database, JobKind, Version, save_record};
use teleport_engine::{ImportEngine, JobStatus, PROGRESS_TABLE, Phase};
use teleport_test_helpers::{
    Workspace, corrupt_entry, patterned_bytes, read_tree, rewrite_manifest, seed_database,
    table_rows, write_tree,
};

fn seeded_package(ws: &Workspace) -> std::path::PathBuf {
    write_tree(
        &ws.source,
        &[
            ("a.txt", b"new a"),
            ("b.txt", b"new b"),
            ("blocked/x.txt", b"new x"),
            ("c.txt", &patterned_bytes(3000, 7)),
        ],
    );
    let db = ws.source_db();
    seed_database(&db);
    export_package(&ws.config(), &db, &ws.source)
}

/// Target state before import: an older `posts` table and two files.
fn prepare_target(ws: &Workspace, db: &dyn Database) {
    db.execute(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT, score REAL);
         INSERT INTO posts (id, title, body, score) VALUES (99, 'old', 'kept until swap', 0.5);",
    )
    .unwrap();
    write_tree(&ws.target, &[("a.txt", b"old a"), ("keep.txt", b"untouched")]);
}

// ---------------------------------------------------------------------------
// 1. Round trip
// ---------------------------------------------------------------------------

#[test]
fn round_trip_then_operator_rollback() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let source_db = ws.source_db();
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    let before_rows = table_rows(&target_db, "posts");
    let before_tree = read_tree(&ws.target);

    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Completed, "{view:?}");
    assert_eq!(view.progress, 100);
    assert_eq!(view.phase, Phase::Done.as_str());

    assert_eq!(table_rows(&target_db, "posts"), table_rows(&source_db, "posts"));
    assert!(target_db.table_exists("options").unwrap());
    let tree = read_tree(&ws.target);
    let source_tree = read_tree(&ws.source);
    for (path, bytes) in &source_tree {
        assert_eq!(tree.get(path), Some(bytes), "{path}");
    }
    assert_eq!(tree.get("keep.txt").map(Vec::as_slice), Some(&b"untouched"[..]));
    assert!(!config.staging_dir(&id).exists());

    // The progress marker is gone, backups remain until discarded.
    let job = engine.job(&id).unwrap();
    assert!(
        table_rows(&target_db, PROGRESS_TABLE)
            .iter()
            .all(|row| row.get("job_id") != Some(&teleport_core::SqlValue::Text(id.clone())))
    );
    assert!(job.backup_dir.join("a.txt").exists());

    let reverted = engine.rollback(&id).unwrap();
    assert_eq!(reverted.status, JobStatus::Cancelled);
    assert_eq!(table_rows(&target_db, "posts"), before_rows);
    assert!(!target_db.table_exists("options").unwrap());
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(engine.rollback(&id).is_err());
}

#[test]
fn discard_backups_blocks_rollback() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);

    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    assert_eq!(drive_import(&engine, &id).status, JobStatus::Completed);

    engine.discard_backups(&id).unwrap();
    let job = engine.job(&id).unwrap();
    assert!(job.backups_discarded);
    assert!(!job.backup_dir.exists());
    for backup in job.table_backups.values() {
        if let Some(shadow) = &backup.shadow {
            assert!(!target_db.table_exists(shadow).unwrap());
        }
    }
    assert!(engine.rollback(&id).is_err());
}

#[test]
fn commented_schema_round_trips() {
    let ws = Workspace::new();
    write_tree(&ws.source, &[("a.txt", b"x")]);
    let source_db = ws.source_db();
    source_db
        .execute(
            "CREATE TABLE notes (
               id INTEGER PRIMARY KEY, -- row id
               /* free text */ body TEXT DEFAULT '-- none'
             );
             INSERT INTO notes (id, body) VALUES (1, 'a'), (2, '-- b');",
        )
        .unwrap();
    let package = export_package(&ws.config(), &source_db, &ws.source);

    let target_db = ws.target_db();
    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Completed, "{view:?}");
    assert_eq!(table_rows(&target_db, "notes"), table_rows(&source_db, "notes"));

    target_db.execute("INSERT INTO notes (id) VALUES (3)").unwrap();
    let rows = table_rows(&target_db, "notes");
    assert_eq!(
        rows[2].get("body"),
        Some(&teleport_core::SqlValue::Text("-- none".into()))
    );
}

#[test]
fn indexes_survive_import_and_rollback() {
    let ws = Workspace::new();
    write_tree(&ws.source, &[("a.txt", b"new a")]);
    let source_db = ws.source_db();
    seed_database(&source_db);
    source_db
        .execute(
            "CREATE INDEX posts_title ON posts (title);
             CREATE TABLE audit (post_id INTEGER);
             CREATE TRIGGER posts_audit AFTER UPDATE ON posts
             BEGIN
               INSERT INTO audit (post_id) VALUES (new.id);
             END;",
        )
        .unwrap();
    let package = export_package(&ws.config(), &source_db, &ws.source);

    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    target_db
        .execute("CREATE UNIQUE INDEX posts_uniq ON posts (title);")
        .unwrap();

    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Completed, "{view:?}");

    let imported = target_db.table_dependents("posts").unwrap();
    assert_eq!(imported.len(), 2, "{imported:?}");
    assert!(imported[0].contains("posts_title"));
    assert!(imported[1].contains("posts_audit"));
    // Replayed inserts did not fire the trigger; a live update does.
    assert!(table_rows(&target_db, "audit").is_empty());
    target_db.execute("UPDATE posts SET score = 1 WHERE id = 1").unwrap();
    assert_eq!(table_rows(&target_db, "audit").len(), 1);

    engine.rollback(&id).unwrap();
    let restored = target_db.table_dependents("posts").unwrap();
    assert_eq!(restored.len(), 1, "{restored:?}");
    assert!(restored[0].contains("posts_uniq"));
    assert!(
        target_db
            .execute("INSERT INTO posts (title) VALUES ('old')")
            .is_err(),
        "unique index is enforced again"
    );
}

// ---------------------------------------------------------------------------
// 2. Rejections before any mutation
// ---------------------------------------------------------------------------

#[test]
fn incompatible_package_is_rejected_without_mutation() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    rewrite_manifest(&package, |m| {
        m.compatibility.min_importer_version = "2.0.0".into();
        m.compatibility.max_importer_version = "2.x".into();
    });
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    let before_tree = read_tree(&ws.target);
    let counting = CountingDb::new(&target_db);

    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &counting, &store, &AllowAll)
        .with_importer_version(Version::new(3, 0, 0));
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.last_error_code.as_deref(), Some("IMPORTER_TOO_NEW"));
    assert!(!view.retryable);
    assert_eq!(counting.writes(), 0);
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(!config.staging_dir(&id).exists());
    assert!(!engine.job(&id).unwrap().critical_phase_entered);
}

#[test]
fn corrupted_chunk_fails_before_staging() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    corrupt_entry(&package, "chunks/fs-000003.bin");
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    let before_tree = read_tree(&ws.target);
    let counting = CountingDb::new(&target_db);

    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &counting, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.phase, Phase::ParseManifest.as_str());
    assert_eq!(view.last_error_code.as_deref(), Some("CHECKSUM_MISMATCH"));
    assert_eq!(counting.writes(), 0);
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(!config.staging_dir(&id).exists());
}

#[test]
fn unsigned_package_rejected_when_key_is_trusted() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll)
        .with_trusted_key("bm90IGEga2V5");
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.last_error_code.as_deref(), Some("SIGNATURE_INVALID"));
}

#[test]
fn start_rejects_missing_archive() {
    let ws = Workspace::new();
    let target_db = ws.target_db();
    let config = ws.config();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let err = engine
        .start(&ws.dir.path().join("nope.zip"), &ws.target)
        .unwrap_err();
    assert_eq!(err.code(), "PACKAGE_NOT_FOUND");
    assert!(engine.list().unwrap().is_empty());
}

#[test]
fn environment_mismatch_is_reported() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    let mut config = ws.config();
    config.environment.table_prefix = "wp_".into();
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.phase, Phase::ValidateEnvironment.as_str());
    assert_eq!(view.last_error_code.as_deref(), Some("TABLE_PREFIX_MISMATCH"));
    assert!(!engine.job(&id).unwrap().critical_phase_entered);
    assert!(!config.staging_dir(&id).exists());
}

// ---------------------------------------------------------------------------
// 3. Restore resumption
// ---------------------------------------------------------------------------

fn advance_until(engine: &ImportEngine<'_>, id: &str, done: impl Fn(&teleport_engine::ImportJob) -> bool) {
    for _ in 0..10_000 {
        let job = engine.job(id).unwrap();
        if done(&job) {
            return;
        }
        assert_eq!(job.status, JobStatus::Running, "{:?}", job.last_error);
        engine.advance(id).unwrap();
    }
    panic!("condition never reached");
}

#[test]
fn restore_resumes_after_partial_batches() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let source_db = ws.source_db();
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);

    let mut config = ws.config();
    config.statements_per_batch = 2;
    config.batch_max_items = 1;
    let store = store_for(&config);
    let id = {
        let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
        let id = engine.start(&package, &ws.target).unwrap().id;
        advance_until(&engine, &id, |job| job.checkpoints.restore.statements >= 2);
        let job = engine.job(&id).unwrap();
        assert_eq!(job.phase, Phase::RestoreDatabase);
        assert_eq!(job.checkpoints.restore.statements, 2);
        assert!(job.critical_phase_entered);
        id
    };

    // A fresh engine picks the job up from its record alone.
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Completed, "{view:?}");
    assert_eq!(table_rows(&target_db, "posts"), table_rows(&source_db, "posts"));
    assert_eq!(view.counts.statements, 9);
}

#[test]
fn stale_record_adopts_database_progress() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let source_db = ws.source_db();
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);

    let mut config = ws.config();
    config.statements_per_batch = 2;
    config.batch_max_items = 1;
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;

    advance_until(&engine, &id, |job| job.checkpoints.restore.statements >= 4);
    let stale = engine.job(&id).unwrap();
    assert_eq!(stale.phase, Phase::RestoreDatabase);
    engine.advance(&id).unwrap();
    assert!(engine.job(&id).unwrap().checkpoints.restore.statements > 4);

    // Simulate a crash between the database commit and the record write.
    save_record(&store, JobKind::Import, &id, &stale).unwrap();

    let view = drive_import(&engine, &id);
    assert_eq!(view.status, JobStatus::Completed, "{view:?}");
    assert_eq!(table_rows(&target_db, "posts"), table_rows(&source_db, "posts"));
    let report = engine.report(&id).unwrap();
    assert!(report.log.iter().any(|e| e.code == "TP-IMP-DB-ADOPT"));
}

// ---------------------------------------------------------------------------
// 4. Rollback from the swap phase
// ---------------------------------------------------------------------------

#[test]
fn failed_swap_rolls_back_tables_and_files() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    // A plain file where the package expects the `blocked/` directory.
    write_tree(&ws.target, &[("blocked", b"i am a file")]);
    let before_rows = table_rows(&target_db, "posts");
    let before_tree = read_tree(&ws.target);

    let mut config = ws.config();
    config.max_retries = 0;
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    let view = drive_import(&engine, &id);

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.last_error_code.as_deref(), Some("RETRIES_EXHAUSTED"));
    let job = engine.job(&id).unwrap();
    assert_eq!(job.phase, Phase::Rollback);
    assert!(job.rollback.complete);
    assert_eq!(job.rollback.attempts, 1);
    let swapped: Vec<&str> = job
        .file_backups
        .iter()
        .filter(|b| b.swapped)
        .map(|b| b.target.as_str())
        .collect();
    assert_eq!(swapped, vec!["a.txt", "b.txt"]);
    assert!(job.file_backups.iter().all(|b| b.restored));

    assert_eq!(table_rows(&target_db, "posts"), before_rows);
    assert!(!target_db.table_exists("options").unwrap());
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(
        target_db
            .list_tables()
            .unwrap()
            .iter()
            .all(|t| !t.starts_with("_tp_shadow_"))
    );
    assert!(!config.staging_dir(&id).exists());

    let report = engine.report(&id).unwrap();
    assert!(report.log.iter().any(|e| e.code == "TP-IMP-ROLLBACK-DONE"));
    assert!(engine.rollback(&id).is_err());
}

// ---------------------------------------------------------------------------
// 5. Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn pause_holds_and_cancel_before_critical_leaves_target() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    let before_tree = read_tree(&ws.target);

    let mut config = ws.config();
    config.batch_max_items = 1;
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    engine.advance(&id).unwrap();

    let paused = engine.pause(&id).unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    let held = engine.advance(&id).unwrap();
    assert_eq!(held.counts, paused.counts);
    assert_eq!(held.phase, paused.phase);

    engine.resume(&id).unwrap();
    advance_until(&engine, &id, |job| job.phase == Phase::ValidateEnvironment);
    assert!(config.staging_dir(&id).exists());

    let cancelled = engine.cancel(&id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(!config.staging_dir(&id).exists());
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(engine.cancel(&id).is_err());
}

#[test]
fn cancel_after_critical_rolls_back() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    let before_rows = table_rows(&target_db, "posts");
    let before_tree = read_tree(&ws.target);

    let mut config = ws.config();
    config.batch_max_items = 1;
    config.statements_per_batch = 3;
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    advance_until(&engine, &id, |job| job.phase == Phase::SwapFiles && job.checkpoints.swap.next_file > 0);

    let view = engine.cancel(&id).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert_eq!(table_rows(&target_db, "posts"), before_rows);
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(engine.job(&id).unwrap().rollback.complete);
}

#[test]
fn cancel_mid_swap_removes_created_directories() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);
    std::fs::create_dir_all(ws.target.join("already/empty")).unwrap();
    let before_tree = read_tree(&ws.target);

    let mut config = ws.config();
    config.batch_max_items = 1;
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let id = engine.start(&package, &ws.target).unwrap().id;
    advance_until(&engine, &id, |job| job.checkpoints.swap.next_file >= 3);
    assert!(ws.target.join("blocked/x.txt").is_file());
    let job = engine.job(&id).unwrap();
    let blocked = job
        .file_backups
        .iter()
        .find(|b| b.target == "blocked/x.txt")
        .unwrap();
    assert_eq!(blocked.created_dirs, vec!["blocked".to_string()]);

    engine.cancel(&id).unwrap();
    assert_eq!(read_tree(&ws.target), before_tree);
    assert!(!ws.target.join("blocked").exists());
    assert!(ws.target.join("already/empty").is_dir());
}

// ---------------------------------------------------------------------------
// 6. History
// ---------------------------------------------------------------------------

#[test]
fn history_keeps_imports_that_hold_backups() {
    let ws = Workspace::new();
    let package = seeded_package(&ws);
    let target_db = ws.target_db();
    prepare_target(&ws, &target_db);

    let mut config = ws.config();
    config.history_limit = 1;
    let store = store_for(&config);
    let engine = ImportEngine::new(&config, &target_db, &store, &AllowAll);
    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = engine.start(&package, &ws.target).unwrap().id;
        assert_eq!(drive_import(&engine, &id).status, JobStatus::Completed);
        ids.push(id);
    }
    assert_eq!(engine.list().unwrap().len(), 3);
    assert!(ids.iter().all(|id| engine.job(id).unwrap().holds_backups()));

    engine.discard_backups(&ids[0]).unwrap();
    engine.discard_backups(&ids[1]).unwrap();
    let fourth = engine.start(&package, &ws.target).unwrap().id;
    let left: Vec<String> = engine.list().unwrap().into_iter().map(|v| v.id).collect();
    assert_eq!(left.len(), 3, "{left:?}");
    assert!(left.contains(&ids[2]));
    assert!(left.contains(&fourth));

    // Every shadow table left in the database belongs to a job on record.
    let tracked: Vec<String> = left
        .iter()
        .flat_map(|id| {
            engine
                .job(id)
                .unwrap()
                .table_backups
                .into_values()
                .filter_map(|b| b.shadow)
        })
        .collect();
    for table in target_db.list_tables().unwrap() {
        if table.starts_with("_tp_shadow_") {
            assert!(tracked.contains(&table), "{table} has no job record");
        }
    }
    assert!(engine.job(&ids[2]).unwrap().backup_dir.exists());
}
