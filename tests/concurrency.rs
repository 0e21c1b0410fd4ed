//! Capture-policy properties: batch overlap, fairness, and the
//! non-blocking variants.

use capsule_fs::capture::{AccessProvider, ReadPriorityCapture, WritePriorityCapture};
use capsule_fs::{Capsule, CapsuleError, FileSystemReader, FileSystemWriter, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::sleep;

/// Provider with unit contexts; the coordinators never look inside.
struct UnitProvider;

impl AccessProvider for UnitProvider {
    type Read = ();
    type Write = ();

    fn read_context(&self) -> Result<()> {
        Ok(())
    }

    fn write_context(&self) -> Result<()> {
        Ok(())
    }
}

/// Tracks the highest number of simultaneous holders observed.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn active(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

const WORK: Duration = Duration::from_millis(300);
const GAP: Duration = Duration::from_millis(80);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_priority_late_readers_overtake_queued_writer() {
    let coordinator = Arc::new(ReadPriorityCapture::new(UnitProvider));
    let readers = Arc::new(Gauge::default());
    let writers = Arc::new(Gauge::default());
    let readers_seen_by_writer = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&readers);
        tasks.push(tokio::spawn(async move {
            c.capture_read(|_| async {
                g.enter();
                sleep(WORK).await;
                g.exit();
                Ok(())
            })
            .await
        }));
    }
    sleep(GAP).await;

    let writer_task = {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&writers);
        let r = Arc::clone(&readers);
        let seen = Arc::clone(&readers_seen_by_writer);
        tokio::spawn(async move {
            c.capture_write(|_| async {
                g.enter();
                seen.store(r.active(), Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                g.exit();
                Ok(())
            })
            .await
        })
    };
    sleep(GAP).await;

    for _ in 0..50 {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&readers);
        tasks.push(tokio::spawn(async move {
            c.capture_read(|_| async {
                g.enter();
                sleep(WORK).await;
                g.exit();
                Ok(())
            })
            .await
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    writer_task.await.unwrap().unwrap();

    // Late readers join the running batch, so all 100 overlap and the
    // writer runs strictly after them, alone.
    assert_eq!(readers.peak(), 100);
    assert_eq!(writers.peak(), 1);
    assert_eq!(readers_seen_by_writer.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_priority_queued_writer_blocks_late_readers() {
    let coordinator = Arc::new(WritePriorityCapture::new(UnitProvider));
    let readers = Arc::new(Gauge::default());
    let writers = Arc::new(Gauge::default());
    let readers_seen_by_writer = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&readers);
        tasks.push(tokio::spawn(async move {
            c.capture_read(|_| async {
                g.enter();
                sleep(WORK).await;
                g.exit();
                Ok(())
            })
            .await
        }));
    }
    sleep(GAP).await;

    let writer_task = {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&writers);
        let r = Arc::clone(&readers);
        let seen = Arc::clone(&readers_seen_by_writer);
        tokio::spawn(async move {
            c.capture_write(|_| async {
                g.enter();
                seen.store(r.active(), Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                g.exit();
                Ok(())
            })
            .await
        })
    };
    sleep(GAP).await;

    for _ in 0..50 {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&readers);
        tasks.push(tokio::spawn(async move {
            c.capture_read(|_| async {
                g.enter();
                sleep(WORK).await;
                g.exit();
                Ok(())
            })
            .await
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    writer_task.await.unwrap().unwrap();

    // Late readers queue behind the writer, so only the first batch ever
    // overlaps; the writer still runs alone.
    assert_eq!(readers.peak(), 50);
    assert_eq!(writers.peak(), 1);
    assert_eq!(readers_seen_by_writer.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_readers_all_overlap() {
    let coordinator = Arc::new(ReadPriorityCapture::new(UnitProvider));
    let readers = Arc::new(Gauge::default());

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let c = Arc::clone(&coordinator);
        let g = Arc::clone(&readers);
        tasks.push(tokio::spawn(async move {
            c.capture_read(|_| async {
                g.enter();
                sleep(Duration::from_millis(150)).await;
                g.exit();
                Ok(())
            })
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(readers.peak(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writers_are_mutually_exclusive() {
    for policy in 0..2 {
        let writers = Arc::new(Gauge::default());
        let mut tasks: Vec<tokio::task::JoinHandle<Result<()>>> = Vec::new();
        if policy == 0 {
            let c = Arc::new(ReadPriorityCapture::new(UnitProvider));
            for _ in 0..10 {
                let c = Arc::clone(&c);
                let g = Arc::clone(&writers);
                tasks.push(tokio::spawn(async move {
                    c.capture_write(|_| async {
                        g.enter();
                        sleep(Duration::from_millis(20)).await;
                        g.exit();
                        Ok(())
                    })
                    .await
                }));
            }
        } else {
            let c = Arc::new(WritePriorityCapture::new(UnitProvider));
            for _ in 0..10 {
                let c = Arc::clone(&c);
                let g = Arc::clone(&writers);
                tasks.push(tokio::spawn(async move {
                    c.capture_write(|_| async {
                        g.enter();
                        sleep(Duration::from_millis(20)).await;
                        g.exit();
                        Ok(())
                    })
                    .await
                }));
            }
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(writers.peak(), 1, "policy {policy}");
    }
}

#[tokio::test]
async fn test_try_write_fails_while_read_grant_held() {
    let coordinator = Arc::new(ReadPriorityCapture::new(UnitProvider));
    let (entered_tx, entered_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move {
            c.capture_read(move |_| async move {
                entered_tx.send(()).unwrap();
                release_rx.await.unwrap();
                Ok::<_, CapsuleError>(())
            })
            .await
        })
    };
    entered_rx.await.unwrap();

    let err = coordinator
        .try_capture_write(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::WriteCapture));

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();

    // The grant is gone; the try variant succeeds now.
    coordinator
        .try_capture_write(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_try_read_fails_while_write_grant_held() {
    let coordinator = Arc::new(WritePriorityCapture::new(UnitProvider));
    let (entered_tx, entered_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move {
            c.capture_write(move |_| async move {
                entered_tx.send(()).unwrap();
                release_rx.await.unwrap();
                Ok::<_, CapsuleError>(())
            })
            .await
        })
    };
    entered_rx.await.unwrap();

    let err = coordinator
        .try_capture_read(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::ReadCapture));

    let err = coordinator
        .try_capture_write(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::WriteCapture));

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();

    coordinator
        .try_capture_read(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_try_read_succeeds_alongside_read_grant() {
    let coordinator = Arc::new(ReadPriorityCapture::new(UnitProvider));
    let (entered_tx, entered_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move {
            c.capture_read(move |_| async move {
                entered_tx.send(()).unwrap();
                release_rx.await.unwrap();
                Ok::<_, CapsuleError>(())
            })
            .await
        })
    };
    entered_rx.await.unwrap();

    coordinator
        .try_capture_read(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap();

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_grant_releases_the_container() {
    let coordinator = Arc::new(ReadPriorityCapture::new(UnitProvider));

    let held = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move {
            c.capture_read(|_| async {
                sleep(Duration::from_secs(3600)).await;
                Ok::<_, CapsuleError>(())
            })
            .await
        })
    };
    sleep(Duration::from_millis(50)).await;

    // Cancel the reader mid-grant; the scoped release must still run.
    held.abort();
    let _ = held.await;

    coordinator
        .try_capture_write(|_| async { Ok::<_, CapsuleError>(()) })
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capsule_grants_serialize_writes_against_reads() {
    let dir = TempDir::new().unwrap();
    let capsule = Arc::new(Capsule::open(dir.path().join("conc.capsule")).unwrap());

    capsule
        .with_mutable_folder(|f| async move {
            f.create_file("counter.txt", b"0")?;
            Ok(())
        })
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let c = Arc::clone(&capsule);
        tasks.push(tokio::spawn(async move {
            c.with_mutable_folder(move |f| async move {
                f.create_file(&format!("w{i}.txt"), format!("payload {i}").as_bytes())?;
                Ok(())
            })
            .await
        }));
    }
    for i in 0..8 {
        let c = Arc::clone(&capsule);
        tasks.push(tokio::spawn(async move {
            c.with_folder(|f| async move {
                // Reads observe a consistent tree whatever the interleaving.
                f.validate()
            })
            .await
            .map(|ok| assert!(ok, "reader {i} saw an inconsistent tree"))
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let names = capsule
        .with_folder(|f| async move {
            let mut names = Vec::new();
            for file in f.find_files("/w*.txt", true)? {
                names.push(file?.name().to_string());
            }
            Ok(names)
        })
        .await
        .unwrap();
    assert_eq!(names.len(), 8);
}
