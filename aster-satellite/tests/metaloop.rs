#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use aster_satellite::config::LoopConfig;
use aster_satellite::metaloop::{iterate_database, Error, Loop, NullObserver, Observer};
use aster_task::{spawn_task, ChildTask};
use support::{Event, RecordingObserver, TestCatalog};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn stream_id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn loop_config(coalesce: Duration, list_limit: usize) -> LoopConfig {
    LoopConfig {
        coalesce_duration: coalesce,
        rate_limit: 0,
        list_limit,
    }
}

fn three_object_catalog() -> TestCatalog {
    let mut catalog = TestCatalog::new();
    catalog.add_object(support::object(1, 1), vec![support::remote_segment(stream_id(1), 0)]);
    catalog.add_object(support::object(2, 1), vec![support::inline_segment(stream_id(2), 0)]);
    catalog.add_object(support::object(3, 1), vec![support::remote_segment(stream_id(3), 0)]);
    catalog
}

#[tokio::test]
async fn delivers_objects_before_their_segments_in_order() {
    let mut catalog = TestCatalog::new();
    catalog.add_object(
        support::object(1, 2),
        vec![
            support::remote_segment(stream_id(1), 0),
            support::inline_segment(stream_id(1), 1),
        ],
    );
    catalog.add_object(support::object(2, 1), vec![support::inline_segment(stream_id(2), 0)]);

    let observer = RecordingObserver::new();
    let cancel = CancellationToken::new();

    iterate_database(&cancel, 0, &catalog, vec![observer.clone() as Arc<dyn Observer>])
        .await
        .unwrap();

    let events = observer.events();
    assert_eq!(
        events,
        vec![
            Event::Object(stream_id(1)),
            Event::Remote(stream_id(1), support::remote_segment(stream_id(1), 0).position),
            Event::Inline(stream_id(1), support::inline_segment(stream_id(1), 1).position),
            Event::Object(stream_id(2)),
            Event::Inline(stream_id(2), support::inline_segment(stream_id(2), 0).position),
        ]
    );
}

#[tokio::test]
async fn failing_observer_is_isolated_from_the_others() {
    let catalog = Arc::new(three_object_catalog());
    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(200), 2500), catalog.clone()));

    let driver = {
        let loop_ = Arc::clone(&loop_);
        let cancel = CancellationToken::new();
        ChildTask::spawn(async move { loop_.run_once(&cancel).await })
    };

    let failing = RecordingObserver::new().fail_on_segment(stream_id(2), 0);
    let healthy = RecordingObserver::new();

    let (failing_result, healthy_result) = tokio::join!(
        loop_.join(CancellationToken::new(), [failing.clone() as Arc<dyn Observer>]),
        loop_.join(CancellationToken::new(), [healthy.clone() as Arc<dyn Observer>]),
    );

    assert!(matches!(failing_result, Err(Error::Observer(_))));
    healthy_result.unwrap();

    // The pass itself completed without error.
    driver.join().await.unwrap().unwrap();

    // The failing observer stopped at object 2's segment...
    assert_eq!(
        failing.events(),
        vec![
            Event::Object(stream_id(1)),
            Event::Remote(stream_id(1), support::remote_segment(stream_id(1), 0).position),
            Event::Object(stream_id(2)),
            Event::Inline(stream_id(2), support::inline_segment(stream_id(2), 0).position),
        ]
    );

    // ...while the healthy one got the full catalog.
    assert_eq!(healthy.events().len(), 6);
    assert_eq!(healthy.events().last(), Some(&Event::Remote(stream_id(3), support::remote_segment(stream_id(3), 0).position)));
}

#[tokio::test]
async fn cancellation_during_coalescing_aborts_the_pass() {
    let catalog = Arc::new(three_object_catalog());
    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_secs(5), 2500), catalog.clone()));

    let cancel = CancellationToken::new();

    let driver = {
        let loop_ = Arc::clone(&loop_);
        let cancel = cancel.clone();
        ChildTask::spawn(async move { loop_.run_once(&cancel).await })
    };

    let observer = RecordingObserver::new();
    let join = {
        let loop_ = Arc::clone(&loop_);
        let cancel = cancel.clone();
        let observer = observer.clone() as Arc<dyn Observer>;
        ChildTask::spawn(async move { loop_.join(cancel, [observer]).await })
    };

    // Let the join land inside the coalescing window, then cancel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    assert!(matches!(join.join().await.unwrap(), Err(Error::Canceled)));
    assert!(matches!(driver.join().await.unwrap(), Err(Error::Canceled)));

    // No database iteration occurred.
    assert_eq!(catalog.stream_iterations(), 0);
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn pass_degenerates_to_success_when_every_observer_drops() {
    let catalog = Arc::new(three_object_catalog());
    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(200), 2500), catalog.clone()));

    let driver = {
        let loop_ = Arc::clone(&loop_);
        let cancel = CancellationToken::new();
        ChildTask::spawn(async move { loop_.run_once(&cancel).await })
    };

    let first = RecordingObserver::new().fail_on_object(stream_id(1));
    let second = RecordingObserver::new().fail_on_object(stream_id(1));

    let (first_result, second_result) = tokio::join!(
        loop_.join(CancellationToken::new(), [first.clone() as Arc<dyn Observer>]),
        loop_.join(CancellationToken::new(), [second.clone() as Arc<dyn Observer>]),
    );

    assert!(matches!(first_result, Err(Error::Observer(_))));
    assert!(matches!(second_result, Err(Error::Observer(_))));

    driver.join().await.unwrap().unwrap();

    assert_eq!(first.events(), vec![Event::Object(stream_id(1))]);
    assert_eq!(second.events(), vec![Event::Object(stream_id(1))]);
}

#[tokio::test]
async fn batch_boundary_flushes_before_the_crossing_entry() {
    let mut catalog = TestCatalog::new();
    for n in 1..=4 {
        catalog.add_object(support::object(n, 0), Vec::new());
    }
    catalog.add_object(
        support::object(5, 9),
        (0..9).map(|index| support::inline_segment(stream_id(5), index)).collect(),
    );
    let catalog = Arc::new(catalog);

    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(50), 10), catalog.clone()));

    let driver = {
        let loop_ = Arc::clone(&loop_);
        let cancel = CancellationToken::new();
        ChildTask::spawn(async move { loop_.run_once(&cancel).await })
    };

    loop_
        .join(CancellationToken::new(), [Arc::new(NullObserver) as Arc<dyn Observer>])
        .await
        .unwrap();
    driver.join().await.unwrap().unwrap();

    assert_eq!(catalog.stream_iterations(), 2);
}

#[tokio::test]
async fn observers_in_the_window_share_a_pass_and_later_ones_wait() {
    let catalog = Arc::new(three_object_catalog());
    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(300), 2500), catalog.clone()));

    let run_cancel = CancellationToken::new();
    let driver = spawn_task(Arc::clone(&loop_), run_cancel.clone());

    let early = RecordingObserver::new();
    let late = RecordingObserver::new();

    let (early_result, late_result) = tokio::join!(
        loop_.join(CancellationToken::new(), [early.clone() as Arc<dyn Observer>]),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            loop_.join(CancellationToken::new(), [late.clone() as Arc<dyn Observer>]).await
        }
    );
    early_result.unwrap();
    late_result.unwrap();

    assert_eq!(catalog.stream_iterations(), 1, "both observers expected in one pass");

    // A joiner arriving after the window gets the next pass.
    loop_
        .join(CancellationToken::new(), [RecordingObserver::new() as Arc<dyn Observer>])
        .await
        .unwrap();
    assert_eq!(catalog.stream_iterations(), 2);

    run_cancel.cancel();
    let _ = driver.join().await;
}

#[tokio::test]
async fn rate_limit_paces_object_consumption() {
    let mut catalog = TestCatalog::new();
    for n in 1..=6 {
        catalog.add_object(support::object(n, 0), Vec::new());
    }

    let cancel = CancellationToken::new();
    let started = std::time::Instant::now();

    iterate_database(&cancel, 5, &catalog, vec![Arc::new(NullObserver) as Arc<dyn Observer>])
        .await
        .unwrap();

    // Six entries at 5/s with burst 1: one immediately, five spaced out.
    assert!(started.elapsed() >= Duration::from_millis(900), "pass finished too fast");
}

#[tokio::test]
async fn database_failure_reaches_every_observer() {
    let mut catalog = TestCatalog::new();
    catalog.add_object(support::object(1, 1), vec![support::inline_segment(stream_id(1), 0)]);
    catalog.fail_objects_after(1);
    let catalog = Arc::new(catalog);

    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(100), 2500), catalog));

    let driver = {
        let loop_ = Arc::clone(&loop_);
        let cancel = CancellationToken::new();
        ChildTask::spawn(async move { loop_.run_once(&cancel).await })
    };

    let result = loop_
        .join(CancellationToken::new(), [RecordingObserver::new() as Arc<dyn Observer>])
        .await;
    assert!(matches!(result, Err(Error::Db(_))));

    assert!(matches!(driver.join().await.unwrap(), Err(Error::Db(_))));
}

#[tokio::test]
async fn missing_stream_answer_is_a_consistency_failure() {
    let mut catalog = TestCatalog::new();
    catalog.add_object(support::object(1, 0), Vec::new());
    catalog.add_object(support::object(2, 0), Vec::new());
    catalog.omit_stream(stream_id(2));
    let catalog = Arc::new(catalog);

    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(100), 2500), catalog));

    let driver = {
        let loop_ = Arc::clone(&loop_);
        let cancel = CancellationToken::new();
        ChildTask::spawn(async move { loop_.run_once(&cancel).await })
    };

    let result = loop_
        .join(CancellationToken::new(), [RecordingObserver::new() as Arc<dyn Observer>])
        .await;
    assert!(matches!(result, Err(Error::UnhandledObjects { count: 1 })));
    assert!(matches!(driver.join().await.unwrap(), Err(Error::UnhandledObjects { count: 1 })));
}

#[tokio::test]
async fn join_after_close_is_refused() {
    let catalog = Arc::new(TestCatalog::new());
    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(100), 2500), catalog));

    loop_.close();

    let result = loop_
        .join(CancellationToken::new(), [Arc::new(NullObserver) as Arc<dyn Observer>])
        .await;
    assert!(matches!(result, Err(Error::Closed)));

    // Wait resolves once closed.
    tokio::time::timeout(Duration::from_secs(1), loop_.wait()).await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "catalog loop may only be run once")]
async fn running_twice_trips_the_guard() {
    let catalog = Arc::new(TestCatalog::new());
    let loop_ = Arc::new(Loop::new(loop_config(Duration::from_millis(100), 2500), catalog));

    let first = {
        let loop_ = Arc::clone(&loop_);
        ChildTask::spawn(async move { loop_.run(CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _ = loop_.run(CancellationToken::new()).await;
    drop(first);
}

#[tokio::test]
#[should_panic(expected = "catalog loop already closed")]
async fn closing_twice_trips_the_guard() {
    let catalog = Arc::new(TestCatalog::new());
    let loop_ = Loop::new(loop_config(Duration::from_millis(100), 2500), catalog);

    loop_.close();
    loop_.close();
}
