//! Every sink hands back exactly the record it was given.

use proptest::prelude::*;

use cutline::store::{FileSink, MemorySink, SnapshotSink, SqliteSink};
use cutline::SnapshotRecord;
use cutline_testkit::generators::record;

async fn assert_round_trip(sink: &dyn SnapshotSink, record: &SnapshotRecord) {
    sink.persist(record).await.unwrap();
    assert_eq!(sink.load(record.id).await.unwrap().as_ref(), Some(record));
    assert_eq!(sink.list().await.unwrap(), vec![record.id]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_sink_returns_the_persisted_record(record in record(5)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            assert_round_trip(&MemorySink::new(), &record).await;

            let dir = tempfile::tempdir().unwrap();
            assert_round_trip(&FileSink::new(dir.path()), &record).await;

            assert_round_trip(&SqliteSink::open_memory().unwrap(), &record).await;
        });
    }
}
