//! Purpose: Session manager, block writer, and block reader behavior against the in-memory service.
//! Exports: None (integration test module).
//! Role: Validate commit semantics, block exclusivity, cancellation, retries, and resumable reads.
//! Invariants: Every test builds its own service; no shared state between tests.
//! Invariants: Waits are bounded by call-context deadlines.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tabletunnel::api::{
    BlockState, CallContext, CancelToken, Column, DataType, DownloadOptions, ErrorCode,
    ErrorKind, PartitionSpec, Record, RetryPolicy, Schema, SessionStatus, TableRef, TunnelClient,
    TunnelConfig, TunnelStub, UploadOptions, Value,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Harness {
    stub: Arc<TunnelStub>,
    client: TunnelClient,
    table: TableRef,
}

fn schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::BigInt).not_null(),
        Column::new("name", DataType::String),
        Column::new("score", DataType::Double),
    ])
}

fn row(id: i64) -> Record {
    vec![
        Value::BigInt(id),
        Value::String(format!("name-{id}")),
        Value::Double(id as f64 / 2.0),
    ]
}

fn harness() -> TestResult<Harness> {
    harness_with(TunnelStub::new(), |config| config)
}

fn harness_with(
    stub: TunnelStub,
    configure: impl FnOnce(TunnelConfig) -> TunnelConfig,
) -> TestResult<Harness> {
    let stub = Arc::new(stub);
    stub.create_table("lifecycle", "events", schema())?;
    let config = TunnelConfig::new("http://tunnel.invalid")?
        .with_project("lifecycle")
        .with_retry(
            RetryPolicy::default().with_backoff(Duration::from_millis(5), Duration::from_millis(20)),
        );
    let client = TunnelClient::new(stub.clone(), configure(config));
    let table = client.table("events")?;
    Ok(Harness {
        stub,
        client,
        table,
    })
}

fn write_block(
    session: &tabletunnel::api::UploadSession,
    index: u32,
    ids: impl IntoIterator<Item = i64>,
) -> TestResult<u64> {
    let ctx = CallContext::new();
    let mut writer = session.open_writer(index, &ctx)?;
    for id in ids {
        writer.write(&row(id), &ctx)?;
    }
    Ok(writer.close(&ctx)?.records)
}

fn committed_ids(harness: &Harness) -> Vec<i64> {
    harness
        .stub
        .rows("lifecycle", "events", "")
        .into_iter()
        .filter_map(|record| match record.first() {
            Some(Value::BigInt(id)) => Some(*id),
            _ => None,
        })
        .collect()
}

#[test]
fn commit_is_idempotent_for_the_same_block_set() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    write_block(&upload, 1, 10..13)?;
    write_block(&upload, 0, 0..2)?;

    upload.commit(&[1, 0], &ctx)?;
    assert_eq!(committed_ids(&h), vec![0, 1, 10, 11, 12]);
    assert_eq!(upload.committed_blocks(), Some(vec![0, 1]));

    let requests = h.stub.request_count();
    upload.commit(&[0, 1], &ctx)?;
    assert_eq!(h.stub.request_count(), requests);
    assert_eq!(committed_ids(&h).len(), 5);

    let err = upload.commit(&[0], &ctx).expect_err("different set after commit");
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(err.code(), Some(ErrorCode::SessionClosed));

    let err = upload.open_writer(2, &ctx).expect_err("closed session");
    assert_eq!(err.code(), Some(ErrorCode::SessionClosed));
    Ok(())
}

#[test]
fn incomplete_block_leaves_commit_unchanged() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    write_block(&upload, 0, 0..3)?;

    let requests = h.stub.request_count();
    let err = upload.commit(&[0, 1], &ctx).expect_err("block 1 never flushed");
    assert_eq!(err.code(), Some(ErrorCode::IncompleteBlock));
    assert_eq!(err.block(), Some(1));
    assert_eq!(h.stub.request_count(), requests);
    assert_eq!(upload.committed_blocks(), None);
    assert_eq!(upload.status(), SessionStatus::Normal);
    assert!(committed_ids(&h).is_empty());

    write_block(&upload, 1, 3..4)?;
    upload.commit(&[0, 1], &ctx)?;
    assert_eq!(committed_ids(&h), vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn expired_session_rejects_open() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    assert!(h.stub.expire_session(upload.id()));
    assert_eq!(upload.refresh_status(&ctx)?, SessionStatus::Expired);

    let err = upload.open_writer(0, &ctx).expect_err("expired");
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(err.code(), Some(ErrorCode::SessionExpired));
    assert!(err.is_session_expired());
    Ok(())
}

#[test]
fn session_past_its_expiry_is_expired_locally() -> TestResult<()> {
    let h = harness_with(TunnelStub::new().with_session_ttl(Duration::ZERO), |c| c)?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    assert_eq!(upload.status(), SessionStatus::Expired);
    let err = upload.open_writer(0, &ctx).expect_err("expired");
    assert_eq!(err.code(), Some(ErrorCode::SessionExpired));
    Ok(())
}

#[test]
fn expiry_discovered_at_close_marks_the_session() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    let mut writer = upload.open_writer(0, &ctx)?;
    writer.write(&row(1), &ctx)?;
    h.stub.expire_session(upload.id());
    let err = writer.close(&ctx).expect_err("expired mid-block");
    assert!(err.is_session_expired());
    assert_eq!(writer.state(), BlockState::Failed);
    assert_eq!(upload.status(), SessionStatus::Expired);
    Ok(())
}

#[test]
fn second_open_on_the_same_index_fails_while_the_first_completes() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;

    let mut first = upload.open_writer(0, &ctx)?;
    first.write(&row(7), &ctx)?;
    let err = upload.open_writer(0, &ctx).expect_err("index is taken");
    assert_eq!(err.code(), Some(ErrorCode::BlockAlreadyOpen));
    assert_eq!(err.block(), Some(0));

    assert_eq!(first.close(&ctx)?.records, 1);
    upload.commit(&[0], &ctx)?;
    assert_eq!(committed_ids(&h), vec![7]);
    Ok(())
}

#[test]
fn concurrent_opens_on_one_index_admit_exactly_one_writer() -> TestResult<()> {
    let h = harness()?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|worker| {
            let upload = upload.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Option<ErrorCode> {
                let ctx = CallContext::new();
                let opened = upload.open_writer(0, &ctx);
                barrier.wait();
                match opened {
                    Ok(mut writer) => {
                        let written = writer
                            .write(&row(worker), &ctx)
                            .and_then(|()| writer.close(&ctx));
                        written.err().and_then(|err| err.code())
                    }
                    Err(err) => err.code(),
                }
            })
        })
        .collect();
    let outcomes: Vec<Option<ErrorCode>> = handles
        .into_iter()
        .map(|handle| handle.join().map_err(|_| "writer thread panicked"))
        .collect::<Result<_, _>>()?;

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_none()).count(), 1);
    assert!(outcomes.contains(&Some(ErrorCode::BlockAlreadyOpen)));
    assert_eq!(upload.flushed_blocks(), vec![0]);
    Ok(())
}

#[test]
fn cancelled_block_fails_and_the_index_can_be_rewritten() -> TestResult<()> {
    let h = harness()?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;

    let token = CancelToken::new();
    let ctx = CallContext::new().with_cancel(token.clone());
    let mut writer = upload.open_writer(0, &ctx)?;
    writer.write(&row(1), &ctx)?;
    token.cancel();
    let err = writer.write(&row(2), &ctx).expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(writer.state(), BlockState::Failed);
    let err = writer.close(&ctx).expect_err("failed writer");
    assert_eq!(err.code(), Some(ErrorCode::InvalidWriteState));
    drop(writer);

    let ctx = CallContext::new();
    assert_eq!(write_block(&upload, 0, 100..102)?, 2);
    upload.commit(&[0], &ctx)?;
    assert_eq!(committed_ids(&h), vec![100, 101]);
    Ok(())
}

#[test]
fn cancel_reaches_a_writer_stalled_on_backpressure() -> TestResult<()> {
    let h = harness_with(TunnelStub::new(), |config| config.with_chunk_size(64))?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;
    h.stub.set_delay(Some(Duration::from_secs(3)));

    let token = CancelToken::new();
    let ctx = CallContext::new().with_cancel(token.clone());
    let mut writer = upload.open_writer(0, &ctx)?;
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };
    let started = Instant::now();
    let mut id = 0;
    let err = loop {
        if let Err(err) = writer.write(&row(id), &ctx) {
            break err;
        }
        id += 1;
    };
    let elapsed = started.elapsed();
    canceller.join().map_err(|_| "canceller panicked")?;

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(elapsed < Duration::from_secs(1), "cancel took {elapsed:?}");
    assert_eq!(writer.state(), BlockState::Failed);
    drop(writer);
    assert!(upload.flushed_blocks().is_empty());
    Ok(())
}

#[test]
fn deadline_reaches_a_writer_stalled_on_backpressure() -> TestResult<()> {
    let h = harness_with(TunnelStub::new(), |config| config.with_chunk_size(64))?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;
    h.stub.set_delay(Some(Duration::from_secs(3)));

    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
    let mut writer = upload.open_writer(0, &ctx)?;
    let started = Instant::now();
    let mut id = 0;
    let err = loop {
        if let Err(err) = writer.write(&row(id), &ctx) {
            break err;
        }
        id += 1;
    };
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[test]
fn dropped_writer_never_flushes_its_block() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    {
        let mut writer = upload.open_writer(3, &ctx)?;
        writer.write(&row(1), &ctx)?;
    }
    assert!(upload.flushed_blocks().is_empty());
    let err = upload.commit(&[3], &ctx).expect_err("aborted block");
    assert_eq!(err.code(), Some(ErrorCode::IncompleteBlock));
    assert_eq!(write_block(&upload, 3, [5])?, 1);
    Ok(())
}

#[test]
fn deadline_during_close_times_out_the_block() -> TestResult<()> {
    let h = harness()?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;

    h.stub.set_delay(Some(Duration::from_millis(400)));
    let ctx = CallContext::new().with_timeout(Duration::from_millis(80));
    let mut writer = upload.open_writer(0, &ctx)?;
    writer.write(&row(1), &ctx)?;
    let err = writer.close(&ctx).expect_err("deadline passes while the service stalls");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(writer.state(), BlockState::Failed);
    drop(writer);

    h.stub.set_delay(None);
    assert_eq!(write_block(&upload, 0, [9])?, 1);
    Ok(())
}

#[test]
fn deadline_shorter_than_a_stalled_request_is_a_timeout() -> TestResult<()> {
    let h = harness()?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;
    h.stub.set_delay(Some(Duration::from_millis(300)));
    let ctx = CallContext::new().with_timeout(Duration::from_millis(40));
    let err = upload.refresh_status(&ctx).expect_err("stalled status");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    Ok(())
}

#[test]
fn http_timeout_without_deadline_is_a_transport_error() -> TestResult<()> {
    let h = harness_with(TunnelStub::new(), |config| {
        config
            .with_http_timeout(Duration::from_millis(30))
            .with_retry(RetryPolicy::none())
    })?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;
    h.stub.set_delay(Some(Duration::from_millis(200)));
    let err = upload
        .refresh_status(&CallContext::new())
        .expect_err("request timeout");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());
    Ok(())
}

#[test]
fn concurrent_blocks_commit_in_index_order() -> TestResult<()> {
    let h = harness()?;
    let upload = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())?;

    let handles: Vec<_> = (0..4u32)
        .rev()
        .map(|index| {
            let upload = upload.clone();
            thread::spawn(move || -> Result<u64, String> {
                let base = i64::from(index) * 1000;
                write_block(&upload, index, base..base + 250).map_err(|err| err.to_string())
            })
        })
        .collect();
    for handle in handles {
        let records = handle.join().map_err(|_| "writer thread panicked")??;
        assert_eq!(records, 250);
    }

    upload.commit(&[0, 1, 2, 3], &CallContext::new())?;
    let ids = committed_ids(&h);
    assert_eq!(ids.len(), 1000);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[test]
fn transient_service_failures_are_retried() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();

    h.stub.fail_next(503, 1);
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    assert_eq!(h.stub.request_count(), 2);

    // The streamed PUT is refused before its body is read; the writer replays it.
    h.stub.fail_next(503, 1);
    assert_eq!(write_block(&upload, 0, 0..50)?, 50);

    h.stub.fail_next(502, 1);
    upload.commit(&[0], &ctx)?;
    assert_eq!(committed_ids(&h), (0..50).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn exhausted_retries_surface_one_terminal_error() -> TestResult<()> {
    let h = harness_with(TunnelStub::new(), |config| {
        config.with_retry(
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
        )
    })?;
    h.stub.fail_next(503, 5);
    let err = h
        .client
        .create_upload(&h.table, UploadOptions::new(), &CallContext::new())
        .expect_err("service stays down");
    assert_eq!(err.kind(), ErrorKind::Service);
    assert_eq!(err.status(), Some(503));
    assert_eq!(err.code(), Some(ErrorCode::SessionCreateFailed));
    assert_eq!(h.stub.request_count(), 2);
    Ok(())
}

#[test]
fn schema_hints_must_agree_with_the_table() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    h.client
        .create_upload(&h.table, UploadOptions::new().with_schema_hint(schema()), &ctx)?;

    let wrong = Schema::new(vec![
        Column::new("id", DataType::String),
        Column::new("name", DataType::String),
        Column::new("score", DataType::Double),
    ]);
    let err = h
        .client
        .create_upload(&h.table, UploadOptions::new().with_schema_hint(wrong), &ctx)
        .expect_err("conflicting hint");
    assert_eq!(err.code(), Some(ErrorCode::SchemaConflict));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    Ok(())
}

#[test]
fn nonconforming_records_leave_the_block_writable() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    let mut writer = upload.open_writer(0, &ctx)?;
    writer.write(&row(1), &ctx)?;

    let err = writer
        .write(&[Value::String("x".into()), Value::Null, Value::Null], &ctx)
        .expect_err("type mismatch");
    assert_eq!(err.code(), Some(ErrorCode::TypeMismatch));
    let err = writer.write(&[Value::BigInt(2)], &ctx).expect_err("arity");
    assert_eq!(err.code(), Some(ErrorCode::SchemaArityMismatch));
    let err = writer
        .write(&[Value::Null, Value::Null, Value::Null], &ctx)
        .expect_err("not null");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(writer.state(), BlockState::Writing);

    writer.write(&row(3), &ctx)?;
    assert_eq!(writer.close(&ctx)?.records, 2);
    let err = writer.write(&row(4), &ctx).expect_err("closed");
    assert_eq!(err.code(), Some(ErrorCode::InvalidWriteState));
    Ok(())
}

#[test]
fn partitioned_uploads_land_in_their_partition() -> TestResult<()> {
    let stub = Arc::new(TunnelStub::new());
    let partitioned = schema().with_partition_column(Column::new("pt", DataType::String));
    stub.create_table("lifecycle", "daily", partitioned)?;
    let config = TunnelConfig::new("http://tunnel.invalid")?.with_project("lifecycle");
    let client = TunnelClient::new(stub.clone(), config);
    let table = client.table("daily")?;
    let ctx = CallContext::new();

    let err = client
        .create_upload(&table, UploadOptions::new(), &ctx)
        .expect_err("partition required");
    assert_eq!(err.service_code(), Some("InvalidPartition"));
    assert!(!err.is_retryable());

    let spec = PartitionSpec::new().with("pt", "20240101");
    let upload = client.create_upload(&table, UploadOptions::new().with_partition(spec.clone()), &ctx)?;
    assert_eq!(upload.partition(), &spec);
    write_block(&upload, 0, 0..4)?;
    upload.commit(&[0], &ctx)?;
    assert_eq!(stub.rows("lifecycle", "daily", "pt=20240101").len(), 4);
    assert!(stub.rows("lifecycle", "daily", "pt=20240102").is_empty());

    let download = client.create_download(&table, DownloadOptions::new().with_partition(spec), &ctx)?;
    assert_eq!(download.record_count(), 4);
    Ok(())
}

#[test]
fn reopened_sessions_continue_elsewhere() -> TestResult<()> {
    let h = harness()?;
    let ctx = CallContext::new();
    let upload = h.client.create_upload(&h.table, UploadOptions::new(), &ctx)?;
    write_block(&upload, 0, 0..2)?;
    write_block(&upload, 5, 2..3)?;

    let config = TunnelConfig::new("http://tunnel.invalid")?.with_project("lifecycle");
    let other = TunnelClient::new(h.stub.clone(), config);
    let reopened = other.reopen_upload(&h.table, upload.id(), &ctx)?;
    assert_eq!(reopened.flushed_blocks(), vec![0, 5]);
    assert_eq!(reopened.schema(), &schema());
    other.commit(upload.id(), &[0, 5], &ctx)?;
    assert_eq!(other.status(upload.id(), &ctx)?, SessionStatus::Closed);

    assert_eq!(upload.refresh_status(&ctx)?, SessionStatus::Closed);
    assert_eq!(upload.committed_blocks(), Some(vec![0, 5]));
    upload.commit(&[0, 5], &ctx)?;

    let download = h.client.create_download(&h.table, DownloadOptions::new(), &ctx)?;
    let again = other.reopen_download(&h.table, download.id(), &ctx)?;
    assert_eq!(again.record_count(), 3);
    assert_eq!(again.read_all(&ctx)?, vec![row(0), row(1), row(2)]);

    let partitioned = schema().with_partition_column(Column::new("pt", DataType::String));
    h.stub.create_table("lifecycle", "daily", partitioned)?;
    let daily = h.client.table("daily")?;
    let spec = PartitionSpec::new().with("pt", "20240101");
    let upload = h.client.create_upload(
        &daily,
        UploadOptions::new().with_partition(spec.clone()),
        &ctx,
    )?;
    let reopened = other.reopen_upload(&daily, upload.id(), &ctx)?;
    assert_eq!(reopened.partition(), &spec);
    write_block(&reopened, 0, 10..12)?;
    reopened.commit(&[0], &ctx)?;
    assert_eq!(h.stub.rows("lifecycle", "daily", "pt=20240101").len(), 2);

    let download = h.client.create_download(
        &daily,
        DownloadOptions::new().with_partition(spec.clone()),
        &ctx,
    )?;
    let again = other.reopen_download(&daily, download.id(), &ctx)?;
    assert_eq!(again.partition(), &spec);
    assert_eq!(again.read_all(&ctx)?, vec![row(10), row(11)]);

    let err = other.upload("missing").expect_err("unknown id");
    assert_eq!(err.kind(), ErrorKind::Usage);
    Ok(())
}

#[test]
fn ranged_reads_deliver_exactly_the_requested_records() -> TestResult<()> {
    let h = harness()?;
    h.stub
        .insert_rows("lifecycle", "events", "", (0..50).map(row).collect())?;
    let ctx = CallContext::new();
    let download = h.client.create_download(
        &h.table,
        DownloadOptions::new().with_columns(["score", "id"]),
        &ctx,
    )?;
    assert_eq!(download.schema().len(), 2);
    assert_eq!(download.schema().columns[0].name, "score");

    let mut reader = download.open_reader(10, 3, &ctx)?;
    let mut got = Vec::new();
    while let Some(record) = reader.read(&ctx)? {
        got.push(record);
    }
    assert_eq!(
        got,
        (10..13)
            .map(|id| vec![Value::Double(id as f64 / 2.0), Value::BigInt(id)])
            .collect::<Vec<_>>()
    );
    let err = reader.read(&ctx).expect_err("past the end");
    assert_eq!(err.code(), Some(ErrorCode::UnexpectedEndOfStream));

    let requests = h.stub.request_count();
    let err = download.open_reader(48, 5, &ctx).expect_err("out of range");
    assert_eq!(err.code(), Some(ErrorCode::UnexpectedEndOfStream));
    assert_eq!(h.stub.request_count(), requests);

    let mut idle = download.reader();
    let err = idle.read(&ctx).expect_err("not opened");
    assert_eq!(err.code(), Some(ErrorCode::InvalidReadState));
    Ok(())
}

#[test]
fn interrupted_download_resumes_after_the_last_record() -> TestResult<()> {
    let h = harness()?;
    h.stub
        .insert_rows("lifecycle", "events", "", (0..200).map(row).collect())?;
    let ctx = CallContext::new();
    let download = h.client.create_download(&h.table, DownloadOptions::new(), &ctx)?;

    h.stub.cut_next_download(301);
    let records = download.read_all(&ctx)?;
    assert_eq!(records, (0..200).map(row).collect::<Vec<_>>());
    Ok(())
}
