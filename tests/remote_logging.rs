use peerlimit::logsink::{LogSink, LogSinkConfig};
use peerlimit::report::{ReportingContext, StatusReporter};
use tokio::net::TcpListener;
use url::Url;

#[tokio::test]
async fn test_reporter_mirrors_lines_to_log_sink() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogSinkConfig {
        log_dir: dir.path().join("logs"),
        static_dir: dir.path().join("static"),
        ..Default::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(LogSink::new(&config).serve_with_listener(listener));

    let endpoint = Url::parse(&format!("http://{addr}")).unwrap();
    let reporter = StatusReporter::connect(Some(endpoint)).await;
    let session = match reporter.context() {
        ReportingContext::Remote { session, .. } => session.clone(),
        ReportingContext::NoSession => panic!("expected a remote session"),
    };
    assert_eq!(session.len(), 32);

    reporter.report("Testing with 1 data channel...").await;
    reporter.report("Test with 1 data channel succeeded.").await;

    let log = tokio::fs::read_to_string(config.log_dir.join(format!("{session}.txt")))
        .await
        .unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with(&format!("[New session with ID {session}")));
    assert_eq!(lines[1], "Testing with 1 data channel...");
    assert_eq!(lines[2], "Test with 1 data channel succeeded.");

    server.abort();
}
