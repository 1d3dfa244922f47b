use pipeline_mock::LogSink;
use pipeline_plugin::serve_sink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    serve_sink(LogSink::default).await
}
