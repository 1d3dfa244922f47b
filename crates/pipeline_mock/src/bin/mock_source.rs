use pipeline_mock::CounterSource;
use pipeline_plugin::serve_source;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    serve_source(CounterSource::default).await
}
