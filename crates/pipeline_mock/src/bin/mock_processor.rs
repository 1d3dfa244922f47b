use pipeline_mock::UppercaseProcessor;
use pipeline_plugin::serve_processor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    serve_processor(UppercaseProcessor::default).await
}
