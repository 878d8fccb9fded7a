//! Echo processor: copies every JSON note from the input topics to the output topic
//!
//! ```text
//! krimson-echo --brokers localhost:9092 --input notes --output notes-echo
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use krimson::broker::kafka::KafkaClients;
use krimson::{
    init_tracing, JsonCodec, Message, OffsetReset, OutputTopic, Processor, ProcessorContext,
    ProcessorError, ProcessorOptions, ProducerRequest, SubscriptionTopicGap,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A free-form JSON note
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note(serde_json::Value);

impl Message for Note {
    const MESSAGE_TYPE: &'static str = "krimson.echo.Note";
}

#[derive(Parser, Debug)]
#[command(name = "krimson-echo")]
#[command(version = krimson::VERSION)]
#[command(about = "Copy notes from input topics to an output topic", long_about = None)]
struct Cli {
    /// YAML options file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Bootstrap servers
    #[arg(short, long, env = "KRIMSON_BROKERS")]
    brokers: Option<String>,

    /// Client id
    #[arg(long, default_value = "krimson-echo")]
    client_id: String,

    /// Consumer group id (defaults to the client id)
    #[arg(short, long)]
    group: Option<String>,

    /// Input topics
    #[arg(short, long, num_args = 1..)]
    input: Vec<String>,

    /// Output topic
    #[arg(short, long)]
    output: Option<String>,

    /// Start from the latest offset when nothing was committed
    #[arg(long)]
    latest: bool,
}

impl Cli {
    fn options(&self) -> Result<ProcessorOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path))?;
                ProcessorOptions::from_yaml_str(&yaml)?
            }
            None => ProcessorOptions::default(),
        };

        options.client_id = self.client_id.clone();
        if let Some(brokers) = &self.brokers {
            options.connection.bootstrap_servers = brokers.clone();
        }
        if let Some(group) = &self.group {
            options.group_id = Some(group.clone());
        }
        if !self.input.is_empty() {
            options.input_topics = self.input.clone();
        }
        if let Some(output) = &self.output {
            options.output_topic = Some(OutputTopic::new(output));
        }
        if self.latest {
            options.auto_offset_reset = OffsetReset::Latest;
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let processor = Processor::builder()
        .options(cli.options()?)
        .codec(JsonCodec::new().register::<Note>())
        .clients(Arc::new(KafkaClients))
        .process(|note: &Note, context: &ProcessorContext| {
            let request = ProducerRequest::new(note.clone()).with_key(context.key().clone());
            context.output(request)?;
            Ok(())
        })
        .build()?;

    let cancellation = CancellationToken::new();
    let on_signal = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_signal.cancel();
        }
    });

    let result = processor
        .activate(
            cancellation,
            Some(Box::new(
                |processor: &Processor, gaps: &[SubscriptionTopicGap], _: Option<&ProcessorError>| {
                    for topic in gaps {
                        info!(
                            client_id = processor.client_id(),
                            topic = %topic.topic,
                            gap = topic.gap(),
                            "Final subscription gap"
                        );
                    }
                },
            )),
        )
        .await;

    if let Err(e) = &result {
        error!("Processor failed: {}", e);
    }
    result?;
    Ok(())
}
